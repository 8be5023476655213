// Lockstep subgroup scheduler.
//
// Drives one subgroup's cooperative threads from a single OS thread. Each
// outer tick resumes every eligible thread, rescans the parked-state
// summary, partitions the eligible threads into convergence groups by
// operation id, and executes one collective per group. Reconvergence works
// because op ids are assigned in static source order: the smallest id among
// parked threads is the textually earliest reconverge point anyone is
// waiting at, so threads run up to that point, park, and are released
// together once the rest of the subgroup has drained. Workgroup barriers
// outrank reconvergence (the `min_reconv_id < barrier_id` guard) since a
// barrier is always textually later than any divergence it dominates.

use std::rc::Rc;
use std::sync::atomic::{fence, Ordering};
use std::task::{Context, Poll, Waker};

use crate::barrier::WorkgroupBarrier;
use crate::channel::{Command, LaneVec, Op, OpResult, ThreadState};
use crate::collective;
use crate::config::{
    self, DEBUG_SUBGROUP_ID, DEBUG_WORKGROUP_X, DEBUG_WORKGROUP_Y, DEBUG_WORKGROUP_Z,
    SUBGROUP_SIZE,
};
use crate::context::{uvec3, WorkGroupContext};
use crate::error::EmuError;
use crate::lane::{LaneCell, LaneFuture};

pub(crate) struct SubgroupScheduler {
    group: WorkGroupContext,
    num_active: usize,
    states: LaneVec<ThreadState>,
    commands: LaneVec<Command>,
    results: LaneVec<OpResult>,
    cells: Vec<Rc<LaneCell>>,
    lanes: Vec<LaneFuture>,
    /// Smallest op id among halted / sub-barrier threads, or `u32::MAX`.
    min_reconv_id: u32,
    /// Op id of the pending workgroup barrier, or `u32::MAX`.
    barrier_id: u32,
    /// Threads currently parked at the workgroup barrier.
    barrier_count: usize,
}

impl SubgroupScheduler {
    pub fn new(group: WorkGroupContext) -> Self {
        SubgroupScheduler {
            group,
            num_active: 0,
            states: [ThreadState::Running; SUBGROUP_SIZE],
            commands: [Command::invalid(); SUBGROUP_SIZE],
            results: [OpResult::invalid(); SUBGROUP_SIZE],
            cells: Vec::with_capacity(SUBGROUP_SIZE),
            lanes: Vec::with_capacity(SUBGROUP_SIZE),
            min_reconv_id: u32::MAX,
            barrier_id: u32::MAX,
            barrier_count: 0,
        }
    }

    /// Registers one cooperative thread. Tail subgroups register fewer than
    /// `SUBGROUP_SIZE` lanes.
    pub fn add_lane(&mut self, cell: Rc<LaneCell>, future: LaneFuture) {
        assert!(self.num_active < SUBGROUP_SIZE, "subgroup is full");
        self.cells.push(cell);
        self.lanes.push(future);
        self.num_active += 1;
    }

    /// Runs the subgroup to completion.
    pub fn run(&mut self, barrier: &WorkgroupBarrier) -> Result<(), EmuError> {
        loop {
            let made_progress = self.resume_phase()?;
            if self.all_finished() {
                return Ok(());
            }
            self.scan_phase(made_progress)?;
            self.execute_phase(barrier)?;
        }
    }

    fn all_finished(&self) -> bool {
        self.states[..self.num_active]
            .iter()
            .all(|&s| s == ThreadState::Finished)
    }

    /// A halted or sub-barrier thread may reconverge once no thread is
    /// still running, provided the earliest reconverge point comes before
    /// any pending workgroup barrier and this thread is parked exactly
    /// there.
    fn can_reconverge(&self, t: usize) -> bool {
        self.all_parked()
            && self.min_reconv_id < self.barrier_id
            && self.commands[t].op_id == self.min_reconv_id
    }

    /// A barrier thread may pass once the whole subgroup has arrived (the
    /// workgroup-wide wait happens in the execute phase).
    fn can_pass_barrier(&self, t: usize) -> bool {
        self.barrier_count == self.num_active && self.commands[t].op_id == self.barrier_id
    }

    /// True when every non-finished, non-barrier thread is parked.
    fn all_parked(&self) -> bool {
        self.states[..self.num_active].iter().all(|&s| {
            matches!(
                s,
                ThreadState::Halted
                    | ThreadState::AtSubBarrier
                    | ThreadState::AtBarrier
                    | ThreadState::Finished
            )
        })
    }

    /// Eligibility snapshot for this tick, evaluated against the current
    /// scan values before any thread moves.
    fn eligibility(&self) -> LaneVec<bool> {
        let mut eligible = [false; SUBGROUP_SIZE];
        for t in 0..self.num_active {
            eligible[t] = match self.states[t] {
                ThreadState::Running => true,
                ThreadState::Halted | ThreadState::AtSubBarrier => self.can_reconverge(t),
                ThreadState::AtBarrier => self.can_pass_barrier(t),
                ThreadState::Finished => false,
            };
        }
        eligible
    }

    /// Resume phase: feed results into every eligible thread and collect
    /// the commands they suspend on next.
    fn resume_phase(&mut self) -> Result<bool, EmuError> {
        let eligible = self.eligibility();
        let mut made_progress = false;
        for t in 0..self.num_active {
            if !eligible[t] {
                continue;
            }
            made_progress = true;
            self.resume_lane(t)?;
        }
        Ok(made_progress)
    }

    fn resume_lane(&mut self, t: usize) -> Result<(), EmuError> {
        self.cells[t].put_result(self.results[t]);
        let mut cx = Context::from_waker(Waker::noop());
        match self.lanes[t].as_mut().poll(&mut cx) {
            Poll::Ready(Ok(())) => {
                self.states[t] = ThreadState::Finished;
            }
            Poll::Ready(Err(failure)) => return Err(failure),
            Poll::Pending => {
                let command = self.cells[t].take_command().ok_or(EmuError::InvalidOp {
                    work_group: self.group.work_group_id,
                    subgroup: self.group.subgroup_id,
                    expected: Op::Invalid,
                    got: Op::Invalid,
                })?;
                self.states[t] = match command.op {
                    Op::Reconverge => ThreadState::Halted,
                    Op::SubgroupBarrier
                    | Op::SubgroupMemoryBarrier
                    | Op::MemoryBarrier
                    | Op::GroupMemoryBarrier => ThreadState::AtSubBarrier,
                    Op::Barrier => ThreadState::AtBarrier,
                    _ => ThreadState::Running,
                };
                self.commands[t] = command;
            }
        }
        Ok(())
    }

    /// Scan phase: recompute the parked-state summary and detect the two
    /// unrecoverable conditions.
    fn scan_phase(&mut self, made_progress: bool) -> Result<(), EmuError> {
        self.min_reconv_id = u32::MAX;
        self.barrier_id = u32::MAX;
        self.barrier_count = 0;

        for t in 0..self.num_active {
            match self.states[t] {
                ThreadState::Halted | ThreadState::AtSubBarrier => {
                    self.min_reconv_id = self.min_reconv_id.min(self.commands[t].op_id);
                }
                ThreadState::AtBarrier => {
                    let op_id = self.commands[t].op_id;
                    if self.barrier_count > 0 && op_id != self.barrier_id {
                        return Err(EmuError::NonUniformBarrier {
                            work_group: self.group.work_group_id,
                            subgroup: self.group.subgroup_id,
                            op_id_a: self.barrier_id,
                            op_id_b: op_id,
                        });
                    }
                    self.barrier_id = op_id;
                    self.barrier_count += 1;
                }
                ThreadState::Running | ThreadState::Finished => {}
            }
        }

        if !made_progress {
            return Err(EmuError::Deadlock {
                work_group: self.group.work_group_id,
                subgroup: self.group.subgroup_id,
                barrier_count: self.barrier_count,
                num_active: self.num_active,
            });
        }
        Ok(())
    }

    /// Grouping + execute phase: partition the threads eligible to act into
    /// convergence groups by op id and run one collective per group.
    fn execute_phase(&mut self, barrier: &WorkgroupBarrier) -> Result<(), EmuError> {
        let eligible = self.eligibility();
        let mut grouped = [false; SUBGROUP_SIZE];

        for t in 0..self.num_active {
            if grouped[t] || !eligible[t] {
                continue;
            }
            let op_id = self.commands[t].op_id;
            let op = self.commands[t].op;
            let active: Vec<usize> = (t..self.num_active)
                .filter(|&s| eligible[s] && self.commands[s].op_id == op_id)
                .collect();
            for &s in &active {
                grouped[s] = true;
            }

            match op {
                // The whole subgroup joins the workgroup-wide rendezvous
                // before the barrier group is released.
                Op::Barrier => barrier.wait(self.group.subgroup_id, op_id)?,
                // Best-effort fence; weak memory is not modelled.
                Op::SubgroupMemoryBarrier | Op::MemoryBarrier | Op::GroupMemoryBarrier => {
                    fence(Ordering::SeqCst)
                }
                _ => {}
            }

            if self.trace_selected() {
                eprintln!(
                    "[shader_emu] wg {} sg {} op {:?} id {} lanes {:?}",
                    self.group.work_group_id, self.group.subgroup_id, op, op_id, active
                );
            }

            collective::execute(
                op,
                op_id,
                &self.commands,
                &mut self.results,
                &active,
                &self.group,
            )?;
        }
        Ok(())
    }

    fn trace_selected(&self) -> bool {
        config::DEBUG_TRACE
            && self.group.work_group_id
                == uvec3(DEBUG_WORKGROUP_X, DEBUG_WORKGROUP_Y, DEBUG_WORKGROUP_Z)
            && self.group.subgroup_id == DEBUG_SUBGROUP_ID
    }
}

// Workgroup barrier.
//
// One barrier per workgroup, with count = number of subgroups. Every
// subgroup scheduler calls `wait` exactly once per `barrier()` command
// (uniformity within the subgroup is enforced by the scheduler before it
// gets here; uniformity across subgroups is enforced here, by comparing
// the op ids of one generation's arrivals). The barrier is reusable across
// generations, and unlike `std::sync::Barrier` it can be cancelled: a
// subgroup that fails fatally wakes every waiter with the error instead of
// leaving them blocked, and a subgroup whose threads all finish retires, so
// a workgroup whose remaining subgroups can never be released surfaces a
// deadlock.

use std::sync::{Condvar, Mutex};

use crate::context::UVec3;
use crate::error::EmuError;

pub(crate) struct WorkgroupBarrier {
    state: Mutex<BarrierState>,
    cond: Condvar,
    total: usize,
    work_group: UVec3,
}

struct BarrierState {
    arrived: usize,
    retired: usize,
    generation: u64,
    /// Op id of this generation's first arrival.
    op_id: Option<u32>,
    failure: Option<EmuError>,
}

impl WorkgroupBarrier {
    pub fn new(total: usize, work_group: UVec3) -> Self {
        WorkgroupBarrier {
            state: Mutex::new(BarrierState {
                arrived: 0,
                retired: 0,
                generation: 0,
                op_id: None,
                failure: None,
            }),
            cond: Condvar::new(),
            total,
            work_group,
        }
    }

    /// Blocks until every non-retired subgroup of the workgroup has arrived
    /// at the barrier with `op_id`. Fails if the barrier was cancelled, if
    /// another subgroup arrived at a different barrier site, or if
    /// retirements make a full rendezvous impossible.
    pub fn wait(&self, subgroup: u32, op_id: u32) -> Result<(), EmuError> {
        let mut state = self.state.lock().expect("workgroup barrier poisoned");
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }

        match state.op_id {
            None => state.op_id = Some(op_id),
            Some(expected) if expected != op_id => {
                let failure = EmuError::NonUniformBarrier {
                    work_group: self.work_group,
                    subgroup,
                    op_id_a: expected,
                    op_id_b: op_id,
                };
                state.failure = Some(failure.clone());
                self.cond.notify_all();
                return Err(failure);
            }
            Some(_) => {}
        }

        state.arrived += 1;

        if state.arrived == self.total {
            state.arrived = 0;
            state.op_id = None;
            state.generation += 1;
            self.cond.notify_all();
            return Ok(());
        }

        if state.arrived + state.retired == self.total {
            // The retired subgroups will never arrive; nobody can pass.
            let failure = self.abandoned(&state, subgroup);
            state.failure = Some(failure.clone());
            self.cond.notify_all();
            return Err(failure);
        }

        let generation = state.generation;
        while state.generation == generation && state.failure.is_none() {
            state = self.cond.wait(state).expect("workgroup barrier poisoned");
        }
        match &state.failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }

    /// Marks one subgroup as finished for good. If waiters are now stuck,
    /// the barrier is cancelled with a deadlock error.
    pub fn retire(&self, subgroup: u32) {
        let mut state = self.state.lock().expect("workgroup barrier poisoned");
        state.retired += 1;
        if state.arrived > 0 && state.arrived + state.retired == self.total {
            let failure = self.abandoned(&state, subgroup);
            state.failure = Some(failure);
            self.cond.notify_all();
        }
    }

    /// Cancels the barrier with `failure`, waking every waiter. The first
    /// recorded failure wins.
    pub fn cancel(&self, failure: EmuError) {
        let mut state = self.state.lock().expect("workgroup barrier poisoned");
        if state.failure.is_none() {
            state.failure = Some(failure);
        }
        self.cond.notify_all();
    }

    fn abandoned(&self, state: &BarrierState, subgroup: u32) -> EmuError {
        EmuError::Deadlock {
            work_group: self.work_group,
            subgroup,
            barrier_count: state.arrived,
            num_active: self.total,
        }
    }
}

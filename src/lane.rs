// Cooperative thread plumbing.
//
// Each invocation's shader body is compiled (by the `compute_shader!`
// transform) into an async block; the Rust compiler turns that into the
// per-thread state machine. A thread suspends in exactly one place: the
// `Exchange` future, which deposits a `Command` into the lane's cell on its
// first poll and reads back the scheduler's `OpResult` on the second. The
// scheduler drives these futures manually with a no-op waker, one lane at a
// time, from a single OS thread.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::buffer::{SharedMemory, StorageBuffer};
use crate::channel::{Command, Op, OpResult, ResultPayload, ScalarValue, ShaderScalar};
use crate::context::{ThreadContext, UVec3, UVec4, WorkGroupContext};
use crate::error::EmuError;
use crate::mask;

/// A suspended cooperative thread. Never crosses threads: it is created and
/// polled on its scheduler's OS thread only.
pub type LaneFuture = Pin<Box<dyn Future<Output = Result<(), EmuError>>>>;

/// Command/result mailbox shared between one closure and its scheduler.
pub(crate) struct LaneCell {
    command: Cell<Option<Command>>,
    result: Cell<OpResult>,
}

impl LaneCell {
    pub fn new() -> Self {
        LaneCell {
            command: Cell::new(None),
            result: Cell::new(OpResult::invalid()),
        }
    }

    pub fn put_result(&self, result: OpResult) {
        self.result.set(result);
    }

    pub fn take_command(&self) -> Option<Command> {
        self.command.take()
    }
}

/// The shader side of the channel: issues commands, suspends, and unpacks
/// results. One per invocation; owned by the generated closure.
pub struct LaneLink {
    cell: Rc<LaneCell>,
    work_group: UVec3,
    subgroup: u32,
}

impl LaneLink {
    pub(crate) fn new(cell: Rc<LaneCell>, work_group: UVec3, subgroup: u32) -> Self {
        LaneLink {
            cell,
            work_group,
            subgroup,
        }
    }

    fn invalid_op(&self, expected: Op, got: Op) -> EmuError {
        EmuError::InvalidOp {
            work_group: self.work_group,
            subgroup: self.subgroup,
            expected,
            got,
        }
    }

    fn exchange(&self, command: Command) -> Exchange<'_> {
        Exchange {
            cell: &self.cell,
            command: Some(command),
        }
    }

    /// Issues one command, suspends, and checks the result kind echoes the
    /// command kind. A mismatch means the transform and runtime disagree.
    async fn run_op(&self, command: Command) -> Result<OpResult, EmuError> {
        let op = command.op;
        let result = self.exchange(command).await;
        if result.op != op {
            return Err(self.invalid_op(op, result.op));
        }
        Ok(result)
    }

    /// Value-carrying collective (broadcast/reductions/scans/shuffles).
    pub async fn scalar<T: ShaderScalar>(
        &self,
        op_id: u32,
        op: Op,
        value: T,
        aux: u32,
    ) -> Result<T, EmuError> {
        let result = self
            .run_op(Command::scalar(op_id, op, value.into_scalar(), aux))
            .await?;
        match result.payload {
            ResultPayload::Scalar(v) => {
                T::from_scalar(v).ok_or_else(|| self.invalid_op(op, result.op))
            }
            _ => Err(self.invalid_op(op, result.op)),
        }
    }

    /// Value-carrying collective with a boolean answer (all-equal).
    pub async fn scalar_test<T: ShaderScalar>(
        &self,
        op_id: u32,
        op: Op,
        value: T,
    ) -> Result<bool, EmuError> {
        let result = self
            .run_op(Command::scalar(op_id, op, value.into_scalar(), 0))
            .await?;
        match result.payload {
            ResultPayload::Flag(flag) => Ok(flag),
            _ => Err(self.invalid_op(op, result.op)),
        }
    }

    /// Boolean collective (all/any).
    pub async fn predicate(&self, op_id: u32, op: Op, flag: bool) -> Result<bool, EmuError> {
        let result = self.run_op(Command::flag(op_id, op, flag)).await?;
        match result.payload {
            ResultPayload::Flag(flag) => Ok(flag),
            _ => Err(self.invalid_op(op, result.op)),
        }
    }

    /// Ballot: packs the subgroup's predicates into the low word of the
    /// quadruple carrier.
    pub async fn ballot(&self, op_id: u32, flag: bool) -> Result<UVec4, EmuError> {
        let result = self.run_op(Command::flag(op_id, Op::Ballot, flag)).await?;
        match result.payload {
            ResultPayload::Scalar(ScalarValue::U32(bits)) => Ok(mask::low_word(bits)),
            _ => Err(self.invalid_op(Op::Ballot, result.op)),
        }
    }

    /// Elect: true on exactly the first active lane of the group.
    pub async fn elect(&self, op_id: u32) -> Result<bool, EmuError> {
        let result = self.run_op(Command::flag(op_id, Op::Elect, false)).await?;
        match result.payload {
            ResultPayload::Flag(flag) => Ok(flag),
            _ => Err(self.invalid_op(Op::Elect, result.op)),
        }
    }

    /// Synchronization command with no payload (barriers).
    pub async fn sync_op(&self, op_id: u32, op: Op) -> Result<(), EmuError> {
        self.run_op(Command::sync(op_id, op)).await?;
        Ok(())
    }

    /// Reconverge marker inserted by the transform after divergent control
    /// flow. Scheduler-only; no user-visible effect.
    pub async fn reconverge(&self, op_id: u32) -> Result<(), EmuError> {
        self.sync_op(op_id, Op::Reconverge).await
    }
}

/// The single suspension point. First poll deposits the command and parks;
/// second poll (after the scheduler resumed us) yields the result.
struct Exchange<'a> {
    cell: &'a LaneCell,
    command: Option<Command>,
}

impl Future for Exchange<'_> {
    type Output = OpResult;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<OpResult> {
        let this = self.get_mut();
        match this.command.take() {
            Some(command) => {
                this.cell.command.set(Some(command));
                Poll::Pending
            }
            None => Poll::Ready(this.cell.result.get()),
        }
    }
}

/// Everything one invocation receives from the dispatcher: its channel
/// link, the built-in contexts, the dispatch-wide storage buffer, its
/// workgroup's shared memory, and the caller's argument tuple.
pub struct Invocation<A> {
    pub link: LaneLink,
    pub group: WorkGroupContext,
    pub thread: ThreadContext,
    pub ssbo: StorageBuffer,
    pub shared: SharedMemory,
    pub args: A,
}

/// A compiled shader: a factory producing one cooperative thread closure
/// per invocation. `compute_shader!` expands to a function returning an
/// implementation of this trait.
pub trait ComputeShader<A>: Sync {
    fn instantiate(&self, invocation: Invocation<A>) -> LaneFuture;
}

impl<A, F> ComputeShader<A> for F
where
    F: Fn(Invocation<A>) -> LaneFuture + Sync,
{
    fn instantiate(&self, invocation: Invocation<A>) -> LaneFuture {
        self(invocation)
    }
}

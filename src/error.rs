// Fatal dispatch errors.
//
// Every runtime error carries the workgroup and subgroup it was raised in.
// None of them are recoverable: the first one aborts the whole dispatch,
// and shader code has no way to observe or catch them.

use thiserror::Error;

use crate::channel::Op;
use crate::context::UVec3;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EmuError {
    /// The installed thread pool cannot hold every concurrently blocked
    /// subgroup scheduler plus one supervisor per resident workgroup.
    #[error("thread pool too small: {required} threads required, {available} available")]
    PoolTooSmall { available: usize, required: usize },

    /// Two threads of one subgroup arrived at workgroup barriers with
    /// different operation ids.
    #[error(
        "non-uniform barrier in workgroup {work_group} subgroup {subgroup}: \
         threads waiting at op {op_id_a} and op {op_id_b}"
    )]
    NonUniformBarrier {
        work_group: UVec3,
        subgroup: u32,
        op_id_a: u32,
        op_id_b: u32,
    },

    /// A scheduler tick made no progress while unfinished threads remain,
    /// or a workgroup barrier was abandoned by retiring subgroups.
    #[error(
        "deadlock in workgroup {work_group} subgroup {subgroup}: \
         {barrier_count} of {num_active} threads at barrier, no progress"
    )]
    Deadlock {
        work_group: UVec3,
        subgroup: u32,
        barrier_count: usize,
        num_active: usize,
    },

    /// A command was answered by a result of a different kind, a thread
    /// suspended without depositing a command, or a convergence group
    /// carried malformed payloads. Indicates a transform/runtime mismatch.
    #[error(
        "invalid subgroup operation in workgroup {work_group} subgroup {subgroup}: \
         command {expected:?} answered by {got:?}"
    )]
    InvalidOp {
        work_group: UVec3,
        subgroup: u32,
        expected: Op,
        got: Op,
    },
}

//! CPU-hosted emulator of the GPU compute-shader execution model.
//!
//! Shader bodies are written in Rust syntax against GLSL-style built-ins
//! and subgroup intrinsics, rewritten at build time by [`compute_shader!`]
//! into factories of cooperative thread closures, and executed by a
//! lockstep scheduler that reproduces real subgroup semantics: divergence
//! and reconvergence, collective operations over the active lanes, and
//! two-tier (subgroup + workgroup) synchronization.
//!
//! # Example
//!
//! ```ignore
//! use shader_emu::{compute_shader, run_compute_no_shared, StorageBuffer};
//!
//! compute_shader! {
//!     fn sum_into_slot_zero() {
//!         let gid = gl_GlobalInvocationID.x as usize;
//!         let v = ssbo.read_u32(1 + gid);
//!         let total = subgroup_add(v);
//!         if gl_SubgroupInvocationID == 0 {
//!             ssbo.atomic_add_u32(0, total);
//!         }
//!     }
//! }
//!
//! let ssbo = StorageBuffer::zeroed(1 + 64);
//! for i in 0..64 {
//!     ssbo.write_u32(1 + i, i as u32);
//! }
//! run_compute_no_shared((4, 1, 1), (16, 1, 1), &sum_into_slot_zero(), &ssbo, ())?;
//! assert_eq!(ssbo.read_u32(0), 2016);
//! # Ok::<(), shader_emu::EmuError>(())
//! ```
//!
//! The subgroup width and the concurrent-workgroup cap are compile-time
//! constants in [`config`]. All runtime failures (non-uniform barriers,
//! deadlocks, invalid operations, an under-sized thread pool) surface as
//! [`EmuError`] from [`run_compute`]; shader code cannot observe them.

mod barrier;
mod collective;
mod scheduler;

pub mod buffer;
pub mod channel;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod lane;
pub mod mask;

// The shader transform. Expands to a factory returning `impl ComputeShader`.
pub use shader_emu_macro::compute_shader;

pub use buffer::{AtomicWords, SharedMemory, SharedSeed, StorageBuffer};
pub use channel::{
    Command, CommandPayload, Op, OpResult, ResultPayload, ScalarValue, ShaderScalar, ThreadState,
    ValueType,
};
pub use config::{MAX_CONCURRENT_WORKGROUPS, SUBGROUP_SIZE};
pub use context::{uvec3, uvec4, ThreadContext, UVec3, UVec4, WorkGroupContext};
pub use dispatch::{run_compute, run_compute_no_shared};
pub use error::EmuError;
pub use lane::{ComputeShader, Invocation, LaneFuture, LaneLink};
pub use mask::{
    ballot_bit_count, ballot_bit_extract, ballot_exclusive_bit_count, ballot_find_lsb,
    ballot_find_msb, ballot_inclusive_bit_count, inverse_ballot,
};

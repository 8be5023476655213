//! Shader transform.
//!
//! The `compute_shader!` macro rewrites a shader body, written in Rust
//! syntax against the GLSL-style built-ins and subgroup intrinsics, into a
//! factory producing one cooperative thread closure per invocation. The
//! closure emits a command on the lane's channel at every intrinsic call
//! and every reconverge marker, suspends, and resumes when the subgroup
//! scheduler writes the result back.
//!
//! # Example
//!
//! ```ignore
//! use shader_emu::compute_shader;
//!
//! compute_shader! {
//!     fn scaled_sum(scale: f32) {
//!         let gid = gl_GlobalInvocationID.x as usize;
//!         let v = ssbo.read_f32(gid) * scale;
//!         let total = subgroup_add(v);
//!         if subgroup_elect() {
//!             ssbo.write_f32(gid, total);
//!         }
//!     }
//! }
//!
//! // `scaled_sum()` returns the compiled shader; dispatch it with
//! // `shader_emu::run_compute(.., &scaled_sum(), .., (2.0f32,))`.
//! ```
//!
//! Inside the body the following names are in scope:
//!
//! - `ssbo`: the dispatch-wide storage buffer,
//! - `shared`: this workgroup's shared memory,
//! - the declared arguments, cloned per invocation from the dispatch call,
//! - the built-ins: `gl_NumWorkGroups`, `gl_WorkGroupSize`,
//!   `gl_WorkGroupID`, `gl_NumSubgroups`, `gl_SubgroupID`,
//!   `gl_SubgroupSize`, `gl_LocalInvocationID`, `gl_GlobalInvocationID`,
//!   `gl_SubgroupInvocationID`, and the five `gl_Subgroup*Mask` values.
//!
//! Divergent control flow is legal: the transform inserts reconverge
//! markers after `if`/`match` and around loops that `continue` or `break`,
//! so diverged lanes re-merge and collectives always run over the lanes
//! that actually reached them. The one hard rule is the GPU rule:
//! `barrier()` must be reached uniformly by the whole workgroup, or the
//! dispatch fails.

mod intrinsics;
mod transform;

use proc_macro::TokenStream;
use syn::parse_macro_input;

/// Compiles a shader body into a cooperative thread factory.
///
/// `compute_shader! { fn name(args..) { body } }` expands to
/// `fn name() -> impl shader_emu::ComputeShader<(ArgTypes..,)>`.
///
/// Structural errors (nested routine definitions, wrong intrinsic arity,
/// intrinsics inside nested closures) are reported at compile time.
#[proc_macro]
pub fn compute_shader(input: TokenStream) -> TokenStream {
    let func = parse_macro_input!(input as syn::ItemFn);
    transform::expand(func)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

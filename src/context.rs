// Built-in invocation contexts.
//
// `WorkGroupContext` is immutable within a subgroup and cloned into every
// scheduler; `ThreadContext` is computed once per invocation when the
// dispatcher materializes the topology. Both are plain data handed to the
// shader prelude as the `gl_*` built-ins.

use std::fmt;

use crate::config::SUBGROUP_SIZE;
use crate::mask;

/// Minimal 3-component u32 vector used for the grid-shaped built-ins.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UVec3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

pub const fn uvec3(x: u32, y: u32, z: u32) -> UVec3 {
    UVec3 { x, y, z }
}

impl fmt::Display for UVec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Minimal 4-component u32 vector; the shape of ballot masks. Only the low
/// word carries lanes (subgroups never exceed 32 lanes), the rest is kept
/// for API compatibility and is always zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UVec4 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub w: u32,
}

pub const fn uvec4(x: u32, y: u32, z: u32, w: u32) -> UVec4 {
    UVec4 { x, y, z, w }
}

/// Per-workgroup built-ins, fixed for the lifetime of one subgroup run.
#[derive(Clone, Debug)]
pub struct WorkGroupContext {
    pub num_work_groups: UVec3,
    pub work_group_size: UVec3,
    pub work_group_id: UVec3,
    pub num_subgroups: u32,
    pub subgroup_id: u32,
}

impl WorkGroupContext {
    /// Invocations per workgroup.
    pub fn threads_per_workgroup(&self) -> u32 {
        self.work_group_size.x * self.work_group_size.y * self.work_group_size.z
    }
}

/// Per-invocation built-ins.
#[derive(Clone, Copy, Debug)]
pub struct ThreadContext {
    pub global_invocation_id: UVec3,
    pub local_invocation_id: UVec3,
    pub subgroup_invocation_id: u32,
    pub subgroup_eq_mask: UVec4,
    pub subgroup_ge_mask: UVec4,
    pub subgroup_gt_mask: UVec4,
    pub subgroup_le_mask: UVec4,
    pub subgroup_lt_mask: UVec4,
}

impl ThreadContext {
    /// Builds the context for the thread at `local_linear` within its
    /// workgroup, sitting on `lane` of its subgroup. Local coordinates come
    /// from the row-major unrolling of the workgroup size.
    pub fn new(group: &WorkGroupContext, lane: u32, local_linear: u32) -> Self {
        let size = group.work_group_size;
        let local = uvec3(
            local_linear % size.x,
            (local_linear / size.x) % size.y,
            local_linear / (size.x * size.y),
        );
        let global = uvec3(
            group.work_group_id.x * size.x + local.x,
            group.work_group_id.y * size.y + local.y,
            group.work_group_id.z * size.z + local.z,
        );
        debug_assert!((lane as usize) < SUBGROUP_SIZE);

        ThreadContext {
            global_invocation_id: global,
            local_invocation_id: local,
            subgroup_invocation_id: lane,
            subgroup_eq_mask: mask::low_word(mask::eq_bits(lane)),
            subgroup_ge_mask: mask::low_word(mask::ge_bits(lane)),
            subgroup_gt_mask: mask::low_word(mask::gt_bits(lane)),
            subgroup_le_mask: mask::low_word(mask::le_bits(lane)),
            subgroup_lt_mask: mask::low_word(mask::lt_bits(lane)),
        }
    }
}

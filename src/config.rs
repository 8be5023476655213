// Build-time emulator configuration.
//
// Every knob here is a compile-time constant: the subgroup width is baked
// into the lane-vector array types, so it cannot be chosen at runtime.

/// Number of lanes that execute in lockstep within one subgroup.
pub const SUBGROUP_SIZE: usize = 8;

/// Upper bound on workgroups resident at the same time. Workgroups are
/// dispatched in row-major batches of this size.
pub const MAX_CONCURRENT_WORKGROUPS: usize = 2;

/// When true, every convergence group executed by the subgroup selected
/// below is traced to stderr.
pub const DEBUG_TRACE: bool = false;

/// Workgroup whose collective traffic is traced.
pub const DEBUG_WORKGROUP_X: u32 = 0;
pub const DEBUG_WORKGROUP_Y: u32 = 0;
pub const DEBUG_WORKGROUP_Z: u32 = 0;

/// Subgroup (within the workgroup above) whose collective traffic is traced.
pub const DEBUG_SUBGROUP_ID: u32 = 0;

// A subgroup must have at least one lane, and the precomputed lane masks
// assume every lane fits in the low word of a ballot.
const _: () = assert!(SUBGROUP_SIZE >= 1, "subgroup size must be at least 1");
const _: () = assert!(SUBGROUP_SIZE <= 32, "ballot masks hold at most 32 lanes");

//! Intrinsic call-site table.
//!
//! Maps the shader-facing intrinsic names to their rewrite shape: which
//! channel helper they lower to, the `Op` tag they carry, and their arity.
//! Everything else a shader calls (buffer accessors, ballot-mask helpers,
//! plain functions) passes through the transform untouched.

/// How an intrinsic call site is lowered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lowering {
    /// Value in, value of the same type out. `binary` sites carry a second
    /// u32 argument (lane id / mask / delta) in the command's aux slot.
    Scalar { op: &'static str, binary: bool },
    /// Value in, bool out (all-equal).
    ScalarTest { op: &'static str },
    /// Bool in, bool out (all / any).
    Predicate { op: &'static str },
    /// Bool in, ballot mask out.
    Ballot,
    /// No argument, bool out.
    Elect,
    /// No argument, no result payload. Parks the thread.
    Sync { op: &'static str },
}

impl Lowering {
    pub fn arity(&self) -> usize {
        match self {
            Lowering::Scalar { binary: true, .. } => 2,
            Lowering::Scalar { binary: false, .. } => 1,
            Lowering::ScalarTest { .. } | Lowering::Predicate { .. } | Lowering::Ballot => 1,
            Lowering::Elect | Lowering::Sync { .. } => 0,
        }
    }
}

/// Looks up an intrinsic by its shader-facing name.
pub fn lookup(name: &str) -> Option<Lowering> {
    let lowering = match name {
        "subgroup_broadcast" => Lowering::Scalar { op: "Broadcast", binary: true },
        "subgroup_broadcast_first" => Lowering::Scalar { op: "BroadcastFirst", binary: false },
        "subgroup_add" => Lowering::Scalar { op: "Add", binary: false },
        "subgroup_min" => Lowering::Scalar { op: "Min", binary: false },
        "subgroup_max" => Lowering::Scalar { op: "Max", binary: false },
        "subgroup_inclusive_add" => Lowering::Scalar { op: "InclusiveAdd", binary: false },
        "subgroup_exclusive_add" => Lowering::Scalar { op: "ExclusiveAdd", binary: false },
        "subgroup_shuffle" => Lowering::Scalar { op: "Shuffle", binary: true },
        "subgroup_shuffle_xor" => Lowering::Scalar { op: "ShuffleXor", binary: true },
        "subgroup_shuffle_down" => Lowering::Scalar { op: "ShuffleDown", binary: true },
        "subgroup_shuffle_up" => Lowering::Scalar { op: "ShuffleUp", binary: true },
        "subgroup_all_equal" => Lowering::ScalarTest { op: "AllEqual" },
        "subgroup_all" => Lowering::Predicate { op: "All" },
        "subgroup_any" => Lowering::Predicate { op: "Any" },
        "subgroup_ballot" => Lowering::Ballot,
        "subgroup_elect" => Lowering::Elect,
        "subgroup_barrier" => Lowering::Sync { op: "SubgroupBarrier" },
        "subgroup_memory_barrier" => Lowering::Sync { op: "SubgroupMemoryBarrier" },
        "barrier" => Lowering::Sync { op: "Barrier" },
        "memory_barrier" => Lowering::Sync { op: "MemoryBarrier" },
        "group_memory_barrier" => Lowering::Sync { op: "GroupMemoryBarrier" },
        _ => return None,
    };
    Some(lowering)
}

/// Synchronization classes the peephole pass reasons about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncClass {
    SubgroupBarrier,
    SubgroupMemoryBarrier,
    Barrier,
    MemoryBarrier,
    GroupMemoryBarrier,
}

/// Classifies a bare intrinsic sync call by name.
pub fn sync_class(name: &str) -> Option<SyncClass> {
    match name {
        "subgroup_barrier" => Some(SyncClass::SubgroupBarrier),
        "subgroup_memory_barrier" => Some(SyncClass::SubgroupMemoryBarrier),
        "barrier" => Some(SyncClass::Barrier),
        "memory_barrier" => Some(SyncClass::MemoryBarrier),
        "group_memory_barrier" => Some(SyncClass::GroupMemoryBarrier),
        _ => None,
    }
}

/// True when the later sync point makes the earlier memory barrier
/// redundant: a full barrier subsumes the workgroup-scope memory barriers,
/// and either barrier flavor subsumes a subgroup memory barrier.
pub fn subsumes(later: SyncClass, earlier: SyncClass) -> bool {
    match earlier {
        SyncClass::SubgroupMemoryBarrier => {
            matches!(later, SyncClass::Barrier | SyncClass::SubgroupBarrier)
        }
        SyncClass::MemoryBarrier | SyncClass::GroupMemoryBarrier => {
            matches!(later, SyncClass::Barrier)
        }
        _ => false,
    }
}

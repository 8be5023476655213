// Command/result channel types.
//
// A cooperative thread talks to its subgroup scheduler in exactly one way:
// it deposits a `Command` at a suspension point and consumes an `OpResult`
// when it is resumed. Both sides of the exchange are tagged with the static
// operation id the transform assigned to the call site; the scheduler uses
// that id as its convergence-grouping key.

use crate::config::SUBGROUP_SIZE;

/// Scalar type tags. The emulator's collectives are closed over this set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    I32,
    U32,
    F32,
    F64,
}

/// A typed scalar travelling over the command/result channel.
///
/// This is the tagged-union rendition of a 64-bit raw cell paired with a
/// [`ValueType`]; the variant is the tag.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScalarValue {
    Bool(bool),
    I32(i32),
    U32(u32),
    F32(f32),
    F64(f64),
}

impl ScalarValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            ScalarValue::Bool(_) => ValueType::Bool,
            ScalarValue::I32(_) => ValueType::I32,
            ScalarValue::U32(_) => ValueType::U32,
            ScalarValue::F32(_) => ValueType::F32,
            ScalarValue::F64(_) => ValueType::F64,
        }
    }
}

/// Conversion between concrete shader scalars and channel values.
///
/// Implemented for exactly the five supported scalar types; the transform
/// relies on it to keep intrinsic call sites monomorphic in the shader
/// while the wire format stays type-erased.
pub trait ShaderScalar: Copy {
    fn into_scalar(self) -> ScalarValue;
    fn from_scalar(value: ScalarValue) -> Option<Self>;
}

macro_rules! impl_shader_scalar {
    ($ty:ty, $variant:ident) => {
        impl ShaderScalar for $ty {
            fn into_scalar(self) -> ScalarValue {
                ScalarValue::$variant(self)
            }

            fn from_scalar(value: ScalarValue) -> Option<Self> {
                match value {
                    ScalarValue::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_shader_scalar!(bool, Bool);
impl_shader_scalar!(i32, I32);
impl_shader_scalar!(u32, U32);
impl_shader_scalar!(f32, F32);
impl_shader_scalar!(f64, F64);

/// Operation tags shared by commands and results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    // Control.
    Invalid,
    Reconverge,

    // Collective scalar ops.
    Broadcast,
    BroadcastFirst,
    Add,
    Min,
    Max,
    InclusiveAdd,
    ExclusiveAdd,
    Shuffle,
    ShuffleXor,
    ShuffleDown,
    ShuffleUp,
    AllEqual,

    // Collective boolean ops.
    Ballot,
    All,
    Any,
    Elect,

    // Synchronization.
    SubgroupBarrier,
    SubgroupMemoryBarrier,
    Barrier,
    MemoryBarrier,
    GroupMemoryBarrier,
}

/// Payload a thread attaches to a command.
///
/// `aux` is the second argument of the binary collectives: a lane id for
/// broadcast/shuffle, a mask for shuffle-xor, a delta for shuffle-up/down.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CommandPayload {
    None,
    Scalar { value: ScalarValue, aux: u32 },
    Flag(bool),
}

/// Emitted by a cooperative thread at every suspension point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Command {
    pub op_id: u32,
    pub op: Op,
    pub payload: CommandPayload,
}

impl Command {
    pub fn scalar(op_id: u32, op: Op, value: ScalarValue, aux: u32) -> Self {
        Command {
            op_id,
            op,
            payload: CommandPayload::Scalar { value, aux },
        }
    }

    pub fn flag(op_id: u32, op: Op, flag: bool) -> Self {
        Command {
            op_id,
            op,
            payload: CommandPayload::Flag(flag),
        }
    }

    pub fn sync(op_id: u32, op: Op) -> Self {
        Command {
            op_id,
            op,
            payload: CommandPayload::None,
        }
    }

    pub fn invalid() -> Self {
        Command {
            op_id: u32::MAX,
            op: Op::Invalid,
            payload: CommandPayload::None,
        }
    }
}

/// Payload the scheduler writes back. Same shape as the command payload but
/// without `aux`; the boolean variant answers elect/all/any/all-equal.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ResultPayload {
    None,
    Scalar(ScalarValue),
    Flag(bool),
}

/// Written back by the scheduler before a thread is resumed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OpResult {
    pub op_id: u32,
    pub op: Op,
    pub payload: ResultPayload,
}

impl OpResult {
    pub fn scalar(op_id: u32, op: Op, value: ScalarValue) -> Self {
        OpResult {
            op_id,
            op,
            payload: ResultPayload::Scalar(value),
        }
    }

    pub fn flag(op_id: u32, op: Op, flag: bool) -> Self {
        OpResult {
            op_id,
            op,
            payload: ResultPayload::Flag(flag),
        }
    }

    pub fn sync(op_id: u32, op: Op) -> Self {
        OpResult {
            op_id,
            op,
            payload: ResultPayload::None,
        }
    }

    pub fn invalid() -> Self {
        OpResult {
            op_id: u32::MAX,
            op: Op::Invalid,
            payload: ResultPayload::None,
        }
    }
}

/// Scheduling state of one cooperative thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// Resumable every tick; its pending command (if any) is a collective.
    Running,
    /// Parked on a reconverge marker.
    Halted,
    /// Parked on a subgroup barrier or memory barrier.
    AtSubBarrier,
    /// Parked on a workgroup barrier.
    AtBarrier,
    /// The closure ran to completion.
    Finished,
}

/// Lane-indexed state vector, one slot per subgroup lane.
pub type LaneVec<T> = [T; SUBGROUP_SIZE];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trips_preserve_type() {
        assert_eq!(i32::from_scalar((-7i32).into_scalar()), Some(-7));
        assert_eq!(u32::from_scalar(9u32.into_scalar()), Some(9));
        assert_eq!(f64::from_scalar(2.5f64.into_scalar()), Some(2.5));
        assert_eq!(bool::from_scalar(true.into_scalar()), Some(true));
    }

    #[test]
    fn scalar_conversion_rejects_cross_type_reads() {
        assert_eq!(i32::from_scalar(ScalarValue::U32(1)), None);
        assert_eq!(f32::from_scalar(ScalarValue::F64(1.0)), None);
    }

    #[test]
    fn value_type_tags_match_variants() {
        assert_eq!(ScalarValue::F32(0.0).value_type(), ValueType::F32);
        assert_eq!(ScalarValue::Bool(false).value_type(), ValueType::Bool);
    }
}

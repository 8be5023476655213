// Subgroup collective kernels.
//
// Pure functions over the lane vectors: given the commands of one
// convergence group and the ascending list of its active lanes, fill in the
// results for those lanes. The first active lane is the group's "first
// thread" (the elect winner and the broadcast-first source). Reductions and
// scans walk the active set in ascending lane order, so floating-point
// results are deterministic for a given divergence pattern.

use crate::channel::{Command, CommandPayload, LaneVec, Op, OpResult, ScalarValue, ValueType};
use crate::config::SUBGROUP_SIZE;
use crate::context::WorkGroupContext;
use crate::error::EmuError;

/// Executes one convergence group's collective, writing `results` for every
/// lane in `active`. Synchronization ops produce bare echo results; the
/// scheduler has already performed their barrier/fence work.
pub(crate) fn execute(
    op: Op,
    op_id: u32,
    commands: &LaneVec<Command>,
    results: &mut LaneVec<OpResult>,
    active: &[usize],
    group: &WorkGroupContext,
) -> Result<(), EmuError> {
    match op {
        Op::Reconverge
        | Op::SubgroupBarrier
        | Op::SubgroupMemoryBarrier
        | Op::Barrier
        | Op::MemoryBarrier
        | Op::GroupMemoryBarrier => {
            for &t in active {
                results[t] = OpResult::sync(op_id, op);
            }
            Ok(())
        }

        Op::Broadcast => {
            let (_, id) = scalar_command(commands, active[0], op, group)?;
            let source = if active.contains(&(id as usize)) {
                id as usize
            } else {
                active[0]
            };
            let (value, _) = scalar_command(commands, source, op, group)?;
            for &t in active {
                results[t] = OpResult::scalar(op_id, op, value);
            }
            Ok(())
        }

        Op::BroadcastFirst => {
            let (value, _) = scalar_command(commands, active[0], op, group)?;
            for &t in active {
                results[t] = OpResult::scalar(op_id, op, value);
            }
            Ok(())
        }

        Op::Add | Op::Min | Op::Max => {
            let values = gather(commands, active, op, group)?;
            let mut acc = identity(op, values[0].value_type())
                .ok_or_else(|| malformed(op, group))?;
            for &v in &values {
                acc = combine(op, acc, v).ok_or_else(|| malformed(op, group))?;
            }
            for &t in active {
                results[t] = OpResult::scalar(op_id, op, acc);
            }
            Ok(())
        }

        Op::InclusiveAdd => {
            let values = gather(commands, active, op, group)?;
            let mut acc = identity(Op::Add, values[0].value_type())
                .ok_or_else(|| malformed(op, group))?;
            for (i, &t) in active.iter().enumerate() {
                acc = combine(Op::Add, acc, values[i]).ok_or_else(|| malformed(op, group))?;
                results[t] = OpResult::scalar(op_id, op, acc);
            }
            Ok(())
        }

        Op::ExclusiveAdd => {
            let values = gather(commands, active, op, group)?;
            let mut acc = identity(Op::Add, values[0].value_type())
                .ok_or_else(|| malformed(op, group))?;
            for (i, &t) in active.iter().enumerate() {
                results[t] = OpResult::scalar(op_id, op, acc);
                acc = combine(Op::Add, acc, values[i]).ok_or_else(|| malformed(op, group))?;
            }
            Ok(())
        }

        Op::Shuffle | Op::ShuffleXor | Op::ShuffleDown | Op::ShuffleUp => {
            for &t in active {
                let (own, aux) = scalar_command(commands, t, op, group)?;
                let source = shuffle_source(op, t, aux);
                let value = match source {
                    Some(s) if s < SUBGROUP_SIZE && active.contains(&s) => {
                        scalar_command(commands, s, op, group)?.0
                    }
                    _ => own,
                };
                results[t] = OpResult::scalar(op_id, op, value);
            }
            Ok(())
        }

        Op::AllEqual => {
            let values = gather(commands, active, op, group)?;
            let first = values[0];
            let equal = values.iter().all(|v| *v == first);
            for &t in active {
                results[t] = OpResult::flag(op_id, op, equal);
            }
            Ok(())
        }

        Op::Ballot => {
            let mut bits = 0u32;
            for &t in active {
                if flag_command(commands, t, op, group)? {
                    bits |= 1 << t;
                }
            }
            for &t in active {
                results[t] = OpResult::scalar(op_id, op, ScalarValue::U32(bits));
            }
            Ok(())
        }

        Op::Elect => {
            for &t in active {
                results[t] = OpResult::flag(op_id, op, t == active[0]);
            }
            Ok(())
        }

        Op::All => {
            let mut all = true;
            for &t in active {
                all &= flag_command(commands, t, op, group)?;
            }
            for &t in active {
                results[t] = OpResult::flag(op_id, op, all);
            }
            Ok(())
        }

        Op::Any => {
            let mut any = false;
            for &t in active {
                any |= flag_command(commands, t, op, group)?;
            }
            for &t in active {
                results[t] = OpResult::flag(op_id, op, any);
            }
            Ok(())
        }

        Op::Invalid => Err(malformed(op, group)),
    }
}

/// Lane index a shuffle variant reads from, before bounds/membership checks.
fn shuffle_source(op: Op, lane: usize, aux: u32) -> Option<usize> {
    match op {
        Op::Shuffle => Some(aux as usize),
        Op::ShuffleXor => Some(lane ^ aux as usize),
        Op::ShuffleDown => lane.checked_add(aux as usize),
        Op::ShuffleUp => lane.checked_sub(aux as usize),
        _ => None,
    }
}

fn malformed(op: Op, group: &WorkGroupContext) -> EmuError {
    // `Op::Invalid` on the `got` side stands for a malformed payload.
    EmuError::InvalidOp {
        work_group: group.work_group_id,
        subgroup: group.subgroup_id,
        expected: op,
        got: Op::Invalid,
    }
}

fn scalar_command(
    commands: &LaneVec<Command>,
    lane: usize,
    op: Op,
    group: &WorkGroupContext,
) -> Result<(ScalarValue, u32), EmuError> {
    match commands[lane].payload {
        CommandPayload::Scalar { value, aux } => Ok((value, aux)),
        _ => Err(malformed(op, group)),
    }
}

fn flag_command(
    commands: &LaneVec<Command>,
    lane: usize,
    op: Op,
    group: &WorkGroupContext,
) -> Result<bool, EmuError> {
    match commands[lane].payload {
        CommandPayload::Flag(flag) => Ok(flag),
        _ => Err(malformed(op, group)),
    }
}

/// Collects the group's values and checks they share one value type.
fn gather(
    commands: &LaneVec<Command>,
    active: &[usize],
    op: Op,
    group: &WorkGroupContext,
) -> Result<Vec<ScalarValue>, EmuError> {
    let mut values = Vec::with_capacity(active.len());
    for &t in active {
        values.push(scalar_command(commands, t, op, group)?.0);
    }
    let ty = values[0].value_type();
    if values.iter().any(|v| v.value_type() != ty) {
        return Err(malformed(op, group));
    }
    Ok(values)
}

/// Typed identity element: 0 for add, the type's maximum for min, the
/// type's minimum (signed low) for max. Booleans have none.
fn identity(op: Op, ty: ValueType) -> Option<ScalarValue> {
    match (op, ty) {
        (Op::Add, ValueType::I32) => Some(ScalarValue::I32(0)),
        (Op::Add, ValueType::U32) => Some(ScalarValue::U32(0)),
        (Op::Add, ValueType::F32) => Some(ScalarValue::F32(0.0)),
        (Op::Add, ValueType::F64) => Some(ScalarValue::F64(0.0)),
        (Op::Min, ValueType::I32) => Some(ScalarValue::I32(i32::MAX)),
        (Op::Min, ValueType::U32) => Some(ScalarValue::U32(u32::MAX)),
        (Op::Min, ValueType::F32) => Some(ScalarValue::F32(f32::MAX)),
        (Op::Min, ValueType::F64) => Some(ScalarValue::F64(f64::MAX)),
        (Op::Max, ValueType::I32) => Some(ScalarValue::I32(i32::MIN)),
        (Op::Max, ValueType::U32) => Some(ScalarValue::U32(u32::MIN)),
        (Op::Max, ValueType::F32) => Some(ScalarValue::F32(f32::MIN)),
        (Op::Max, ValueType::F64) => Some(ScalarValue::F64(f64::MIN)),
        _ => None,
    }
}

/// Applies one reduction step. Integer adds wrap; min/max on floats follow
/// the usual partial-order rules.
fn combine(op: Op, a: ScalarValue, b: ScalarValue) -> Option<ScalarValue> {
    use ScalarValue::*;
    match (op, a, b) {
        (Op::Add, I32(x), I32(y)) => Some(I32(x.wrapping_add(y))),
        (Op::Add, U32(x), U32(y)) => Some(U32(x.wrapping_add(y))),
        (Op::Add, F32(x), F32(y)) => Some(F32(x + y)),
        (Op::Add, F64(x), F64(y)) => Some(F64(x + y)),
        (Op::Min, I32(x), I32(y)) => Some(I32(x.min(y))),
        (Op::Min, U32(x), U32(y)) => Some(U32(x.min(y))),
        (Op::Min, F32(x), F32(y)) => Some(F32(x.min(y))),
        (Op::Min, F64(x), F64(y)) => Some(F64(x.min(y))),
        (Op::Max, I32(x), I32(y)) => Some(I32(x.max(y))),
        (Op::Max, U32(x), U32(y)) => Some(U32(x.max(y))),
        (Op::Max, F32(x), F32(y)) => Some(F32(x.max(y))),
        (Op::Max, F64(x), F64(y)) => Some(F64(x.max(y))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ResultPayload;
    use crate::context::uvec3;

    fn group() -> WorkGroupContext {
        WorkGroupContext {
            num_work_groups: uvec3(1, 1, 1),
            work_group_size: uvec3(SUBGROUP_SIZE as u32, 1, 1),
            work_group_id: uvec3(0, 0, 0),
            num_subgroups: 1,
            subgroup_id: 0,
        }
    }

    fn lanes_i32(values: &[i32], op: Op) -> LaneVec<Command> {
        let mut commands = [Command::invalid(); SUBGROUP_SIZE];
        for (t, &v) in values.iter().enumerate() {
            commands[t] = Command::scalar(0, op, ScalarValue::I32(v), 0);
        }
        commands
    }

    fn scalar_i32(result: &OpResult) -> i32 {
        match result.payload {
            ResultPayload::Scalar(ScalarValue::I32(v)) => v,
            other => panic!("expected i32 scalar, got {:?}", other),
        }
    }

    fn flag(result: &OpResult) -> bool {
        match result.payload {
            ResultPayload::Flag(f) => f,
            other => panic!("expected flag, got {:?}", other),
        }
    }

    #[test]
    fn add_reduces_over_the_active_set_only() {
        let commands = lanes_i32(&[1, 2, 3, 4, 5, 6, 7, 8], Op::Add);
        let mut results = [OpResult::invalid(); SUBGROUP_SIZE];
        let active = [0, 2, 5];
        execute(Op::Add, 9, &commands, &mut results, &active, &group()).unwrap();
        for &t in &active {
            assert_eq!(scalar_i32(&results[t]), 1 + 3 + 6);
            assert_eq!(results[t].op_id, 9);
        }
    }

    #[test]
    fn min_max_use_typed_identities() {
        let commands = lanes_i32(&[5, -3, 9, 0, 0, 0, 0, 0], Op::Min);
        let mut results = [OpResult::invalid(); SUBGROUP_SIZE];
        execute(Op::Min, 1, &commands, &mut results, &[0, 1, 2], &group()).unwrap();
        assert_eq!(scalar_i32(&results[1]), -3);

        let commands = lanes_i32(&[5, -3, 9, 0, 0, 0, 0, 0], Op::Max);
        let mut results = [OpResult::invalid(); SUBGROUP_SIZE];
        execute(Op::Max, 1, &commands, &mut results, &[0, 1, 2], &group()).unwrap();
        assert_eq!(scalar_i32(&results[0]), 9);
    }

    #[test]
    fn prefix_sums_follow_active_set_order() {
        let commands = lanes_i32(&[10, 20, 30, 40, 50, 0, 0, 0], Op::InclusiveAdd);
        let mut results = [OpResult::invalid(); SUBGROUP_SIZE];
        let active = [1, 3, 4];
        execute(Op::InclusiveAdd, 2, &commands, &mut results, &active, &group()).unwrap();
        assert_eq!(scalar_i32(&results[1]), 20);
        assert_eq!(scalar_i32(&results[3]), 60);
        assert_eq!(scalar_i32(&results[4]), 110);

        let commands = lanes_i32(&[10, 20, 30, 40, 50, 0, 0, 0], Op::ExclusiveAdd);
        let mut results = [OpResult::invalid(); SUBGROUP_SIZE];
        execute(Op::ExclusiveAdd, 2, &commands, &mut results, &active, &group()).unwrap();
        assert_eq!(scalar_i32(&results[1]), 0);
        assert_eq!(scalar_i32(&results[3]), 20);
        assert_eq!(scalar_i32(&results[4]), 60);
    }

    #[test]
    fn broadcast_falls_back_to_first_for_inactive_sources() {
        let mut commands = [Command::invalid(); SUBGROUP_SIZE];
        for t in 0..SUBGROUP_SIZE {
            commands[t] = Command::scalar(0, Op::Broadcast, ScalarValue::I32(t as i32), 6);
        }
        let mut results = [OpResult::invalid(); SUBGROUP_SIZE];
        // Lane 6 is active: its value wins.
        execute(Op::Broadcast, 3, &commands, &mut results, &[1, 4, 6], &group()).unwrap();
        assert_eq!(scalar_i32(&results[1]), 6);

        // Lane 6 inactive: first active lane's value wins.
        execute(Op::Broadcast, 3, &commands, &mut results, &[1, 4], &group()).unwrap();
        assert_eq!(scalar_i32(&results[4]), 1);
    }

    #[test]
    fn shuffles_fall_back_to_own_value() {
        let mut commands = [Command::invalid(); SUBGROUP_SIZE];
        for t in 0..SUBGROUP_SIZE {
            // Every lane asks for lane + 2.
            commands[t] = Command::scalar(0, Op::ShuffleDown, ScalarValue::I32(t as i32), 2);
        }
        let mut results = [OpResult::invalid(); SUBGROUP_SIZE];
        let active = [0, 1, 2, 3];
        execute(Op::ShuffleDown, 4, &commands, &mut results, &active, &group()).unwrap();
        assert_eq!(scalar_i32(&results[0]), 2);
        assert_eq!(scalar_i32(&results[1]), 3);
        // Sources 4 and 5 are outside the active set: own value.
        assert_eq!(scalar_i32(&results[2]), 2);
        assert_eq!(scalar_i32(&results[3]), 3);
    }

    #[test]
    fn shuffle_up_guards_underflow() {
        let mut commands = [Command::invalid(); SUBGROUP_SIZE];
        for t in 0..SUBGROUP_SIZE {
            commands[t] = Command::scalar(0, Op::ShuffleUp, ScalarValue::I32(t as i32), 1);
        }
        let mut results = [OpResult::invalid(); SUBGROUP_SIZE];
        execute(Op::ShuffleUp, 4, &commands, &mut results, &[0, 1, 2], &group()).unwrap();
        assert_eq!(scalar_i32(&results[0]), 0);
        assert_eq!(scalar_i32(&results[1]), 0);
        assert_eq!(scalar_i32(&results[2]), 1);
    }

    #[test]
    fn ballot_sets_bits_for_active_true_lanes() {
        let mut commands = [Command::invalid(); SUBGROUP_SIZE];
        for t in 0..SUBGROUP_SIZE {
            commands[t] = Command::flag(0, Op::Ballot, t % 2 == 0);
        }
        let mut results = [OpResult::invalid(); SUBGROUP_SIZE];
        let active = [0, 1, 2, 3, 4];
        execute(Op::Ballot, 5, &commands, &mut results, &active, &group()).unwrap();
        match results[0].payload {
            ResultPayload::Scalar(ScalarValue::U32(bits)) => assert_eq!(bits, 0b1_0101),
            other => panic!("expected u32 mask, got {:?}", other),
        }
    }

    #[test]
    fn elect_picks_exactly_the_first_active_lane() {
        let mut commands = [Command::invalid(); SUBGROUP_SIZE];
        for t in 0..SUBGROUP_SIZE {
            commands[t] = Command::flag(0, Op::Elect, false);
        }
        let mut results = [OpResult::invalid(); SUBGROUP_SIZE];
        execute(Op::Elect, 6, &commands, &mut results, &[2, 3, 7], &group()).unwrap();
        assert!(flag(&results[2]));
        assert!(!flag(&results[3]));
        assert!(!flag(&results[7]));
    }

    #[test]
    fn all_any_and_all_equal() {
        let mut commands = [Command::invalid(); SUBGROUP_SIZE];
        for t in 0..SUBGROUP_SIZE {
            commands[t] = Command::flag(0, Op::All, t != 3);
        }
        let mut results = [OpResult::invalid(); SUBGROUP_SIZE];
        execute(Op::All, 7, &commands, &mut results, &[0, 1, 2], &group()).unwrap();
        assert!(flag(&results[0]));
        execute(Op::All, 7, &commands, &mut results, &[2, 3, 4], &group()).unwrap();
        assert!(!flag(&results[2]));

        for t in 0..SUBGROUP_SIZE {
            commands[t] = Command::flag(0, Op::Any, t == 3);
        }
        execute(Op::Any, 7, &commands, &mut results, &[2, 3, 4], &group()).unwrap();
        assert!(flag(&results[4]));

        let commands = lanes_i32(&[4, 4, 4, 5, 0, 0, 0, 0], Op::AllEqual);
        execute(Op::AllEqual, 8, &commands, &mut results, &[0, 1, 2], &group()).unwrap();
        assert!(flag(&results[0]));
        execute(Op::AllEqual, 8, &commands, &mut results, &[1, 2, 3], &group()).unwrap();
        assert!(!flag(&results[1]));
    }

    #[test]
    fn bool_arithmetic_is_rejected() {
        let mut commands = [Command::invalid(); SUBGROUP_SIZE];
        for t in 0..SUBGROUP_SIZE {
            commands[t] = Command::scalar(0, Op::Add, ScalarValue::Bool(true), 0);
        }
        let mut results = [OpResult::invalid(); SUBGROUP_SIZE];
        let err = execute(Op::Add, 9, &commands, &mut results, &[0, 1], &group());
        assert!(matches!(err, Err(EmuError::InvalidOp { .. })));
    }

    #[test]
    fn mixed_value_types_are_rejected() {
        let mut commands = [Command::invalid(); SUBGROUP_SIZE];
        commands[0] = Command::scalar(0, Op::Add, ScalarValue::I32(1), 0);
        commands[1] = Command::scalar(0, Op::Add, ScalarValue::F32(1.0), 0);
        let mut results = [OpResult::invalid(); SUBGROUP_SIZE];
        let err = execute(Op::Add, 9, &commands, &mut results, &[0, 1], &group());
        assert!(matches!(err, Err(EmuError::InvalidOp { .. })));
    }

    #[test]
    fn float_reduction_is_deterministic_in_lane_order() {
        let mut commands = [Command::invalid(); SUBGROUP_SIZE];
        let values = [0.1f32, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8];
        for (t, &v) in values.iter().enumerate() {
            commands[t] = Command::scalar(0, Op::Add, ScalarValue::F32(v), 0);
        }
        let active: Vec<usize> = (0..SUBGROUP_SIZE).collect();
        let mut results = [OpResult::invalid(); SUBGROUP_SIZE];
        execute(Op::Add, 1, &commands, &mut results, &active, &group()).unwrap();
        let expected = values.iter().fold(0.0f32, |a, &b| a + b);
        match results[0].payload {
            ResultPayload::Scalar(ScalarValue::F32(v)) => assert_eq!(v, expected),
            other => panic!("expected f32, got {:?}", other),
        }
    }
}

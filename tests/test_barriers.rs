//! Workgroup and subgroup synchronization: barrier rendezvous across
//! subgroups, non-uniform-barrier detection, deadlock detection, memory
//! barriers, and the sync-point peephole of the transform.

use shader_emu::{compute_shader, run_compute_no_shared, EmuError, StorageBuffer};

fn with_pool<R: Send>(threads: usize, f: impl FnOnce() -> R + Send) -> R {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .expect("failed to build test pool")
        .install(f)
}

compute_shader! {
    fn broadcast_then_write_back() {
        let gid = gl_GlobalInvocationID.x as usize;
        let v = ssbo.read_i32(gid + 1);
        let b = subgroup_broadcast_first(v);
        barrier();
        ssbo.write_i32(gid, b);
        barrier();
    }
}

/// Two subgroups in a 16-wide workgroup: each subgroup broadcasts its lane
/// 0's read, and the barriers keep reads and writes apart.
#[test]
fn test_broadcast_first_across_two_subgroups() {
    let ssbo = StorageBuffer::zeroed(17);
    for i in 0..17 {
        ssbo.write_i32(i, i as i32);
    }
    with_pool(8, || {
        run_compute_no_shared((1, 1, 1), (16, 1, 1), &broadcast_then_write_back(), &ssbo, ())
            .unwrap();
    });
    let out: Vec<i32> = (0..16).map(|i| ssbo.read_i32(i)).collect();
    assert_eq!(out, vec![1, 1, 1, 1, 1, 1, 1, 1, 9, 9, 9, 9, 9, 9, 9, 9]);
}

compute_shader! {
    fn exchange_across_subgroups() {
        let gid = gl_GlobalInvocationID.x as usize;
        let lid = gl_LocalInvocationID.x;
        let size = gl_WorkGroupSize.x;
        ssbo.write_u32(gid, gid as u32 * 2);
        barrier();
        let partner = (lid + size / 2) % size;
        let base = gid - lid as usize;
        let seen = ssbo.read_u32(base + partner as usize);
        ssbo.write_u32(64 + gid, seen);
    }
}

/// A store before the barrier is visible to the cross-subgroup partner
/// after it (happens-before across the workgroup).
#[test]
fn test_barrier_orders_cross_subgroup_stores() {
    let ssbo = StorageBuffer::zeroed(128);
    with_pool(8, || {
        run_compute_no_shared((2, 1, 1), (16, 1, 1), &exchange_across_subgroups(), &ssbo, ())
            .unwrap();
    });
    for gid in 0..32usize {
        let lid = gid % 16;
        let base = gid - lid;
        let partner = base + (lid + 8) % 16;
        assert_eq!(
            ssbo.read_u32(64 + gid),
            partner as u32 * 2,
            "thread {} reads its partner's pre-barrier store",
            gid
        );
    }
}

compute_shader! {
    fn lone_barrier() {
        if gl_LocalInvocationID.x == 1 {
            barrier();
        }
    }
}

/// A barrier inside a divergent branch can never complete; the scheduler
/// must fail in finite ticks instead of hanging.
#[test]
fn test_barrier_in_divergent_branch_fails_fast() {
    let ssbo = StorageBuffer::zeroed(1);
    let result = with_pool(8, || {
        run_compute_no_shared((1, 1, 1), (16, 1, 1), &lone_barrier(), &ssbo, ())
    });
    match result {
        Err(EmuError::Deadlock {
            barrier_count,
            num_active,
            ..
        }) => {
            assert_eq!(barrier_count, 1);
            assert_eq!(num_active, 8);
        }
        other => panic!("expected deadlock, got {:?}", other),
    }
}

compute_shader! {
    fn forked_barriers() {
        if gl_SubgroupInvocationID < 4 {
            barrier();
        } else {
            barrier();
        }
    }
}

/// Threads of one subgroup arriving at two different barrier sites is a
/// non-uniform barrier.
#[test]
fn test_non_uniform_barrier_is_detected() {
    let ssbo = StorageBuffer::zeroed(1);
    let result = with_pool(6, || {
        run_compute_no_shared((1, 1, 1), (8, 1, 1), &forked_barriers(), &ssbo, ())
    });
    match result {
        Err(err @ EmuError::NonUniformBarrier { .. }) => {
            let message = err.to_string();
            assert!(message.contains("workgroup"), "diagnostic names the workgroup");
            assert!(message.contains("subgroup"), "diagnostic names the subgroup");
        }
        other => panic!("expected non-uniform barrier, got {:?}", other),
    }
}

compute_shader! {
    fn subgroups_at_different_sites() {
        if gl_SubgroupID == 0 {
            barrier();
        } else {
            barrier();
        }
    }
}

/// Whole subgroups arriving at different barrier sites must also fail: the
/// workgroup rendezvous compares arrival op ids across subgroups.
#[test]
fn test_cross_subgroup_barrier_mismatch_is_detected() {
    let ssbo = StorageBuffer::zeroed(1);
    let result = with_pool(8, || {
        run_compute_no_shared((1, 1, 1), (16, 1, 1), &subgroups_at_different_sites(), &ssbo, ())
    });
    assert!(
        matches!(result, Err(EmuError::NonUniformBarrier { .. })),
        "got {:?}",
        result
    );
}

compute_shader! {
    fn finished_vs_waiting_subgroups() {
        if gl_SubgroupID == 1 {
            barrier();
        }
    }
}

/// One subgroup finishes while the other waits at a workgroup barrier that
/// can never complete; retirement turns the hang into an error.
#[test]
fn test_retired_subgroup_aborts_barrier_wait() {
    let ssbo = StorageBuffer::zeroed(1);
    let result = with_pool(8, || {
        run_compute_no_shared((1, 1, 1), (16, 1, 1), &finished_vs_waiting_subgroups(), &ssbo, ())
    });
    assert!(
        matches!(result, Err(EmuError::Deadlock { .. })),
        "got {:?}",
        result
    );
}

compute_shader! {
    fn branch_collective_then_barrier() {
        let gid = gl_GlobalInvocationID.x as usize;
        let mut v = 0u32;
        if gl_SubgroupInvocationID < 4 {
            v = subgroup_add(1u32);
        }
        barrier();
        ssbo.write_u32(gid, v);
    }
}

/// The reconverge marker after the branch sits right before a barrier and
/// is peepholed away; the barrier itself re-merges the lanes.
#[test]
fn test_reconverge_before_barrier_is_subsumed() {
    let ssbo = StorageBuffer::zeroed(16);
    with_pool(8, || {
        run_compute_no_shared(
            (1, 1, 1),
            (16, 1, 1),
            &branch_collective_then_barrier(),
            &ssbo,
            (),
        )
        .unwrap();
    });
    let out: Vec<u32> = (0..16).map(|i| ssbo.read_u32(i)).collect();
    assert_eq!(
        out,
        vec![4, 4, 4, 4, 0, 0, 0, 0, 4, 4, 4, 4, 0, 0, 0, 0]
    );
}

compute_shader! {
    fn fences() {
        let gid = gl_GlobalInvocationID.x as usize;
        ssbo.write_u32(gid, 1);
        memory_barrier();
        barrier();
        subgroup_memory_barrier();
        group_memory_barrier();
        ssbo.atomic_add_u32(gid, 1);
    }
}

/// Memory barriers: the one right before `barrier()` is peepholed away,
/// the standalone ones park the subgroup and fence. Either way the shader
/// runs to completion with every store applied.
#[test]
fn test_memory_barrier_flavors() {
    let ssbo = StorageBuffer::zeroed(16);
    with_pool(8, || {
        run_compute_no_shared((1, 1, 1), (16, 1, 1), &fences(), &ssbo, ()).unwrap();
    });
    for i in 0..16 {
        assert_eq!(ssbo.read_u32(i), 2);
    }
}

compute_shader! {
    fn repeated_barriers() {
        let gid = gl_GlobalInvocationID.x as usize;
        let lid = gl_LocalInvocationID.x as usize;
        let size = gl_WorkGroupSize.x as usize;
        let base = gid - lid;
        ssbo.write_u32(gid, lid as u32);
        let mut round = 0u32;
        while round < 4 {
            barrier();
            let neighbor = ssbo.read_u32(base + (lid + 1) % size);
            barrier();
            ssbo.write_u32(gid, neighbor + 1);
            round = round + 1;
        }
    }
}

/// The workgroup barrier is reused across generations; four rotate-and-add
/// rounds stay in lockstep.
#[test]
fn test_barrier_generations() {
    let ssbo = StorageBuffer::zeroed(16);
    with_pool(8, || {
        run_compute_no_shared((1, 1, 1), (16, 1, 1), &repeated_barriers(), &ssbo, ()).unwrap();
    });
    for lid in 0..16usize {
        // After round r every slot holds lane (lid + r) % 16 plus r.
        let expected = ((lid + 4) % 16) as u32 + 4;
        assert_eq!(ssbo.read_u32(lid), expected, "lane {}", lid);
    }
}

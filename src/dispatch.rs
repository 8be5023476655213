// Dispatcher.
//
// Materializes the workgroup/subgroup topology and runs every invocation
// exactly once. Workgroups are dispatched in row-major order over the 3D
// grid, in batches of `MAX_CONCURRENT_WORKGROUPS`; the batching is a CPU
// resource cap, and neither it nor the row-major order is a scheduling
// guarantee shaders may rely on. Each workgroup gets a fresh deep copy of
// the shared-memory seed and a barrier sized to its subgroup count; each
// subgroup scheduler runs as its own task on the rayon pool.

use std::rc::Rc;
use std::sync::Mutex;

use crate::barrier::WorkgroupBarrier;
use crate::buffer::{SharedMemory, SharedSeed, StorageBuffer};
use crate::config::{MAX_CONCURRENT_WORKGROUPS, SUBGROUP_SIZE};
use crate::context::{uvec3, ThreadContext, UVec3, WorkGroupContext};
use crate::error::EmuError;
use crate::lane::{ComputeShader, Invocation, LaneCell, LaneLink};
use crate::scheduler::SubgroupScheduler;

/// Runs a compute dispatch without workgroup shared memory.
pub fn run_compute_no_shared<S, A>(
    num_work_groups: (u32, u32, u32),
    work_group_size: (u32, u32, u32),
    shader: &S,
    ssbo: &StorageBuffer,
    args: A,
) -> Result<(), EmuError>
where
    S: ComputeShader<A>,
    A: Clone + Send + Sync,
{
    run_compute(
        num_work_groups,
        work_group_size,
        shader,
        ssbo,
        &SharedSeed::empty(),
        args,
    )
}

/// Runs every invocation of the dispatch grid exactly once. Effects land in
/// the storage buffer; the first fatal error aborts the dispatch.
pub fn run_compute<S, A>(
    num_work_groups: (u32, u32, u32),
    work_group_size: (u32, u32, u32),
    shader: &S,
    ssbo: &StorageBuffer,
    shared: &SharedSeed,
    args: A,
) -> Result<(), EmuError>
where
    S: ComputeShader<A>,
    A: Clone + Send + Sync,
{
    let (gx, gy, gz) = num_work_groups;
    let (sx, sy, sz) = work_group_size;
    let threads_per_workgroup = (sx * sy * sz) as usize;
    let total_groups = gx as usize * gy as usize * gz as usize;
    if threads_per_workgroup == 0 || total_groups == 0 {
        return Ok(());
    }
    let num_subgroups = threads_per_workgroup.div_ceil(SUBGROUP_SIZE);

    // Every concurrently resident workgroup may block one supervisor task
    // plus one task per subgroup on barrier waits; the pool must be able to
    // hold all of them at once or the dispatch could livelock.
    let required = MAX_CONCURRENT_WORKGROUPS * (num_subgroups + 1);
    let available = rayon::current_num_threads();
    if available < required {
        return Err(EmuError::PoolTooSmall {
            available,
            required,
        });
    }

    let mut order = Vec::with_capacity(total_groups);
    for z in 0..gz {
        for y in 0..gy {
            for x in 0..gx {
                order.push(uvec3(x, y, z));
            }
        }
    }

    let failure: Mutex<Option<EmuError>> = Mutex::new(None);

    for batch in order.chunks(MAX_CONCURRENT_WORKGROUPS) {
        rayon::scope(|scope| {
            for &work_group_id in batch {
                let failure = &failure;
                let args = &args;
                scope.spawn(move |_| {
                    let outcome = run_workgroup(
                        work_group_id,
                        num_work_groups,
                        work_group_size,
                        num_subgroups,
                        shader,
                        ssbo,
                        shared,
                        args,
                    );
                    if let Err(e) = outcome {
                        let mut slot = failure.lock().expect("dispatch failure slot poisoned");
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                });
            }
        });

        let slot = failure.lock().expect("dispatch failure slot poisoned");
        if let Some(e) = slot.as_ref() {
            return Err(e.clone());
        }
    }

    Ok(())
}

/// Supervises one workgroup: instantiates its shared memory and barrier,
/// then runs one scheduler task per subgroup and joins them.
#[allow(clippy::too_many_arguments)]
fn run_workgroup<S, A>(
    work_group_id: UVec3,
    num_work_groups: (u32, u32, u32),
    work_group_size: (u32, u32, u32),
    num_subgroups: usize,
    shader: &S,
    ssbo: &StorageBuffer,
    shared: &SharedSeed,
    args: &A,
) -> Result<(), EmuError>
where
    S: ComputeShader<A>,
    A: Clone + Send + Sync,
{
    let shared_memory = shared.instantiate();
    let barrier = WorkgroupBarrier::new(num_subgroups, work_group_id);
    let failure: Mutex<Option<EmuError>> = Mutex::new(None);

    rayon::scope(|scope| {
        for subgroup_id in 0..num_subgroups as u32 {
            let barrier = &barrier;
            let failure = &failure;
            let shared_memory = shared_memory.clone();
            scope.spawn(move |_| {
                let group = WorkGroupContext {
                    num_work_groups: uvec3(num_work_groups.0, num_work_groups.1, num_work_groups.2),
                    work_group_size: uvec3(work_group_size.0, work_group_size.1, work_group_size.2),
                    work_group_id,
                    num_subgroups: num_subgroups as u32,
                    subgroup_id,
                };
                match run_subgroup(group, shader, ssbo, &shared_memory, args, barrier) {
                    Ok(()) => barrier.retire(subgroup_id),
                    Err(e) => {
                        barrier.cancel(e.clone());
                        let mut slot = failure.lock().expect("workgroup failure slot poisoned");
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                }
            });
        }
    });

    match failure
        .into_inner()
        .expect("workgroup failure slot poisoned")
    {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Creates the subgroup's cooperative threads and runs its scheduler to
/// completion on the calling task.
fn run_subgroup<S, A>(
    group: WorkGroupContext,
    shader: &S,
    ssbo: &StorageBuffer,
    shared: &SharedMemory,
    args: &A,
    barrier: &WorkgroupBarrier,
) -> Result<(), EmuError>
where
    S: ComputeShader<A>,
    A: Clone,
{
    let threads_per_workgroup = group.threads_per_workgroup() as usize;
    let first = group.subgroup_id as usize * SUBGROUP_SIZE;
    let count = SUBGROUP_SIZE.min(threads_per_workgroup - first);

    let mut scheduler = SubgroupScheduler::new(group.clone());
    for lane in 0..count {
        let cell = Rc::new(LaneCell::new());
        let link = LaneLink::new(Rc::clone(&cell), group.work_group_id, group.subgroup_id);
        let thread = ThreadContext::new(&group, lane as u32, (first + lane) as u32);
        let future = shader.instantiate(Invocation {
            link,
            group: group.clone(),
            thread,
            ssbo: ssbo.clone(),
            shared: shared.clone(),
            args: args.clone(),
        });
        scheduler.add_lane(cell, future);
    }
    scheduler.run(barrier)
}

/// Kernel execution engine for the software device.
/// Work-groups run in parallel on the rayon pool, each with its own zeroed
/// local memory. Inside a group, work-items are issued in wavefronts of
/// `WAVEFRONT` lanes and executed sequentially (simulated SIMD).
use rayon::prelude::*;
use tracing::trace;

use crate::kernel::{Dim3, NdRange};
use crate::software::kernel::{BoundArg, KernelFault, NativeKernel, WorkItemCtx};

/// Lanes issued together inside a work-group
pub const WAVEFRONT: usize = 32;

/// Statistics collected during a launch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionStats {
    pub groups_executed: u64,
    pub wavefronts_executed: u64,
    pub work_items_executed: u64,
}

impl ExecutionStats {
    fn merge(self, other: Self) -> Self {
        ExecutionStats {
            groups_executed: self.groups_executed + other.groups_executed,
            wavefronts_executed: self.wavefronts_executed + other.wavefronts_executed,
            work_items_executed: self.work_items_executed + other.work_items_executed,
        }
    }
}

/// Run `kernel` over every work-item of `range`. Stops at the first fault;
/// groups already running still finish.
pub fn execute(
    kernel: &NativeKernel,
    args: &[BoundArg],
    range: &NdRange,
) -> Result<ExecutionStats, KernelFault> {
    let num_groups = range.num_groups();
    let total_groups = num_groups.size();
    trace!(kernel = %kernel.name, total_groups, "executing");

    (0..total_groups)
        .into_par_iter()
        .map(|flat| execute_group(kernel, args, range, flat_to_dim3(flat, num_groups)))
        .try_reduce(ExecutionStats::default, |a, b| Ok(a.merge(b)))
}

/// Execute all work-items of one work-group, grouped into wavefronts.
fn execute_group(
    kernel: &NativeKernel,
    args: &[BoundArg],
    range: &NdRange,
    group_id: Dim3,
) -> Result<ExecutionStats, KernelFault> {
    let mut locals: Vec<Option<Vec<u32>>> = args
        .iter()
        .map(|arg| match arg {
            BoundArg::Local { words } => Some(vec![0u32; *words]),
            _ => None,
        })
        .collect();

    let group_size = range.local_size() as usize;
    let num_wavefronts = group_size.div_ceil(WAVEFRONT);
    let mut stats = ExecutionStats {
        groups_executed: 1,
        ..ExecutionStats::default()
    };

    for wavefront in 0..num_wavefronts {
        let start = wavefront * WAVEFRONT;
        let end = (start + WAVEFRONT).min(group_size);
        for lane in start..end {
            let local_id = flat_to_dim3(lane as u64, range.local);
            let mut ctx = WorkItemCtx::new(
                local_id,
                group_id,
                range.local,
                range.num_groups(),
                args,
                &mut locals,
            );
            (kernel.func)(&mut ctx)?;
            stats.work_items_executed += 1;
        }
        stats.wavefronts_executed += 1;
    }
    Ok(stats)
}

/// Convert a flat index into a Dim3 given the extent.
fn flat_to_dim3(flat: u64, extent: Dim3) -> Dim3 {
    let (ex, ey) = (extent.x as u64, extent.y as u64);
    let x = flat % ex;
    let y = (flat / ex) % ey;
    let z = flat / (ex * ey);
    Dim3::new(x as u32, y as u32, z as u32)
}

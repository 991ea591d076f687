/// Device memory tiers and the buffer allocator.
/// A run touches four kinds of device memory:
///   - per-run global: the shared countdown counter, seeded once from the
///     host, and the result histograms read back after the run
///   - per-work-group global: one group's partition of the result histograms,
///     a view of the per-run buffer that is never allocated on its own
///   - per-work-item local: scratch the runtime allocates at launch
///   - diagnostic: debug scalars, only in diagnostic mode
///
/// Each tier is its own Rust type. Host-owned buffers release themselves on
/// drop, so a failed allocation never leaves earlier buffers behind and a
/// successful run frees everything once readback is done.
use std::fmt;
use std::mem::size_of;

use serde::Serialize;
use tracing::debug;

use crate::device::{BufferId, Device};
use crate::error::{ConfigError, FcsError};
use crate::kernel::KernelArg;
use crate::params::RunParameters;

/// Number of f32 diagnostic scalars the kernel can report.
pub const DIAGNOSTIC_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MemoryTier {
    PerRunGlobal,
    PerWorkgroupGlobal,
    PerWorkitemLocal,
    Diagnostic,
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryTier::PerRunGlobal       => write!(f, "per-run global"),
            MemoryTier::PerWorkgroupGlobal => write!(f, "per-work-group global"),
            MemoryTier::PerWorkitemLocal   => write!(f, "per-work-item local"),
            MemoryTier::Diagnostic         => write!(f, "diagnostic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
    /// Read-write, initialized from host memory at allocation time
    CopyFromHost,
}

/// A sized allocation request in one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceMemoryRegion {
    pub tier: MemoryTier,
    pub bytes: usize,
    pub access: AccessMode,
}

impl DeviceMemoryRegion {
    pub fn new(tier: MemoryTier, bytes: usize, access: AccessMode) -> Self {
        DeviceMemoryRegion {
            tier,
            bytes,
            access,
        }
    }
}

// ---------------------------------------------------------------------------
// Buffer plan
// ---------------------------------------------------------------------------

/// Byte sizes of every region a run needs, computed before touching the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferPlan {
    pub countdown: DeviceMemoryRegion,
    pub results: DeviceMemoryRegion,
    /// Number of work-group partitions in `results`
    pub workgroups: usize,
    /// u64 bins per work-group partition
    pub bins_per_workgroup: usize,
    /// One group's slice of `results`
    pub partition: DeviceMemoryRegion,
    /// Group-local scratch: workitems × slots × sizeof(u32)
    pub local_scratch: DeviceMemoryRegion,
    pub diagnostic: Option<DeviceMemoryRegion>,
}

impl BufferPlan {
    pub fn for_run(params: &RunParameters, diagnostic: bool) -> Result<Self, ConfigError> {
        let workgroups = params.workgroups as usize;
        let bins_per_workgroup = params.global_buffer_size_per_workgroup as usize;
        let result_bytes = params
            .result_len()?
            .checked_mul(size_of::<u64>())
            .ok_or_else(|| overflow("result buffer", params))?;
        let partition_bytes = bins_per_workgroup
            .checked_mul(size_of::<u64>())
            .ok_or_else(|| overflow("result partition", params))?;
        let local_bytes = (params.workitems as usize)
            .checked_mul(params.local_buffer_size_per_workitem as usize)
            .and_then(|n| n.checked_mul(size_of::<u32>()))
            .ok_or_else(|| overflow("local scratch", params))?;

        Ok(BufferPlan {
            countdown: DeviceMemoryRegion::new(
                MemoryTier::PerRunGlobal,
                size_of::<u32>(),
                AccessMode::CopyFromHost,
            ),
            results: DeviceMemoryRegion::new(
                MemoryTier::PerRunGlobal,
                result_bytes,
                AccessMode::ReadWrite,
            ),
            workgroups,
            bins_per_workgroup,
            partition: DeviceMemoryRegion::new(
                MemoryTier::PerWorkgroupGlobal,
                partition_bytes,
                AccessMode::ReadWrite,
            ),
            local_scratch: DeviceMemoryRegion::new(
                MemoryTier::PerWorkitemLocal,
                local_bytes,
                AccessMode::ReadWrite,
            ),
            diagnostic: diagnostic.then(|| {
                DeviceMemoryRegion::new(
                    MemoryTier::Diagnostic,
                    DIAGNOSTIC_LEN * size_of::<f32>(),
                    AccessMode::ReadWrite,
                )
            }),
        })
    }

    /// Number of u64 counters in the result buffer
    pub fn result_len(&self) -> usize {
        self.results.bytes / size_of::<u64>()
    }
}

fn overflow(what: &'static str, params: &RunParameters) -> ConfigError {
    ConfigError::Overflow {
        what,
        detail: format!(
            "{} workgroups x {} workitems, capacities {}/{}",
            params.workgroups,
            params.workitems,
            params.global_buffer_size_per_workgroup,
            params.local_buffer_size_per_workitem
        ),
    }
}

// ---------------------------------------------------------------------------
// Owned device buffers
// ---------------------------------------------------------------------------

/// A host-owned device allocation, released when dropped.
pub struct DeviceBuffer<'d, D: Device + ?Sized> {
    device: &'d D,
    id: BufferId,
    region: DeviceMemoryRegion,
}

impl<'d, D: Device + ?Sized> DeviceBuffer<'d, D> {
    fn allocate(
        device: &'d D,
        region: DeviceMemoryRegion,
        host_data: Option<&[u8]>,
    ) -> Result<Self, FcsError> {
        let id = device
            .allocate(&region, host_data)
            .map_err(|source| FcsError::Allocation {
                tier: region.tier,
                bytes: region.bytes,
                source,
            })?;
        debug!(tier = %region.tier, bytes = region.bytes, %id, "allocated device buffer");
        Ok(DeviceBuffer { device, id, region })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn region(&self) -> &DeviceMemoryRegion {
        &self.region
    }

    pub fn as_arg(&self) -> KernelArg {
        KernelArg::Global {
            buffer: self.id,
            tier: self.region.tier,
            bytes: self.region.bytes,
        }
    }
}

impl<D: Device + ?Sized> Drop for DeviceBuffer<'_, D> {
    fn drop(&mut self) {
        self.device.release(self.id);
        debug!(tier = %self.region.tier, id = %self.id, "released device buffer");
    }
}

/// The countdown counter: one u32 holding the droplets left to simulate.
pub struct CountdownBuffer<'d, D: Device + ?Sized>(DeviceBuffer<'d, D>);

impl<'d, D: Device + ?Sized> CountdownBuffer<'d, D> {
    pub fn as_arg(&self) -> KernelArg {
        self.0.as_arg()
    }

    pub fn id(&self) -> BufferId {
        self.0.id()
    }
}

/// Result histograms. Global memory owned by the work-groups while the kernel
/// runs: group `g` addresses only bins `[g * bins, (g + 1) * bins)`. The host
/// sees the aggregate and reads it back only after completion.
pub struct ResultsBuffer<'d, D: Device + ?Sized> {
    buffer: DeviceBuffer<'d, D>,
    workgroups: usize,
    bins_per_workgroup: usize,
}

impl<'d, D: Device + ?Sized> ResultsBuffer<'d, D> {
    pub fn as_arg(&self) -> KernelArg {
        self.buffer.as_arg()
    }

    pub fn id(&self) -> BufferId {
        self.buffer.id()
    }

    pub fn len(&self) -> usize {
        self.workgroups * self.bins_per_workgroup
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.buffer.region().bytes
    }
}

/// Debug scalars written by the kernel in diagnostic mode.
pub struct DiagnosticBuffer<'d, D: Device + ?Sized>(DeviceBuffer<'d, D>);

impl<'d, D: Device + ?Sized> DiagnosticBuffer<'d, D> {
    pub fn as_arg(&self) -> KernelArg {
        self.0.as_arg()
    }

    pub fn id(&self) -> BufferId {
        self.0.id()
    }

    pub fn bytes(&self) -> usize {
        self.0.region().bytes
    }
}

/// Work-item scratch in local memory. The device runtime allocates it per
/// work-group at launch; the host only knows its size and never addresses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalScratch {
    region: DeviceMemoryRegion,
}

impl LocalScratch {
    pub fn bytes(&self) -> usize {
        self.region.bytes
    }

    pub fn as_arg(&self) -> KernelArg {
        KernelArg::Local {
            bytes: self.region.bytes,
        }
    }
}

/// Every buffer one run needs. Dropping it releases all host-owned buffers.
pub struct RunBuffers<'d, D: Device + ?Sized> {
    pub countdown: CountdownBuffer<'d, D>,
    pub results: ResultsBuffer<'d, D>,
    pub local_scratch: LocalScratch,
    pub diagnostic: Option<DiagnosticBuffer<'d, D>>,
}

impl<'d, D: Device + ?Sized> RunBuffers<'d, D> {
    /// Allocate every region in `plan`, seeding the countdown with
    /// `total_droplets`. Stops at the first failure; buffers allocated so far
    /// are released on the way out.
    pub fn allocate(device: &'d D, plan: &BufferPlan, total_droplets: u32) -> Result<Self, FcsError> {
        let results = ResultsBuffer {
            buffer: DeviceBuffer::allocate(device, plan.results, None)?,
            workgroups: plan.workgroups,
            bins_per_workgroup: plan.bins_per_workgroup,
        };
        debug!(
            tier = %plan.partition.tier,
            partitions = plan.workgroups,
            bytes = plan.partition.bytes,
            "result buffer partitioned by work-group"
        );
        let countdown = CountdownBuffer(DeviceBuffer::allocate(
            device,
            plan.countdown,
            Some(bytemuck::bytes_of(&total_droplets)),
        )?);
        let diagnostic = match plan.diagnostic {
            Some(region) => Some(DiagnosticBuffer(DeviceBuffer::allocate(device, region, None)?)),
            None => None,
        };
        Ok(RunBuffers {
            countdown,
            results,
            local_scratch: LocalScratch {
                region: plan.local_scratch,
            },
            diagnostic,
        })
    }
}

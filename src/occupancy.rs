/// Occupancy and launch-limit checks: how many work-groups can be resident
/// on one compute unit at once, and whether a launch fits the device at all.
/// Derived from the same min-over-constraints reasoning as CUDA's occupancy
/// calculator, reduced to the resources this launch actually consumes.
use crate::error::ConfigError;

/// Hardware limits of a compute device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLimits {
    /// Number of compute units (SMs / CUs)
    pub compute_units: u32,
    /// Largest work-group the device accepts
    pub max_work_group_size: u64,
    /// Maximum concurrent work-items per compute unit
    pub max_work_items_per_unit: u64,
    /// Hard cap on resident work-groups per compute unit
    pub max_groups_per_unit: u64,
    /// Local memory per compute unit, in bytes
    pub local_mem_bytes: u64,
    /// Total global memory, in bytes
    pub global_mem_bytes: u64,
}

impl DeviceLimits {
    /// Limits of a mid-range discrete GPU; a safe default for host-side models.
    pub fn typical_gpu() -> Self {
        DeviceLimits {
            compute_units: 32,
            max_work_group_size: 1024,
            max_work_items_per_unit: 2048,
            max_groups_per_unit: 32,
            local_mem_bytes: 64 * 1024,
            global_mem_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

/// Which resource is limiting residency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidencyLimiter {
    WorkItemSlots,
    LocalMemory,
    HardwareGroupCap,
}

impl std::fmt::Display for ResidencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResidencyLimiter::WorkItemSlots    => write!(f, "work-item slots"),
            ResidencyLimiter::LocalMemory      => write!(f, "local memory"),
            ResidencyLimiter::HardwareGroupCap => write!(f, "hardware group cap"),
        }
    }
}

/// Resources one work-group of a launch needs.
#[derive(Debug, Clone, Copy)]
pub struct GroupResources {
    pub work_items: u64,
    pub local_bytes: u64,
}

/// Reject launches the device can never run: oversized groups or local
/// allocations larger than a compute unit's local memory.
pub fn check_launch(group: &GroupResources, limits: &DeviceLimits) -> Result<(), ConfigError> {
    if group.work_items > limits.max_work_group_size {
        return Err(ConfigError::WorkgroupTooLarge {
            requested: group.work_items,
            max: limits.max_work_group_size,
        });
    }
    if group.local_bytes > limits.local_mem_bytes {
        return Err(ConfigError::LocalMemoryExceeded {
            requested: group.local_bytes,
            available: limits.local_mem_bytes,
        });
    }
    Ok(())
}

/// Maximum work-groups resident on one compute unit and the bottleneck.
/// Minimum across three constraints:
///   1. Work-item slots
///   2. Local memory
///   3. Hardware group cap
pub fn max_groups_per_unit(group: &GroupResources, limits: &DeviceLimits) -> (u64, ResidencyLimiter) {
    let by_items = limits.max_work_items_per_unit / group.work_items.max(1);

    let by_local = if group.local_bytes == 0 {
        u64::MAX
    } else {
        limits.local_mem_bytes / group.local_bytes
    };

    let by_hw = limits.max_groups_per_unit;

    let max = by_items.min(by_local).min(by_hw);

    let limiter = if max == by_hw {
        ResidencyLimiter::HardwareGroupCap
    } else if max == by_local {
        ResidencyLimiter::LocalMemory
    } else {
        ResidencyLimiter::WorkItemSlots
    };

    (max, limiter)
}

/// Fraction of the device's work-item slots a launch can keep busy, [0.0, 1.0].
pub fn occupancy(group: &GroupResources, limits: &DeviceLimits) -> f32 {
    let (groups, _) = max_groups_per_unit(group, limits);
    let resident = groups.saturating_mul(group.work_items);
    (resident as f32 / limits.max_work_items_per_unit.max(1) as f32).min(1.0)
}

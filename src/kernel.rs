/// Launch geometry and the kernel argument contract.
/// An NDRange describes how many work-items run and how they are grouped;
/// the argument contract pins every buffer to a fixed positional slot so a
/// misbinding fails on the host instead of silently corrupting device memory.
use bytemuck::{Pod, Zeroable};
use serde::Serialize;

use crate::device::BufferId;
use crate::error::ConfigError;
use crate::memory::MemoryTier;

/// 3D dimension struct used for grid and group sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Dim3 { x, y, z }
    }

    /// Convenience constructor for 1D configs
    pub fn x(x: u32) -> Self {
        Dim3 { x, y: 1, z: 1 }
    }

    pub fn zero() -> Self {
        Dim3 { x: 0, y: 0, z: 0 }
    }

    /// Total number of elements covered by this extent
    pub fn size(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    fn get(&self, dim: usize) -> u32 {
        match dim {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }
}

// ---------------------------------------------------------------------------
// NdRange
// ---------------------------------------------------------------------------

/// Execution grid: global extent, local (work-group) extent and origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NdRange {
    /// Grid origin, always zero for launches built here
    pub offset: Dim3,
    /// Total work-items in each dimension
    pub global: Dim3,
    /// Work-items per work-group in each dimension
    pub local: Dim3,
    /// Number of significant dimensions (1..=3)
    pub work_dim: u32,
}

impl NdRange {
    /// 1D grid of `workgroups × workitems` work-items grouped by `workitems`.
    pub fn linear(workgroups: u32, workitems: u32) -> Result<Self, ConfigError> {
        if workgroups == 0 {
            return Err(ConfigError::TooSmall {
                field: "workgroups",
                min: 1,
                value: 0,
            });
        }
        if workitems == 0 {
            return Err(ConfigError::TooSmall {
                field: "workitems",
                min: 1,
                value: 0,
            });
        }
        let global = workgroups
            .checked_mul(workitems)
            .ok_or_else(|| ConfigError::Overflow {
                what: "global work size",
                detail: format!("{workgroups} x {workitems}"),
            })?;
        Self::new(Dim3::x(global), Dim3::x(workitems))
    }

    /// N-D grid. Every local extent must be non-zero and divide its global extent.
    pub fn new(global: Dim3, local: Dim3) -> Result<Self, ConfigError> {
        for dim in 0..3 {
            let (g, l) = (global.get(dim) as u64, local.get(dim) as u64);
            if l == 0 {
                return Err(ConfigError::TooSmall {
                    field: "local work size",
                    min: 1,
                    value: 0,
                });
            }
            if g == 0 {
                return Err(ConfigError::TooSmall {
                    field: "global work size",
                    min: 1,
                    value: 0,
                });
            }
            if g % l != 0 {
                return Err(ConfigError::NonDivisibleGrid {
                    dim,
                    global: g,
                    local: l,
                });
            }
        }
        let work_dim = if global.z > 1 || local.z > 1 {
            3
        } else if global.y > 1 || local.y > 1 {
            2
        } else {
            1
        };
        Ok(NdRange {
            offset: Dim3::zero(),
            global,
            local,
            work_dim,
        })
    }

    /// Work-groups along each dimension
    pub fn num_groups(&self) -> Dim3 {
        Dim3::new(
            self.global.x / self.local.x,
            self.global.y / self.local.y,
            self.global.z / self.local.z,
        )
    }

    pub fn total_groups(&self) -> u64 {
        self.num_groups().size()
    }

    pub fn global_size(&self) -> u64 {
        self.global.size()
    }

    pub fn local_size(&self) -> u64 {
        self.local.size()
    }

    /// Global extents of the significant dimensions, in OpenCL order
    pub fn global_sizes(&self) -> Vec<usize> {
        (0..self.work_dim as usize)
            .map(|d| self.global.get(d) as usize)
            .collect()
    }

    pub fn local_sizes(&self) -> Vec<usize> {
        (0..self.work_dim as usize)
            .map(|d| self.local.get(d) as usize)
            .collect()
    }

    pub fn offsets(&self) -> Vec<usize> {
        (0..self.work_dim as usize)
            .map(|d| self.offset.get(d) as usize)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Kernel arguments
// ---------------------------------------------------------------------------

/// Scalar block passed by value as the last kernel argument.
/// Layout must match `struct run_constants` in program.cl.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable, Serialize)]
pub struct RunConstants {
    pub end_time_ns: u64,
    pub seed: u64,
    pub photons_per_intensity_per_time: f32,
    /// Leading u32 slots of each work-item's scratch reserved for RNG state
    pub rng_reserved: u32,
    /// Histogram bins per work-group
    pub global_capacity: u32,
    /// Scratch slots per work-item
    pub local_capacity: u32,
}

/// One positional kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    /// Host-allocated device buffer
    Global {
        buffer: BufferId,
        tier: MemoryTier,
        bytes: usize,
    },
    /// Group-local memory allocated by the device runtime at launch
    Local { bytes: usize },
    /// Scalars passed by value
    Constants(RunConstants),
}

impl KernelArg {
    fn describe(&self) -> String {
        match self {
            KernelArg::Global { tier, bytes, .. } => format!("{tier} buffer of {bytes} bytes"),
            KernelArg::Local { bytes } => format!("local allocation of {bytes} bytes"),
            KernelArg::Constants(_) => "constant block".to_string(),
        }
    }
}

/// Named argument slot in the kernel signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSlot {
    /// Shared countdown of droplets not yet simulated (one u32)
    Countdown,
    /// Per-work-group result histograms
    Results,
    /// Per-work-item scratch in local memory
    LocalScratch,
    /// Debug scalars, diagnostic mode only
    Diagnostic,
    /// `RunConstants`
    Constants,
}

impl ArgSlot {
    pub fn name(&self) -> &'static str {
        match self {
            ArgSlot::Countdown => "countdown",
            ArgSlot::Results => "results",
            ArgSlot::LocalScratch => "local scratch",
            ArgSlot::Diagnostic => "diagnostic",
            ArgSlot::Constants => "constants",
        }
    }

    /// Check that `arg` is the kind of argument this slot accepts.
    fn accepts(&self, arg: &KernelArg) -> Result<(), String> {
        let ok = match (self, arg) {
            (ArgSlot::Countdown, KernelArg::Global { tier, bytes, .. }) => {
                *tier == MemoryTier::PerRunGlobal && *bytes == std::mem::size_of::<u32>()
            }
            (ArgSlot::Results, KernelArg::Global { tier, bytes, .. }) => {
                *tier == MemoryTier::PerRunGlobal
                    && *bytes > 0
                    && *bytes % std::mem::size_of::<u64>() == 0
            }
            (ArgSlot::Diagnostic, KernelArg::Global { tier, .. }) => {
                *tier == MemoryTier::Diagnostic
            }
            (ArgSlot::LocalScratch, KernelArg::Local { bytes }) => *bytes > 0,
            (ArgSlot::Constants, KernelArg::Constants(_)) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(format!("cannot accept {}", arg.describe()))
        }
    }
}

/// Ordered list of slots a kernel expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgContract {
    slots: Vec<ArgSlot>,
}

impl ArgContract {
    pub fn new(slots: Vec<ArgSlot>) -> Self {
        ArgContract { slots }
    }

    /// countdown, results, local scratch, constants
    pub fn release() -> Self {
        Self::new(vec![
            ArgSlot::Countdown,
            ArgSlot::Results,
            ArgSlot::LocalScratch,
            ArgSlot::Constants,
        ])
    }

    /// countdown, results, local scratch, diagnostic, constants
    pub fn diagnostic() -> Self {
        Self::new(vec![
            ArgSlot::Countdown,
            ArgSlot::Results,
            ArgSlot::LocalScratch,
            ArgSlot::Diagnostic,
            ArgSlot::Constants,
        ])
    }

    pub fn slots(&self) -> &[ArgSlot] {
        &self.slots
    }

    pub fn position(&self, slot: ArgSlot) -> Option<usize> {
        self.slots.iter().position(|s| *s == slot)
    }

    pub fn binder(&self) -> ArgBinder<'_> {
        ArgBinder {
            contract: self,
            bound: vec![None; self.slots.len()],
        }
    }
}

/// Collects arguments by slot and emits them in contract order.
pub struct ArgBinder<'c> {
    contract: &'c ArgContract,
    bound: Vec<Option<KernelArg>>,
}

impl<'c> ArgBinder<'c> {
    pub fn bind(&mut self, slot: ArgSlot, arg: KernelArg) -> Result<&mut Self, ConfigError> {
        let index = self
            .contract
            .position(slot)
            .ok_or_else(|| ConfigError::ArgumentBinding {
                index: self.contract.slots.len(),
                slot: slot.name(),
                problem: "slot is not part of this kernel's contract".to_string(),
            })?;
        let fail = |problem: String| ConfigError::ArgumentBinding {
            index,
            slot: slot.name(),
            problem,
        };
        if self.bound[index].is_some() {
            return Err(fail("bound twice".to_string()));
        }
        slot.accepts(&arg).map_err(fail)?;
        self.bound[index] = Some(arg);
        Ok(self)
    }

    /// Arguments in positional order. Fails if any slot is still unbound.
    pub fn finish(&mut self) -> Result<Vec<KernelArg>, ConfigError> {
        let mut args = Vec::with_capacity(self.bound.len());
        for (index, (slot, arg)) in self.contract.slots.iter().zip(&self.bound).enumerate() {
            match arg {
                Some(arg) => args.push(*arg),
                None => {
                    return Err(ConfigError::ArgumentBinding {
                        index,
                        slot: slot.name(),
                        problem: "not bound".to_string(),
                    });
                }
            }
        }
        Ok(args)
    }
}

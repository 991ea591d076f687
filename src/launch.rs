/// Kernel launcher: validates a run against the device, binds the buffers to
/// the kernel's positional contract and builds the execution grid.
///
/// Everything that can be rejected is rejected here, before a single byte of
/// device memory is allocated and long before enqueue.
use tracing::{debug, info};

use crate::device::{Device, KernelId};
use crate::error::{ConfigError, Result};
use crate::event::PreparedLaunch;
use crate::kernel::{ArgContract, ArgSlot, KernelArg, NdRange, RunConstants};
use crate::memory::{BufferPlan, RunBuffers};
use crate::occupancy::{self, DeviceLimits, GroupResources};
use crate::params::RunParameters;

/// u32 words of RNG state the kernel keeps at the front of each work-item's scratch
pub const RNG_STATE_WORDS: u32 = 4;

/// Release or diagnostic orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Release,
    Diagnostic,
}

impl Default for RunMode {
    fn default() -> Self {
        if cfg!(feature = "diagnostic") {
            RunMode::Diagnostic
        } else {
            RunMode::Release
        }
    }
}

impl RunMode {
    pub fn contract(&self) -> ArgContract {
        match self {
            RunMode::Release => ArgContract::release(),
            RunMode::Diagnostic => ArgContract::diagnostic(),
        }
    }

    pub fn is_diagnostic(&self) -> bool {
        *self == RunMode::Diagnostic
    }
}

/// A validated run: buffer sizes, grid and kernel constants.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub mode: RunMode,
    pub buffers: BufferPlan,
    pub range: NdRange,
    pub constants: RunConstants,
    pub total_droplets: u32,
}

impl LaunchPlan {
    pub fn prepare(
        params: &RunParameters,
        mode: RunMode,
        rng_reserved: u32,
        seed: u64,
        limits: &DeviceLimits,
    ) -> std::result::Result<Self, ConfigError> {
        params.validate()?;
        let end_time_ns = params.end_time_ns()?;
        let range = NdRange::linear(params.workgroups, params.workitems)?;
        let buffers = BufferPlan::for_run(params, mode.is_diagnostic())?;

        let local_capacity = params.local_buffer_size_per_workitem;
        if rng_reserved < RNG_STATE_WORDS || rng_reserved >= local_capacity {
            return Err(ConfigError::RngReservation {
                rng_reserved,
                min: RNG_STATE_WORDS,
                local_capacity,
            });
        }

        let group = GroupResources {
            work_items: range.local_size(),
            local_bytes: buffers.local_scratch.bytes as u64,
        };
        occupancy::check_launch(&group, limits)?;
        let (resident, limiter) = occupancy::max_groups_per_unit(&group, limits);
        debug!(
            resident_groups_per_unit = resident,
            limiter = %limiter,
            occupancy = occupancy::occupancy(&group, limits),
            "launch residency"
        );

        Ok(LaunchPlan {
            mode,
            buffers,
            range,
            constants: RunConstants {
                end_time_ns,
                seed,
                photons_per_intensity_per_time: params.photons_per_intensity_per_time,
                rng_reserved,
                global_capacity: params.global_buffer_size_per_workgroup,
                local_capacity,
            },
            total_droplets: params.total_droplets,
        })
    }

    /// Bind `buffers` to the mode's argument contract and wrap the launch.
    pub fn bind<'d, D: Device + ?Sized>(
        &self,
        device: &'d D,
        kernel: KernelId,
        buffers: &RunBuffers<'d, D>,
    ) -> Result<PreparedLaunch<'d, D>> {
        let contract = self.mode.contract();
        let mut binder = contract.binder();
        binder
            .bind(ArgSlot::Countdown, buffers.countdown.as_arg())?
            .bind(ArgSlot::Results, buffers.results.as_arg())?
            .bind(ArgSlot::LocalScratch, buffers.local_scratch.as_arg())?
            .bind(ArgSlot::Constants, KernelArg::Constants(self.constants))?;
        if let Some(diag) = &buffers.diagnostic {
            binder.bind(ArgSlot::Diagnostic, diag.as_arg())?;
        }
        let args = binder.finish()?;

        if self.mode.is_diagnostic() {
            info!(
                workgroups = self.range.total_groups(),
                workitems = self.range.local_size(),
                "workgroups x workitems: {}x{}",
                self.range.total_groups(),
                self.range.local_size()
            );
        }
        Ok(PreparedLaunch::new(device, kernel, args, self.range))
    }
}

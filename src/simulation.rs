/// FCS simulation orchestrator.
///
/// A [`Simulation`] owns a device and a compiled kernel. Each call to
/// [`Simulation::run`] performs one complete dispatch:
///
/// ```text
/// validate ─▶ allocate ─▶ bind ─▶ enqueue ─▶ wait ─▶ read back ─▶ finish
/// ```
///
/// Release and diagnostic runs are two separate paths sharing the same
/// allocator and launcher; the mode is fixed when the simulation is
/// configured, not checked inside the dispatch path.
use std::path::PathBuf;
use std::time::Duration;

use bytemuck::Zeroable;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span};

use crate::device::Device;
use crate::error::{FcsError, Result};
use crate::event::CompletionHandle;
use crate::launch::{LaunchPlan, RNG_STATE_WORDS, RunMode};
use crate::memory::{DIAGNOSTIC_LEN, DiagnosticBuffer, ResultsBuffer, RunBuffers};
use crate::params::RunParameters;
use crate::program::{
    self, CompiledProgram, DEFAULT_ENTRY_POINT, DEFAULT_PROGRAM_PATH, DIAGNOSTIC_DEFINE,
};
use crate::results::{Diagnostics, ResultSet};

/// One-time setup of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Kernel source, relative to the working directory
    pub program_path: PathBuf,
    /// Kernel function to launch
    pub entry_point: String,
    /// Scratch slots per work-item reserved for RNG state
    pub rng_reserved: u32,
    /// Base seed; each work-item derives its own stream from it
    pub seed: u64,
    pub mode: RunMode,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            program_path: PathBuf::from(DEFAULT_PROGRAM_PATH),
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            rng_reserved: RNG_STATE_WORDS,
            seed: 0x5eed_fc5,
            mode: RunMode::default(),
        }
    }
}

impl SimulationConfig {
    pub fn with_program_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.program_path = path.into();
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_rng_reserved(mut self, rng_reserved: u32) -> Self {
        self.rng_reserved = rng_reserved;
        self
    }
}

pub struct Simulation<D: Device> {
    device: D,
    program: CompiledProgram,
    config: SimulationConfig,
}

impl<D: Device> Simulation<D> {
    /// Load and build the kernel program for the configured mode. Nothing is
    /// allocated on the device if the source is missing or fails to build.
    pub fn init(device: D, config: SimulationConfig) -> Result<Self> {
        let defines: &[&str] = match config.mode {
            RunMode::Release => &[],
            RunMode::Diagnostic => &[DIAGNOSTIC_DEFINE],
        };
        let program = program::load(&device, &config.program_path, &config.entry_point, defines)?;
        Ok(Simulation {
            device,
            program,
            config,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Run once in the configured mode. The kernel was built for that mode,
    /// so the mode cannot change between runs.
    pub fn run(&self, params: &RunParameters) -> Result<ResultSet> {
        match self.config.mode {
            RunMode::Release => self.run_release(params),
            RunMode::Diagnostic => self.run_diagnostic(params),
        }
    }

    /// Dispatch without diagnostics: results only.
    fn run_release(&self, params: &RunParameters) -> Result<ResultSet> {
        let _span = info_span!("fcs_run", mode = "release").entered();
        let plan = self.plan(params, RunMode::Release)?;

        let buffers = RunBuffers::allocate(&self.device, &plan.buffers, plan.total_droplets)?;
        let mut handle = plan
            .bind(&self.device, self.program.kernel, &buffers)?
            .enqueue()?;
        handle.wait()?;

        let results = read_results(&self.device, &handle, &buffers.results)?;
        self.device.finish().map_err(FcsError::Readback)?;
        handle.mark_results_available()?;

        info!(bins = results.len(), "run complete");
        Ok(ResultSet {
            result_len: results.len(),
            results,
            device_elapsed_ns: None,
            host_elapsed_ns: None,
            diagnostics: None,
        })
    }

    /// Dispatch with the diagnostic buffer, device profiling and host timing.
    fn run_diagnostic(&self, params: &RunParameters) -> Result<ResultSet> {
        let _span = info_span!("fcs_run", mode = "diagnostic").entered();
        info!("FCS#run()");
        let plan = self.plan(params, RunMode::Diagnostic)?;

        let buffers = RunBuffers::allocate(&self.device, &plan.buffers, plan.total_droplets)?;
        let mut handle = plan
            .bind(&self.device, self.program.kernel, &buffers)?
            .enqueue()?;
        handle.wait()?;

        let host_elapsed = handle.host_elapsed().unwrap_or(Duration::ZERO);
        let device_timing = handle.device_timing();
        info!(elapsed_ns = host_elapsed.as_nanos() as u64, "CPU timing");
        match device_timing {
            Some(t) => info!(
                start_ns = t.start_ns,
                end_ns = t.end_ns,
                elapsed_ns = t.elapsed_ns(),
                "GPU timing"
            ),
            None => debug!("device recorded no profiling timestamps"),
        }

        let results = read_results(&self.device, &handle, &buffers.results)?;
        let diagnostics = match &buffers.diagnostic {
            Some(diag) => Some(read_diagnostics(&self.device, &handle, diag)?),
            None => None,
        };
        self.device.finish().map_err(FcsError::Readback)?;
        handle.mark_results_available()?;

        info!(bins = results.len(), "run complete");
        Ok(ResultSet {
            result_len: results.len(),
            results,
            device_elapsed_ns: device_timing.map(|t| t.elapsed_ns()),
            host_elapsed_ns: Some(host_elapsed.as_nanos() as u64),
            diagnostics,
        })
    }

    fn plan(&self, params: &RunParameters, mode: RunMode) -> Result<LaunchPlan> {
        let plan = LaunchPlan::prepare(
            params,
            mode,
            self.config.rng_reserved,
            self.config.seed,
            &self.device.limits(),
        )?;
        debug!(
            droplets = plan.total_droplets,
            global = plan.range.global_size(),
            local = plan.range.local_size(),
            result_bytes = plan.buffers.results.bytes,
            local_bytes = plan.buffers.local_scratch.bytes,
            "launch planned"
        );
        Ok(plan)
    }
}

/// Copy the result histograms to a new host array of exactly the buffer's length.
fn read_results<D: Device + ?Sized>(
    device: &D,
    handle: &CompletionHandle<'_, D>,
    results: &ResultsBuffer<'_, D>,
) -> Result<Vec<u64>> {
    handle.ensure_completed()?;
    let mut host = vec![0u64; results.len()];
    device
        .read_buffer(results.id(), bytemuck::cast_slice_mut(&mut host))
        .map_err(FcsError::Readback)?;
    Ok(host)
}

fn read_diagnostics<D: Device + ?Sized>(
    device: &D,
    handle: &CompletionHandle<'_, D>,
    diag: &DiagnosticBuffer<'_, D>,
) -> Result<Diagnostics> {
    handle.ensure_completed()?;
    let mut values = <[f32; DIAGNOSTIC_LEN]>::zeroed();
    device
        .read_buffer(diag.id(), bytemuck::cast_slice_mut(&mut values))
        .map_err(FcsError::Readback)?;
    Ok(Diagnostics::new(values))
}

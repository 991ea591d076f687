/// Launch lifecycle: a prepared launch becomes an in-flight
/// [`CompletionHandle`], which moves through `Completed` to
/// `ResultsAvailable`.
///
/// ```text
/// NotLaunched ──enqueue──▶ InFlight ──wait──▶ Completed ──readback──▶ ResultsAvailable
/// ```
///
/// The wait has no timeout: a hung kernel hangs the caller.
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::device::{Device, EventId, KernelId, ProfilingInfo};
use crate::error::{FcsError, Result};
use crate::kernel::{KernelArg, NdRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    NotLaunched,
    InFlight,
    Completed,
    ResultsAvailable,
}

impl fmt::Display for LaunchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchState::NotLaunched      => write!(f, "not launched"),
            LaunchState::InFlight         => write!(f, "in flight"),
            LaunchState::Completed        => write!(f, "completed"),
            LaunchState::ResultsAvailable => write!(f, "results available"),
        }
    }
}

/// A fully bound kernel launch that has not been enqueued yet.
pub struct PreparedLaunch<'d, D: Device + ?Sized> {
    device: &'d D,
    kernel: KernelId,
    args: Vec<KernelArg>,
    range: NdRange,
}

impl<'d, D: Device + ?Sized> PreparedLaunch<'d, D> {
    pub fn new(device: &'d D, kernel: KernelId, args: Vec<KernelArg>, range: NdRange) -> Self {
        PreparedLaunch {
            device,
            kernel,
            args,
            range,
        }
    }

    pub fn state(&self) -> LaunchState {
        LaunchState::NotLaunched
    }

    /// Queue the kernel and return without waiting for it.
    pub fn enqueue(self) -> Result<CompletionHandle<'d, D>> {
        let enqueued_at = Instant::now();
        let event = self
            .device
            .enqueue_kernel(self.kernel, &self.args, &self.range)
            .map_err(FcsError::Launch)?;
        debug!(
            global = self.range.global_size(),
            local = self.range.local_size(),
            "kernel enqueued"
        );
        Ok(CompletionHandle {
            device: self.device,
            event,
            state: LaunchState::InFlight,
            enqueued_at,
            completed_at: None,
        })
    }
}

/// Token for an in-flight launch.
pub struct CompletionHandle<'d, D: Device + ?Sized> {
    device: &'d D,
    event: EventId,
    state: LaunchState,
    enqueued_at: Instant,
    completed_at: Option<Instant>,
}

impl<'d, D: Device + ?Sized> CompletionHandle<'d, D> {
    pub fn state(&self) -> LaunchState {
        self.state
    }

    /// Block until the kernel finishes. Returns immediately once completed.
    pub fn wait(&mut self) -> Result<()> {
        if self.state != LaunchState::InFlight {
            trace!(state = %self.state, "wait on finished launch");
            return Ok(());
        }
        self.device.wait(self.event).map_err(FcsError::Completion)?;
        self.completed_at = Some(Instant::now());
        self.state = LaunchState::Completed;
        debug!("kernel completed");
        Ok(())
    }

    /// Fail unless the kernel has finished.
    pub fn ensure_completed(&self) -> Result<()> {
        match self.state {
            LaunchState::Completed | LaunchState::ResultsAvailable => Ok(()),
            state => Err(FcsError::NotCompleted(state)),
        }
    }

    /// Record that results were copied to the host.
    pub fn mark_results_available(&mut self) -> Result<()> {
        self.ensure_completed()?;
        self.state = LaunchState::ResultsAvailable;
        Ok(())
    }

    /// Device start/end timestamps, once completed and if recorded.
    pub fn device_timing(&self) -> Option<ProfilingInfo> {
        self.ensure_completed().ok()?;
        self.device.profiling(self.event)
    }

    /// Host wall-clock time from just before enqueue to the end of the wait.
    pub fn host_elapsed(&self) -> Option<Duration> {
        self.completed_at.map(|done| done - self.enqueued_at)
    }
}

impl<D: Device + ?Sized> Drop for CompletionHandle<'_, D> {
    fn drop(&mut self) {
        // Launches cannot be cancelled; buffers the kernel uses must outlive it
        if self.state == LaunchState::InFlight {
            if let Err(e) = self.device.wait(self.event) {
                warn!(error = %e, "in-flight kernel failed while its handle was dropped");
            }
        }
        self.device.release_event(self.event);
    }
}

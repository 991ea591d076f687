/// Error types for simulation setup, dispatch and readback.
///
/// Every failure is terminal for the run that raised it: there is no retry
/// and no partial `ResultSet`. Backends report raw failures as `DeviceError`;
/// the orchestrator wraps them into `FcsError` together with the stage that
/// failed.
use std::path::PathBuf;

use crate::event::LaunchState;
use crate::memory::MemoryTier;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, FcsError>;

/// Failures reported by a device backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    /// The device cannot satisfy an allocation
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    /// Program build or kernel lookup failed
    #[error("program build failed: {0}")]
    Build(String),

    /// A handle passed to the device does not name a live object
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },

    /// The device refused to enqueue a command
    #[error("enqueue rejected: {0}")]
    Enqueue(String),

    /// The kernel faulted while executing
    #[error("kernel execution failed: {0}")]
    Execution(String),

    /// Host/device transfer size does not match the buffer
    #[error("transfer size mismatch: buffer holds {buffer} bytes, host side has {host}")]
    TransferSize { buffer: usize, host: usize },

    /// A native API call returned an error code
    #[error("{op} failed with code {code}")]
    Api { op: &'static str, code: i32 },
}

/// Invalid run or launch configuration, always raised before enqueue.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be at least {min}, got {value}")]
    TooSmall {
        field: &'static str,
        min: u64,
        value: u64,
    },

    #[error("end time {0} s is not a positive finite number")]
    InvalidEndTime(f64),

    #[error("end time {0} s overflows a 64-bit nanosecond count")]
    EndTimeOverflow(f64),

    #[error("photon rate {0} must be between 0 and {max}", max = crate::params::MAX_PHOTON_RATE)]
    InvalidPhotonRate(f32),

    #[error("global size {global} in dimension {dim} is not a multiple of local size {local}")]
    NonDivisibleGrid { dim: usize, global: u64, local: u64 },

    #[error("{what} overflows: {detail}")]
    Overflow { what: &'static str, detail: String },

    #[error("work-group size {requested} exceeds the device maximum of {max}")]
    WorkgroupTooLarge { requested: u64, max: u64 },

    #[error("local scratch of {requested} bytes exceeds device local memory of {available} bytes")]
    LocalMemoryExceeded { requested: u64, available: u64 },

    #[error("rng_reserved {rng_reserved} must be in [{min}, {local_capacity})")]
    RngReservation {
        rng_reserved: u32,
        min: u32,
        local_capacity: u32,
    },

    #[error("kernel argument slot {index} ({slot}): {problem}")]
    ArgumentBinding {
        index: usize,
        slot: &'static str,
        problem: String,
    },

    #[error("cannot parse run parameters: {0}")]
    Parse(String),
}

/// Broad failure category, matching how callers react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Initialization,
    Allocation,
    Configuration,
    Launch,
    Synchronization,
}

/// Orchestration failure.
#[derive(Debug, thiserror::Error)]
pub enum FcsError {
    /// No device could be opened
    #[error("no usable compute device: {0}")]
    DeviceUnavailable(#[source] DeviceError),

    /// Program source missing or unreadable
    #[error("cannot read program source {}: {source}", path.display())]
    ProgramSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Device program failed to compile or link
    #[error("cannot build kernel `{entry}`: {source}")]
    ProgramBuild {
        entry: String,
        #[source]
        source: DeviceError,
    },

    /// Device memory allocation failed for one tier
    #[error("allocating {bytes} bytes for the {tier} tier failed: {source}")]
    Allocation {
        tier: MemoryTier,
        bytes: usize,
        #[source]
        source: DeviceError,
    },

    /// Invalid parameters or grid, rejected before enqueue
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    /// The device runtime rejected the kernel launch
    #[error("kernel launch rejected: {0}")]
    Launch(#[source] DeviceError),

    /// Waiting on the completion event failed
    #[error("kernel did not complete: {0}")]
    Completion(#[source] DeviceError),

    /// Copying results back to the host failed
    #[error("readback failed: {0}")]
    Readback(#[source] DeviceError),

    /// Readback was requested before the kernel completed
    #[error("readback requested while the launch is {0}")]
    NotCompleted(LaunchState),
}

impl FcsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FcsError::DeviceUnavailable(_)
            | FcsError::ProgramSource { .. }
            | FcsError::ProgramBuild { .. } => ErrorKind::Initialization,
            FcsError::Allocation { .. } => ErrorKind::Allocation,
            FcsError::Configuration(_) => ErrorKind::Configuration,
            FcsError::Launch(_) => ErrorKind::Launch,
            FcsError::Completion(_) | FcsError::Readback(_) | FcsError::NotCompleted(_) => {
                ErrorKind::Synchronization
            }
        }
    }
}

pub mod device;
pub mod error;
pub mod event;
pub mod kernel;
pub mod launch;
pub mod logging;
pub mod memory;
pub mod occupancy;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod params;
pub mod program;
pub mod report;
pub mod results;
pub mod simulation;
pub mod software;

pub use device::Device;
pub use error::{ErrorKind, FcsError, Result};
pub use launch::RunMode;
pub use params::RunParameters;
pub use results::ResultSet;
pub use simulation::{Simulation, SimulationConfig};
pub use software::SoftwareDevice;

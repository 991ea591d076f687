/// Device program loading: read kernel source from disk and build it on the
/// device. Runs once per `Simulation`, before any buffer is allocated.
use std::path::{Path, PathBuf};

use tracing::info;

use crate::device::{Device, KernelId};
use crate::error::{FcsError, Result};

/// Kernel source looked up relative to the working directory.
pub const DEFAULT_PROGRAM_PATH: &str = "program.cl";

/// Kernel function launched for every run.
pub const DEFAULT_ENTRY_POINT: &str = "fcs";

/// Macro that switches program.cl to the diagnostic signature.
pub const DIAGNOSTIC_DEFINE: &str = "FCS_DIAGNOSTIC";

/// A kernel built and ready to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledProgram {
    pub kernel: KernelId,
    pub entry_point: String,
    pub source_path: PathBuf,
}

/// Read the whole program source. A missing or unreadable file is fatal.
pub fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| FcsError::ProgramSource {
        path: path.to_path_buf(),
        source,
    })
}

/// Read `path` and build `entry_point` from it on `device`.
pub fn load<D: Device + ?Sized>(
    device: &D,
    path: &Path,
    entry_point: &str,
    defines: &[&str],
) -> Result<CompiledProgram> {
    let source = read_source(path)?;
    let kernel = device
        .build_kernel(&source, entry_point, defines)
        .map_err(|source| FcsError::ProgramBuild {
            entry: entry_point.to_string(),
            source,
        })?;
    info!(
        device = device.name(),
        program = %path.display(),
        entry = entry_point,
        defines = ?defines,
        bytes = source.len(),
        "program built"
    );
    Ok(CompiledProgram {
        kernel,
        entry_point: entry_point.to_string(),
        source_path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn missing_source_is_an_initialization_failure() {
        let err = read_source(Path::new("/nonexistent/absent.cl")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Initialization);
        assert!(err.to_string().contains("absent.cl"));
    }

    #[test]
    fn source_is_read_whole() {
        let path = std::env::temp_dir().join("fcsim_program_test_k.cl");
        std::fs::write(&path, "__kernel void fcs() {}\n").unwrap();
        let source = read_source(&path);
        std::fs::remove_file(&path).ok();
        assert_eq!(source.unwrap(), "__kernel void fcs() {}\n");
    }
}

#![allow(dead_code)]
/// Shared fixtures for the integration tests: a device that records every
/// call instead of running anything, and a throwaway program file.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use fcsim::device::{BufferId, Device, EventId, KernelId, ProfilingInfo};
use fcsim::error::DeviceError;
use fcsim::kernel::{KernelArg, NdRange};
use fcsim::memory::{DeviceMemoryRegion, MemoryTier};
use fcsim::occupancy::DeviceLimits;
use parking_lot::Mutex;

/// One observed device call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Build {
        entry: String,
        defines: Vec<String>,
    },
    Allocate {
        id: BufferId,
        tier: MemoryTier,
        bytes: usize,
        host: Option<Vec<u8>>,
    },
    Release(BufferId),
    Enqueue {
        args: Vec<KernelArg>,
        range: NdRange,
    },
    Wait(EventId),
    Read(BufferId),
    Finish,
}

/// Device double that records calls and completes every launch instantly.
/// Reads fill the host buffer with `fill_byte`.
pub struct RecordingDevice {
    pub calls: Mutex<Vec<Call>>,
    pub limits: DeviceLimits,
    /// Allocations in this tier fail with out-of-memory
    pub fail_tier: Option<MemoryTier>,
    pub fail_build: bool,
    pub fail_enqueue: bool,
    pub profiling: Option<ProfilingInfo>,
    pub fill_byte: u8,
    next: Mutex<u64>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        RecordingDevice {
            calls: Mutex::new(Vec::new()),
            limits: DeviceLimits::typical_gpu(),
            fail_tier: None,
            fail_build: false,
            fail_enqueue: false,
            profiling: None,
            fill_byte: 0,
            next: Mutex::new(1),
        }
    }

    pub fn failing_tier(mut self, tier: MemoryTier) -> Self {
        self.fail_tier = Some(tier);
        self
    }

    pub fn with_profiling(mut self, start_ns: u64, end_ns: u64) -> Self {
        self.profiling = Some(ProfilingInfo { start_ns, end_ns });
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Index of the first call matching `pred`.
    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls.lock().iter().position(pred)
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    pub fn allocated(&self) -> Vec<BufferId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Allocate { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn released(&self) -> Vec<BufferId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Release(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn enqueued_args(&self) -> Option<Vec<KernelArg>> {
        self.calls.lock().iter().find_map(|c| match c {
            Call::Enqueue { args, .. } => Some(args.clone()),
            _ => None,
        })
    }

    pub fn enqueued_range(&self) -> Option<NdRange> {
        self.calls.lock().iter().find_map(|c| match c {
            Call::Enqueue { range, .. } => Some(*range),
            _ => None,
        })
    }

    fn next_handle(&self) -> u64 {
        let mut next = self.next.lock();
        let id = *next;
        *next += 1;
        id
    }
}

impl Device for RecordingDevice {
    fn name(&self) -> &str {
        "recording device"
    }

    fn limits(&self) -> DeviceLimits {
        self.limits.clone()
    }

    fn build_kernel(
        &self,
        _source: &str,
        entry: &str,
        defines: &[&str],
    ) -> Result<KernelId, DeviceError> {
        self.calls.lock().push(Call::Build {
            entry: entry.to_string(),
            defines: defines.iter().map(|d| d.to_string()).collect(),
        });
        if self.fail_build {
            return Err(DeviceError::Build("syntax error".to_string()));
        }
        Ok(KernelId(self.next_handle()))
    }

    fn allocate(
        &self,
        region: &DeviceMemoryRegion,
        host_data: Option<&[u8]>,
    ) -> Result<BufferId, DeviceError> {
        if self.fail_tier == Some(region.tier) {
            return Err(DeviceError::OutOfMemory {
                requested: region.bytes,
                available: 0,
            });
        }
        let id = BufferId(self.next_handle());
        self.calls.lock().push(Call::Allocate {
            id,
            tier: region.tier,
            bytes: region.bytes,
            host: host_data.map(<[u8]>::to_vec),
        });
        Ok(id)
    }

    fn release(&self, buffer: BufferId) {
        self.calls.lock().push(Call::Release(buffer));
    }

    fn enqueue_kernel(
        &self,
        _kernel: KernelId,
        args: &[KernelArg],
        range: &NdRange,
    ) -> Result<EventId, DeviceError> {
        if self.fail_enqueue {
            return Err(DeviceError::Enqueue("invalid work-group size".to_string()));
        }
        self.calls.lock().push(Call::Enqueue {
            args: args.to_vec(),
            range: *range,
        });
        Ok(EventId(self.next_handle()))
    }

    fn wait(&self, event: EventId) -> Result<(), DeviceError> {
        self.calls.lock().push(Call::Wait(event));
        Ok(())
    }

    fn profiling(&self, _event: EventId) -> Option<ProfilingInfo> {
        self.profiling
    }

    fn release_event(&self, _event: EventId) {}

    fn read_buffer(&self, buffer: BufferId, dst: &mut [u8]) -> Result<(), DeviceError> {
        self.calls.lock().push(Call::Read(buffer));
        dst.fill(self.fill_byte);
        Ok(())
    }

    fn finish(&self) -> Result<(), DeviceError> {
        self.calls.lock().push(Call::Finish);
        Ok(())
    }
}

static TEMP_FILES: AtomicUsize = AtomicUsize::new(0);

/// A file under the system temp directory, removed on drop.
pub struct TempFile(PathBuf);

impl TempFile {
    pub fn new(name: &str, contents: &str) -> Self {
        let n = TEMP_FILES.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("fcsim_{}_{n}_{name}", std::process::id()));
        std::fs::write(&path, contents).expect("write temp file");
        TempFile(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        std::fs::remove_file(&self.0).ok();
    }
}

/// A program file declaring the `fcs` kernel. The path is valid while the
/// returned guard lives.
pub fn program_file() -> (TempFile, PathBuf) {
    let file = TempFile::new(
        "program.cl",
        "__kernel void fcs(__global uint* countdown, __global ulong* results) {}\n",
    );
    let path = file.path().to_path_buf();
    (file, path)
}

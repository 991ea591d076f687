/// Software compute device.
///
/// Runs native kernels on the host CPU behind the same [`Device`] interface
/// as a real accelerator: global memory lives in an accounted pool, each
/// launch gets its own background thread and completion event, and events
/// carry start/end timestamps on a device clock that starts when the device
/// is created.
///
/// Program "compilation" checks that the source declares the requested
/// kernel and resolves it in a registry of native implementations.
use std::collections::HashMap;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::{BufferId, Device, EventId, KernelId, ProfilingInfo};
use crate::error::DeviceError;
use crate::kernel::{KernelArg, NdRange};
use crate::memory::DeviceMemoryRegion;
use crate::occupancy::DeviceLimits;

use self::kernel::{BoundArg, NativeKernel};
use self::memory::MemoryPool;

pub mod executor;
pub mod fcs;
pub mod kernel;
pub mod memory;

/// Limits of the software device: GPU-like group limits, 256 KiB of local
/// memory per group and 1 GiB of global memory.
pub fn software_limits() -> DeviceLimits {
    DeviceLimits {
        compute_units: rayon::current_num_threads() as u32,
        max_work_group_size: 1024,
        max_work_items_per_unit: 2048,
        max_groups_per_unit: 32,
        local_mem_bytes: 256 * 1024,
        global_mem_bytes: 1024 * 1024 * 1024,
    }
}

type LaunchResult = Result<ProfilingInfo, DeviceError>;

enum EventSlot {
    Running(JoinHandle<LaunchResult>),
    Done(LaunchResult),
}

pub struct SoftwareDevice {
    name: String,
    limits: DeviceLimits,
    registry: HashMap<String, NativeKernel>,
    memory: Mutex<MemoryPool>,
    kernels: Mutex<HashMap<u64, NativeKernel>>,
    events: Mutex<HashMap<u64, EventSlot>>,
    next_handle: Mutex<u64>,
    epoch: Instant,
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareDevice {
    /// Device with the native FCS kernel registered.
    pub fn new() -> Self {
        Self::with_limits(software_limits())
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        let pool = MemoryPool::new(limits.global_mem_bytes as usize);
        let mut device = SoftwareDevice {
            name: "fcsim software device".to_string(),
            limits,
            registry: HashMap::new(),
            memory: Mutex::new(pool),
            kernels: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            next_handle: Mutex::new(1),
            epoch: Instant::now(),
        };
        device.register(fcs::fcs_kernel());
        device
    }

    /// Make `kernel` available to `build_kernel` under its name.
    pub fn register(&mut self, kernel: NativeKernel) {
        self.registry.insert(kernel.name.clone(), kernel);
    }

    pub fn with_kernel(mut self, kernel: NativeKernel) -> Self {
        self.register(kernel);
        self
    }

    /// Global memory currently allocated, in bytes.
    pub fn memory_in_use(&self) -> usize {
        self.memory.lock().used()
    }

    pub fn live_buffers(&self) -> usize {
        self.memory.lock().live_buffers()
    }

    fn next_handle(&self) -> u64 {
        let mut next = self.next_handle.lock();
        let id = *next;
        *next += 1;
        id
    }

    fn bind_args(&self, args: &[KernelArg]) -> Result<Vec<BoundArg>, DeviceError> {
        let memory = self.memory.lock();
        args.iter()
            .map(|arg| match arg {
                KernelArg::Global { buffer, .. } => memory.get(*buffer).map(BoundArg::Global),
                KernelArg::Local { bytes } => {
                    if *bytes as u64 > self.limits.local_mem_bytes {
                        return Err(DeviceError::Enqueue(format!(
                            "local allocation of {bytes} bytes exceeds {} bytes",
                            self.limits.local_mem_bytes
                        )));
                    }
                    Ok(BoundArg::Local {
                        words: bytes.div_ceil(4),
                    })
                }
                KernelArg::Constants(c) => Ok(BoundArg::Constants(*c)),
            })
            .collect()
    }
}

/// Whether `source` declares `__kernel void <entry>(`.
fn declares_kernel(source: &str, entry: &str) -> bool {
    source.match_indices("__kernel").any(|(at, kw)| {
        let mut rest = source[at + kw.len()..].split_whitespace();
        if rest.next() != Some("void") {
            return false;
        }
        rest.next().is_some_and(|token| {
            let name: String = token
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            name == entry
        })
    })
}

impl Device for SoftwareDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> DeviceLimits {
        self.limits.clone()
    }

    fn build_kernel(
        &self,
        source: &str,
        entry: &str,
        defines: &[&str],
    ) -> Result<KernelId, DeviceError> {
        if !declares_kernel(source, entry) {
            return Err(DeviceError::Build(format!(
                "kernel `{entry}` is not declared in the program source"
            )));
        }
        let kernel = self.registry.get(entry).cloned().ok_or_else(|| {
            DeviceError::Build(format!("no native implementation of kernel `{entry}`"))
        })?;
        let id = self.next_handle();
        self.kernels.lock().insert(id, kernel);
        debug!(entry, ?defines, id, "native kernel resolved");
        Ok(KernelId(id))
    }

    fn allocate(
        &self,
        region: &DeviceMemoryRegion,
        host_data: Option<&[u8]>,
    ) -> Result<BufferId, DeviceError> {
        self.memory.lock().allocate(region, host_data)
    }

    fn release(&self, buffer: BufferId) {
        if !self.memory.lock().release(buffer) {
            warn!(%buffer, "release of unknown buffer");
        }
    }

    fn enqueue_kernel(
        &self,
        kernel: KernelId,
        args: &[KernelArg],
        range: &NdRange,
    ) -> Result<EventId, DeviceError> {
        let native = self
            .kernels
            .lock()
            .get(&kernel.0)
            .cloned()
            .ok_or(DeviceError::UnknownHandle {
                kind: "kernel",
                id: kernel.0,
            })?;
        if range.local_size() > self.limits.max_work_group_size {
            return Err(DeviceError::Enqueue(format!(
                "work-group size {} exceeds {}",
                range.local_size(),
                self.limits.max_work_group_size
            )));
        }
        let bound = self.bind_args(args)?;
        let range = *range;
        let epoch = self.epoch;
        let id = self.next_handle();

        let handle = std::thread::Builder::new()
            .name(format!("fcsim-launch-{id}"))
            .spawn(move || -> LaunchResult {
                let start_ns = epoch.elapsed().as_nanos() as u64;
                let stats = executor::execute(&native, &bound, &range)
                    .map_err(|fault| DeviceError::Execution(fault.to_string()))?;
                let end_ns = epoch.elapsed().as_nanos() as u64;
                info!(
                    kernel = %native.name,
                    groups = stats.groups_executed,
                    wavefronts = stats.wavefronts_executed,
                    work_items = stats.work_items_executed,
                    elapsed_ns = end_ns - start_ns,
                    "launch complete"
                );
                Ok(ProfilingInfo { start_ns, end_ns })
            })
            .map_err(|e| DeviceError::Enqueue(e.to_string()))?;

        self.events.lock().insert(id, EventSlot::Running(handle));
        Ok(EventId(id))
    }

    fn wait(&self, event: EventId) -> Result<(), DeviceError> {
        let slot = self.events.lock().remove(&event.0);
        let result = match slot {
            Some(EventSlot::Running(handle)) => handle.join().unwrap_or_else(|_| {
                Err(DeviceError::Execution("launch thread panicked".to_string()))
            }),
            Some(EventSlot::Done(result)) => result,
            None => {
                return Err(DeviceError::UnknownHandle {
                    kind: "event",
                    id: event.0,
                });
            }
        };
        self.events
            .lock()
            .insert(event.0, EventSlot::Done(result.clone()));
        result.map(|_| ())
    }

    fn profiling(&self, event: EventId) -> Option<ProfilingInfo> {
        match self.events.lock().get(&event.0) {
            Some(EventSlot::Done(Ok(info))) => Some(*info),
            _ => None,
        }
    }

    fn release_event(&self, event: EventId) {
        let slot = self.events.lock().remove(&event.0);
        if let Some(EventSlot::Running(handle)) = slot {
            // launches cannot be cancelled
            let _ = handle.join();
        }
    }

    fn read_buffer(&self, buffer: BufferId, dst: &mut [u8]) -> Result<(), DeviceError> {
        let alloc = self.memory.lock().get(buffer)?;
        alloc.read_bytes(dst)
    }

    fn finish(&self) -> Result<(), DeviceError> {
        let running: Vec<u64> = self
            .events
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, EventSlot::Running(_)))
            .map(|(id, _)| *id)
            .collect();
        for id in running {
            self.wait(EventId(id))?;
        }
        Ok(())
    }
}

impl Drop for SoftwareDevice {
    fn drop(&mut self) {
        for (_, slot) in self.events.get_mut().drain() {
            if let EventSlot::Running(handle) = slot {
                let _ = handle.join();
            }
        }
    }
}

impl std::fmt::Debug for SoftwareDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareDevice")
            .field("name", &self.name)
            .field("limits", &self.limits)
            .field("kernels", &self.registry.keys().collect::<Vec<_>>())
            .finish()
    }
}

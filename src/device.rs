/// The seam between the orchestrator and a compute device.
///
/// A [`Device`] stands for a ready device context plus its in-order command
/// queue. Objects living on the device (buffers, compiled kernels, launch
/// events) are named by opaque handles; the device owns the real resources
/// and frees them when the handle is released.
///
/// All methods take `&self`. Backends keep their handle tables behind
/// interior locks so typed buffer guards can hold a shared reference to the
/// device while the orchestrator keeps issuing commands.
use std::fmt;

use crate::error::DeviceError;
use crate::kernel::{KernelArg, NdRange};
use crate::memory::DeviceMemoryRegion;
use crate::occupancy::DeviceLimits;

/// Device buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Compiled kernel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub u64);

/// Handle of an enqueued command's completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Device-side timestamps of a finished command, in nanoseconds on the
/// device clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilingInfo {
    pub start_ns: u64,
    pub end_ns: u64,
}

impl ProfilingInfo {
    pub fn elapsed_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

pub trait Device {
    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Hardware limits used to validate launches before enqueue.
    fn limits(&self) -> DeviceLimits;

    /// Compile `source` with each of `defines` set as a preprocessor macro
    /// and look up the kernel called `entry`.
    fn build_kernel(&self, source: &str, entry: &str, defines: &[&str])
        -> Result<KernelId, DeviceError>;

    /// Allocate a buffer for `region`. When `host_data` is given it is copied
    /// into the buffer as part of the allocation; otherwise the buffer is
    /// zero-filled.
    fn allocate(
        &self,
        region: &DeviceMemoryRegion,
        host_data: Option<&[u8]>,
    ) -> Result<BufferId, DeviceError>;

    /// Free a buffer. Releasing an unknown handle is a no-op.
    fn release(&self, buffer: BufferId);

    /// Enqueue `kernel` over `range` with positional `args`. Returns as soon
    /// as the command is queued; it never waits for execution.
    fn enqueue_kernel(
        &self,
        kernel: KernelId,
        args: &[KernelArg],
        range: &NdRange,
    ) -> Result<EventId, DeviceError>;

    /// Block until the command behind `event` has finished. There is no
    /// timeout. Waiting on an already finished event returns immediately.
    fn wait(&self, event: EventId) -> Result<(), DeviceError>;

    /// Start and end timestamps of a finished command, if the device
    /// recorded them.
    fn profiling(&self, event: EventId) -> Option<ProfilingInfo>;

    /// Forget a completion event.
    fn release_event(&self, event: EventId);

    /// Blocking copy of a whole buffer into `dst`. `dst` must be exactly
    /// the buffer's size.
    fn read_buffer(&self, buffer: BufferId, dst: &mut [u8]) -> Result<(), DeviceError>;

    /// Block until every queued command has finished.
    fn finish(&self) -> Result<(), DeviceError>;
}

impl<D: Device + ?Sized> Device for &D {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn limits(&self) -> DeviceLimits {
        (**self).limits()
    }

    fn build_kernel(
        &self,
        source: &str,
        entry: &str,
        defines: &[&str],
    ) -> Result<KernelId, DeviceError> {
        (**self).build_kernel(source, entry, defines)
    }

    fn allocate(
        &self,
        region: &DeviceMemoryRegion,
        host_data: Option<&[u8]>,
    ) -> Result<BufferId, DeviceError> {
        (**self).allocate(region, host_data)
    }

    fn release(&self, buffer: BufferId) {
        (**self).release(buffer)
    }

    fn enqueue_kernel(
        &self,
        kernel: KernelId,
        args: &[KernelArg],
        range: &NdRange,
    ) -> Result<EventId, DeviceError> {
        (**self).enqueue_kernel(kernel, args, range)
    }

    fn wait(&self, event: EventId) -> Result<(), DeviceError> {
        (**self).wait(event)
    }

    fn profiling(&self, event: EventId) -> Option<ProfilingInfo> {
        (**self).profiling(event)
    }

    fn release_event(&self, event: EventId) {
        (**self).release_event(event)
    }

    fn read_buffer(&self, buffer: BufferId, dst: &mut [u8]) -> Result<(), DeviceError> {
        (**self).read_buffer(buffer, dst)
    }

    fn finish(&self) -> Result<(), DeviceError> {
        (**self).finish()
    }
}

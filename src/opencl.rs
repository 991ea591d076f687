/// OpenCL device backend (feature `opencl`).
/// Picks the GPU with the most global memory (falling back to any device),
/// creates one context and one in-order profiling queue, and maps the
/// `Device` handles onto OpenCL buffers, kernels and events.
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;

use opencl3::command_queue::{CL_QUEUE_PROFILING_ENABLE, CommandQueue};
use opencl3::context::Context;
use opencl3::device::{CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_GPU, Device as ClDevice, get_all_devices};
use opencl3::error_codes::ClError;
use opencl3::event::Event;
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_COPY_HOST_PTR, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, ClMem};
use opencl3::program::Program;
use opencl3::types::CL_BLOCKING;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::{BufferId, Device, EventId, KernelId, ProfilingInfo};
use crate::error::DeviceError;
use crate::kernel::{KernelArg, NdRange};
use crate::memory::{AccessMode, DeviceMemoryRegion};
use crate::occupancy::DeviceLimits;

fn api(op: &'static str) -> impl Fn(ClError) -> DeviceError {
    move |e| DeviceError::Api { op, code: e.0 }
}

pub struct OpenClDevice {
    name: String,
    limits: DeviceLimits,
    context: Context,
    queue: CommandQueue,
    // programs must outlive the kernels created from them
    programs: Mutex<Vec<Program>>,
    kernels: Mutex<HashMap<u64, Kernel>>,
    buffers: Mutex<HashMap<u64, Buffer<u8>>>,
    events: Mutex<HashMap<u64, Event>>,
    next_handle: Mutex<u64>,
}

impl OpenClDevice {
    /// Open the best available device.
    pub fn create() -> Result<Self, DeviceError> {
        let all_ids = get_all_devices(CL_DEVICE_TYPE_ALL).map_err(api("clGetDeviceIDs"))?;
        let mut gpu_ids = get_all_devices(CL_DEVICE_TYPE_GPU).unwrap_or_default();
        gpu_ids.sort_by(|a, b| {
            let mem_a = ClDevice::new(*a).global_mem_size().unwrap_or(0);
            let mem_b = ClDevice::new(*b).global_mem_size().unwrap_or(0);
            mem_b.cmp(&mem_a)
        });

        for id in gpu_ids.into_iter().chain(all_ids) {
            let device = ClDevice::new(id);
            let Ok(context) = Context::from_device(&device) else {
                continue;
            };
            #[allow(deprecated)]
            let Ok(queue) = CommandQueue::create_default(&context, CL_QUEUE_PROFILING_ENABLE) else {
                continue;
            };
            let name = device.name().unwrap_or_default().trim().to_string();
            let limits = DeviceLimits {
                compute_units: device.max_compute_units().unwrap_or(1),
                max_work_group_size: device.max_work_group_size().unwrap_or(1) as u64,
                max_work_items_per_unit: device.max_work_group_size().unwrap_or(1) as u64,
                max_groups_per_unit: 16,
                local_mem_bytes: device.local_mem_size().unwrap_or(0),
                global_mem_bytes: device.global_mem_size().unwrap_or(0),
            };
            info!(device = %name, compute_units = limits.compute_units, "opened OpenCL device");
            return Ok(OpenClDevice {
                name,
                limits,
                context,
                queue,
                programs: Mutex::new(Vec::new()),
                kernels: Mutex::new(HashMap::new()),
                buffers: Mutex::new(HashMap::new()),
                events: Mutex::new(HashMap::new()),
                next_handle: Mutex::new(1),
            });
        }
        Err(DeviceError::Api {
            op: "clCreateContext",
            code: -1,
        })
    }

    fn next_handle(&self) -> u64 {
        let mut next = self.next_handle.lock();
        let id = *next;
        *next += 1;
        id
    }
}

impl Device for OpenClDevice {
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
        let options: Vec<String> = defines.iter().map(|d| format!("-D {d}")).collect();
        let program = Program::create_and_build_from_source(&self.context, source, &options.join(" "))
            .map_err(DeviceError::Build)?;
        let kernel = Kernel::create(&program, entry)
            .map_err(|e| DeviceError::Build(format!("kernel `{entry}`: error {}", e.0)))?;
        self.programs.lock().push(program);
        let id = self.next_handle();
        self.kernels.lock().insert(id, kernel);
        Ok(KernelId(id))
    }

    fn allocate(
        &self,
        region: &DeviceMemoryRegion,
        host_data: Option<&[u8]>,
    ) -> Result<BufferId, DeviceError> {
        let mut flags = match region.access {
            AccessMode::ReadOnly => CL_MEM_READ_ONLY,
            AccessMode::ReadWrite | AccessMode::CopyFromHost => CL_MEM_READ_WRITE,
        };
        let host_ptr = match host_data {
            Some(data) => {
                if data.len() != region.bytes {
                    return Err(DeviceError::TransferSize {
                        buffer: region.bytes,
                        host: data.len(),
                    });
                }
                flags |= CL_MEM_COPY_HOST_PTR;
                data.as_ptr() as *mut c_void
            }
            None => ptr::null_mut(),
        };
        // SAFETY: with CL_MEM_COPY_HOST_PTR the runtime copies `region.bytes`
        // bytes out of `host_data` before returning; otherwise the pointer is null.
        let buffer = unsafe {
            Buffer::<u8>::create(&self.context, flags, region.bytes, host_ptr)
                .map_err(api("clCreateBuffer"))?
        };
        if host_data.is_none() {
            let mut zeroed = buffer;
            // SAFETY: blocking fill of a buffer this function owns.
            unsafe {
                self.queue
                    .enqueue_fill_buffer(&mut zeroed, &[0u8], 0, region.bytes, &[])
                    .map_err(api("clEnqueueFillBuffer"))?
                    .wait()
                    .map_err(api("clWaitForEvents"))?;
            }
            return Ok(self.store_buffer(zeroed));
        }
        Ok(self.store_buffer(buffer))
    }

    fn release(&self, buffer: BufferId) {
        if self.buffers.lock().remove(&buffer.0).is_none() {
            warn!(%buffer, "release of unknown buffer");
        }
    }

    fn enqueue_kernel(
        &self,
        kernel: KernelId,
        args: &[KernelArg],
        range: &NdRange,
    ) -> Result<EventId, DeviceError> {
        let kernels = self.kernels.lock();
        let buffers = self.buffers.lock();
        let kernel = kernels.get(&kernel.0).ok_or(DeviceError::UnknownHandle {
            kind: "kernel",
            id: kernel.0,
        })?;

        let mut exec = ExecuteKernel::new(kernel);
        for arg in args {
            match arg {
                KernelArg::Global { buffer, .. } => {
                    let buf = buffers.get(&buffer.0).ok_or(DeviceError::UnknownHandle {
                        kind: "buffer",
                        id: buffer.0,
                    })?;
                    // SAFETY: the buffer stays alive in the handle table until released,
                    // and the orchestrator releases buffers only after the launch completes.
                    unsafe {
                        exec.set_arg(buf);
                    }
                }
                KernelArg::Local { bytes } => unsafe {
                    exec.set_arg_local_buffer(*bytes);
                },
                KernelArg::Constants(c) => unsafe {
                    exec.set_arg(c);
                },
            }
        }
        let global = range.global_sizes();
        let local = range.local_sizes();
        let offsets = range.offsets();
        // SAFETY: every argument position was set above; sizes come from a
        // validated NdRange.
        let event = unsafe {
            exec.set_global_work_offsets(&offsets)
                .set_global_work_sizes(&global)
                .set_local_work_sizes(&local)
                .enqueue_nd_range(&self.queue)
                .map_err(|e| DeviceError::Enqueue(format!("clEnqueueNDRangeKernel: {}", e.0)))?
        };
        let id = self.next_handle();
        self.events.lock().insert(id, event);
        debug!(id, "kernel enqueued on OpenCL queue");
        Ok(EventId(id))
    }

    fn wait(&self, event: EventId) -> Result<(), DeviceError> {
        let events = self.events.lock();
        let ev = events.get(&event.0).ok_or(DeviceError::UnknownHandle {
            kind: "event",
            id: event.0,
        })?;
        ev.wait().map_err(api("clWaitForEvents"))
    }

    fn profiling(&self, event: EventId) -> Option<ProfilingInfo> {
        let events = self.events.lock();
        let ev = events.get(&event.0)?;
        let start_ns = ev.profiling_command_start().ok()?;
        let end_ns = ev.profiling_command_end().ok()?;
        Some(ProfilingInfo { start_ns, end_ns })
    }

    fn release_event(&self, event: EventId) {
        self.events.lock().remove(&event.0);
    }

    fn read_buffer(&self, buffer: BufferId, dst: &mut [u8]) -> Result<(), DeviceError> {
        let buffers = self.buffers.lock();
        let buf = buffers.get(&buffer.0).ok_or(DeviceError::UnknownHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        let size = buf.size().map_err(api("clGetMemObjectInfo"))?;
        if size != dst.len() {
            return Err(DeviceError::TransferSize {
                buffer: size,
                host: dst.len(),
            });
        }
        // SAFETY: blocking read into a host slice of exactly the buffer's size.
        unsafe {
            self.queue
                .enqueue_read_buffer(buf, CL_BLOCKING, 0, dst, &[])
                .map_err(api("clEnqueueReadBuffer"))?
                .wait()
                .map_err(api("clWaitForEvents"))
        }
    }

    fn finish(&self) -> Result<(), DeviceError> {
        self.queue.finish().map_err(api("clFinish"))
    }
}

impl OpenClDevice {
    fn store_buffer(&self, buffer: Buffer<u8>) -> BufferId {
        let id = self.next_handle();
        self.buffers.lock().insert(id, buffer);
        BufferId(id)
    }
}

/// Native kernels for the software device.
/// A kernel is a function every work-item executes, identified by its
/// local/group coordinates, with access to the bound arguments and to its
/// work-group's local memory.
use std::sync::Arc;

use crate::kernel::{Dim3, RunConstants};
use crate::software::memory::DeviceAllocation;

/// A work-item stopped with an error. Any fault fails the whole launch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelFault {
    #[error("{what} index {index} out of bounds (length {len})")]
    OutOfBounds {
        what: &'static str,
        index: usize,
        len: usize,
    },

    #[error("argument {index} is not bound")]
    MissingArg { index: usize },

    #[error("argument {index} is not a {expected}")]
    WrongArg {
        index: usize,
        expected: &'static str,
    },

    #[error("{0}")]
    Aborted(String),
}

/// A kernel argument resolved to device-side storage.
#[derive(Debug, Clone)]
pub enum BoundArg {
    Global(Arc<DeviceAllocation>),
    /// Group-local memory of this many u32 words, zeroed per work-group
    Local { words: usize },
    Constants(RunConstants),
}

/// Per-work-item context passed into the kernel function.
pub struct WorkItemCtx<'a> {
    pub local_id: Dim3,
    pub group_id: Dim3,
    pub local_size: Dim3,
    pub num_groups: Dim3,
    args: &'a [BoundArg],
    /// Group-local memory per argument position, shared by the whole group
    locals: &'a mut [Option<Vec<u32>>],
}

impl<'a> WorkItemCtx<'a> {
    pub fn new(
        local_id: Dim3,
        group_id: Dim3,
        local_size: Dim3,
        num_groups: Dim3,
        args: &'a [BoundArg],
        locals: &'a mut [Option<Vec<u32>>],
    ) -> Self {
        WorkItemCtx {
            local_id,
            group_id,
            local_size,
            num_groups,
            args,
            locals,
        }
    }

    /// Flat index of this work-item inside its group
    pub fn local_linear_id(&self) -> usize {
        linear(self.local_id, self.local_size)
    }

    /// Flat index of the work-group inside the grid
    pub fn group_linear_id(&self) -> usize {
        linear(self.group_id, self.num_groups)
    }

    /// Flat global index: group * group size + local index
    pub fn global_linear_id(&self) -> u64 {
        self.group_linear_id() as u64 * self.local_size.size() + self.local_linear_id() as u64
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn global(&self, index: usize) -> Result<&'a DeviceAllocation, KernelFault> {
        let args: &'a [BoundArg] = self.args;
        match args.get(index) {
            Some(BoundArg::Global(alloc)) => Ok(alloc),
            Some(_) => Err(KernelFault::WrongArg {
                index,
                expected: "global buffer",
            }),
            None => Err(KernelFault::MissingArg { index }),
        }
    }

    pub fn constants(&self, index: usize) -> Result<RunConstants, KernelFault> {
        match self.args.get(index) {
            Some(BoundArg::Constants(c)) => Ok(*c),
            Some(_) => Err(KernelFault::WrongArg {
                index,
                expected: "constant block",
            }),
            None => Err(KernelFault::MissingArg { index }),
        }
    }

    /// The group-local memory bound at `index`.
    pub fn local_mut(&mut self, index: usize) -> Result<&mut [u32], KernelFault> {
        match self.locals.get_mut(index) {
            Some(Some(words)) => Ok(words.as_mut_slice()),
            Some(None) => Err(KernelFault::WrongArg {
                index,
                expected: "local allocation",
            }),
            None => Err(KernelFault::MissingArg { index }),
        }
    }
}

fn linear(id: Dim3, extent: Dim3) -> usize {
    (id.z as usize * extent.y as usize + id.y as usize) * extent.x as usize + id.x as usize
}

pub type KernelFn = dyn Fn(&mut WorkItemCtx<'_>) -> Result<(), KernelFault> + Send + Sync;

/// A native kernel: a named function executed by every work-item in the grid.
#[derive(Clone)]
pub struct NativeKernel {
    pub name: String,
    pub func: Arc<KernelFn>,
}

impl NativeKernel {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&mut WorkItemCtx<'_>) -> Result<(), KernelFault> + Send + Sync + 'static,
    {
        NativeKernel {
            name: name.to_string(),
            func: Arc::new(func),
        }
    }
}

impl std::fmt::Debug for NativeKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeKernel").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    #[test]
    fn linear_ids_follow_row_major_order() {
        let args = [BoundArg::Constants(RunConstants::zeroed())];
        let mut locals = [None];
        let ctx = WorkItemCtx::new(
            Dim3::new(3, 1, 0),
            Dim3::new(2, 0, 0),
            Dim3::new(4, 2, 1),
            Dim3::new(5, 1, 1),
            &args,
            &mut locals,
        );
        assert_eq!(ctx.local_linear_id(), 7);
        assert_eq!(ctx.group_linear_id(), 2);
        assert_eq!(ctx.global_linear_id(), 2 * 8 + 7);
    }

    #[test]
    fn argument_accessors_check_kinds() {
        let args = [
            BoundArg::Local { words: 4 },
            BoundArg::Constants(RunConstants::zeroed()),
        ];
        let mut locals = [Some(vec![0u32; 4]), None];
        let mut ctx = WorkItemCtx::new(
            Dim3::zero(),
            Dim3::zero(),
            Dim3::x(1),
            Dim3::x(1),
            &args,
            &mut locals,
        );
        assert!(ctx.constants(1).is_ok());
        assert_eq!(
            ctx.global(0).err(),
            Some(KernelFault::WrongArg {
                index: 0,
                expected: "global buffer"
            })
        );
        assert_eq!(ctx.global(5).err(), Some(KernelFault::MissingArg { index: 5 }));
        assert_eq!(ctx.local_mut(0).unwrap().len(), 4);
        assert!(ctx.local_mut(1).is_err());
    }
}

//! Compiled-kernel interface.
//!
//! The kernel-compilation subsystem is an external collaborator; the
//! runtime only sees an opaque [`KernelMod`] exposing size lists and a
//! launch entry point. The [`KernelLaunchInfo`] descriptor is transient:
//! it is rebuilt from current tensor pointers/sizes immediately before
//! every launch, because dynamic-shape kernels change sizes between
//! passes.

use crate::{DeviceError, Result};

/// One raw device address range handed to a kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressSpan {
    pub addr: usize,
    pub size: usize,
}

/// Launch descriptor: input/workspace/output address spans.
#[derive(Debug, Clone, Default)]
pub struct KernelLaunchInfo {
    pub inputs: Vec<AddressSpan>,
    pub workspaces: Vec<AddressSpan>,
    pub outputs: Vec<AddressSpan>,
}

impl KernelLaunchInfo {
    pub fn with_counts(inputs: usize, workspaces: usize, outputs: usize) -> Self {
        Self {
            inputs: vec![AddressSpan::default(); inputs],
            workspaces: vec![AddressSpan::default(); workspaces],
            outputs: vec![AddressSpan::default(); outputs],
        }
    }
}

/// Opaque executable kernel module selected by the graph compiler.
pub trait KernelMod: Send + Sync {
    /// Fully qualified kernel name, used in logs and errors.
    fn name(&self) -> &str;

    /// Byte sizes of the output buffers, one entry per output slot.
    fn output_size_list(&self) -> Vec<usize>;

    /// Byte sizes of the scratch workspaces required by one launch.
    fn workspace_size_list(&self) -> Vec<usize> {
        Vec::new()
    }

    /// Whether output/workspace sizes may change between passes.
    fn is_dynamic_shape(&self) -> bool {
        false
    }

    /// Refresh size metadata from current input shapes. Called before
    /// memory acquisition when [`Self::is_dynamic_shape`] is true.
    fn update_shape(&self) -> Result<()> {
        Ok(())
    }

    /// Run the kernel against the given address spans.
    fn launch(&self, launch_info: &KernelLaunchInfo) -> Result<()>;
}

/// Fixed-shape kernel backed by a plain function, enough for graph wiring
/// tests and host-only graphs.
pub struct StaticKernel {
    name: String,
    output_sizes: Vec<usize>,
    workspace_sizes: Vec<usize>,
    compute: Box<dyn Fn(&KernelLaunchInfo) -> bool + Send + Sync>,
}

impl StaticKernel {
    pub fn new(name: impl Into<String>, output_sizes: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            output_sizes,
            workspace_sizes: Vec::new(),
            compute: Box::new(|_| true),
        }
    }

    pub fn with_workspaces(mut self, workspace_sizes: Vec<usize>) -> Self {
        self.workspace_sizes = workspace_sizes;
        self
    }

    /// Replace the compute body; returning `false` reports launch failure.
    pub fn with_compute<F>(mut self, compute: F) -> Self
    where
        F: Fn(&KernelLaunchInfo) -> bool + Send + Sync + 'static,
    {
        self.compute = Box::new(compute);
        self
    }
}

impl KernelMod for StaticKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_size_list(&self) -> Vec<usize> {
        self.output_sizes.clone()
    }

    fn workspace_size_list(&self) -> Vec<usize> {
        self.workspace_sizes.clone()
    }

    fn launch(&self, launch_info: &KernelLaunchInfo) -> Result<()> {
        if (self.compute)(launch_info) {
            Ok(())
        } else {
            Err(DeviceError::LaunchFailed {
                kernel: self.name.clone(),
            })
        }
    }
}

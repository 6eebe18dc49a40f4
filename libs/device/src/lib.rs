//! Device Capability Layer
//!
//! Narrow interfaces between the actor runtime and a concrete accelerator
//! backend: memory allocation, kernel launch and device-tensor lifecycle.
//! The runtime is written once against [`DeviceContext`]; each backend
//! (host CPU in-tree, GPU/NPU out of tree) implements it.
//!
//! Ownership of device buffers is tracked through the [`TensorArena`]:
//! descriptors are addressed by stable integer handles and carry an explicit
//! reference count instead of aliasing raw pointers across kernel-graph
//! nodes.

pub mod context;
pub mod kernel;
pub mod tensor;

pub use context::{DeviceContext, DeviceKind, HostDevice};
pub use kernel::{AddressSpan, KernelLaunchInfo, KernelMod, StaticKernel};
pub use tensor::{Release, TensorArena, TensorDesc, TensorFormat, TensorHandle, UNBOUNDED_REF_COUNT};

use thiserror::Error;

/// Device layer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Device allocator could not satisfy the request.
    #[error("Device(id:{device_id}) memory isn't enough, alloc failed: {requested} bytes")]
    OutOfMemory { device_id: u32, requested: usize },

    /// A tensor handle that does not exist in the arena.
    #[error("Invalid tensor handle: {0:?}")]
    InvalidHandle(TensorHandle),

    /// Kernel reported a launch failure.
    #[error("Launch kernel failed: {kernel}")]
    LaunchFailed { kernel: String },

    /// The launch descriptor does not match the kernel signature.
    #[error("Launch descriptor mismatch for {kernel}: {message}")]
    LaunchInfoMismatch { kernel: String, message: String },

    /// Freeing a buffer that holds no device memory.
    #[error("Tensor {0:?} has no device memory to free")]
    NotAllocated(TensorHandle),
}

/// Result type alias for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

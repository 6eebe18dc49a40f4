//! Device context: the per-backend capability interface.
//!
//! Only the memory-manager side of the runtime calls into a
//! [`DeviceContext`]; kernel actors issue requests and react to
//! completions. The in-tree [`HostDevice`] backs host-only graphs and the
//! test suite with a real allocator and a tracked free-byte count.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::kernel::{KernelLaunchInfo, KernelMod};
use crate::tensor::{TensorArena, TensorFormat, TensorHandle};
use crate::{DeviceError, Result};

/// Backend discriminator, mostly for logs and cross-device copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Npu,
}

/// Capability interface implemented once per backend.
pub trait DeviceContext: Send + Sync {
    fn kind(&self) -> DeviceKind;

    fn device_id(&self) -> u32;

    /// Acquire `size` bytes for `tensor` and record the address in the
    /// arena. Fails with [`DeviceError::OutOfMemory`] on exhaustion.
    fn allocate_memory(&self, arena: &TensorArena, tensor: TensorHandle, size: usize) -> Result<()>;

    /// Return `tensor`'s device memory to the allocator and clear its
    /// address.
    fn free_memory(&self, arena: &TensorArena, tensor: TensorHandle) -> Result<()>;

    /// Run a kernel against a prepared launch descriptor.
    fn launch_kernel(&self, kernel: &dyn KernelMod, launch_info: &KernelLaunchInfo) -> Result<()>;

    /// Create an unallocated device-address descriptor in the arena.
    fn create_device_address(
        &self,
        arena: &TensorArena,
        size: usize,
        format: TensorFormat,
        original_ref_count: usize,
    ) -> TensorHandle {
        arena.create(size, format, original_ref_count)
    }

    /// Unreserved bytes remaining in this device's memory arena.
    fn free_bytes(&self) -> usize;
}

const HOST_ALLOC_ALIGN: usize = 64;

/// Host (CPU) backend with a fixed-capacity accounting arena.
///
/// Real heap allocations sit behind the tracked byte budget so that
/// exhaustion behaves like a device and the allocate→launch→free
/// round-trip is observable through [`DeviceContext::free_bytes`].
pub struct HostDevice {
    device_id: u32,
    capacity: usize,
    allocated: AtomicUsize,
    /// Live allocation layouts keyed by address, needed for `dealloc`.
    layouts: Mutex<HashMap<usize, Layout>>,
}

impl HostDevice {
    /// 1 GiB default budget.
    pub fn new(device_id: u32) -> Self {
        Self::with_capacity(device_id, 1 << 30)
    }

    pub fn with_capacity(device_id: u32, capacity: usize) -> Self {
        Self {
            device_id,
            capacity,
            allocated: AtomicUsize::new(0),
            layouts: Mutex::new(HashMap::new()),
        }
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        // Buffers still held by unbounded tensors at teardown are
        // reclaimed here rather than leaked.
        let layouts = self.layouts.lock();
        for (&addr, layout) in layouts.iter() {
            unsafe { dealloc(addr as *mut u8, *layout) };
        }
    }
}

impl DeviceContext for HostDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn allocate_memory(&self, arena: &TensorArena, tensor: TensorHandle, size: usize) -> Result<()> {
        if size > self.free_bytes() {
            return Err(DeviceError::OutOfMemory {
                device_id: self.device_id,
                requested: size,
            });
        }
        let layout = Layout::from_size_align(size, HOST_ALLOC_ALIGN).map_err(|_| {
            DeviceError::OutOfMemory {
                device_id: self.device_id,
                requested: size,
            }
        })?;
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return Err(DeviceError::OutOfMemory {
                device_id: self.device_id,
                requested: size,
            });
        }
        let addr = ptr as usize;
        self.layouts.lock().insert(addr, layout);
        self.allocated.fetch_add(layout.size(), Ordering::Relaxed);
        arena.set_ptr(tensor, addr)?;
        trace!(tensor = %tensor, size, addr, "host alloc");
        Ok(())
    }

    fn free_memory(&self, arena: &TensorArena, tensor: TensorHandle) -> Result<()> {
        let addr = arena.take_ptr(tensor)?.ok_or(DeviceError::NotAllocated(tensor))?;
        let layout = self
            .layouts
            .lock()
            .remove(&addr)
            .ok_or(DeviceError::NotAllocated(tensor))?;
        unsafe { dealloc(addr as *mut u8, layout) };
        self.allocated.fetch_sub(layout.size(), Ordering::Relaxed);
        trace!(tensor = %tensor, size = layout.size(), addr, "host free");
        Ok(())
    }

    fn launch_kernel(&self, kernel: &dyn KernelMod, launch_info: &KernelLaunchInfo) -> Result<()> {
        debug!(kernel = kernel.name(), inputs = launch_info.inputs.len(), "launching kernel");
        kernel.launch(launch_info)
    }

    fn free_bytes(&self) -> usize {
        self.capacity.saturating_sub(self.allocated.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::StaticKernel;
    use crate::tensor::TensorFormat;

    #[test]
    fn test_alloc_free_round_trip_restores_free_bytes() {
        let device = HostDevice::with_capacity(0, 4096);
        let arena = TensorArena::new();
        let before = device.free_bytes();

        let t = device.create_device_address(&arena, 1024, TensorFormat::F32, 1);
        device.allocate_memory(&arena, t, 1024).unwrap();
        assert!(device.free_bytes() < before);
        assert!(arena.ptr(t).unwrap().is_some());

        device.free_memory(&arena, t).unwrap();
        assert_eq!(device.free_bytes(), before);
        assert_eq!(arena.ptr(t).unwrap(), None);
    }

    #[test]
    fn test_exhaustion_is_out_of_memory() {
        let device = HostDevice::with_capacity(0, 512);
        let arena = TensorArena::new();
        let t = arena.create(1024, TensorFormat::Raw, 1);
        let err = device.allocate_memory(&arena, t, 1024).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfMemory { requested: 1024, .. }));
    }

    #[test]
    fn test_free_without_alloc_fails() {
        let device = HostDevice::new(0);
        let arena = TensorArena::new();
        let t = arena.create(64, TensorFormat::Raw, 1);
        assert!(matches!(
            device.free_memory(&arena, t),
            Err(DeviceError::NotAllocated(_))
        ));
    }

    #[test]
    fn test_launch_through_context() {
        let device = HostDevice::new(0);
        let kernel = StaticKernel::new("Identity-0", vec![64]);
        device
            .launch_kernel(&kernel, &KernelLaunchInfo::default())
            .unwrap();
    }
}

//! Device-tensor arena.
//!
//! Buffer descriptors live in one arena per graph and are addressed by
//! stable integer handles. A descriptor carries the byte size, a format
//! tag, the device pointer (absent until memory is acquired) and an
//! explicit reference count shared by every consuming kernel-graph node.
//!
//! Lifecycle law: the producing node owns the buffer while running, every
//! consumer holds one count, and the buffer is returned to the allocator
//! exactly when the count reaches zero. Tensors created with
//! [`UNBOUNDED_REF_COUNT`] are external/persistent (graph parameters,
//! weights) and are never freed by this engine.

use parking_lot::Mutex;

use crate::{DeviceError, Result};

/// Sentinel original ref count for external/persistent tensors.
pub const UNBOUNDED_REF_COUNT: usize = usize::MAX;

/// Stable index of a tensor descriptor within its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorHandle(pub u32);

impl std::fmt::Display for TensorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tensor-{}", self.0)
    }
}

/// Element format/type tag carried alongside the raw buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorFormat {
    F32,
    F16,
    I32,
    U8,
    /// Untyped bytes (workspaces).
    Raw,
}

/// One device-resident buffer descriptor.
#[derive(Debug, Clone)]
pub struct TensorDesc {
    /// Byte size; may change between passes for dynamic-shape kernels.
    pub size: usize,
    pub format: TensorFormat,
    /// Device address, `None` until memory is acquired.
    pub ptr: Option<usize>,
    /// Remaining consumer count for the current pass.
    pub ref_count: usize,
    /// Count restored after each free; [`UNBOUNDED_REF_COUNT`] marks
    /// tensors this engine must never free.
    pub original_ref_count: usize,
}

/// Outcome of one reference-count decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// External/persistent tensor, decrement skipped entirely.
    Skipped,
    /// Consumers remain, memory stays resident.
    Alive,
    /// Count reached zero, the caller must free the device memory now.
    Free,
}

/// Arena of tensor descriptors for one kernel graph.
///
/// Interior mutability keeps handle-based access `&self`; the lock is held
/// only for descriptor field updates, never across allocator calls.
#[derive(Debug, Default)]
pub struct TensorArena {
    descs: Mutex<Vec<TensorDesc>>,
}

impl TensorArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a descriptor and return its stable handle.
    pub fn create(&self, size: usize, format: TensorFormat, original_ref_count: usize) -> TensorHandle {
        let mut descs = self.descs.lock();
        let handle = TensorHandle(descs.len() as u32);
        descs.push(TensorDesc {
            size,
            format,
            ptr: None,
            ref_count: original_ref_count,
            original_ref_count,
        });
        handle
    }

    pub fn len(&self) -> usize {
        self.descs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.lock().is_empty()
    }

    /// Snapshot of one descriptor.
    pub fn describe(&self, handle: TensorHandle) -> Result<TensorDesc> {
        let descs = self.descs.lock();
        descs
            .get(handle.0 as usize)
            .cloned()
            .ok_or(DeviceError::InvalidHandle(handle))
    }

    pub fn size(&self, handle: TensorHandle) -> Result<usize> {
        Ok(self.describe(handle)?.size)
    }

    /// Update the byte size (dynamic-shape refresh between passes).
    pub fn set_size(&self, handle: TensorHandle, size: usize) -> Result<()> {
        self.with_desc(handle, |desc| desc.size = size)
    }

    /// Current device address, if memory is acquired.
    pub fn ptr(&self, handle: TensorHandle) -> Result<Option<usize>> {
        Ok(self.describe(handle)?.ptr)
    }

    /// Record a freshly acquired device address.
    pub fn set_ptr(&self, handle: TensorHandle, ptr: usize) -> Result<()> {
        self.with_desc(handle, |desc| desc.ptr = Some(ptr))
    }

    /// Detach the device address, returning it for the allocator free call.
    pub fn take_ptr(&self, handle: TensorHandle) -> Result<Option<usize>> {
        let mut out = None;
        self.with_desc(handle, |desc| out = desc.ptr.take())?;
        Ok(out)
    }

    pub fn ref_count(&self, handle: TensorHandle) -> Result<usize> {
        Ok(self.describe(handle)?.ref_count)
    }

    /// Decrement one consumer reference.
    ///
    /// Returns [`Release::Free`] exactly once per exhaustion; the caller is
    /// responsible for the allocator free followed by [`Self::reset_ref`].
    pub fn decrease_ref(&self, handle: TensorHandle) -> Result<Release> {
        let mut descs = self.descs.lock();
        let desc = descs
            .get_mut(handle.0 as usize)
            .ok_or(DeviceError::InvalidHandle(handle))?;
        if desc.original_ref_count == UNBOUNDED_REF_COUNT {
            return Ok(Release::Skipped);
        }
        desc.ref_count = desc.ref_count.saturating_sub(1);
        if desc.ref_count == 0 {
            Ok(Release::Free)
        } else {
            Ok(Release::Alive)
        }
    }

    /// Restore the original consumer count after a free, readying the
    /// descriptor for the next pass.
    pub fn reset_ref(&self, handle: TensorHandle) -> Result<()> {
        self.with_desc(handle, |desc| desc.ref_count = desc.original_ref_count)
    }

    fn with_desc<F: FnOnce(&mut TensorDesc)>(&self, handle: TensorHandle, f: F) -> Result<()> {
        let mut descs = self.descs.lock();
        let desc = descs
            .get_mut(handle.0 as usize)
            .ok_or(DeviceError::InvalidHandle(handle))?;
        f(desc);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_describe() {
        let arena = TensorArena::new();
        let h = arena.create(1024, TensorFormat::F32, 2);
        let desc = arena.describe(h).unwrap();
        assert_eq!(desc.size, 1024);
        assert_eq!(desc.ref_count, 2);
        assert_eq!(desc.ptr, None);
    }

    #[test]
    fn test_handles_are_stable() {
        let arena = TensorArena::new();
        let a = arena.create(16, TensorFormat::Raw, 1);
        let b = arena.create(32, TensorFormat::Raw, 1);
        assert_ne!(a, b);
        assert_eq!(arena.size(a).unwrap(), 16);
        assert_eq!(arena.size(b).unwrap(), 32);
    }

    #[test]
    fn test_ref_count_exhaustion_is_exact() {
        let arena = TensorArena::new();
        let h = arena.create(64, TensorFormat::F32, 3);
        assert_eq!(arena.decrease_ref(h).unwrap(), Release::Alive);
        assert_eq!(arena.decrease_ref(h).unwrap(), Release::Alive);
        assert_eq!(arena.decrease_ref(h).unwrap(), Release::Free);
        arena.reset_ref(h).unwrap();
        assert_eq!(arena.ref_count(h).unwrap(), 3);
    }

    #[test]
    fn test_unbounded_tensor_never_releases() {
        let arena = TensorArena::new();
        let h = arena.create(64, TensorFormat::F32, UNBOUNDED_REF_COUNT);
        for _ in 0..100 {
            assert_eq!(arena.decrease_ref(h).unwrap(), Release::Skipped);
        }
    }

    #[test]
    fn test_take_ptr_clears_address() {
        let arena = TensorArena::new();
        let h = arena.create(64, TensorFormat::F32, 1);
        arena.set_ptr(h, 0xdead_0000).unwrap();
        assert_eq!(arena.take_ptr(h).unwrap(), Some(0xdead_0000));
        assert_eq!(arena.ptr(h).unwrap(), None);
    }

    #[test]
    fn test_invalid_handle() {
        let arena = TensorArena::new();
        let err = arena.describe(TensorHandle(9)).unwrap_err();
        assert_eq!(err, DeviceError::InvalidHandle(TensorHandle(9)));
    }
}

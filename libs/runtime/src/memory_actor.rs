//! Memory-manager actor.
//!
//! Serializes all allocator traffic for one device through a single
//! mailbox. Kernel actors never touch the allocator directly in pipeline
//! mode; they send [`OpMessage::AllocateRequest`]/[`OpMessage::FreeRequest`]
//! and react to the completion. Step mode bypasses the mailbox and calls
//! the same helpers inline.

use std::sync::Arc;

use async_trait::async_trait;
use device::{DeviceContext, Release, TensorArena, TensorHandle};
use tracing::{trace, warn};

use crate::actor::Actor;
use crate::messages::{Aid, OpMessage};
use crate::pass::PassContext;
use crate::registry::ActorRegistry;
use crate::{Result, RuntimeError};

/// Acquire memory for every handle in the list.
///
/// Zero-size tensors and tensors that already hold an address (shared
/// outputs allocated by an earlier request in the same pass) are skipped.
/// The first allocator failure aborts the list; partially acquired
/// buffers stay resident and are reclaimed by the pass's free requests.
pub fn allocate_memory_list(
    device: &dyn DeviceContext,
    arena: &TensorArena,
    handles: &[TensorHandle],
) -> Result<()> {
    for &handle in handles {
        let desc = arena.describe(handle).map_err(RuntimeError::Device)?;
        if desc.size == 0 || desc.ptr.is_some() {
            trace!(tensor = %handle, size = desc.size, "allocation skipped");
            continue;
        }
        device
            .allocate_memory(arena, handle, desc.size)
            .map_err(RuntimeError::Device)?;
    }
    Ok(())
}

/// Release one consumer reference per handle, freeing the device memory
/// of any tensor whose count reaches zero and re-arming its count for the
/// next pass.
///
/// Free failures are logged and skipped rather than propagated: a tensor
/// the allocator no longer knows about cannot be recovered by failing the
/// pass, and the remaining handles still need their decrements.
pub fn free_memory_list(device: &dyn DeviceContext, arena: &TensorArena, handles: &[TensorHandle]) {
    for &handle in handles {
        match arena.decrease_ref(handle) {
            Ok(Release::Free) => {
                if let Err(e) = device.free_memory(arena, handle) {
                    warn!(tensor = %handle, error = %e, "device free failed");
                }
                if let Err(e) = arena.reset_ref(handle) {
                    warn!(tensor = %handle, error = %e, "ref count reset failed");
                }
            }
            Ok(Release::Alive) | Ok(Release::Skipped) => {}
            Err(e) => warn!(tensor = %handle, error = %e, "ref count decrement failed"),
        }
    }
}

/// The actor owning one device's allocator.
pub struct MemoryManagerActor {
    aid: Aid,
    device: Arc<dyn DeviceContext>,
    arena: Arc<TensorArena>,
    registry: Arc<ActorRegistry>,
}

impl MemoryManagerActor {
    pub const NAME: &'static str = "memory-manager";

    pub fn new(device: Arc<dyn DeviceContext>, arena: Arc<TensorArena>, registry: Arc<ActorRegistry>) -> Self {
        Self {
            aid: Aid::local(Self::NAME),
            device,
            arena,
            registry,
        }
    }

    fn allocate(&self, handles: &[TensorHandle], reply_to: &Aid, context: &Arc<PassContext>) -> Result<()> {
        if context.is_failed() {
            // The pass is already lost; acquiring more memory for it only
            // delays teardown.
            return Ok(());
        }
        if let Err(e) = allocate_memory_list(self.device.as_ref(), self.arena.as_ref(), handles) {
            context.set_failed(e);
            return Ok(());
        }
        self.registry.send(
            reply_to,
            OpMessage::MemoryAllocFinished {
                context: Arc::clone(context),
            },
            false,
        )
    }
}

#[async_trait]
impl Actor for MemoryManagerActor {
    fn aid(&self) -> &Aid {
        &self.aid
    }

    async fn handle(&mut self, msg: OpMessage) -> Result<()> {
        match msg {
            OpMessage::AllocateRequest {
                handles,
                reply_to,
                context,
            } => self.allocate(&handles, &reply_to, &context),
            OpMessage::FreeRequest { handles, context: _ } => {
                // Frees run even for failed passes so the arena drains.
                free_memory_list(self.device.as_ref(), self.arena.as_ref(), &handles);
                Ok(())
            }
            other => {
                warn!(actor = %self.aid, message = other.name(), "unexpected message");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::GraphExecutionStrategy;
    use device::{HostDevice, TensorFormat, UNBOUNDED_REF_COUNT};
    use parking_lot::Mutex;
    use tokio::runtime::Handle;

    struct Recorder {
        aid: Aid,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Actor for Recorder {
        fn aid(&self) -> &Aid {
            &self.aid
        }

        async fn handle(&mut self, msg: OpMessage) -> Result<()> {
            self.seen.lock().push(msg.name());
            Ok(())
        }
    }

    fn setup() -> (Arc<HostDevice>, Arc<TensorArena>, Arc<ActorRegistry>) {
        (
            Arc::new(HostDevice::with_capacity(0, 4096)),
            Arc::new(TensorArena::new()),
            ActorRegistry::new(Handle::current()),
        )
    }

    #[tokio::test]
    async fn test_allocate_replies_with_finished() {
        let (device, arena, registry) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let reply_to = registry.spawn(
            Recorder {
                aid: Aid::local("kernel-probe"),
                seen: seen.clone(),
            },
            true,
        );
        let mm = registry.spawn(
            MemoryManagerActor::new(device.clone(), arena.clone(), registry.clone()),
            true,
        );

        let ctx = Arc::new(PassContext::new(1, GraphExecutionStrategy::Pipeline));
        let t = arena.create(256, TensorFormat::F32, 1);
        registry
            .send(
                &mm,
                OpMessage::AllocateRequest {
                    handles: vec![t],
                    reply_to: reply_to.clone(),
                    context: ctx.clone(),
                },
                false,
            )
            .unwrap();
        // The completion hops through a second mailbox; wait for it
        // before tearing the actors down.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while seen.lock().is_empty() && std::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        registry.terminate_all().await;

        assert_eq!(seen.lock().as_slice(), ["MemoryAllocFinished"]);
        assert!(arena.ptr(t).unwrap().is_some());
        assert!(!ctx.is_failed());
    }

    #[tokio::test]
    async fn test_alloc_failure_fails_pass_without_reply() {
        let (device, arena, registry) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let reply_to = registry.spawn(
            Recorder {
                aid: Aid::local("kernel-probe"),
                seen: seen.clone(),
            },
            true,
        );
        let mm = registry.spawn(
            MemoryManagerActor::new(device, arena.clone(), registry.clone()),
            true,
        );

        let ctx = Arc::new(PassContext::new(2, GraphExecutionStrategy::Pipeline));
        let t = arena.create(1 << 20, TensorFormat::Raw, 1);
        registry
            .send(
                &mm,
                OpMessage::AllocateRequest {
                    handles: vec![t],
                    reply_to,
                    context: ctx.clone(),
                },
                false,
            )
            .unwrap();
        registry.terminate_all().await;

        assert!(seen.lock().is_empty());
        assert!(ctx.is_failed());
        assert!(ctx.wait().await.is_err());
    }

    #[test]
    fn test_zero_size_and_resident_are_skipped() {
        let device = HostDevice::with_capacity(0, 4096);
        let arena = TensorArena::new();
        let empty = arena.create(0, TensorFormat::Raw, 1);
        let shared = arena.create(128, TensorFormat::F32, 2);
        let before = device.free_bytes();

        allocate_memory_list(&device, &arena, &[empty, shared]).unwrap();
        let after_first = device.free_bytes();
        assert!(after_first < before);
        assert_eq!(arena.ptr(empty).unwrap(), None);

        // Second request over the same handles must not double-allocate.
        allocate_memory_list(&device, &arena, &[empty, shared]).unwrap();
        assert_eq!(device.free_bytes(), after_first);
    }

    #[test]
    fn test_free_list_frees_exactly_at_zero_and_rearms() {
        let device = HostDevice::with_capacity(0, 4096);
        let arena = TensorArena::new();
        let t = arena.create(256, TensorFormat::F32, 2);
        let pinned = arena.create(256, TensorFormat::F32, UNBOUNDED_REF_COUNT);
        allocate_memory_list(&device, &arena, &[t, pinned]).unwrap();

        free_memory_list(&device, &arena, &[t, pinned]);
        assert!(arena.ptr(t).unwrap().is_some());
        free_memory_list(&device, &arena, &[t, pinned]);
        assert_eq!(arena.ptr(t).unwrap(), None);
        assert_eq!(arena.ref_count(t).unwrap(), 2);
        // Unbounded tensors survive any number of frees.
        assert!(arena.ptr(pinned).unwrap().is_some());
    }
}

//! Actor-Based Kernel-Graph Execution Engine
//!
//! Turns a compiled computation graph into concurrently running actors
//! with correct data/control ordering and reference-counted device-memory
//! lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐      ┌───────────────────────┐
//! │    Graph Driver      │      │    Actor Registry     │
//! │                      │      │                       │
//! │  feeds ──────────────┼──────┼─▶ KernelActor ───┐    │
//! │  awaits PassContext  │      │      │  ▲        │    │
//! └──────────────────────┘      │ alloc│  │done    │data│
//!                               │      ▼  │        ▼    │
//!                               │  MemoryManagerActor   │
//!                               │      KernelActor ─────┼─▶ OutputActor
//!                               └───────────────────────┘
//! ```
//!
//! Every kernel actor gates on its statically known data/control fan-in,
//! acquires output/workspace memory through the memory-manager actor,
//! launches its kernel, releases memory *before* sending anything
//! downstream, and emits {results, data, controls} strictly in that order.
//!
//! Two execution strategies share one actor type: *pipeline* (asynchronous,
//! message-driven, the default) and *step* (synchronous in the calling
//! thread, for interactive/control-flow-heavy graphs).

pub mod actor;
pub mod config;
pub mod graph;
pub mod kernel_actor;
pub mod memory_actor;
pub mod messages;
pub mod output_actor;
pub mod pass;
pub mod registry;

pub use actor::{Actor, Envelope, Mailbox};
pub use config::{BindPolicySetting, RuntimeConfig, StrategySetting};
pub use graph::{
    ControlArrow, DataArrow, GraphExecutor, GraphSpec, InputSource, NodeSpec, ParameterSpec,
    ResultArrow,
};
pub use kernel_actor::KernelActor;
pub use memory_actor::MemoryManagerActor;
pub use messages::{Aid, OpData, OpMessage, RemoteEnvelope, RemoteTransport};
pub use output_actor::{OutputActor, OutputSink};
pub use pass::{GraphExecutionStrategy, PassContext, PassStatus};
pub use registry::ActorRegistry;

use thiserror::Error;

/// Runtime errors, `Clone` so a failure can live in the shared pass slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Static graph-to-actor wiring was wrong: unknown actor, index out of
    /// range. Always indicates a compiler/driver bug.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Device layer failure (allocation, launch).
    #[error("Device error: {0}")]
    Device(#[from] device::DeviceError),

    /// A whole execution pass was abandoned.
    #[error("Pass {sequential_num} failed: {message}")]
    PassFailed { sequential_num: u64, message: String },

    /// A message could not cross the remote transport seam.
    #[error("Remote delivery failed to {to}: {message}")]
    Remote { to: String, message: String },
}

impl RuntimeError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

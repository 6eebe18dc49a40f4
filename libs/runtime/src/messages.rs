//! Actor identity and message envelopes.
//!
//! Routing is purely by name within a process; the protocol/address pair
//! only matters once a message reaches the remote transport seam. Data
//! messages carry device-local tensor handles and therefore never cross
//! that seam; only bare control signals are remotable, mirrored by
//! [`OpMessage::to_remote`].

use std::sync::Arc;

use device::TensorHandle;
use serde::{Deserialize, Serialize};

use crate::pass::PassContext;
use crate::{Result, RuntimeError};

/// Actor identity: immutable {name, protocol, address} triple.
///
/// Equality and hashing are by name only; the name is the sole addressing
/// key inside a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aid {
    name: String,
    protocol: String,
    address: String,
}

impl Aid {
    /// In-process actor identity.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: "local".to_string(),
            address: String::new(),
        }
    }

    pub fn remote(name: impl Into<String>, protocol: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: protocol.into(),
            address: address.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_local(&self) -> bool {
        self.protocol == "local"
    }
}

impl PartialEq for Aid {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Aid {}

impl std::hash::Hash for Aid {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl std::fmt::Display for Aid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// One producer result feeding one input slot of one consumer.
#[derive(Debug, Clone)]
pub struct OpData {
    /// Destination input slot.
    pub index: usize,
    pub tensor: TensorHandle,
}

/// Messages understood by the runtime's actors.
#[derive(Debug, Clone)]
pub enum OpMessage {
    /// A data predecessor finished and delivered one input tensor.
    RunOpData {
        data: OpData,
        context: Arc<PassContext>,
    },
    /// A control predecessor finished (ordering signal, no payload).
    RunOpControl {
        from: Option<Aid>,
        context: Arc<PassContext>,
    },
    /// Step-mode trigger carrying already-resident input tensors.
    RunOpControlWithInputTensor {
        from: Option<Aid>,
        tensors: Vec<TensorHandle>,
        context: Arc<PassContext>,
    },
    /// Memory-manager completion for an earlier allocation request.
    MemoryAllocFinished { context: Arc<PassContext> },
    /// Debug collaborator acknowledged; post-processing may continue.
    DebugFinished { context: Arc<PassContext> },

    /// Ask the memory manager to acquire memory for each handle.
    AllocateRequest {
        handles: Vec<TensorHandle>,
        reply_to: Aid,
        context: Arc<PassContext>,
    },
    /// Ask the memory manager to release one consumer reference per handle.
    FreeRequest {
        handles: Vec<TensorHandle>,
        context: Arc<PassContext>,
    },

    /// Ask the debug collaborator to trace a finished launch.
    DebugReq {
        kernel: String,
        reply_to: Aid,
        context: Arc<PassContext>,
    },

    /// A graph output arrived at the collector.
    CollectOutput {
        node: Aid,
        output_index: usize,
        target_index: usize,
        tensor: TensorHandle,
        context: Arc<PassContext>,
    },
}

impl OpMessage {
    /// Short message name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunOpData { .. } => "RunOpData",
            Self::RunOpControl { .. } => "RunOpControl",
            Self::RunOpControlWithInputTensor { .. } => "RunOpControlWithInputTensor",
            Self::MemoryAllocFinished { .. } => "MemoryAllocFinished",
            Self::DebugFinished { .. } => "DebugFinished",
            Self::AllocateRequest { .. } => "AllocateRequest",
            Self::FreeRequest { .. } => "FreeRequest",
            Self::DebugReq { .. } => "DebugReq",
            Self::CollectOutput { .. } => "CollectOutput",
        }
    }

    /// Serialize for the remote seam. Only payload-free control signals
    /// can leave the process; everything else references device-local
    /// state and returns `None`.
    pub fn to_remote(&self, to: &Aid) -> Option<RemoteEnvelope> {
        match self {
            Self::RunOpControl { from, context } => Some(RemoteEnvelope {
                to: to.clone(),
                from: from.clone(),
                message: "RunOpControl".to_string(),
                sequential_num: context.sequential_num(),
            }),
            _ => None,
        }
    }
}

/// Wire form of a remotable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEnvelope {
    pub to: Aid,
    pub from: Option<Aid>,
    pub message: String,
    pub sequential_num: u64,
}

impl RemoteEnvelope {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RuntimeError::Remote {
            to: self.to.name().to_string(),
            message: format!("envelope serialization failed: {e}"),
        })
    }
}

/// Protocol-specific delivery for actors living in another process/node.
pub trait RemoteTransport: Send + Sync {
    fn protocol(&self) -> &str;

    fn deliver(&self, envelope: RemoteEnvelope) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::{GraphExecutionStrategy, PassContext};

    #[test]
    fn test_aid_equality_is_by_name() {
        let a = Aid::local("kernel-0");
        let b = Aid::remote("kernel-0", "tcp", "10.0.0.1:8080");
        assert_eq!(a, b);
        assert_ne!(a, Aid::local("kernel-1"));
    }

    #[test]
    fn test_only_bare_controls_are_remotable() {
        let ctx = Arc::new(PassContext::new(3, GraphExecutionStrategy::Pipeline));
        let to = Aid::remote("kernel-1", "tcp", "10.0.0.1:8080");

        let control = OpMessage::RunOpControl {
            from: Some(Aid::local("kernel-0")),
            context: ctx.clone(),
        };
        let envelope = control.to_remote(&to).unwrap();
        assert_eq!(envelope.sequential_num, 3);
        assert!(!envelope.to_json().unwrap().is_empty());

        let data = OpMessage::RunOpData {
            data: OpData {
                index: 0,
                tensor: device::TensorHandle(0),
            },
            context: ctx,
        };
        assert!(data.to_remote(&to).is_none());
    }
}

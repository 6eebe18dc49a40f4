//! Actor registry and message router.
//!
//! The process-wide directory mapping actor names to mailboxes. One
//! registry is constructed explicitly at startup and injected into every
//! actor/factory that needs to send; there is no lazily-initialized
//! global state. Lookups run under a reader/writer lock so concurrent
//! sends never block each other.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actor::{Actor, ActorTask, Envelope, Mailbox};
use crate::messages::{Aid, OpMessage, RemoteTransport};
use crate::{Result, RuntimeError};

/// Process-wide actor directory and router.
pub struct ActorRegistry {
    /// Local actors by name.
    actors: RwLock<HashMap<String, Mailbox>>,
    /// Task handles for `wait`/`terminate_all`.
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Protocol-keyed transports for non-local destinations.
    transports: RwLock<HashMap<String, Arc<dyn RemoteTransport>>>,
    /// First unhandled actor failure in this process.
    failure_slot: Arc<OnceLock<RuntimeError>>,
    /// Worker pool the actor tasks run on.
    handle: Handle,
}

impl ActorRegistry {
    /// Build a registry whose actors run on the given worker pool.
    pub fn new(handle: Handle) -> Arc<Self> {
        Arc::new(Self {
            actors: RwLock::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            transports: RwLock::new(HashMap::new()),
            failure_slot: Arc::new(OnceLock::new()),
            handle,
        })
    }

    /// Register and start an actor under its name.
    ///
    /// # Panics
    ///
    /// On name collision. Duplicate names mean the graph-to-actor
    /// compilation was wrong, which is a programmer error, not a runtime
    /// condition.
    pub fn spawn<A: Actor>(&self, actor: A, start_running: bool) -> Aid {
        let aid = actor.aid().clone();
        let name = aid.name().to_string();
        let (mailbox, receiver) = Mailbox::channel();
        {
            let mut actors = self.actors.write();
            if actors.contains_key(&name) {
                panic!("Actor name conflicts: {name}");
            }
            actors.insert(name.clone(), mailbox);
        }
        debug!(actor = %name, start_running, "actor spawned");

        let task = ActorTask {
            actor,
            receiver,
            running: start_running,
            failure_slot: Arc::clone(&self.failure_slot),
        };
        let join = self.handle.spawn(task.run());
        self.tasks.lock().insert(name, join);
        aid
    }

    /// Route a message: local mailbox if the name is registered, the
    /// protocol's transport otherwise (when `allow_remote`).
    pub fn send(&self, to: &Aid, msg: OpMessage, allow_remote: bool) -> Result<()> {
        if let Some(mailbox) = self.actors.read().get(to.name()).cloned() {
            mailbox.push(Envelope::Op(msg));
            return Ok(());
        }
        if allow_remote && !to.is_local() {
            let transport = self
                .transports
                .read()
                .get(to.protocol())
                .cloned()
                .ok_or_else(|| RuntimeError::Remote {
                    to: to.name().to_string(),
                    message: format!("no transport for protocol {}", to.protocol()),
                })?;
            let envelope = msg.to_remote(to).ok_or_else(|| RuntimeError::Remote {
                to: to.name().to_string(),
                message: format!("{} cannot be sent to a remote actor", msg.name()),
            })?;
            return transport.deliver(envelope);
        }
        Err(RuntimeError::configuration(format!(
            "message for unknown actor: {}",
            to.name()
        )))
    }

    /// Register a transport for one protocol.
    pub fn add_transport(&self, transport: Arc<dyn RemoteTransport>) {
        let protocol = transport.protocol().to_string();
        self.transports.write().insert(protocol, transport);
    }

    pub fn contains(&self, aid: &Aid) -> bool {
        self.actors.read().contains_key(aid.name())
    }

    /// Mailbox lookup (None for unknown names).
    pub fn get_actor(&self, aid: &Aid) -> Option<Mailbox> {
        self.actors.read().get(aid.name()).cloned()
    }

    /// Flip an actor's running/suspended flag.
    pub fn set_actor_status(&self, aid: &Aid, running: bool) {
        if let Some(mailbox) = self.get_actor(aid) {
            mailbox.push(if running { Envelope::Resume } else { Envelope::Suspend });
        }
    }

    /// Send `Terminate`; it will be the last message the actor processes.
    pub fn terminate(&self, aid: &Aid) {
        if let Some(mailbox) = self.get_actor(aid) {
            mailbox.push(Envelope::Terminate);
        } else {
            warn!(actor = %aid, "terminate for unknown actor");
        }
    }

    /// Block the caller until the actor's mailbox has drained.
    pub async fn wait(&self, aid: &Aid) {
        let join = self.tasks.lock().remove(aid.name());
        if let Some(join) = join {
            if let Err(e) = join.await {
                if !e.is_cancelled() {
                    warn!(actor = %aid, error = %e, "actor task join failed");
                }
            }
        }
    }

    /// Terminate every registered actor and wait for each to drain, so no
    /// actor is destroyed with a message addressed to it still in flight.
    pub async fn terminate_all(&self) {
        let mailboxes: Vec<(String, Mailbox)> = self
            .actors
            .read()
            .iter()
            .map(|(name, mailbox)| (name.clone(), mailbox.clone()))
            .collect();
        for (_, mailbox) in &mailboxes {
            mailbox.push(Envelope::Terminate);
        }

        let joins: Vec<(String, JoinHandle<()>)> = self.tasks.lock().drain().collect();
        for (name, join) in joins {
            if let Err(e) = join.await {
                if !e.is_cancelled() {
                    warn!(actor = %name, error = %e, "actor task join failed");
                }
            }
        }
        self.actors.write().clear();
        info!(count = mailboxes.len(), "all actors terminated");
    }

    /// First unhandled actor failure, if any.
    pub fn failure(&self) -> Option<RuntimeError> {
        self.failure_slot.get().cloned()
    }
}

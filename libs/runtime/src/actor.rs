//! Actor base abstraction.
//!
//! A named, single-owner mailbox of messages drained by exactly one task
//! at a time, so handler state needs no internal locking. The
//! termination protocol is itself a message, guaranteed to be the last one
//! processed: messages still queued behind it are dropped, never run.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::messages::{Aid, OpMessage};
use crate::Result;
use crate::RuntimeError;

/// Mailbox envelope: runtime control around the domain messages.
#[derive(Debug)]
pub enum Envelope {
    Op(OpMessage),
    /// Mark the actor runnable; buffered messages become eligible.
    Resume,
    /// Stop processing; messages keep queueing.
    Suspend,
    /// Last message ever processed.
    Terminate,
}

/// Behavior contract for runtime actors.
///
/// `handle` runs on one worker at a time; `is_active` lets a subclass
/// postpone scheduling until enough messages have arrived (default: any
/// message makes the actor active).
#[async_trait]
pub trait Actor: Send + 'static {
    fn aid(&self) -> &Aid;

    /// One-time initialization, runs before the first message.
    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether `pending` buffered messages justify running the actor.
    fn is_active(&self, pending: usize) -> bool {
        pending > 0
    }

    async fn handle(&mut self, msg: OpMessage) -> Result<()>;
}

/// Sending half of an actor's mailbox, held by the registry.
#[derive(Debug, Clone)]
pub struct Mailbox {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Mailbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue an envelope. Delivery to an already-terminated actor is a
    /// no-op: its queued-but-unprocessed messages were cancelled, and a
    /// duplicate `Terminate` must not crash anything.
    pub fn push(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            debug!("mailbox closed, message dropped");
        }
    }
}

/// The task driving one actor's mailbox.
pub(crate) struct ActorTask<A: Actor> {
    pub actor: A,
    pub receiver: mpsc::UnboundedReceiver<Envelope>,
    pub running: bool,
    /// Process-wide slot capturing the first unhandled actor failure.
    pub failure_slot: Arc<OnceLock<RuntimeError>>,
}

impl<A: Actor> ActorTask<A> {
    pub async fn run(mut self) {
        let name = self.actor.aid().name().to_string();
        if let Err(e) = self.actor.init().await {
            error!(actor = %name, error = %e, "actor init failed");
            let _ = self.failure_slot.set(e);
            return;
        }
        debug!(actor = %name, running = self.running, "actor entering message loop");

        let mut pending: Vec<OpMessage> = Vec::new();
        while let Some(envelope) = self.receiver.recv().await {
            match envelope {
                Envelope::Terminate => {
                    if !pending.is_empty() {
                        debug!(actor = %name, dropped = pending.len(), "terminate cancels queued messages");
                    }
                    break;
                }
                Envelope::Suspend => {
                    self.running = false;
                }
                Envelope::Resume => {
                    self.running = true;
                    if !self.drain(&name, &mut pending).await {
                        break;
                    }
                }
                Envelope::Op(msg) => {
                    pending.push(msg);
                    if self.running && self.actor.is_active(pending.len()) {
                        if !self.drain(&name, &mut pending).await {
                            break;
                        }
                    }
                }
            }
        }
        debug!(actor = %name, "actor terminated");
    }

    /// Handle every buffered message. Returns false when a failure tears
    /// the actor down; a second failure while tearing down is ignored.
    async fn drain(&mut self, name: &str, pending: &mut Vec<OpMessage>) -> bool {
        for msg in pending.drain(..) {
            let msg_name = msg.name();
            if let Err(e) = self.actor.handle(msg).await {
                error!(actor = %name, message = msg_name, error = %e, "actor message handling failed");
                if self.failure_slot.set(e).is_err() {
                    warn!(actor = %name, "failure slot already set, tearing down");
                }
                return false;
            }
        }
        true
    }
}

//! Per-pass execution context.
//!
//! One [`PassContext`] is shared by every message of one logical pass
//! (sequential number). It carries the pass-scoped failure slot (set at
//! most once, later failures are ignored) and the completion channel the
//! driver awaits. Actors never call each other synchronously, so failures
//! escalate through this object instead of propagating across actor
//! boundaries.

use std::sync::OnceLock;

use tokio::sync::watch;
use tracing::{debug, error};

use crate::RuntimeError;

/// Execution strategy of the kernel actors.
///
/// Pipeline: all hops (allocation, free, completion) are asynchronous
/// messages. Step: allocation and launch happen synchronously in the
/// calling thread, used for interactive/control-flow-heavy graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphExecutionStrategy {
    #[default]
    Pipeline,
    Step,
}

/// Observable state of one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassStatus {
    Running,
    Done,
    Failed(RuntimeError),
}

/// Shared context for one logical pass over the whole graph.
#[derive(Debug)]
pub struct PassContext {
    sequential_num: u64,
    strategy: GraphExecutionStrategy,
    failure: OnceLock<RuntimeError>,
    status_tx: watch::Sender<PassStatus>,
    status_rx: watch::Receiver<PassStatus>,
}

impl PassContext {
    pub fn new(sequential_num: u64, strategy: GraphExecutionStrategy) -> Self {
        let (status_tx, status_rx) = watch::channel(PassStatus::Running);
        Self {
            sequential_num,
            strategy,
            failure: OnceLock::new(),
            status_tx,
            status_rx,
        }
    }

    pub fn sequential_num(&self) -> u64 {
        self.sequential_num
    }

    pub fn strategy(&self) -> GraphExecutionStrategy {
        self.strategy
    }

    /// Record a pass failure. Only the first failure sticks; the return
    /// value tells the caller whether this call was the one that stuck.
    pub fn set_failed(&self, err: RuntimeError) -> bool {
        let first = self.failure.set(err.clone()).is_ok();
        if first {
            error!(sequential_num = self.sequential_num, %err, "pass failed");
            let _ = self.status_tx.send(PassStatus::Failed(err));
        } else {
            debug!(sequential_num = self.sequential_num, %err, "pass already failed, ignoring");
        }
        first
    }

    /// Mark the pass complete. A no-op if the pass already failed.
    pub fn set_success(&self) {
        if self.failure.get().is_none() {
            debug!(sequential_num = self.sequential_num, "pass complete");
            let _ = self.status_tx.send(PassStatus::Done);
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.get().is_some()
    }

    pub fn failure(&self) -> Option<&RuntimeError> {
        self.failure.get()
    }

    /// Await the pass outcome. A failed pass resolves with its recorded
    /// failure, never with partial results.
    pub async fn wait(&self) -> crate::Result<()> {
        let mut rx = self.status_rx.clone();
        loop {
            match &*rx.borrow() {
                PassStatus::Done => return Ok(()),
                PassStatus::Failed(err) => return Err(err.clone()),
                PassStatus::Running => {}
            }
            if rx.changed().await.is_err() {
                // Sender side dropped without resolution.
                return Err(RuntimeError::PassFailed {
                    sequential_num: self.sequential_num,
                    message: "pass abandoned without completion".to_string(),
                });
            }
        }
    }

    /// Non-blocking snapshot, used by the synchronous step driver.
    pub fn status(&self) -> PassStatus {
        self.status_rx.borrow().clone()
    }
}

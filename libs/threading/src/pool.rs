//! Worker pool servicing runnable actors.
//!
//! An explicitly constructed multi-threaded tokio runtime: a fixed set of
//! OS worker threads drains the shared run queue of actor mailboxes. Each
//! worker applies its slot of the core-binding plan when it starts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tracing::info;

use crate::affinity::{bind_current_thread, BindPolicy, CoreAffinity};
use crate::{Result, ThreadingError};

/// Worker pool construction parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// OS worker threads; defaults to the logical CPU count.
    pub worker_threads: usize,
    pub bind_policy: BindPolicy,
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
            bind_policy: BindPolicy::default(),
            thread_name: "kernelflow-worker".to_string(),
        }
    }
}

/// Fixed pool of worker threads behind a work queue of runnable actors.
pub struct WorkerPool {
    runtime: Runtime,
    worker_threads: usize,
}

impl WorkerPool {
    /// Build the pool, computing the binding plan from the host topology.
    pub fn build(config: PoolConfig) -> Result<Self> {
        if config.worker_threads == 0 {
            return Err(ThreadingError::Configuration {
                message: "worker_threads must be at least 1".to_string(),
            });
        }
        let plan = CoreAffinity::detect().plan(config.worker_threads, config.bind_policy);
        info!(
            workers = config.worker_threads,
            policy = ?config.bind_policy,
            plan = ?plan,
            "building worker pool"
        );

        // Workers claim plan slots in start order.
        let next_slot = Arc::new(AtomicUsize::new(0));
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name(config.thread_name)
            .on_thread_start(move || {
                if let Some(plan) = &plan {
                    let slot = next_slot.fetch_add(1, Ordering::Relaxed);
                    if let Some(&core) = plan.get(slot % plan.len()) {
                        // Failure already logged; execution continues unbound.
                        let _ = bind_current_thread(core);
                    }
                }
            })
            .enable_all()
            .build()
            .map_err(ThreadingError::PoolBuild)?;

        Ok(Self {
            runtime,
            worker_threads: config.worker_threads,
        })
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Handle for spawning actor tasks onto the pool.
    pub fn handle(&self) -> tokio::runtime::Handle {
        self.runtime.handle().clone()
    }

    /// Drive a future to completion from a non-worker thread (the driver).
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_run() {
        let pool = WorkerPool::build(PoolConfig {
            worker_threads: 2,
            bind_policy: BindPolicy::NoBind,
            ..PoolConfig::default()
        })
        .unwrap();
        assert_eq!(pool.worker_threads(), 2);
        let answer = pool.block_on(async { 21 * 2 });
        assert_eq!(answer, 42);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = WorkerPool::build(PoolConfig {
            worker_threads: 0,
            ..PoolConfig::default()
        });
        assert!(matches!(result, Err(ThreadingError::Configuration { .. })));
    }

    #[test]
    fn test_binding_policy_degrades_gracefully() {
        // Even if sched_setaffinity fails for a core, build must succeed.
        let pool = WorkerPool::build(PoolConfig {
            worker_threads: 1,
            bind_policy: BindPolicy::Higher,
            ..PoolConfig::default()
        })
        .unwrap();
        pool.block_on(async {});
    }
}

//! Worker threads for the actor runtime.
//!
//! Enumerates the host's logical CPUs, ranks them by maximum clock
//! frequency with a micro-architecture class tie-breaker, and builds the
//! worker pool that services runnable actors, optionally pinning one OS
//! thread per worker to one core. Binding failures degrade to unbound
//! execution; they never abort.

pub mod affinity;
pub mod pool;

pub use affinity::{BindPolicy, CoreAffinity, CpuInfo, MicroArch};
pub use pool::{PoolConfig, WorkerPool};

use thiserror::Error;

/// Threading layer errors.
#[derive(Error, Debug)]
pub enum ThreadingError {
    #[error("Worker pool build failed: {0}")]
    PoolBuild(#[from] std::io::Error),

    #[error("Invalid worker configuration: {message}")]
    Configuration { message: String },
}

/// Result type alias for threading operations.
pub type Result<T> = std::result::Result<T, ThreadingError>;

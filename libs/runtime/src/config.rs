//! Runtime configuration.
//!
//! Layered the usual way: built-in defaults, then an optional TOML file,
//! then `KERNELFLOW_*` environment variables. The resolved configuration
//! maps onto the worker-pool parameters and the graph execution strategy.

use serde::Deserialize;
use threading::{BindPolicy, PoolConfig};
use tracing::debug;

use crate::pass::GraphExecutionStrategy;
use crate::{Result, RuntimeError};

/// Core-binding policy, config-file spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindPolicySetting {
    #[default]
    Higher,
    Middle,
    None,
}

impl From<BindPolicySetting> for BindPolicy {
    fn from(setting: BindPolicySetting) -> Self {
        match setting {
            BindPolicySetting::Higher => BindPolicy::Higher,
            BindPolicySetting::Middle => BindPolicy::Middle,
            BindPolicySetting::None => BindPolicy::NoBind,
        }
    }
}

/// Execution strategy, config-file spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategySetting {
    #[default]
    Pipeline,
    Step,
}

impl From<StrategySetting> for GraphExecutionStrategy {
    fn from(setting: StrategySetting) -> Self {
        match setting {
            StrategySetting::Pipeline => GraphExecutionStrategy::Pipeline,
            StrategySetting::Step => GraphExecutionStrategy::Step,
        }
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Worker threads; 0 means one per logical CPU.
    pub worker_threads: usize,
    pub bind_policy: BindPolicySetting,
    pub strategy: StrategySetting,
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            bind_policy: BindPolicySetting::default(),
            strategy: StrategySetting::default(),
            thread_name: "kernelflow-worker".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| RuntimeError::configuration(format!("config parse failed: {e}")))
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::configuration(format!("config read failed for {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env()?;
        debug!(?config, path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Apply `KERNELFLOW_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    fn apply_env_from<F: Fn(&str) -> Option<String>>(&mut self, get: F) -> Result<()> {
        if let Some(raw) = get("KERNELFLOW_WORKER_THREADS") {
            self.worker_threads = raw.parse().map_err(|_| {
                RuntimeError::configuration(format!("invalid KERNELFLOW_WORKER_THREADS: {raw}"))
            })?;
        }
        if let Some(raw) = get("KERNELFLOW_BIND_POLICY") {
            self.bind_policy = match raw.as_str() {
                "higher" => BindPolicySetting::Higher,
                "middle" => BindPolicySetting::Middle,
                "none" => BindPolicySetting::None,
                _ => {
                    return Err(RuntimeError::configuration(format!(
                        "invalid KERNELFLOW_BIND_POLICY: {raw}"
                    )))
                }
            };
        }
        if let Some(raw) = get("KERNELFLOW_STRATEGY") {
            self.strategy = match raw.as_str() {
                "pipeline" => StrategySetting::Pipeline,
                "step" => StrategySetting::Step,
                _ => {
                    return Err(RuntimeError::configuration(format!(
                        "invalid KERNELFLOW_STRATEGY: {raw}"
                    )))
                }
            };
        }
        Ok(())
    }

    pub fn strategy(&self) -> GraphExecutionStrategy {
        self.strategy.into()
    }

    /// Worker-pool parameters derived from this configuration.
    pub fn pool_config(&self) -> PoolConfig {
        let defaults = PoolConfig::default();
        PoolConfig {
            worker_threads: if self.worker_threads == 0 {
                defaults.worker_threads
            } else {
                self.worker_threads
            },
            bind_policy: self.bind_policy.into(),
            thread_name: self.thread_name.clone(),
        }
    }
}

//! Agent configuration

use agent_lib::reconcile::{ReconcilerConfig, SELF_INPUT};
use agent_lib::supervisor::ExecutorConfig;
use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Host label attached to log lines
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health, metrics and input routes
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Overall deadline of one reconciliation pass
    #[serde(default = "default_reconcile_timeout")]
    pub reconcile_timeout_secs: u64,

    /// Panics tolerated per input before it is abandoned
    #[serde(default = "default_max_crashes")]
    pub max_crashes: usize,

    /// Upper bound of the random delay before an input first runs
    #[serde(default = "default_start_jitter")]
    pub start_jitter_ms: u64,

    /// Desired sets arriving within this interval are coalesced
    #[serde(default = "default_coalesce_interval")]
    pub coalesce_interval_secs: u64,

    /// Running inside a container; enables environment overrides for inputs
    #[serde(default)]
    pub container_mode: bool,

    /// Kinds left running when a desired set does not mention them
    #[serde(default = "default_builtin_inputs")]
    pub protected_inputs: Vec<String>,

    /// Kinds a desired set may never change
    #[serde(default = "default_builtin_inputs")]
    pub reserved_inputs: Vec<String>,

    /// Root of the pipeline script tree pushed by the configuration source
    #[serde(default = "default_script_dir")]
    pub script_dir: PathBuf,

    /// Sampling interval of the built-in self input
    #[serde(default = "default_self_interval")]
    pub self_interval_secs: u64,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    9529
}

fn default_reconcile_timeout() -> u64 {
    60
}

fn default_max_crashes() -> usize {
    6
}

fn default_start_jitter() -> u64 {
    10_000
}

fn default_coalesce_interval() -> u64 {
    2
}

fn default_builtin_inputs() -> Vec<String> {
    vec![SELF_INPUT.to_string()]
}

fn default_script_dir() -> PathBuf {
    PathBuf::from("pipeline_confd")
}

fn default_self_interval() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            reconcile_timeout_secs: default_reconcile_timeout(),
            max_crashes: default_max_crashes(),
            start_jitter_ms: default_start_jitter(),
            coalesce_interval_secs: default_coalesce_interval(),
            container_mode: false,
            protected_inputs: default_builtin_inputs(),
            reserved_inputs: default_builtin_inputs(),
            script_dir: default_script_dir(),
            self_interval_secs: default_self_interval(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from `AGENT_*` environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("AGENT")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("protected_inputs")
                    .with_list_parse_key("reserved_inputs"),
            )
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|e| {
            warn!(error = %e, "Invalid agent configuration, using defaults");
            AgentConfig::default()
        }))
    }

    pub fn coalesce_interval(&self) -> Duration {
        Duration::from_secs(self.coalesce_interval_secs)
    }

    pub fn self_interval(&self) -> Duration {
        Duration::from_secs(self.self_interval_secs)
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            deadline: Duration::from_secs(self.reconcile_timeout_secs),
            protected: self.protected_inputs.clone(),
            reserved: self.reserved_inputs.clone(),
            container_mode: self.container_mode,
            env: None,
            executor: ExecutorConfig {
                max_jitter: Duration::from_millis(self.start_jitter_ms),
                max_crashes: self.max_crashes,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_defaults() {
        let config = AgentConfig::default();
        let reconciler = config.reconciler_config();
        let engine = ReconcilerConfig::default();

        assert_eq!(config.api_port, 9529);
        assert_eq!(reconciler.deadline, engine.deadline);
        assert_eq!(reconciler.protected, engine.protected);
        assert_eq!(reconciler.reserved, engine.reserved);
        assert_eq!(reconciler.executor.max_jitter, engine.executor.max_jitter);
        assert_eq!(reconciler.executor.max_crashes, engine.executor.max_crashes);
        assert_eq!(config.coalesce_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_deserialize_partial_config_fills_defaults() {
        let config: AgentConfig = serde_json::from_value(serde_json::json!({
            "api_port": 8080,
            "container_mode": true,
            "reserved_inputs": ["self", "dk"]
        }))
        .unwrap();

        assert_eq!(config.api_port, 8080);
        assert!(config.container_mode);
        assert_eq!(config.reserved_inputs, vec!["self", "dk"]);
        assert_eq!(config.protected_inputs, vec!["self"]);
        assert_eq!(config.max_crashes, 6);
        assert_eq!(config.script_dir, PathBuf::from("pipeline_confd"));
    }
}

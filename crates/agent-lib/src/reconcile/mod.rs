//! Reconciliation of running inputs against a desired set
//!
//! A pass diffs the registry against the desired set and applies the
//! result in four strictly ordered phases: STOP, DELETE, ADD and
//! SIDE-EFFECT RELOAD. The whole pass runs under a deadline. Errors are
//! collected and reported, they never abort the remaining operations.

mod r#loop;
mod reconciler;


pub use r#loop::ReconcileLoop;
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerBuilder};

use crate::supervisor::ExecutorConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Default deadline of one reconciliation pass
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

/// Kind of the agent's built-in self-monitoring input
pub const SELF_INPUT: &str = "self";

/// Shared resource refreshed at the end of every pass
#[async_trait]
pub trait ReloadHook: Send + Sync {
    fn name(&self) -> &str;

    async fn reload(&self) -> anyhow::Result<()>;
}

/// Configuration for the reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Overall deadline of one pass
    pub deadline: Duration,
    /// Kinds left running when a desired set does not mention them
    pub protected: Vec<String>,
    /// Kinds a desired set may never change
    pub reserved: Vec<String>,
    /// Apply environment overrides to inputs that accept them
    pub container_mode: bool,
    /// Environment handed to env-configurable inputs. `None` reads the process environment.
    pub env: Option<HashMap<String, String>>,
    pub executor: ExecutorConfig,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            protected: vec![SELF_INPUT.to_string()],
            reserved: vec![SELF_INPUT.to_string()],
            container_mode: false,
            env: None,
            executor: ExecutorConfig::default(),
        }
    }
}

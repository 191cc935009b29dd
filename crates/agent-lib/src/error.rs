//! Error types for registry mutation and reconciliation

use crate::diff::Action;
use std::time::Duration;
use thiserror::Error;

/// Structural registry error. The offending call is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("collector kind `{0}` not found")]
    KindNotFound(String),

    #[error("index {index} out of range for `{kind}` ({len} running)")]
    IndexOutOfRange {
        kind: String,
        index: usize,
        len: usize,
    },
}

/// Error collected during a reconciliation pass
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{action} {kind}[{position}]: {source}")]
    Registry {
        kind: String,
        action: Action,
        position: usize,
        #[source]
        source: RegistryError,
    },

    #[error("no desired input for {kind}[{position}]")]
    DesiredMissing { kind: String, position: usize },

    #[error("reload hook `{hook}` failed: {source}")]
    Reload {
        hook: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("configuration of {kind}[{position}] panicked: {message}")]
    ConfigPanicked {
        kind: String,
        position: usize,
        message: String,
    },

    #[error("{action} {kind}[{position}] panicked in a startup hook: {message}")]
    HookPanicked {
        kind: String,
        action: Action,
        position: usize,
        message: String,
    },

    #[error("reconciliation exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
}

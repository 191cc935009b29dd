//! Collector reconciliation and supervision engine
//!
//! This crate provides the core functionality for:
//! - Tracking running collector inputs per kind
//! - Diffing them against desired sets pushed by a configuration source
//! - Applying the diff in ordered, deadline-bounded phases
//! - Running every input under panic-isolated, crash-bounded supervision
//! - Health checks and observability

pub mod diff;
pub mod error;
pub mod health;
pub mod http;
pub mod input;
pub mod models;
pub mod observability;
pub mod reconcile;
pub mod registry;
pub mod script;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use diff::{Action, DesiredInput, DesiredSet, Normalized, Operation};
pub use error::{ReconcileError, RegistryError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use http::{HttpRegistry, RouteOwner};
pub use input::{
    Capabilities, CollectorKind, EnvConfigurable, HttpRegistrable, Input, PipelineRunnable,
    Terminable,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
pub use reconcile::{
    ReconcileLoop, ReconcileReport, Reconciler, ReconcilerBuilder, ReconcilerConfig, ReloadHook,
};
pub use registry::{Registry, RunningInstance};
pub use script::ScriptStore;
pub use supervisor::{ExecutorConfig, ExitReason, InstanceTask, SupervisedExecutor};

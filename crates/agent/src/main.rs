//! Collector Agent - runs collector inputs under reconciliation and supervision
//!
//! Applies desired input sets pushed by configuration sources, supervises
//! every running input, and serves health, metrics and input routes.

use agent_lib::{
    diff::DesiredSet,
    health::HealthRegistry,
    http::HttpRegistry,
    observability::{AgentMetrics, StructuredLogger},
    reconcile::{ReconcileLoop, Reconciler, SELF_INPUT},
    script::ScriptStore,
};
use anyhow::Result;
use collector_agent::{api, config::AgentConfig, selfstat::SelfInput};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long shutdown waits for supervised inputs to exit
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting collector-agent");

    let config = AgentConfig::load()?;
    info!(node_name = %config.node_name, api_port = config.api_port, "Agent configured");

    let health_registry = HealthRegistry::with_components().await;
    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(AGENT_VERSION);

    let http = Arc::new(HttpRegistry::new());
    let scripts = Arc::new(ScriptStore::new("confd", &config.script_dir));

    let reconciler = Arc::new(
        Reconciler::builder()
            .config(config.reconciler_config())
            .http(Arc::clone(&http))
            .reload_hook(scripts)
            .health(health_registry.clone())
            .metrics(metrics.clone())
            .logger(logger.clone())
            .build()?,
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // No configuration source ships with this binary, so only the start-up
    // inputs below run. A source (config directory watcher, remote confd
    // backend) plugs in by sending a full DesiredSet per change through
    // `desired_tx`. The loop coalesces them and applies the latest on each tick.
    let (reconcile_loop, desired_tx) =
        ReconcileLoop::new(Arc::clone(&reconciler), config.coalesce_interval());
    let loop_handle = tokio::spawn(reconcile_loop.run(shutdown_tx.subscribe()));

    let self_input = SelfInput::new(
        Arc::clone(reconciler.registry()),
        &config.node_name,
        AGENT_VERSION,
        config.self_interval(),
    );
    let report = reconciler
        .bootstrap(DesiredSet::new().with(SELF_INPUT, self_input, "builtin"))
        .await;
    if !report.is_clean() {
        warn!(errors = report.errors.len(), "Start-up inputs applied with errors");
    }

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics,
        Arc::clone(&reconciler),
        http,
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Mark agent as ready after initialization
    health_registry.set_ready(true).await;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    let _ = shutdown_tx.send(());
    drop(desired_tx);
    if let Err(e) = loop_handle.await {
        warn!(error = %e, "Reconcile loop ended abnormally");
    }

    health_registry.set_ready(false).await;
    reconciler.stop_all().await;
    if !reconciler
        .executor()
        .task_group()
        .wait_idle(DRAIN_TIMEOUT)
        .await
    {
        warn!("Some inputs did not exit before the drain timeout");
    }

    api_handle.abort();
    info!("Shutdown complete");

    Ok(())
}

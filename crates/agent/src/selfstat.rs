//! Built-in self-monitoring input
//!
//! Runs under the same supervision as every other input. It samples the
//! registry on an interval and serves the latest sample at `/v1/self`.

use agent_lib::http::HttpRegistry;
use agent_lib::input::{HttpRegistrable, Input, Terminable};
use agent_lib::registry::Registry;
use async_trait::async_trait;
use axum::routing::get;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Route serving the latest self sample
pub const SELF_ROUTE: &str = "/v1/self";

/// Latest self sample as served over HTTP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfReport {
    pub node: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub running_inputs: usize,
    pub samples: u64,
}

#[derive(Debug)]
struct SelfStats {
    node: String,
    version: String,
    started_at: DateTime<Utc>,
    running_inputs: AtomicUsize,
    samples: AtomicU64,
}

impl SelfStats {
    fn report(&self) -> SelfReport {
        SelfReport {
            node: self.node.clone(),
            version: self.version.clone(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            running_inputs: self.running_inputs.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
        }
    }
}

/// The agent's own input, kind `self`
pub struct SelfInput {
    registry: Arc<Registry>,
    interval: Duration,
    stats: Arc<SelfStats>,
    stop: Notify,
}

impl SelfInput {
    pub fn new(
        registry: Arc<Registry>,
        node: impl Into<String>,
        version: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            interval,
            stats: Arc::new(SelfStats {
                node: node.into(),
                version: version.into(),
                started_at: Utc::now(),
                running_inputs: AtomicUsize::new(0),
                samples: AtomicU64::new(0),
            }),
            stop: Notify::new(),
        }
    }

    pub fn report(&self) -> SelfReport {
        self.stats.report()
    }

    async fn sample(&self) {
        let running = self.registry.read().await.total();
        self.stats.running_inputs.store(running, Ordering::Relaxed);
        let samples = self.stats.samples.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(running_inputs = running, samples = samples, "Sampled agent state");
    }
}

#[async_trait]
impl Input for SelfInput {
    async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "Starting self input");
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sample().await,
                _ = self.stop.notified() => {
                    info!("Self input stopped");
                    break;
                }
            }
        }
    }

    fn sample_config(&self) -> String {
        "[[inputs.self]]\n  ## sampling interval\n  interval = \"10s\"\n".to_string()
    }

    fn catalog(&self) -> String {
        "self".to_string()
    }

    fn config(&self) -> serde_json::Value {
        serde_json::json!({ "interval_secs": self.interval.as_secs() })
    }

    fn is_singleton(&self) -> bool {
        true
    }

    fn as_terminable(&self) -> Option<&dyn Terminable> {
        Some(self)
    }

    fn as_http_registrable(&self) -> Option<&dyn HttpRegistrable> {
        Some(self)
    }
}

impl Terminable for SelfInput {
    fn terminate(&self) {
        self.stop.notify_one();
    }
}

impl HttpRegistrable for SelfInput {
    fn register_http_handler(&self, http: &HttpRegistry) {
        let stats = Arc::clone(&self.stats);
        http.route(
            SELF_ROUTE,
            get(move || {
                let stats = Arc::clone(&stats);
                async move { Json(stats.report()) }
            }),
        );
    }
}

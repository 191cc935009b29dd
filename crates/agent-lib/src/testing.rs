//! Test doubles shared by the engine's unit tests

use crate::http::HttpRegistry;
use crate::input::{EnvConfigurable, HttpRegistrable, Input, PipelineRunnable, Terminable};
use async_trait::async_trait;
use axum::routing::get;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Calls observed on a [`MockInput`]
#[derive(Debug, Default)]
pub(crate) struct MockCounters {
    pub runs: AtomicUsize,
    pub terminations: AtomicUsize,
    pub http_registrations: AtomicUsize,
    pub pipelines: AtomicUsize,
    pub env_reads: AtomicUsize,
    pub env_seen: Mutex<HashMap<String, String>>,
}

impl MockCounters {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn http_registrations(&self) -> usize {
        self.http_registrations.load(Ordering::SeqCst)
    }

    pub fn pipelines(&self) -> usize {
        self.pipelines.load(Ordering::SeqCst)
    }

    pub fn env_reads(&self) -> usize {
        self.env_reads.load(Ordering::SeqCst)
    }
}

/// Input with a fixed configuration and opt-in capabilities.
///
/// `run` blocks until terminated when the input is terminable, and
/// forever otherwise (the supervisor aborts it on stop).
pub(crate) struct MockInput {
    config: Value,
    route: Option<String>,
    terminable: bool,
    pipeline: bool,
    env: bool,
    singleton: bool,
    failing_pipeline: bool,
    failing_config: bool,
    stop: Notify,
    counters: Arc<MockCounters>,
}

impl MockInput {
    pub fn new(config: Value) -> Self {
        Self {
            config,
            route: None,
            terminable: false,
            pipeline: false,
            env: false,
            singleton: false,
            failing_pipeline: false,
            failing_config: false,
            stop: Notify::new(),
            counters: Arc::new(MockCounters::default()),
        }
    }

    pub fn terminable(mut self) -> Self {
        self.terminable = true;
        self
    }

    pub fn http(mut self, route: &str) -> Self {
        self.route = Some(route.to_string());
        self
    }

    pub fn pipeline(mut self) -> Self {
        self.pipeline = true;
        self
    }

    pub fn env(mut self) -> Self {
        self.env = true;
        self
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    /// Pipeline input whose `run_pipeline` panics
    pub fn failing_pipeline(mut self) -> Self {
        self.pipeline = true;
        self.failing_pipeline = true;
        self
    }

    /// Input whose `config` panics
    pub fn failing_config(mut self) -> Self {
        self.failing_config = true;
        self
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }
}

impl Terminable for MockInput {
    fn terminate(&self) {
        self.counters.terminations.fetch_add(1, Ordering::SeqCst);
        self.stop.notify_one();
    }
}

impl HttpRegistrable for MockInput {
    fn register_http_handler(&self, http: &HttpRegistry) {
        self.counters
            .http_registrations
            .fetch_add(1, Ordering::SeqCst);
        if let Some(route) = &self.route {
            let body = self.config.to_string();
            http.route(route, get(move || async move { body }));
        }
    }
}

impl PipelineRunnable for MockInput {
    fn run_pipeline(&self) {
        self.counters.pipelines.fetch_add(1, Ordering::SeqCst);
        if self.failing_pipeline {
            panic!("pipeline script missing");
        }
    }
}

impl EnvConfigurable for MockInput {
    fn read_env(&mut self, env: &HashMap<String, String>) {
        self.counters.env_reads.fetch_add(1, Ordering::SeqCst);
        *self.counters.env_seen.lock().unwrap() = env.clone();
    }
}

#[async_trait]
impl Input for MockInput {
    async fn run(&self) {
        self.counters.runs.fetch_add(1, Ordering::SeqCst);
        if self.terminable {
            self.stop.notified().await;
        } else {
            std::future::pending::<()>().await;
        }
    }

    fn sample_config(&self) -> String {
        "[[inputs.mock]]".to_string()
    }

    fn catalog(&self) -> String {
        "mock".to_string()
    }

    fn config(&self) -> Value {
        if self.failing_config {
            panic!("config template unresolved");
        }
        self.config.clone()
    }

    fn is_singleton(&self) -> bool {
        self.singleton
    }

    fn as_terminable(&self) -> Option<&dyn Terminable> {
        self.terminable.then_some(self as &dyn Terminable)
    }

    fn as_http_registrable(&self) -> Option<&dyn HttpRegistrable> {
        self.route.as_ref().map(|_| self as &dyn HttpRegistrable)
    }

    fn as_pipeline_runnable(&self) -> Option<&dyn PipelineRunnable> {
        self.pipeline.then_some(self as &dyn PipelineRunnable)
    }

    fn as_env_configurable(&mut self) -> Option<&mut dyn EnvConfigurable> {
        if self.env {
            Some(self)
        } else {
            None
        }
    }
}

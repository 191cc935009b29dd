//! Phase executor for reconciliation passes

use super::{ReconcilerConfig, ReloadHook};
use crate::diff::{deletion_order, diff, Action, DesiredInput, DesiredSet, Operation};
use crate::error::{ReconcileError, RegistryError};
use crate::health::{components, HealthRegistry};
use crate::http::HttpRegistry;
use crate::input::{canonical_config, process_env, Capabilities, CollectorKind, Input};
use crate::models::InputSummary;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::registry::{Instances, Registry, RunningInstance};
use crate::supervisor::{panic_message, SupervisedExecutor};
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome of one reconciliation pass
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Operations computed by the differ, in diff order
    pub operations: Vec<Operation>,
    pub errors: Vec<ReconcileError>,
    pub deadline_exceeded: bool,
    pub elapsed: Duration,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of operations with the given action
    pub fn count(&self, action: Action) -> usize {
        self.operations.iter().filter(|op| op.action == action).count()
    }
}

/// Applies desired sets to the registry and supervises the resulting inputs
pub struct Reconciler {
    registry: Arc<Registry>,
    executor: SupervisedExecutor,
    http: Option<Arc<HttpRegistry>>,
    hooks: Vec<Arc<dyn ReloadHook>>,
    config: ReconcilerConfig,
    metrics: AgentMetrics,
    health: HealthRegistry,
    logger: StructuredLogger,
    /// Held for the duration of a pass
    pass: Mutex<()>,
}

impl Reconciler {
    pub fn builder() -> ReconcilerBuilder {
        ReconcilerBuilder::new()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn executor(&self) -> &SupervisedExecutor {
        &self.executor
    }

    pub fn http(&self) -> Option<&Arc<HttpRegistry>> {
        self.http.as_ref()
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub async fn snapshot(&self) -> Vec<InputSummary> {
        self.registry.snapshot().await
    }

    /// Apply a desired set pushed by the configuration source.
    ///
    /// Reserved kinds in the set are ignored and left as they are.
    pub async fn reconcile(&self, desired: DesiredSet) -> ReconcileReport {
        let reserved = self.config.reserved.clone();
        self.apply(desired, &reserved).await
    }

    /// Apply the agent's own start-up inputs, reserved kinds included
    pub async fn bootstrap(&self, desired: DesiredSet) -> ReconcileReport {
        self.apply(desired, &[]).await
    }

    async fn apply(&self, mut desired: DesiredSet, reserved: &[String]) -> ReconcileReport {
        let _pass = self.pass.lock().await;
        let start = Instant::now();

        let normalized = desired.normalize(reserved);

        let mut report = ReconcileReport::default();
        report.errors.extend(normalized.errors);
        let deadline = self.config.deadline;
        if tokio::time::timeout(deadline, self.run_phases(desired, reserved, &mut report))
            .await
            .is_err()
        {
            report.deadline_exceeded = true;
            report.errors.push(ReconcileError::DeadlineExceeded(deadline));
        }
        report.elapsed = start.elapsed();

        self.record(&report).await;
        report
    }

    async fn run_phases(&self, desired: DesiredSet, reserved: &[String], report: &mut ReconcileReport) {
        let mut untouched = self.config.protected.clone();
        untouched.extend(reserved.iter().cloned());

        report.operations = {
            let instances = self.registry.read().await;
            diff(&instances.canonical_view(), &desired.canonical_view(), &untouched)
        };
        debug!(operations = report.operations.len(), "Computed reconciliation operations");

        let operations = &report.operations;
        let errors = &mut report.errors;

        self.stop_phase(operations, errors).await;
        self.delete_phase(operations, errors).await;
        self.add_phase(operations, desired, errors).await;
        self.reload_phase(errors).await;
    }

    /// Signal every instance about to be deleted or replaced
    async fn stop_phase(&self, operations: &[Operation], errors: &mut Vec<ReconcileError>) {
        let instances = self.registry.read().await;

        for op in operations
            .iter()
            .filter(|op| matches!(op.action, Action::Delete | Action::Modify))
        {
            match instances.locate(&op.kind, op.position) {
                Ok(instance) => {
                    debug!(kind = %op.kind, index = op.position, action = %op.action, "Stopping input");
                    instance.request_stop();
                }
                Err(source) => errors.push(registry_error(op, source)),
            }
        }
    }

    async fn delete_phase(&self, operations: &[Operation], errors: &mut Vec<ReconcileError>) {
        let mut instances = self.registry.write().await;

        for op in deletion_order(operations) {
            match instances.remove_at(&op.kind, op.position) {
                Ok(removed) => {
                    self.release_routes(&removed);
                    info!(kind = %op.kind, index = op.position, "Deleted input");
                }
                Err(source) => errors.push(registry_error(op, source)),
            }
        }
    }

    async fn add_phase(
        &self,
        operations: &[Operation],
        desired: DesiredSet,
        errors: &mut Vec<ReconcileError>,
    ) {
        let env = self
            .config
            .container_mode
            .then(|| self.config.env.clone().unwrap_or_else(process_env));
        let mut slots = desired.into_slots();
        let mut instances = self.registry.write().await;

        for op in operations
            .iter()
            .filter(|op| matches!(op.action, Action::Add | Action::Modify))
        {
            let Some(entry) = take_slot(&mut slots, op) else {
                errors.push(ReconcileError::DesiredMissing {
                    kind: op.kind.clone(),
                    position: op.position,
                });
                continue;
            };

            if let Err(source) = check_target(&instances, op) {
                errors.push(registry_error(op, source));
                continue;
            }

            let instance = match self.start_instance(op, entry, env.as_ref()) {
                Ok(instance) => instance,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };
            if op.action == Action::Add {
                instances.append(&op.kind, instance);
                info!(kind = %op.kind, index = op.position, "Added input");
                continue;
            }

            match instances.put(&op.kind, op.position, instance) {
                Ok(replaced) => {
                    self.release_routes(&replaced);
                    info!(kind = %op.kind, index = op.position, "Replaced input");
                }
                Err(source) => errors.push(registry_error(op, source)),
            }
        }
    }

    /// Run the capability hooks of a new instance and launch it.
    ///
    /// A panic in any hook leaves the slot untouched: routes the instance
    /// managed to register are released and nothing is launched.
    fn start_instance(
        &self,
        op: &Operation,
        entry: DesiredInput,
        env: Option<&HashMap<String, String>>,
    ) -> Result<RunningInstance, ReconcileError> {
        let (kind, index) = (op.kind.as_str(), op.position);
        let (input, source, canonical) = entry.into_parts();
        let routes = self.http.as_ref().map(|http| http.new_owner());

        let prepared = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut input = input;
            // compared against the next desired set, so taken before env overrides
            let canonical = canonical.unwrap_or_else(|| canonical_config(input.as_ref()));
            let capabilities = Capabilities::detect(input.as_mut());

            if let Some(env) = env {
                if let Some(configurable) = input.as_env_configurable() {
                    configurable.read_env(env);
                }
            }

            let input: Arc<dyn Input> = Arc::from(input);

            if let Some(registrable) = input.as_http_registrable() {
                match (&self.http, routes) {
                    (Some(http), Some(owner)) => {
                        http.register_as(owner, |http| registrable.register_http_handler(http));
                    }
                    _ => warn!(kind = %kind, index = index, "No HTTP registry configured, input routes not served"),
                }
            }

            if let Some(pipeline) = input.as_pipeline_runnable() {
                pipeline.run_pipeline();
            }

            (input, canonical, capabilities)
        }));

        let (input, canonical, capabilities) = match prepared {
            Ok(prepared) => prepared,
            Err(payload) => {
                if let (Some(http), Some(owner)) = (&self.http, routes) {
                    http.release(owner);
                }
                return Err(ReconcileError::HookPanicked {
                    kind: kind.to_string(),
                    action: op.action,
                    position: index,
                    message: panic_message(payload),
                });
            }
        };

        let task = self
            .executor
            .launch(kind, index, Arc::clone(&input), capabilities);

        let instance = RunningInstance::with_canonical(input, source, capabilities, canonical).with_task(task);
        Ok(match routes {
            Some(owner) => instance.with_routes(owner),
            None => instance,
        })
    }

    /// Drop the HTTP routes a removed or replaced instance registered
    fn release_routes(&self, instance: &RunningInstance) {
        if let (Some(http), Some(owner)) = (&self.http, instance.route_owner()) {
            let released = http.release(owner);
            debug!(routes = released, "Released routes of removed input");
        }
    }

    async fn reload_phase(&self, errors: &mut Vec<ReconcileError>) {
        for hook in &self.hooks {
            match hook.reload().await {
                Ok(()) => debug!(hook = %hook.name(), "Reloaded"),
                Err(source) => errors.push(ReconcileError::Reload {
                    hook: hook.name().to_string(),
                    source,
                }),
            }
        }
    }

    /// Publish a pass outcome to logs, metrics and health
    async fn record(&self, report: &ReconcileReport) {
        for err in &report.errors {
            error!(error = %err, "Reconciliation error");
        }

        self.logger.log_reconcile(
            report.operations.len(),
            report.errors.len(),
            report.elapsed.as_millis(),
            report.deadline_exceeded,
        );

        self.metrics
            .observe_reconcile_duration(report.elapsed.as_secs_f64());
        for op in &report.operations {
            self.metrics.inc_operations(op.action.as_str());
        }
        self.metrics.inc_reconcile_errors(report.errors.len() as u64);
        {
            let instances = self.registry.read().await;
            self.metrics.set_running_inputs(instances.counts());
        }

        if report.is_clean() {
            self.health.set_healthy(components::RECONCILER).await;
        } else {
            self.health
                .set_degraded(
                    components::RECONCILER,
                    format!("last pass collected {} errors", report.errors.len()),
                )
                .await;
        }
    }

    /// Stop every running input and empty the registry. Returns the number stopped.
    ///
    /// Does not wait for the inputs to exit; use the executor's task group for that.
    pub async fn stop_all(&self) -> usize {
        let _pass = self.pass.lock().await;
        let drained = self.registry.write().await.drain();

        let mut stopped = 0;
        for (kind, instances) in drained {
            for (index, instance) in instances.into_iter().enumerate() {
                debug!(kind = %kind, index = index, "Stopping input for shutdown");
                instance.request_stop();
                stopped += 1;
            }
        }

        self.metrics.set_running_inputs(std::iter::empty());
        info!(stopped = stopped, "Stopped all inputs");
        stopped
    }
}

fn registry_error(op: &Operation, source: RegistryError) -> ReconcileError {
    ReconcileError::Registry {
        kind: op.kind.clone(),
        action: op.action,
        position: op.position,
        source,
    }
}

fn take_slot(
    slots: &mut BTreeMap<CollectorKind, Vec<Option<DesiredInput>>>,
    op: &Operation,
) -> Option<DesiredInput> {
    slots
        .get_mut(&op.kind)
        .and_then(|entries| entries.get_mut(op.position))
        .and_then(Option::take)
}

/// ADD must append right after the current last instance, MODIFY must hit an existing one
fn check_target(instances: &Instances, op: &Operation) -> Result<(), RegistryError> {
    match op.action {
        Action::Add => {
            let len = instances.len(&op.kind);
            if op.position == len {
                Ok(())
            } else {
                Err(RegistryError::IndexOutOfRange {
                    kind: op.kind.clone(),
                    index: op.position,
                    len,
                })
            }
        }
        _ => instances.locate(&op.kind, op.position).map(|_| ()),
    }
}

/// Builder for [`Reconciler`]
pub struct ReconcilerBuilder {
    registry: Option<Arc<Registry>>,
    http: Option<Arc<HttpRegistry>>,
    hooks: Vec<Arc<dyn ReloadHook>>,
    config: ReconcilerConfig,
    health: Option<HealthRegistry>,
    metrics: Option<AgentMetrics>,
    logger: Option<StructuredLogger>,
}

impl ReconcilerBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            http: None,
            hooks: Vec::new(),
            config: ReconcilerConfig::default(),
            health: None,
            metrics: None,
            logger: None,
        }
    }

    pub fn config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing registry instead of a fresh one
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Route table for HTTP-registrable inputs, rebuilt after every pass
    pub fn http(mut self, http: Arc<HttpRegistry>) -> Self {
        self.hooks.push(Arc::clone(&http) as Arc<dyn ReloadHook>);
        self.http = Some(http);
        self
    }

    /// Add a side-effect reload hook. Hooks run in the order they were added.
    pub fn reload_hook(mut self, hook: Arc<dyn ReloadHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.config.deadline = deadline;
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<Reconciler> {
        let health = self
            .health
            .ok_or_else(|| anyhow::anyhow!("Health registry is required"))?;
        let logger = self
            .logger
            .ok_or_else(|| anyhow::anyhow!("Logger is required"))?;
        let metrics = self.metrics.unwrap_or_default();

        if self.config.deadline.is_zero() {
            anyhow::bail!("Reconcile deadline must be greater than zero");
        }

        let executor = SupervisedExecutor::new(
            self.config.executor.clone(),
            health.clone(),
            metrics.clone(),
            logger.clone(),
        );

        Ok(Reconciler {
            registry: self.registry.unwrap_or_default(),
            executor,
            http: self.http,
            hooks: self.hooks,
            config: self.config,
            metrics,
            health,
            logger,
            pass: Mutex::new(()),
        })
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Capabilities;
    use crate::testing::MockInput;
    use serde_json::json;

    #[tokio::test]
    async fn test_check_target_rejects_gaps_and_missing_slots() {
        let registry = Registry::new();
        let mut instances = registry.write().await;
        instances.append(
            "mysql",
            RunningInstance::new(Arc::new(MockInput::new(json!({}))), "test", Capabilities::NONE),
        );

        assert!(check_target(&instances, &Operation::new("mysql", Action::Add, 1)).is_ok());
        assert!(check_target(&instances, &Operation::new("mysql", Action::Modify, 0)).is_ok());
        assert_eq!(
            check_target(&instances, &Operation::new("mysql", Action::Add, 3)).unwrap_err(),
            RegistryError::IndexOutOfRange {
                kind: "mysql".to_string(),
                index: 3,
                len: 1,
            }
        );
        assert_eq!(
            check_target(&instances, &Operation::new("redis", Action::Modify, 0)).unwrap_err(),
            RegistryError::KindNotFound("redis".to_string())
        );
    }

    #[test]
    fn test_take_slot_hands_out_each_entry_once() {
        let desired = DesiredSet::new().with("cpu", MockInput::new(json!({})), "confd");
        let mut slots = desired.into_slots();
        let op = Operation::new("cpu", Action::Add, 0);

        assert!(take_slot(&mut slots, &op).is_some());
        assert!(take_slot(&mut slots, &op).is_none());
        assert!(take_slot(&mut slots, &Operation::new("mem", Action::Add, 0)).is_none());
    }

    #[test]
    fn test_report_counts_by_action() {
        let report = ReconcileReport {
            operations: vec![
                Operation::new("a", Action::Add, 0),
                Operation::new("a", Action::Add, 1),
                Operation::new("b", Action::Delete, 0),
            ],
            ..ReconcileReport::default()
        };

        assert_eq!(report.count(Action::Add), 2);
        assert_eq!(report.count(Action::Modify), 0);
        assert!(report.is_clean());
    }
}

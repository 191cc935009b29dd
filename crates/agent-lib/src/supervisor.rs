//! Supervised execution of collector inputs
//!
//! Each running input gets one supervising task. The task waits a random
//! start jitter, then runs the input's entrypoint in a child task so a
//! panic surfaces as a [`JoinError`] instead of unwinding into the agent.
//! Panicking inputs are restarted immediately until they exceed the crash
//! ceiling, after which they are abandoned.
//!
//! A process-wide panic hook records the backtrace of panics raised inside
//! a supervised run, so crash logs carry the stack trace and not only the
//! panic payload.

use crate::health::{components, HealthRegistry};
use crate::input::{Capabilities, Input};
use crate::observability::{AgentMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::future::Future;
use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// Default upper bound of the start jitter
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(10);

/// Default number of tolerated panics per instance
pub const DEFAULT_MAX_CRASHES: usize = 6;

/// Backtrace of a panic raised during one run of an input
type TraceSlot = Arc<Mutex<Option<String>>>;

tokio::task_local! {
    static PANIC_TRACE: TraceSlot;
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that captures backtraces of supervised runs.
///
/// Panics raised anywhere else are passed to the previous hook unchanged.
pub(crate) fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let captured = PANIC_TRACE
                .try_with(|slot| {
                    let trace = Backtrace::force_capture().to_string();
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(trace);
                })
                .is_ok();
            if !captured {
                previous(info);
            }
        }));
    });
}

fn take_trace(slot: &TraceSlot) -> Option<String> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Spawn one run of an input with a slot for its panic backtrace
fn spawn_attempt(input: Arc<dyn Input>) -> (JoinHandle<()>, TraceSlot) {
    let trace = TraceSlot::default();
    let handle = tokio::spawn(PANIC_TRACE.scope(Arc::clone(&trace), async move {
        input.run().await
    }));
    (handle, trace)
}

/// Configuration for supervised execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound (exclusive) of the random delay before the first run
    pub max_jitter: Duration,
    /// Panics tolerated before the instance is abandoned
    pub max_crashes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_jitter: DEFAULT_MAX_JITTER,
            max_crashes: DEFAULT_MAX_CRASHES,
        }
    }
}

/// Why a supervising task finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The input returned from `run` on its own
    Completed,
    /// A stop was requested while the input was running
    Stopped,
    /// A stop was requested before the input was started
    Interrupted,
    /// The input panicked more often than the crash ceiling allows
    CrashCeiling { crashes: usize },
}

/// Panic history of a single supervised instance
#[derive(Debug, Clone, Default)]
pub struct CrashRecord {
    pub crash_count: usize,
    pub crash_times: Vec<DateTime<Utc>>,
    pub last_panic: Option<String>,
    pub last_backtrace: Option<String>,
}

impl CrashRecord {
    fn record(&mut self, message: String, backtrace: Option<String>) {
        self.crash_count += 1;
        self.crash_times.push(Utc::now());
        self.last_panic = Some(message);
        self.last_backtrace = backtrace;
    }
}

/// Process-wide panic counters per collector kind
#[derive(Debug, Clone, Default)]
pub struct CrashLedger {
    counts: Arc<DashMap<String, u64>>,
}

impl CrashLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, kind: &str) {
        *self.counts.entry(kind.to_string()).or_insert(0) += 1;
    }

    /// Number of panics recorded for a kind
    pub fn count(&self, kind: &str) -> u64 {
        self.counts.get(kind).map(|c| *c).unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

/// Tracks every task spawned for supervised inputs so shutdown can wait for them
#[derive(Debug, Clone)]
pub struct TaskGroup {
    name: &'static str,
    active: Arc<watch::Sender<usize>>,
}

/// Decrements the group's task count when the task ends, however it ends
struct ActiveGuard(Arc<watch::Sender<usize>>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl TaskGroup {
    pub fn new(name: &'static str) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            name,
            active: Arc::new(active),
        }
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.active.send_modify(|n| *n += 1);
        let guard = ActiveGuard(Arc::clone(&self.active));
        tokio::spawn(async move {
            let _guard = guard;
            future.await
        })
    }

    /// Number of tasks still running
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Wait until every task has finished. Returns false if the timeout elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.active.subscribe();
        let idle = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        if !idle {
            warn!(group = self.name, active = self.active(), "Tasks still running after timeout");
        }
        idle
    }
}

/// Handle to one supervised input
#[derive(Debug)]
pub struct InstanceTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<ExitReason>,
    crashes: Arc<AtomicUsize>,
}

impl InstanceTask {
    /// Ask the supervising task to stop. Does not wait.
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Panics recovered so far for this instance
    pub fn crash_count(&self) -> usize {
        self.crashes.load(Ordering::Relaxed)
    }

    /// Wait for the supervising task to finish
    pub async fn join(self) -> ExitReason {
        match self.handle.await {
            Ok(reason) => reason,
            // the supervising task never panics itself; cancellation only happens at runtime shutdown
            Err(_) => ExitReason::Stopped,
        }
    }
}

/// Launches inputs under crash supervision
#[derive(Clone)]
pub struct SupervisedExecutor {
    config: ExecutorConfig,
    group: TaskGroup,
    ledger: CrashLedger,
    metrics: AgentMetrics,
    health: HealthRegistry,
    logger: StructuredLogger,
}

impl SupervisedExecutor {
    pub fn new(
        config: ExecutorConfig,
        health: HealthRegistry,
        metrics: AgentMetrics,
        logger: StructuredLogger,
    ) -> Self {
        install_panic_hook();
        Self {
            config,
            group: TaskGroup::new("inputs"),
            ledger: CrashLedger::new(),
            metrics,
            health,
            logger,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn task_group(&self) -> &TaskGroup {
        &self.group
    }

    pub fn crash_ledger(&self) -> &CrashLedger {
        &self.ledger
    }

    /// Start supervising an input on the shared task group
    pub fn launch(
        &self,
        kind: &str,
        index: usize,
        input: Arc<dyn Input>,
        capabilities: Capabilities,
    ) -> InstanceTask {
        let (stop_tx, stop_rx) = watch::channel(false);
        let crashes = Arc::new(AtomicUsize::new(0));
        let run = Supervision {
            kind: kind.to_string(),
            index,
            input,
            terminable: capabilities.contains(Capabilities::TERMINABLE),
            crashes: Arc::clone(&crashes),
            executor: self.clone(),
        };

        debug!(kind = %kind, index = index, capabilities = %capabilities, "Launching supervised input");
        let handle = self.group.spawn(run.supervise(stop_rx));

        InstanceTask {
            stop_tx,
            handle,
            crashes,
        }
    }
}

/// Outcome of waiting on a single run of an input
enum Attempt {
    Finished(Result<(), JoinError>),
    StopRequested,
}

struct Supervision {
    kind: String,
    index: usize,
    input: Arc<dyn Input>,
    terminable: bool,
    crashes: Arc<AtomicUsize>,
    executor: SupervisedExecutor,
}

impl Supervision {
    async fn supervise(self, mut stop_rx: watch::Receiver<bool>) -> ExitReason {
        let config = &self.executor.config;
        let delay = Duration::from_millis(rand_jitter(config.max_jitter.as_millis() as u64));

        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_requested(&mut stop_rx) => {
                    info!(kind = %self.kind, index = self.index, "Start of input interrupted");
                    return ExitReason::Interrupted;
                }
            }
        }

        info!(kind = %self.kind, index = self.index, jitter_ms = delay.as_millis(), "Starting input");
        let mut record = CrashRecord::default();

        loop {
            if stop_pending(&stop_rx) {
                return ExitReason::Stopped;
            }

            let (mut attempt, trace) = spawn_attempt(Arc::clone(&self.input));

            let event = tokio::select! {
                res = &mut attempt => Attempt::Finished(res),
                _ = stop_requested(&mut stop_rx) => Attempt::StopRequested,
            };

            let outcome = match event {
                Attempt::Finished(res) => res,
                Attempt::StopRequested => {
                    match self.input.as_terminable() {
                        Some(terminable) if self.terminable => terminable.terminate(),
                        _ => attempt.abort(),
                    }
                    if let Err(e) = attempt.await {
                        if e.is_panic() {
                            warn!(kind = %self.kind, index = self.index, "Input panicked while stopping");
                        }
                    }
                    info!(kind = %self.kind, index = self.index, "Input stopped");
                    return ExitReason::Stopped;
                }
            };

            match outcome {
                Ok(()) if stop_pending(&stop_rx) => {
                    info!(kind = %self.kind, index = self.index, "Input stopped");
                    return ExitReason::Stopped;
                }
                Ok(()) => {
                    info!(
                        kind = %self.kind,
                        index = self.index,
                        "Input exited, it may only register an HTTP handler"
                    );
                    return ExitReason::Completed;
                }
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic());
                    record.record(message.clone(), take_trace(&trace));
                    self.crashes.store(record.crash_count, Ordering::Relaxed);
                    self.executor.ledger.record(&self.kind);
                    self.executor.metrics.inc_input_panics(&self.kind);
                    self.executor.logger.log_input_panic(
                        &self.kind,
                        self.index,
                        record.crash_count,
                        &message,
                        record.last_backtrace.as_deref(),
                    );

                    if record.crash_count > config.max_crashes {
                        self.abandon(&record).await;
                        return ExitReason::CrashCeiling {
                            crashes: record.crash_count,
                        };
                    }
                }
                Err(_) => {
                    // cancelled from outside, only happens during runtime shutdown
                    return ExitReason::Stopped;
                }
            }
        }
    }

    async fn abandon(&self, record: &CrashRecord) {
        self.executor.logger.log_input_abandoned(
            &self.kind,
            self.index,
            record.crash_count,
            &record.crash_times,
        );
        self.executor.metrics.inc_inputs_abandoned(&self.kind);
        self.executor
            .health
            .set_degraded(
                components::SUPERVISOR,
                format!(
                    "input {}[{}] stopped after {} crashes",
                    self.kind, self.index, record.crash_count
                ),
            )
            .await;
    }
}

/// Resolves once a stop was requested or the instance handle was dropped
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn stop_pending(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Random jitter in `[0, max_ms)` milliseconds
fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..max_ms)
}

//! Registry of running input instances
//!
//! Maps each collector kind to its ordered instances. A kind never maps to
//! an empty list. Structural changes are only reachable through
//! [`RegistryWriteGuard`], so the reader/writer discipline is enforced by
//! the types: scans hold the shared lock, edits hold the exclusive one.

use crate::diff::CanonicalView;
use crate::error::RegistryError;
use crate::http::RouteOwner;
use crate::input::{canonical_config, Capabilities, CollectorKind, Input};
use crate::models::{InputSummary, InstanceState};
use crate::supervisor::InstanceTask;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// A running input and the supervised task driving it
#[derive(Debug)]
pub struct RunningInstance {
    input: Arc<dyn Input>,
    source: String,
    capabilities: Capabilities,
    canonical: String,
    task: Option<InstanceTask>,
    routes: Option<RouteOwner>,
}

impl RunningInstance {
    pub fn new(input: Arc<dyn Input>, source: impl Into<String>, capabilities: Capabilities) -> Self {
        let canonical = canonical_config(input.as_ref());
        Self::with_canonical(input, source, capabilities, canonical)
    }

    /// Instance whose comparable configuration was computed before it was
    /// adjusted (e.g. by environment overrides)
    pub fn with_canonical(
        input: Arc<dyn Input>,
        source: impl Into<String>,
        capabilities: Capabilities,
        canonical: String,
    ) -> Self {
        Self {
            input,
            source: source.into(),
            capabilities,
            canonical,
            task: None,
            routes: None,
        }
    }

    /// Attach the supervised task running this instance
    pub fn with_task(mut self, task: InstanceTask) -> Self {
        self.task = Some(task);
        self
    }

    /// Remember the owner of the HTTP routes this instance registered
    pub fn with_routes(mut self, owner: RouteOwner) -> Self {
        self.routes = Some(owner);
        self
    }

    pub fn route_owner(&self) -> Option<RouteOwner> {
        self.routes
    }

    pub fn input(&self) -> &Arc<dyn Input> {
        &self.input
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn task(&self) -> Option<&InstanceTask> {
        self.task.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Ask the instance to stop without waiting for it.
    ///
    /// A supervised instance is terminated (or aborted) by its supervisor.
    pub fn request_stop(&self) {
        match &self.task {
            Some(task) => task.request_stop(),
            None if self.capabilities.contains(Capabilities::TERMINABLE) => {
                if let Some(terminable) = self.input.as_terminable() {
                    terminable.terminate();
                }
            }
            None => {}
        }
    }

    /// Take the supervised task out, e.g. to wait for it during shutdown
    pub fn take_task(&mut self) -> Option<InstanceTask> {
        self.task.take()
    }
}

/// Instances per kind, as seen through either guard
#[derive(Debug, Default)]
pub struct Instances {
    kinds: HashMap<CollectorKind, Vec<RunningInstance>>,
}

impl Instances {
    pub fn get(&self, kind: &str) -> Option<&[RunningInstance]> {
        self.kinds.get(kind).map(Vec::as_slice)
    }

    pub fn instance(&self, kind: &str, index: usize) -> Option<&RunningInstance> {
        self.kinds.get(kind).and_then(|instances| instances.get(index))
    }

    /// Instance at a position, or why there is none
    pub fn locate(&self, kind: &str, index: usize) -> Result<&RunningInstance, RegistryError> {
        let instances = self
            .kinds
            .get(kind)
            .ok_or_else(|| RegistryError::KindNotFound(kind.to_string()))?;
        instances.get(index).ok_or_else(|| RegistryError::IndexOutOfRange {
            kind: kind.to_string(),
            index,
            len: instances.len(),
        })
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Number of instances of a kind
    pub fn len(&self, kind: &str) -> usize {
        self.kinds.get(kind).map_or(0, Vec::len)
    }

    /// Number of instances across all kinds
    pub fn total(&self) -> usize {
        self.kinds.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn counts(&self) -> impl Iterator<Item = (&str, usize)> {
        self.kinds
            .iter()
            .map(|(kind, instances)| (kind.as_str(), instances.len()))
    }

    pub fn canonical_view(&self) -> CanonicalView {
        self.kinds
            .iter()
            .map(|(kind, instances)| {
                (
                    kind.clone(),
                    instances.iter().map(|i| i.canonical.clone()).collect(),
                )
            })
            .collect()
    }

    /// Every instance with its kind and position, kinds sorted
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize, &RunningInstance)> {
        self.kinds().into_iter().flat_map(move |kind| {
            self.kinds[kind]
                .iter()
                .enumerate()
                .map(move |(index, instance)| (kind, index, instance))
        })
    }

    fn slots_mut(&mut self, kind: &str) -> Result<&mut Vec<RunningInstance>, RegistryError> {
        self.kinds
            .get_mut(kind)
            .ok_or_else(|| RegistryError::KindNotFound(kind.to_string()))
    }
}

/// Exclusive access to the registry
pub struct RegistryWriteGuard<'a>(RwLockWriteGuard<'a, Instances>);

impl Deref for RegistryWriteGuard<'_> {
    type Target = Instances;

    fn deref(&self) -> &Instances {
        &self.0
    }
}

impl RegistryWriteGuard<'_> {
    /// Replace the instance at `index`, returning the previous one
    pub fn put(
        &mut self,
        kind: &str,
        index: usize,
        instance: RunningInstance,
    ) -> Result<RunningInstance, RegistryError> {
        let slots = self.0.slots_mut(kind)?;
        let len = slots.len();
        let slot = slots
            .get_mut(index)
            .ok_or_else(|| RegistryError::IndexOutOfRange {
                kind: kind.to_string(),
                index,
                len,
            })?;
        debug!(kind = %kind, index = index, "Replacing input instance");
        Ok(std::mem::replace(slot, instance))
    }

    /// Remove the instance at `index`. Removing the last instance removes the kind.
    pub fn remove_at(&mut self, kind: &str, index: usize) -> Result<RunningInstance, RegistryError> {
        let slots = self.0.slots_mut(kind)?;
        if index >= slots.len() {
            return Err(RegistryError::IndexOutOfRange {
                kind: kind.to_string(),
                index,
                len: slots.len(),
            });
        }

        let removed = slots.remove(index);
        if slots.is_empty() {
            self.0.kinds.remove(kind);
        }
        debug!(kind = %kind, index = index, "Removed input instance");
        Ok(removed)
    }

    /// Append an instance to its kind, returning its position
    pub fn append(&mut self, kind: &str, instance: RunningInstance) -> usize {
        let slots = self.0.kinds.entry(kind.to_string()).or_default();
        slots.push(instance);
        debug!(kind = %kind, index = slots.len() - 1, "Appended input instance");
        slots.len() - 1
    }

    /// Remove every instance, handing them to the caller
    pub fn drain(&mut self) -> Vec<(CollectorKind, Vec<RunningInstance>)> {
        self.0.kinds.drain().collect()
    }
}

/// Live registry of running inputs
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<Instances>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access for scans
    pub async fn read(&self) -> RwLockReadGuard<'_, Instances> {
        self.inner.read().await
    }

    /// Exclusive access for structural edits
    pub async fn write(&self) -> RegistryWriteGuard<'_> {
        RegistryWriteGuard(self.inner.write().await)
    }

    /// Serialisable view of every instance
    pub async fn snapshot(&self) -> Vec<InputSummary> {
        let instances = self.read().await;
        instances
            .iter()
            .map(|(kind, index, instance)| InputSummary {
                kind: kind.to_string(),
                index,
                source: instance.source.clone(),
                catalog: instance.input.catalog(),
                capabilities: instance
                    .capabilities
                    .names()
                    .into_iter()
                    .map(String::from)
                    .collect(),
                state: if instance.is_running() {
                    InstanceState::Running
                } else {
                    InstanceState::Exited
                },
                crash_count: instance.task.as_ref().map_or(0, InstanceTask::crash_count),
            })
            .collect()
    }
}

//! Positional diffing of running inputs against a desired set
//!
//! Position `i` of a kind's desired list corresponds to position `i` of
//! its running list. For each kind the differ emits MODIFY for common
//! positions whose canonical configuration differs, DELETE for surplus
//! running positions (highest first) and ADD for surplus desired
//! positions (lowest first).

use crate::error::ReconcileError;
use crate::input::{canonical_config, CollectorKind, Input};
use crate::supervisor::panic_message;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

/// Canonical configurations per kind, in position order
pub type CanonicalView = BTreeMap<CollectorKind, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Add,
    Delete,
    Modify,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "ADD",
            Action::Delete => "DELETE",
            Action::Modify => "MODIFY",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change to apply to the registry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Operation {
    pub kind: CollectorKind,
    pub action: Action,
    pub position: usize,
}

impl Operation {
    pub fn new(kind: impl Into<CollectorKind>, action: Action, position: usize) -> Self {
        Self {
            kind: kind.into(),
            action,
            position,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}[{}]", self.action, self.kind, self.position)
    }
}

/// Facts read from a desired input once, before it is diffed
#[derive(Debug, Clone)]
struct Inspected {
    canonical: String,
    singleton: bool,
}

/// A configured input waiting to be applied
pub struct DesiredInput {
    pub input: Box<dyn Input>,
    /// Where the configuration came from, for diagnostics
    pub source: String,
    inspected: Option<Inspected>,
}

impl DesiredInput {
    pub fn new(input: impl Input, source: impl Into<String>) -> Self {
        Self {
            input: Box::new(input),
            source: source.into(),
            inspected: None,
        }
    }

    pub fn canonical(&self) -> String {
        match &self.inspected {
            Some(inspected) => inspected.canonical.clone(),
            None => canonical_config(self.input.as_ref()),
        }
    }

    /// Read the configuration and singleton flag, containing any panic in
    /// collector code. Returns the panic message on failure.
    fn inspect(&mut self) -> Result<(), String> {
        if self.inspected.is_some() {
            return Ok(());
        }
        let input = self.input.as_ref();
        let inspected = panic::catch_unwind(AssertUnwindSafe(|| Inspected {
            canonical: canonical_config(input),
            singleton: input.is_singleton(),
        }))
        .map_err(panic_message)?;
        self.inspected = Some(inspected);
        Ok(())
    }

    fn is_singleton(&self) -> bool {
        match &self.inspected {
            Some(inspected) => inspected.singleton,
            None => self.input.is_singleton(),
        }
    }

    /// Split into the input, its source and the canonical configuration
    /// when it was already rendered
    pub(crate) fn into_parts(self) -> (Box<dyn Input>, String, Option<String>) {
        let canonical = self.inspected.map(|inspected| inspected.canonical);
        (self.input, self.source, canonical)
    }
}

impl fmt::Debug for DesiredInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesiredInput")
            .field("source", &self.source)
            .field(
                "config",
                &self.inspected.as_ref().map(|inspected| &inspected.canonical),
            )
            .finish()
    }
}

/// Result of [`DesiredSet::normalize`]
#[derive(Debug, Default)]
pub struct Normalized {
    /// Entries removed from the set
    pub dropped: usize,
    /// Entries whose configuration could not be read
    pub errors: Vec<ReconcileError>,
}

/// Complete set of inputs that should be running, keyed by kind
#[derive(Debug, Default)]
pub struct DesiredSet {
    kinds: BTreeMap<CollectorKind, Vec<DesiredInput>>,
}

impl DesiredSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an input to its kind
    pub fn push(&mut self, kind: impl Into<CollectorKind>, input: DesiredInput) {
        self.kinds.entry(kind.into()).or_default().push(input);
    }

    /// Builder-style [`push`](Self::push)
    pub fn with(
        mut self,
        kind: impl Into<CollectorKind>,
        input: impl Input,
        source: impl Into<String>,
    ) -> Self {
        self.push(kind, DesiredInput::new(input, source));
        self
    }

    /// Declare a kind with no instances. Running instances of it are deleted.
    pub fn clear_kind(&mut self, kind: impl Into<CollectorKind>) {
        self.kinds.insert(kind.into(), Vec::new());
    }

    pub fn get(&self, kind: &str) -> Option<&[DesiredInput]> {
        self.kinds.get(kind).map(Vec::as_slice)
    }

    pub fn contains_kind(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    /// Total number of desired inputs across kinds
    pub fn len(&self) -> usize {
        self.kinds.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn canonical_view(&self) -> CanonicalView {
        self.kinds
            .iter()
            .map(|(kind, inputs)| {
                (
                    kind.clone(),
                    inputs.iter().map(DesiredInput::canonical).collect(),
                )
            })
            .collect()
    }

    /// Drop entries that must not reach the registry.
    ///
    /// Reserved kinds are removed entirely. Entries whose configuration
    /// panics when read are removed and reported. Exact duplicates within
    /// a kind keep only their first occurrence, and singleton kinds keep
    /// only their first entry.
    pub fn normalize(&mut self, reserved: &[String]) -> Normalized {
        let mut dropped = 0;
        let mut errors = Vec::new();

        for kind in reserved {
            if let Some(inputs) = self.kinds.remove(kind) {
                warn!(kind = %kind, "Reserved input cannot be reconfigured, ignoring");
                dropped += inputs.len();
            }
        }

        for (kind, inputs) in self.kinds.iter_mut() {
            let before = inputs.len();
            let mut position = 0;
            inputs.retain_mut(|input| {
                let inspected = input.inspect();
                position += 1;
                match inspected {
                    Ok(()) => true,
                    Err(message) => {
                        warn!(kind = %kind, index = position - 1, panic = %message, "Reading input configuration panicked, dropping it");
                        errors.push(ReconcileError::ConfigPanicked {
                            kind: kind.clone(),
                            position: position - 1,
                            message,
                        });
                        false
                    }
                }
            });
            dropped += before - inputs.len();

            let mut seen = BTreeSet::new();
            let before = inputs.len();
            inputs.retain(|input| seen.insert(input.canonical()));
            if inputs.len() < before {
                warn!(kind = %kind, duplicates = before - inputs.len(), "Dropping duplicate input configurations");
                dropped += before - inputs.len();
            }

            if inputs.len() > 1 && inputs[0].is_singleton() {
                warn!(kind = %kind, configured = inputs.len(), "Singleton input allows only one instance");
                dropped += inputs.len() - 1;
                inputs.truncate(1);
            }
        }

        Normalized { dropped, errors }
    }

    /// Hand the inputs over as per-position slots the reconciler can take from
    pub(crate) fn into_slots(self) -> BTreeMap<CollectorKind, Vec<Option<DesiredInput>>> {
        self.kinds
            .into_iter()
            .map(|(kind, inputs)| (kind, inputs.into_iter().map(Some).collect()))
            .collect()
    }
}

/// Compute the operations that turn `running` into `desired`.
///
/// Kinds absent from `desired` lose all their instances unless listed in
/// `protected`. Kinds are visited in sorted order.
pub fn diff(running: &CanonicalView, desired: &CanonicalView, protected: &[String]) -> Vec<Operation> {
    let kinds: BTreeSet<&CollectorKind> = running.keys().chain(desired.keys()).collect();
    let empty = Vec::new();
    let mut operations = Vec::new();

    for kind in kinds {
        let want = match desired.get(kind) {
            Some(want) => want,
            None if protected.iter().any(|p| p == kind) => {
                debug!(kind = %kind, "Protected input absent from desired set, leaving it running");
                continue;
            }
            None => &empty,
        };
        let have = running.get(kind).unwrap_or(&empty);
        diff_kind(kind, have, want, &mut operations);
    }

    operations
}

fn diff_kind(kind: &str, have: &[String], want: &[String], operations: &mut Vec<Operation>) {
    let common = have.len().min(want.len());

    for position in 0..common {
        if have[position] != want[position] {
            operations.push(Operation::new(kind, Action::Modify, position));
        }
    }

    // highest first so earlier removals never shift later ones
    for position in (want.len()..have.len()).rev() {
        operations.push(Operation::new(kind, Action::Delete, position));
    }

    for position in have.len()..want.len() {
        operations.push(Operation::new(kind, Action::Add, position));
    }
}

/// DELETE operations in the order they must be applied: per kind, highest position first
pub fn deletion_order(operations: &[Operation]) -> Vec<&Operation> {
    let mut deletes: Vec<&Operation> = operations
        .iter()
        .filter(|op| op.action == Action::Delete)
        .collect();
    deletes.sort_by(|a, b| a.kind.cmp(&b.kind).then(b.position.cmp(&a.position)));
    deletes
}

//! Serialisable views of the engine state

use serde::{Deserialize, Serialize};

/// Whether a registry slot still has a live supervised task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Running,
    /// Returned, stopped or abandoned after too many crashes
    Exited,
}

/// One running input as reported by the agent API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSummary {
    pub kind: String,
    pub index: usize,
    pub source: String,
    pub catalog: String,
    pub capabilities: Vec<String>,
    pub state: InstanceState,
    pub crash_count: usize,
}

/// Panics recovered for a collector kind since the agent started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCrashes {
    pub kind: String,
    pub panics: u64,
}

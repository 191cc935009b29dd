//! Collector input interfaces
//!
//! Every collector plugin is consumed through the [`Input`] trait. Beyond
//! the mandatory entrypoint an input may expose optional capabilities
//! (stop signal, HTTP routes, pipeline scripts, environment overrides).
//! The reconciler detects them once when an instance is added and records
//! the result as a [`Capabilities`] bitset on the registry slot.

use crate::http::HttpRegistry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

/// Logical name of a collector plugin type (e.g. "mysql")
pub type CollectorKind = String;

/// Environment variable prefixes forwarded to [`EnvConfigurable`] inputs
pub const ENV_PREFIXES: &[&str] = &["ENV_", "DK_"];

/// A collector instance
#[async_trait]
pub trait Input: Send + Sync + 'static {
    /// Run the collector until it is told to stop or has nothing left to do
    async fn run(&self);

    /// Annotated sample configuration for this collector kind
    fn sample_config(&self) -> String;

    /// Catalog the collector belongs to (e.g. "db", "host")
    fn catalog(&self) -> String;

    /// Configuration of this instance, used to detect changes between passes
    fn config(&self) -> serde_json::Value;

    /// Only one instance of a singleton kind may run at a time
    fn is_singleton(&self) -> bool {
        false
    }

    fn as_terminable(&self) -> Option<&dyn Terminable> {
        None
    }

    fn as_http_registrable(&self) -> Option<&dyn HttpRegistrable> {
        None
    }

    fn as_pipeline_runnable(&self) -> Option<&dyn PipelineRunnable> {
        None
    }

    fn as_env_configurable(&mut self) -> Option<&mut dyn EnvConfigurable> {
        None
    }
}

impl fmt::Debug for dyn Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Input")
            .field("catalog", &self.catalog())
            .finish_non_exhaustive()
    }
}

/// Input that can be asked to return from [`Input::run`]
pub trait Terminable {
    /// Request shutdown. Must not block.
    fn terminate(&self);
}

/// Input that serves routes on the agent's HTTP server
pub trait HttpRegistrable {
    fn register_http_handler(&self, http: &HttpRegistry);
}

/// Input that starts log/metric enrichment scripts
pub trait PipelineRunnable {
    fn run_pipeline(&self);
}

/// Input that merges configuration from environment variables
pub trait EnvConfigurable {
    fn read_env(&mut self, env: &HashMap<String, String>);
}

/// Optional capabilities implemented by an input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Self = Self(0);
    pub const TERMINABLE: Self = Self(1 << 0);
    pub const HTTP: Self = Self(1 << 1);
    pub const PIPELINE: Self = Self(1 << 2);
    pub const ENV: Self = Self(1 << 3);

    const NAMES: [(Self, &'static str); 4] = [
        (Self::TERMINABLE, "terminable"),
        (Self::HTTP, "http"),
        (Self::PIPELINE, "pipeline"),
        (Self::ENV, "env"),
    ];

    /// Check an input for every optional capability
    pub fn detect(input: &mut dyn Input) -> Self {
        let mut caps = Self::NONE;
        if input.as_terminable().is_some() {
            caps.insert(Self::TERMINABLE);
        }
        if input.as_http_registrable().is_some() {
            caps.insert(Self::HTTP);
        }
        if input.as_pipeline_runnable().is_some() {
            caps.insert(Self::PIPELINE);
        }
        if input.as_env_configurable().is_some() {
            caps.insert(Self::ENV);
        }
        caps
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Names of the capabilities present, in a fixed order
    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(cap, _)| self.contains(*cap))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        write!(f, "{}", self.names().join(","))
    }
}

/// Canonical comparable form of an input's configuration.
///
/// `serde_json` keeps object keys sorted, so two equal configurations
/// always render to the same string.
pub fn canonical_config(input: &dyn Input) -> String {
    input.config().to_string()
}

/// Snapshot the process environment variables handed to [`EnvConfigurable`] inputs
pub fn process_env() -> HashMap<String, String> {
    filter_env(std::env::vars())
}

fn filter_env(vars: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
    vars.filter(|(key, _)| ENV_PREFIXES.iter().any(|p| key.starts_with(p)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct PlainInput;

    #[async_trait]
    impl Input for PlainInput {
        async fn run(&self) {}

        fn sample_config(&self) -> String {
            "[[inputs.plain]]".to_string()
        }

        fn catalog(&self) -> String {
            "test".to_string()
        }

        fn config(&self) -> serde_json::Value {
            json!({ "b": 2, "a": 1 })
        }
    }

    struct StoppableInput {
        env_seen: usize,
    }

    impl Terminable for StoppableInput {
        fn terminate(&self) {}
    }

    impl EnvConfigurable for StoppableInput {
        fn read_env(&mut self, env: &HashMap<String, String>) {
            self.env_seen = env.len();
        }
    }

    #[async_trait]
    impl Input for StoppableInput {
        async fn run(&self) {}

        fn sample_config(&self) -> String {
            String::new()
        }

        fn catalog(&self) -> String {
            "test".to_string()
        }

        fn config(&self) -> serde_json::Value {
            json!({})
        }

        fn as_terminable(&self) -> Option<&dyn Terminable> {
            Some(self)
        }

        fn as_env_configurable(&mut self) -> Option<&mut dyn EnvConfigurable> {
            Some(self)
        }
    }

    #[test]
    fn test_detect_plain_input_has_no_capabilities() {
        let mut input = PlainInput;
        let caps = Capabilities::detect(&mut input);
        assert!(caps.is_empty());
        assert_eq!(caps.to_string(), "none");
    }

    #[test]
    fn test_detect_detects_optional_capabilities() {
        let mut input = StoppableInput { env_seen: 0 };
        let caps = Capabilities::detect(&mut input);

        assert!(caps.contains(Capabilities::TERMINABLE));
        assert!(caps.contains(Capabilities::ENV));
        assert!(!caps.contains(Capabilities::HTTP));
        assert_eq!(caps.names(), vec!["terminable", "env"]);
    }

    #[test]
    fn test_canonical_config_sorts_keys() {
        assert_eq!(canonical_config(&PlainInput), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn test_filter_env_keeps_known_prefixes() {
        let vars = vec![
            ("ENV_HOSTNAME".to_string(), "web-1".to_string()),
            ("DK_MYSQL_HOST".to_string(), "db".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ];

        let env = filter_env(vars.into_iter());

        assert_eq!(env.len(), 2);
        assert_eq!(env.get("ENV_HOSTNAME").map(String::as_str), Some("web-1"));
        assert!(!env.contains_key("PATH"));
    }
}

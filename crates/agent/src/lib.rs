//! Collector agent host process
//!
//! Wires the reconciliation engine to configuration, the HTTP API and the
//! built-in self input.

pub mod api;
pub mod config;
pub mod selfstat;

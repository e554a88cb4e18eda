//! MCP Doctor: conformance, security and performance diagnostics for
//! Model Context Protocol servers.
//!
//! [`api::Engine`] is the entry point: it runs probe suites against a
//! [`models::Target`], detects issues in the results and drives bounded
//! remediation.

pub mod api;
pub mod config;
pub mod db;
pub mod detector;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod probes;
pub mod remediation;
pub mod scoring;
pub mod transport;
pub mod utils;

pub use api::{Diagnosis, Engine, EngineBuilder};
pub use config::EngineConfig;
pub use error::{DoctorError, Result};

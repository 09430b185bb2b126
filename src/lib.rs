//! dact - scenario-driven test orchestration
//!
//! Loads tools and scenarios from YAML, resolves step dependencies into
//! stages, runs each step as an external process with templated parameters,
//! extracts outputs for later steps, and validates the results.

pub mod cli;
pub mod commands;
pub mod common;
pub mod dataset;
pub mod engine;
pub mod loader;
pub mod model;
pub mod template;
pub mod value;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use engine::{Orchestrator, RunRequest, ScenarioResult};
pub use loader::Catalog;
pub use model::{Case, Scenario, Step, Tool};
pub use value::{Mapping, Value};

//! Definition types deserialized from YAML
//!
//! Tools, scenarios and cases are consumed read-only by the engine.

mod case;
mod scenario;
mod tool;

pub use case::{Case, CaseFile, CaseValidation, DataDrivenCase, ValidationKind};
pub use scenario::{Scenario, Step};
pub use tool::{OutputSpec, PostExec, Tool, ToolParameter, ToolValidation};

use std::time::Duration;

/// Convert a seconds field, ignoring negative or non-finite values
pub(crate) fn secs(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

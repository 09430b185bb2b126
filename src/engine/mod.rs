//! Scenario execution engine
//!
//! Resolution, per-step process execution with retry, output extraction,
//! validation, and the orchestrator tying them together.

pub mod case;
pub mod context;
pub mod executor;
pub mod extractor;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod resolver;
pub mod validation;

pub use case::{run_case, CaseOptions, CaseResult};
pub use context::{FailureCause, RunContext, SkipReason, StepResult, StepStatus};
pub use executor::{ExecutorSettings, StepExecutor};
pub use extractor::OutputExtractor;
pub use orchestrator::{Orchestrator, OrchestratorBuilder, Outcome, Phase, RunRequest, ScenarioResult};
pub use process::{ProcessOutcome, ProcessRequest, ProcessRunner, ShellRunner};
pub use registry::{ExtractionInput, FunctionRegistry};
pub use resolver::{resolve, ExecutionPlan, Mermaid};
pub use validation::{ValidationEngine, ValidationResult, ValidationSubject, Verdict};

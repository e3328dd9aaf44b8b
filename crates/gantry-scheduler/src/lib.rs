//! Pipeline planning and scheduling for Gantry.
//!
//! Planning turns a [`PipelineConfig`](gantry_core::pipeline::PipelineConfig)
//! and a trigger into a dependency graph of job instances; the scheduler then
//! drives that graph to completion against a
//! [`JobExecutor`](gantry_core::ports::JobExecutor).

pub mod concurrency;
pub mod graph;
pub mod matrix;
pub mod plan;
pub mod queue;
pub mod report;
pub mod retry;
pub mod rules;
pub mod scheduler;
pub mod templates;
pub mod variables;
pub mod workers;

pub use concurrency::{ConcurrencyRegistry, SupersedeOutcome};
pub use graph::{GraphBuilder, JobInstance, PipelineGraph};
pub use matrix::{JobExpander, MatrixCell};
pub use plan::{PipelinePlan, PlanSummary, Planner};
pub use report::{ExecutionReport, JobReport, StatusCounts};
pub use rules::{RuleEvaluator, RuleOutcome};
pub use scheduler::{PipelineRun, Scheduler, SchedulerConfig, SchedulerHandle};
pub use templates::{JobTemplate, TemplateCatalog};
pub use variables::{VariableResolver, VariableSet};
pub use workers::{WorkerPool, WorkerSpec};

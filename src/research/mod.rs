//! 调研流程组件：规划、执行、评估、扩展

pub mod critic;
pub mod executor;
pub mod expander;
pub mod planner;

pub use critic::{Critic, CritiqueIssue, CritiqueResult, Severity};
pub use executor::{enrich_params, ExecutionOutcome, TaskExecutor};
pub use expander::{CandidateSource, ExpansionCandidate, ExpansionPlan, SearchExpander};
pub use planner::{parse_plan, PlanResponse, PlannedTask, Planner, PlannerConfig};

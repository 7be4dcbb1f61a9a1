//! 核心编排层：错误分类与自愈、运行状态、证据模型、主控编排

pub mod builder;
pub mod error;
pub mod evidence;
pub mod orchestrator;
pub mod recovery;
pub mod state;

pub use builder::{create_orchestrator, OrchestratorBuilder};
pub use error::{AgentError, ErrorKind, ToolError};
pub use evidence::Evidence;
pub use orchestrator::{Orchestrator, RunHandle};
pub use recovery::{
    classify_text, ErrorContext, ErrorStats, HealerConfig, RecoveryAction, RecoveryResult,
    RecoveryStrategy, SelfHealer,
};
pub use state::{
    AgentPhase, RunLimits, RunState, RunSummary, StepEvent, Subtask, SubtaskStatus, TaskType,
    ThoughtStep,
};

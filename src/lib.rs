//! Scout - 多平台情报调研智能体
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与自愈、运行状态、主控编排
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **research**: Planner、子任务执行、Critic、搜索扩展
//! - **text**: 中英文分词与关键词抽取
//! - **tools**: 工具注册表、执行器与内置工具

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod research;
pub mod text;
pub mod tools;

pub use crate::core::{Orchestrator, OrchestratorBuilder, RunHandle, RunState, StepEvent};

//! 错误类型与错误分类
//!
//! 与 SelfHealer 配合：AgentError / ToolError / LlmError 尽量携带结构化的 ErrorKind，
//! 只有来自第三方代码的错误才退回到按错误文本做关键词分类。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;

/// 错误分类（九类），决定重试预算与恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimit,
    Blocked,
    Parse,
    Timeout,
    Auth,
    Tool,
    Llm,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::Network,
        ErrorKind::RateLimit,
        ErrorKind::Blocked,
        ErrorKind::Parse,
        ErrorKind::Timeout,
        ErrorKind::Auth,
        ErrorKind::Tool,
        ErrorKind::Llm,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Blocked => "blocked",
            ErrorKind::Parse => "parse",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Auth => "auth",
            ErrorKind::Tool => "tool",
            ErrorKind::Llm => "llm",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// 只有鉴权错误不可恢复
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrorKind::Auth)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 工具实现抛出的故障（区别于工具正常返回的 success=false）
///
/// `kind` 为 None 表示错误来自第三方代码，需要由 SelfHealer 按文本分类。
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ToolError {
    pub kind: Option<ErrorKind>,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            message: message.into(),
        }
    }

    /// 未分类的外部错误
    pub fn external(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
        }
    }
}

/// 运行期错误（工具、LLM、取消、事件流等）
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("Tool timeout: {tool} exceeded {secs}s")]
    ToolTimeout { tool: String, secs: u64 },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool execution failed ({tool}): {source}")]
    Tool {
        tool: String,
        #[source]
        source: ToolError,
    },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Cancelled by caller")]
    Cancelled,

    #[error("Event stream closed by consumer")]
    StreamClosed,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Run task aborted: {0}")]
    TaskAborted(String),
}

impl AgentError {
    /// 结构化的错误分类；None 表示只能按文本分类
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            AgentError::ToolTimeout { .. } => Some(ErrorKind::Timeout),
            AgentError::UnknownTool(_) => Some(ErrorKind::Tool),
            AgentError::Tool { source, .. } => source.kind,
            AgentError::Llm(e) => Some(e.kind()),
            AgentError::JsonParse(_) => Some(ErrorKind::Parse),
            AgentError::Cancelled
            | AgentError::StreamClosed
            | AgentError::Config(_)
            | AgentError::TaskAborted(_) => None,
        }
    }

    /// 取消类错误不走恢复流程
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AgentError::Cancelled | AgentError::StreamClosed)
    }
}

//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时。invoke(tool_name, params) 先校验参数，再在超时内调用工具；
//! 未注册 / 超时 / 工具故障转为 AgentError；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::AgentError;
use crate::tools::{validate_params, Params, Tool, ToolRegistry, ToolResult};

/// 工具执行器：对每次调用施加超时，并将结果映射为 AgentError
#[derive(Clone)]
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self::with_timeout(registry, Duration::from_secs(timeout_secs))
    }

    pub fn with_timeout(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// 执行指定工具
    ///
    /// - 未注册：Err(UnknownTool)
    /// - 参数校验失败：Ok(ToolResult::fail)，不调用工具
    /// - 超时：Err(ToolTimeout)；工具故障：Err(Tool)
    pub async fn invoke(&self, tool_name: &str, params: Params) -> Result<ToolResult, AgentError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| AgentError::UnknownTool(tool_name.to_string()))?;

        let start = Instant::now();
        let preview = args_preview(&params);

        if let Some(message) = validate_params(&tool.parameters(), &params) {
            audit(tool_name, "invalid", start, &preview);
            return Ok(ToolResult::fail(message));
        }

        let result = timeout(self.timeout, tool.execute(params)).await;

        let outcome = match &result {
            Ok(Ok(r)) if r.success => "ok",
            Ok(Ok(_)) => "failed",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        audit(tool_name, outcome, start, &preview);

        match result {
            Ok(Ok(r)) => Ok(r),
            Ok(Err(source)) => Err(AgentError::Tool {
                tool: tool_name.to_string(),
                source,
            }),
            Err(_) => Err(AgentError::ToolTimeout {
                tool: tool_name.to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

fn audit(tool_name: &str, outcome: &str, start: Instant, args_preview: &str) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": tool_name,
        "ok": outcome == "ok",
        "outcome": outcome,
        "duration_ms": start.elapsed().as_millis() as u64,
        "args_preview": args_preview,
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Params) -> String {
    let s = serde_json::Value::Object(args.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ErrorKind, ToolError};
    use crate::tools::{ParamType, ToolParameter};
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Scripted {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tool for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        fn description(&self) -> &str {
            "scripted"
        }
        fn parameters(&self) -> Vec<ToolParameter> {
            vec![ToolParameter::required("mode", ParamType::String, "mode")]
        }
        async fn execute(&self, params: Params) -> Result<ToolResult, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match params.get("mode").and_then(|v| v.as_str()) {
                Some("fail") => Ok(ToolResult::fail("nothing found")),
                Some("throw") => Err(ToolError::new(ErrorKind::Network, "connection reset")),
                Some("slow") => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(ToolResult::ok(Map::new()))
                }
                _ => Ok(ToolResult::ok(Map::new()).with_tokens(3)),
            }
        }
    }

    fn executor(tool: Arc<Scripted>) -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register_arc(tool);
        ToolExecutor::with_timeout(registry, Duration::from_secs(1))
    }

    fn params(v: serde_json::Value) -> Params {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let exec = executor(Arc::new(Scripted::default()));
        let err = exec.invoke("nope", Params::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn test_validation_short_circuits() {
        let tool = Arc::new(Scripted::default());
        let exec = executor(tool.clone());
        let result = exec.invoke("scripted", Params::new()).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("mode"));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_outcomes() {
        let exec = executor(Arc::new(Scripted::default()));
        let ok = exec.invoke("scripted", params(json!({"mode": "ok"}))).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.tokens_used, 3);

        let failed = exec.invoke("scripted", params(json!({"mode": "fail"}))).await.unwrap();
        assert!(!failed.success);

        let err = exec.invoke("scripted", params(json!({"mode": "throw"}))).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Network));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let exec = executor(Arc::new(Scripted::default()));
        let err = exec.invoke("scripted", params(json!({"mode": "slow"}))).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolTimeout { .. }));
        assert_eq!(err.kind(), Some(ErrorKind::Timeout));
    }
}

//! 子任务执行器：把游标处的子任务分派给工具，并把结果写回 RunState
//!
//! 执行器从不推进游标。成功与失败都只更新子任务状态、证据与思维链，
//! 由 Orchestrator 显式调用 complete_current_subtask / complete_current_subtask_failed。

use std::time::Instant;

use serde_json::{json, Map, Value};

use crate::core::{AgentError, AgentPhase, RunState, SubtaskStatus, TaskType, ThoughtStep};
use crate::text::truncate_chars;
use crate::tools::{Params, ToolExecutor, ToolPayload};

/// 一次子任务执行的结果
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// 本次追加到思维链的步骤
    pub step: ThoughtStep,
    pub success: bool,
    /// 成功时工具返回的 data
    pub result: Option<Map<String, Value>>,
    /// 失败时的错误文本
    pub error: Option<String>,
}

impl ExecutionOutcome {
    fn succeeded(step: ThoughtStep, result: Map<String, Value>) -> Self {
        Self {
            step,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    fn failed(step: ThoughtStep, error: String) -> Self {
        Self {
            step,
            success: false,
            result: None,
            error: Some(error),
        }
    }
}

/// 子任务执行器
#[derive(Clone)]
pub struct TaskExecutor {
    tools: ToolExecutor,
}

impl TaskExecutor {
    pub fn new(tools: ToolExecutor) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &ToolExecutor {
        &self.tools
    }

    /// 执行游标处的子任务；没有子任务时返回 Ok(None)
    ///
    /// 工具返回 success=false、未知任务类型、工具未注册：记一次错误并返回 Ok。
    /// 工具抛出故障（超时 / ToolError）：记一次错误、追加错误步骤后返回 Err，交给调用方恢复。
    pub async fn execute_current(&self, state: &mut RunState) -> Result<Option<ExecutionOutcome>, AgentError> {
        let Some(subtask) = state.current_subtask() else {
            return Ok(None);
        };
        let task_type = subtask.task_type.clone();
        let description = subtask.description.clone();
        let params = subtask.parameters.clone();
        let phase = task_type.phase();
        state.current_phase = phase;

        let tool_name = match task_type.tool_name() {
            Some(name) if self.tools.has_tool(name) => name,
            Some(name) => {
                let error = format!("工具未注册: {name}");
                return Ok(Some(self.reject(state, &description, error)));
            }
            None => {
                let error = format!("未知的任务类型: {task_type}");
                return Ok(Some(self.reject(state, &description, error)));
            }
        };

        if let Some(subtask) = state.current_subtask_mut() {
            subtask.status = SubtaskStatus::Running;
            subtask.attempts += 1;
        }
        let params = enrich_params(state, &task_type, params);
        let start = Instant::now();
        let invoked = self.tools.invoke(tool_name, params).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match invoked {
            Ok(result) if result.success => {
                let data = result.data.unwrap_or_default();
                let payload = ToolPayload::parse(&task_type, &data);
                state.collected_data.extend(payload.evidence().iter().cloned());
                for keyword in payload.discovered_keywords() {
                    state.add_discovered_keyword(keyword);
                }
                let step = ThoughtStep::new(phase, format!("执行子任务: {description}"))
                    .with_action(tool_name)
                    .with_observation(payload.observation())
                    .with_tokens(result.tokens_used)
                    .with_duration_ms(duration_ms);
                let step = state.push_thought(step).clone();
                Ok(Some(ExecutionOutcome::succeeded(step, data)))
            }
            Ok(result) => {
                let error = result.error.unwrap_or_else(|| "工具执行失败".to_string());
                let step = self.fail(state, phase, &description, &error, result.tokens_used, duration_ms);
                Ok(Some(ExecutionOutcome::failed(step, error)))
            }
            Err(e) => {
                self.fail(state, phase, &description, &e.to_string(), 0, duration_ms);
                Err(e)
            }
        }
    }

    fn fail(
        &self,
        state: &mut RunState,
        phase: AgentPhase,
        description: &str,
        error: &str,
        tokens: u64,
        duration_ms: u64,
    ) -> ThoughtStep {
        // 同一子任务的重试失败只记一次错误
        let first_failure = match state.current_subtask_mut() {
            Some(subtask) => {
                subtask.status = SubtaskStatus::Failed;
                subtask.attempts <= 1
            }
            None => true,
        };
        if first_failure {
            state.record_error();
        }
        tracing::warn!(task = %description, error = %error, "subtask failed");
        let step = ThoughtStep::new(phase, format!("子任务执行失败: {description}"))
            .with_action("error")
            .with_observation(truncate_chars(error, 200))
            .with_tokens(tokens)
            .with_duration_ms(duration_ms);
        state.push_thought(step).clone()
    }

    /// 无法分派的子任务：不调用任何工具
    fn reject(&self, state: &mut RunState, description: &str, error: String) -> ExecutionOutcome {
        let step = self.fail(state, AgentPhase::Executing, description, &error, 0, 0);
        ExecutionOutcome::failed(step, error)
    }
}

/// 按任务类型补全参数：缺失的查询、证据、原始命令与此前的分析结果
pub fn enrich_params(state: &RunState, task_type: &TaskType, mut params: Params) -> Params {
    let evidence = || Value::Array(state.collected_data.iter().map(|e| Value::Object(e.0.clone())).collect());

    match task_type {
        TaskType::Search | TaskType::MemorySearch => {
            params
                .entry("query")
                .or_insert_with(|| json!(state.original_command));
        }
        TaskType::Analyze => {
            params.entry("data").or_insert_with(evidence);
        }
        TaskType::Synthesize => {
            // 以本次运行的实际数据为准，覆盖计划里给出的同名参数
            params.insert("collected_data".to_string(), evidence());
            params.insert("original_command".to_string(), json!(state.original_command));
            let mut merged = Map::new();
            for subtask in state.subtasks.iter().filter(|t| {
                t.task_type == TaskType::Analyze && t.status == SubtaskStatus::Completed
            }) {
                if let Some(result) = &subtask.result {
                    merged.extend(result.clone());
                }
            }
            params.insert("analysis_results".to_string(), Value::Object(merged));
        }
        TaskType::Other(_) => {}
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::core::{ErrorKind, Evidence, ToolError};
    use crate::tools::{ParamType, PlatformSearchTool, Tool, ToolParameter, ToolRegistry, ToolResult};

    /// 记录收到的参数并按预设返回
    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        seen: Mutex<Vec<Params>>,
        calls: AtomicUsize,
        mode: &'static str,
    }

    #[async_trait]
    impl Tool for Recorder {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "recorder"
        }
        fn parameters(&self) -> Vec<ToolParameter> {
            vec![ToolParameter::optional("query", ParamType::String, "q")]
        }
        async fn execute(&self, params: Params) -> Result<ToolResult, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(params);
            match self.mode {
                "fail" => Ok(ToolResult::fail("quota exceeded")),
                "throw" => Err(ToolError::new(ErrorKind::Network, "connection reset")),
                _ => Ok(ToolResult::ok(
                    json!({"main_points": ["a"], "sentiment": "positive"})
                        .as_object()
                        .cloned()
                        .unwrap(),
                )),
            }
        }
    }

    fn corpus() -> Vec<Evidence> {
        serde_json::from_value(json!([
            {"platform": "zhihu", "id": "z1", "title": "DeepSeek 发布新模型", "content": "DeepSeek-V3 开源", "keywords": ["DeepSeek-V3"]},
            {"platform": "wechat", "id": "w1", "title": "DeepSeek 融资传闻", "content": "估值上涨"}
        ]))
        .unwrap()
    }

    fn executor_with(tools: Vec<Arc<dyn Tool>>) -> TaskExecutor {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register_arc(tool);
        }
        TaskExecutor::new(ToolExecutor::with_timeout(registry, Duration::from_secs(5)))
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_search_merges_evidence_and_keywords() {
        let exec = executor_with(vec![Arc::new(PlatformSearchTool::new(corpus()))]);
        let mut state = RunState::new("DeepSeek");
        state.add_subtask("search", TaskType::Search, obj(json!({"platforms": ["zhihu", "wechat"]})));

        let outcome = exec.execute_current(&mut state).await.unwrap().unwrap();
        assert!(outcome.success);
        assert_eq!(state.collected_data.len(), 2);
        assert_eq!(state.discovered_keywords(), ["DeepSeek-V3".to_string()]);
        assert_eq!(outcome.step.phase, AgentPhase::Searching);
        assert!(outcome.step.observation.as_deref().unwrap().contains("DeepSeek-V3"));
        // 游标不由执行器推进
        assert_eq!(state.current_subtask_index(), 0);
        assert_eq!(state.subtasks[0].status, SubtaskStatus::Running);
    }

    #[tokio::test]
    async fn test_unknown_task_type_is_recorded_not_thrown() {
        let exec = executor_with(vec![]);
        let mut state = RunState::new("cmd");
        state.add_subtask("scrape", TaskType::from("scrape"), Map::new());
        state.add_subtask("search", TaskType::Search, Map::new());

        let outcome = exec.execute_current(&mut state).await.unwrap().unwrap();
        assert!(!outcome.success);
        assert_eq!(state.error_count(), 1);
        assert_eq!(state.subtasks[0].status, SubtaskStatus::Failed);
        assert!(!outcome.step.to_event().is_terminal());

        // 工具未注册同样只记错误
        state.complete_current_subtask_failed("unknown");
        let outcome = exec.execute_current(&mut state).await.unwrap().unwrap();
        assert!(outcome.error.unwrap().contains("platform_search"));
        assert_eq!(state.error_count(), 2);
    }

    #[tokio::test]
    async fn test_tool_reported_failure_does_not_advance() {
        let tool = Arc::new(Recorder {
            name: "analyze",
            mode: "fail",
            ..Default::default()
        });
        let exec = executor_with(vec![tool.clone()]);
        let mut state = RunState::new("cmd");
        state.add_subtask("analyze", TaskType::Analyze, Map::new());

        let outcome = exec.execute_current(&mut state).await.unwrap().unwrap();
        assert_eq!(outcome.error.as_deref(), Some("quota exceeded"));
        assert_eq!(state.current_subtask_index(), 0);
        assert_eq!(state.subtasks[0].status, SubtaskStatus::Failed);
        assert_eq!(state.error_count(), 1);
        assert_eq!(state.thought_chain.last().unwrap().action.as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn test_thrown_fault_is_propagated() {
        let tool = Arc::new(Recorder {
            name: "analyze",
            mode: "throw",
            ..Default::default()
        });
        let exec = executor_with(vec![tool]);
        let mut state = RunState::new("cmd");
        state.add_subtask("analyze", TaskType::Analyze, Map::new());

        let err = exec.execute_current(&mut state).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Network));
        assert_eq!(state.error_count(), 1);
        assert_eq!(state.thought_chain.len(), 1);
        assert_eq!(state.current_subtask_index(), 0);
    }

    #[tokio::test]
    async fn test_retried_fault_counts_once_per_subtask() {
        let tool = Arc::new(Recorder {
            name: "analyze",
            mode: "throw",
            ..Default::default()
        });
        let exec = executor_with(vec![tool.clone()]);
        let mut state = RunState::new("cmd");
        state.add_subtask("analyze", TaskType::Analyze, Map::new());

        for _ in 0..3 {
            assert!(exec.execute_current(&mut state).await.is_err());
        }
        assert_eq!(tool.calls.load(Ordering::SeqCst), 3);
        assert_eq!(state.subtasks[0].attempts, 3);
        assert_eq!(state.error_count(), 1);
        // 每次失败仍各自留下一步
        assert_eq!(state.thought_chain.len(), 3);

        // 下一个子任务重新计数
        state.complete_current_subtask_failed("network");
        state.add_subtask("analyze again", TaskType::Analyze, Map::new());
        assert!(exec.execute_current(&mut state).await.is_err());
        assert_eq!(state.error_count(), 2);
    }

    #[tokio::test]
    async fn test_synthesize_overrides_planned_inputs() {
        let synth = Arc::new(Recorder {
            name: "synthesize",
            ..Default::default()
        });
        let exec = executor_with(vec![synth.clone()]);
        let mut state = RunState::new("追踪 DeepSeek");
        state.collected_data = corpus();
        state.add_subtask(
            "synthesize",
            TaskType::Synthesize,
            obj(json!({
                "collected_data": [],
                "original_command": "旧命令",
                "analysis_results": {"main_points": ["过期"]},
                "format": "brief"
            })),
        );

        exec.execute_current(&mut state).await.unwrap().unwrap();
        let seen = synth.seen.lock().unwrap();
        let params = &seen[0];
        assert_eq!(params["collected_data"].as_array().unwrap().len(), 2);
        assert_eq!(params["original_command"], json!("追踪 DeepSeek"));
        assert_eq!(params["analysis_results"], json!({}));
        assert_eq!(params["format"], json!("brief"));
    }

    #[tokio::test]
    async fn test_synthesize_receives_evidence_and_prior_analysis() {
        let synth = Arc::new(Recorder {
            name: "synthesize",
            ..Default::default()
        });
        let exec = executor_with(vec![synth.clone()]);
        let mut state = RunState::new("追踪 DeepSeek");
        state.collected_data = corpus();
        state.add_subtask("analyze", TaskType::Analyze, Map::new());
        state.complete_current_subtask(Some(obj(json!({"main_points": ["开源"]}))));
        state.add_subtask("synthesize", TaskType::Synthesize, Map::new());

        exec.execute_current(&mut state).await.unwrap().unwrap();
        let seen = synth.seen.lock().unwrap();
        let params = &seen[0];
        assert_eq!(params["collected_data"].as_array().unwrap().len(), 2);
        assert_eq!(params["original_command"], json!("追踪 DeepSeek"));
        assert_eq!(params["analysis_results"]["main_points"], json!(["开源"]));
    }

    #[tokio::test]
    async fn test_non_search_results_are_not_evidence() {
        let tool = Arc::new(Recorder {
            name: "memory_search",
            ..Default::default()
        });
        let exec = executor_with(vec![tool.clone()]);
        let mut state = RunState::new("DeepSeek");
        state.add_subtask("memory", TaskType::MemorySearch, Map::new());

        let outcome = exec.execute_current(&mut state).await.unwrap().unwrap();
        assert!(outcome.success);
        assert!(state.collected_data.is_empty());
        assert_eq!(tool.seen.lock().unwrap()[0]["query"], json!("DeepSeek"));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    }
}

//! 编排器集成测试：完整运行、故障恢复、熔断切换、取消

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;

use scout::config::AppConfig;
use scout::core::{
    AgentPhase, Evidence, RunState, SelfHealer, StepEvent, SubtaskStatus, TaskType, ToolError,
};
use scout::llm::{Completion, CompletionRequest, LlmClient, LlmError, MockLlmClient};
use scout::research::{Critic, Planner, SearchExpander, TaskExecutor};
use scout::tools::{
    MemoryStore, ParamType, Params, Tool, ToolExecutor, ToolParameter, ToolResult,
};
use scout::{Orchestrator, OrchestratorBuilder};

fn corpus() -> Vec<Evidence> {
    vec![
        Evidence::new("zhihu")
            .with("id", "z1")
            .with("title", "如何评价 DeepSeek R1")
            .with("content", "DeepSeek R1 在推理任务上表现突出，采用 MoE 架构，训练成本较低。")
            .with("author", "研究员")
            .with("url", "https://www.zhihu.com/question/1")
            .with("published_at", "2026-10-01")
            .with("likes", 1200)
            .with("keywords", json!(["DeepSeek R1", "MoE"])),
        Evidence::new("wechat")
            .with("id", "w1")
            .with("title", "DeepSeek 开源路线图")
            .with("content", "DeepSeek 持续开源模型权重，社区活跃度很高，企业落地案例增多。")
            .with("author", "AI 前线")
            .with("url", "https://mp.weixin.qq.com/s/1")
            .with("published_at", "2026-10-02")
            .with("reads", 30000)
            .with("keywords", json!(["开源"])),
    ]
}

fn orchestrator(builder: OrchestratorBuilder) -> Arc<Orchestrator> {
    Arc::new(builder.build().unwrap())
}

fn base_builder(llm: MockLlmClient) -> OrchestratorBuilder {
    OrchestratorBuilder::new(AppConfig::default()).with_llm(Arc::new(llm))
}

fn actions(events: &[StepEvent]) -> Vec<&str> {
    events.iter().filter_map(|e| e.action.as_deref()).collect()
}

fn assert_single_terminal(events: &[StepEvent]) {
    let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminal.len(), 1, "events: {:?}", actions(events));
    assert!(events.last().unwrap().is_terminal());
}

fn search_results(params: &Params, corpus: &[Evidence]) -> ToolResult {
    let platforms: Vec<&str> = params
        .get("platforms")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let results: Vec<&Evidence> = corpus
        .iter()
        .filter(|e| platforms.is_empty() || platforms.contains(&e.platform()))
        .collect();
    let mut data = Map::new();
    data.insert("total".to_string(), json!(results.len()));
    data.insert("results".to_string(), json!(results));
    data.insert("discovered_keywords".to_string(), json!([]));
    ToolResult::ok(data)
}

fn search_parameters() -> Vec<ToolParameter> {
    vec![ToolParameter::required("query", ParamType::String, "搜索关键词")]
}

/// 第一次调用抛出超时故障，之后正常返回
struct FlakySearch {
    calls: AtomicUsize,
}

#[async_trait]
impl Tool for FlakySearch {
    fn name(&self) -> &str {
        "platform_search"
    }

    fn description(&self) -> &str {
        "flaky search"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        search_parameters()
    }

    async fn execute(&self, params: Params) -> Result<ToolResult, ToolError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ToolError::external("connection timeout"));
        }
        Ok(search_results(&params, &corpus()))
    }
}

/// 在 zhihu 上总是抛出未分类故障
struct BrokenZhihu;

#[async_trait]
impl Tool for BrokenZhihu {
    fn name(&self) -> &str {
        "platform_search"
    }

    fn description(&self) -> &str {
        "zhihu is down"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        search_parameters()
    }

    async fn execute(&self, params: Params) -> Result<ToolResult, ToolError> {
        let on_zhihu = params
            .get("platforms")
            .and_then(Value::as_array)
            .is_some_and(|a| a.iter().any(|p| p == "zhihu"));
        if on_zhihu {
            return Err(ToolError::external("something odd happened"));
        }
        Ok(search_results(&params, &corpus()))
    }
}

/// 前几次调用抛出网络故障，之后正常返回
struct UnstableNetworkSearch {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl Tool for UnstableNetworkSearch {
    fn name(&self) -> &str {
        "platform_search"
    }

    fn description(&self) -> &str {
        "unstable network"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        search_parameters()
    }

    async fn execute(&self, params: Params) -> Result<ToolResult, ToolError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(ToolError::external("connection reset by peer"));
        }
        Ok(search_results(&params, &corpus()))
    }
}

/// 子任务搜索正常并发现新关键词；追加搜索（不带 platforms）为空或抛错
struct ExpansionSearch {
    expansion_throws: bool,
    expansion_calls: AtomicUsize,
}

#[async_trait]
impl Tool for ExpansionSearch {
    fn name(&self) -> &str {
        "platform_search"
    }

    fn description(&self) -> &str {
        "expansion search"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        search_parameters()
    }

    async fn execute(&self, params: Params) -> Result<ToolResult, ToolError> {
        if params.contains_key("platforms") {
            let mut data = search_results(&params, &corpus()).data.unwrap_or_default();
            data.insert("discovered_keywords".to_string(), json!(["MoE 架构"]));
            return Ok(ToolResult::ok(data));
        }
        self.expansion_calls.fetch_add(1, Ordering::SeqCst);
        if self.expansion_throws {
            return Err(ToolError::external("search backend unavailable"));
        }
        let mut data = Map::new();
        data.insert("total".to_string(), json!(0));
        data.insert("results".to_string(), json!([]));
        data.insert("discovered_keywords".to_string(), json!([]));
        Ok(ToolResult::ok(data))
    }
}

/// 被调用后通知测试，然后永不返回
struct HangingLlm {
    entered: Arc<Notify>,
}

#[async_trait]
impl LlmClient for HangingLlm {
    async fn generate(&self, _request: &CompletionRequest) -> Result<Completion, LlmError> {
        self.entered.notify_one();
        std::future::pending::<()>().await;
        Err(LlmError::EmptyResponse)
    }
}

/// 被调用后通知测试，然后一直挂起
struct HangingSearch {
    entered: Arc<Notify>,
}

#[async_trait]
impl Tool for HangingSearch {
    fn name(&self) -> &str {
        "platform_search"
    }

    fn description(&self) -> &str {
        "never returns"
    }

    async fn execute(&self, _params: Params) -> Result<ToolResult, ToolError> {
        self.entered.notify_one();
        std::future::pending::<()>().await;
        Ok(ToolResult::fail("unreachable"))
    }
}

#[tokio::test]
async fn test_fallback_plan_runs_to_completion() {
    let orchestrator = orchestrator(base_builder(MockLlmClient::new()).with_corpus(corpus()));
    let (state, events) = orchestrator
        .run_to_completion("监控 DeepSeek 的最新动态")
        .await
        .unwrap();

    assert_eq!(state.current_phase, AgentPhase::Completed);
    let types: Vec<&TaskType> = state.subtasks.iter().map(|s| &s.task_type).collect();
    assert_eq!(
        types,
        [&TaskType::Search, &TaskType::Search, &TaskType::Analyze, &TaskType::Synthesize]
    );
    assert!(state
        .subtasks
        .iter()
        .all(|s| s.status == SubtaskStatus::Completed));
    assert_eq!(state.current_subtask_index(), 4);
    assert!(!state.collected_data.is_empty());
    assert!(state.quality_scores.contains_key("overall"));
    assert!(state.quality_scores.contains_key("credibility"));

    let acts = actions(&events);
    assert_eq!(acts[0], "receive_command");
    assert_eq!(acts[1], "fallback_plan");
    assert!(acts.contains(&"critique"));
    assert!(acts.contains(&"expansion_analysis"));
    assert_eq!(*acts.last().unwrap(), "complete");
    assert_single_terminal(&events);

    // 事件与思维链一一对应
    assert_eq!(events.len(), state.thought_chain.len());
    assert!(state.expansion_count() <= state.limits.max_expansions);
    assert!(state.current_step() <= state.limits.max_steps + 1);
}

#[tokio::test]
async fn test_empty_evidence_skips_critique() {
    let orchestrator = orchestrator(base_builder(MockLlmClient::new()).with_corpus(Vec::new()));
    let (state, events) = orchestrator.run_to_completion("DeepSeek").await.unwrap();

    assert_eq!(state.current_phase, AgentPhase::Completed);
    assert!(state.collected_data.is_empty());
    assert!(state.quality_scores.is_empty());
    let acts = actions(&events);
    assert!(!acts.contains(&"critique"));
    assert!(!acts.contains(&"recursive_expand"));
    assert_single_terminal(&events);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fault_is_retried_with_backoff() {
    let tool = Arc::new(FlakySearch {
        calls: AtomicUsize::new(0),
    });
    let orchestrator = orchestrator(base_builder(MockLlmClient::new()).with_tool(tool.clone()));

    let started = tokio::time::Instant::now();
    let (state, events) = orchestrator.run_to_completion("DeepSeek").await.unwrap();

    assert_eq!(state.current_phase, AgentPhase::Completed);
    assert!(started.elapsed() >= std::time::Duration::from_millis(1000));
    assert_eq!(state.error_count(), 1);
    assert_eq!(state.subtasks[0].status, SubtaskStatus::Completed);

    let acts = actions(&events);
    let error_at = acts.iter().position(|a| *a == "error").unwrap();
    assert_eq!(acts[error_at + 1], "retry_backoff");
    assert_eq!(acts[error_at + 2], "platform_search");
    let recovery = &events[error_at + 1];
    assert_eq!(recovery.phase, AgentPhase::Recovering);
    assert_eq!(recovery.observation.as_deref(), Some("等待 1000ms 后重试"));
}

#[tokio::test]
async fn test_open_breaker_switches_platform() {
    let plan = json!({
        "analysis": "三次知乎搜索",
        "tasks": [
            {"description": "知乎搜索一", "task_type": "search", "parameters": {"query": "DeepSeek", "platforms": ["zhihu"]}},
            {"description": "知乎搜索二", "task_type": "search", "parameters": {"query": "DeepSeek", "platforms": ["zhihu"]}},
            {"description": "知乎搜索三", "task_type": "search", "parameters": {"query": "DeepSeek", "platforms": ["zhihu"]}},
            {"description": "生成摘要", "task_type": "synthesize", "parameters": {}}
        ]
    });
    let mut config = AppConfig::default();
    config.run.max_steps = 50;
    config.run.max_expansions = 0;
    config.run.max_errors = 10;
    let builder = OrchestratorBuilder::new(config)
        .with_llm(Arc::new(MockLlmClient::new().with_reply(plan.to_string())))
        .with_tool(Arc::new(BrokenZhihu));
    let orchestrator = orchestrator(builder);

    let (state, events) = orchestrator.run_to_completion("DeepSeek").await.unwrap();

    assert_eq!(state.current_phase, AgentPhase::Completed);
    let statuses: Vec<SubtaskStatus> = state.subtasks.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        [
            SubtaskStatus::Failed,
            SubtaskStatus::Failed,
            SubtaskStatus::Completed,
            SubtaskStatus::Completed
        ]
    );
    assert_eq!(state.subtasks[2].parameters["platforms"], json!(["wechat"]));
    assert!(state.collected_data.iter().all(|e| e.platform() == "wechat"));

    let acts = actions(&events);
    assert_eq!(acts.iter().filter(|a| **a == "skip_subtask").count(), 2);
    assert!(acts.contains(&"switch_platform"));
    assert!(orchestrator.healer().is_circuit_open("zhihu"));
    assert_single_terminal(&events);
}

#[tokio::test]
async fn test_cancel_while_tool_runs() {
    let entered = Arc::new(Notify::new());
    let tool = Arc::new(HangingSearch {
        entered: entered.clone(),
    });
    let orchestrator = orchestrator(base_builder(MockLlmClient::new()).with_tool(tool));

    let handle = orchestrator.run("DeepSeek");
    entered.notified().await;
    handle.cancel();

    let events: Vec<StepEvent> = handle.into_stream().collect().await;
    let last = events.last().unwrap();
    assert_eq!(last.action.as_deref(), Some("cancelled"));
    assert_eq!(last.phase, AgentPhase::Failed);
    assert_single_terminal(&events);
}

#[tokio::test]
async fn test_join_returns_final_state() {
    let orchestrator = orchestrator(base_builder(MockLlmClient::new()).with_corpus(corpus()));
    let handle = orchestrator.run("DeepSeek 开源");
    let task_id = handle.task_id().to_string();
    let state: RunState = handle.join().await.unwrap();

    assert_eq!(state.task_id, task_id);
    let summary = state.to_summary();
    assert_eq!(summary.task_id, task_id);
    assert_eq!(summary.data_collected, state.collected_data.len());
}

#[tokio::test]
async fn test_error_budget_exhaustion_fails_run() {
    let mut config = AppConfig::default();
    config.run.max_errors = 1;
    let orchestrator = orchestrator(
        OrchestratorBuilder::new(config)
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_tool(Arc::new(BrokenZhihu)),
    );

    let (state, events) = orchestrator.run_to_completion("DeepSeek").await.unwrap();

    assert_eq!(state.current_phase, AgentPhase::Failed);
    assert_eq!(events.last().unwrap().action.as_deref(), Some("fail"));
    assert_single_terminal(&events);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_network_faults_count_once() {
    let tool = Arc::new(UnstableNetworkSearch {
        failures: 3,
        calls: AtomicUsize::new(0),
    });
    let orchestrator = orchestrator(base_builder(MockLlmClient::new()).with_tool(tool.clone()));
    assert_eq!(orchestrator.limits().max_errors, 3);

    let (state, events) = orchestrator.run_to_completion("DeepSeek").await.unwrap();

    assert_eq!(state.current_phase, AgentPhase::Completed);
    assert_eq!(state.error_count(), 1);
    assert_eq!(state.subtasks[0].status, SubtaskStatus::Completed);
    assert_eq!(state.subtasks[0].attempts, 4);
    assert!(tool.calls.load(Ordering::SeqCst) >= 4);

    let acts = actions(&events);
    assert_eq!(acts.iter().filter(|a| **a == "retry_backoff").count(), 3);
    assert!(!acts.contains(&"skip_subtask"));
    assert_eq!(*acts.last().unwrap(), "complete");
    assert_single_terminal(&events);
}

#[tokio::test]
async fn test_exhausted_budget_skips_without_recovery() {
    let mut config = AppConfig::default();
    config.run.max_errors = 1;
    let orchestrator = orchestrator(
        OrchestratorBuilder::new(config)
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_tool(Arc::new(UnstableNetworkSearch {
                failures: usize::MAX,
                calls: AtomicUsize::new(0),
            })),
    );

    let (state, events) = orchestrator.run_to_completion("DeepSeek").await.unwrap();

    assert_eq!(state.current_phase, AgentPhase::Failed);
    let skip = events
        .iter()
        .find(|e| e.action.as_deref() == Some("skip_subtask"))
        .unwrap();
    assert_eq!(skip.observation.as_deref(), Some("运行预算已用尽，放弃恢复"));
    assert_eq!(state.subtasks[0].attempts, 1);
    assert_single_terminal(&events);
}

#[tokio::test]
async fn test_empty_expansion_search_completes() {
    let tool = Arc::new(ExpansionSearch {
        expansion_throws: false,
        expansion_calls: AtomicUsize::new(0),
    });
    let orchestrator = orchestrator(base_builder(MockLlmClient::new()).with_tool(tool.clone()));

    let (state, events) = orchestrator.run_to_completion("DeepSeek").await.unwrap();

    assert_eq!(state.current_phase, AgentPhase::Completed);
    let acts = actions(&events);
    let expansions = tool.expansion_calls.load(Ordering::SeqCst);
    assert!(expansions >= 1);
    assert_eq!(acts.iter().filter(|a| **a == "recursive_expand").count(), expansions);
    assert_eq!(acts.iter().filter(|a| **a == "expand_empty").count(), expansions);
    assert!(!acts.contains(&"expand_search"));
    let empty = events
        .iter()
        .find(|e| e.action.as_deref() == Some("expand_empty"))
        .unwrap();
    assert_eq!(empty.observation.as_deref(), Some("新增 0 条结果"));
    assert_eq!(*acts.last().unwrap(), "complete");
    assert_single_terminal(&events);
}

#[tokio::test]
async fn test_failing_expansion_search_does_not_count_as_error() {
    let tool = Arc::new(ExpansionSearch {
        expansion_throws: true,
        expansion_calls: AtomicUsize::new(0),
    });
    let orchestrator = orchestrator(base_builder(MockLlmClient::new()).with_tool(tool.clone()));

    let (state, events) = orchestrator.run_to_completion("DeepSeek").await.unwrap();

    assert_eq!(state.current_phase, AgentPhase::Completed);
    assert_eq!(state.error_count(), 0);
    let acts = actions(&events);
    let expansions = tool.expansion_calls.load(Ordering::SeqCst);
    assert!(expansions >= 1);
    assert_eq!(acts.iter().filter(|a| **a == "recursive_expand").count(), expansions);
    assert_eq!(acts.iter().filter(|a| **a == "expand_error").count(), expansions);
    let failed = events
        .iter()
        .find(|e| e.action.as_deref() == Some("expand_error"))
        .unwrap();
    assert_eq!(failed.phase, AgentPhase::Expanding);
    assert!(failed
        .observation
        .as_deref()
        .unwrap()
        .contains("search backend unavailable"));
    assert_eq!(*acts.last().unwrap(), "complete");
    assert_single_terminal(&events);
}

#[tokio::test]
async fn test_cancel_while_critic_llm_hangs() {
    let entered = Arc::new(Notify::new());
    let hanging: Arc<dyn LlmClient> = Arc::new(HangingLlm {
        entered: entered.clone(),
    });
    let mock: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new());

    let registry = OrchestratorBuilder::new(AppConfig::default())
        .with_corpus(corpus())
        .build_tool_registry(Arc::clone(&mock), Arc::new(MemoryStore::new()))
        .unwrap();
    let orchestrator = Arc::new(Orchestrator::new(
        Planner::new(mock),
        TaskExecutor::new(ToolExecutor::new(registry, 30)),
        Critic::new().with_llm(Arc::clone(&hanging)),
        SearchExpander::default().with_llm(hanging),
        Arc::new(SelfHealer::default()),
    ));

    let handle = orchestrator.run("DeepSeek");
    entered.notified().await;
    handle.cancel();

    let events: Vec<StepEvent> = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        handle.into_stream().collect::<Vec<StepEvent>>(),
    )
    .await
    .expect("run should stop once cancelled");
    let acts = actions(&events);
    // 子任务都已执行完，停在评估或扩展的 LLM 调用上
    assert!(acts.contains(&"synthesize"));
    assert!(!acts.contains(&"complete"));
    let last = events.last().unwrap();
    assert_eq!(last.action.as_deref(), Some("cancelled"));
    assert_eq!(last.phase, AgentPhase::Failed);
    assert_single_terminal(&events);
}

//! Planner：把自然语言调研命令分解为有序子任务
//!
//! 低温度调用 LLM，把回复解析为 PlanResponse（```json 代码块、普通代码块或裸 JSON 均可）。
//! LLM 失败、超时、无法解析或给出空计划时，当场退回关键词启发式的兜底计划，不在内部重试。
//! 无论走哪条路径，都只追加一个思维步骤，记录子任务数量。

use std::sync::Arc;
use std::time::{Duration, Instant};

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::core::{AgentError, AgentPhase, RunState, TaskType, ThoughtStep};
use crate::llm::{CompletionRequest, LlmClient, LlmError};
use crate::text::{extract_json, extract_keywords, truncate_chars};

const PLANNER_SYSTEM_PROMPT: &str = "你是一个专业的 AI 情报分析任务规划器。你的职责是将用户的调研命令分解为具体的可执行子任务。

## 你可以规划的任务类型：
1. **search** - 在平台上搜索内容
   - platforms: 要搜索的平台列表 (wechat, zhihu, xiaohongshu, douyin)
   - query: 搜索关键词
   - time_range: 时间范围 (1d, 7d, 30d)

2. **analyze** - 分析收集到的数据
   - analysis_type: sentiment（情感分析）, summary（摘要）, extract_entities（实体提取）

3. **memory_search** - 搜索历史情报库
   - query: 搜索查询
   - detect_changes: 是否检测时间线变化

4. **synthesize** - 综合所有数据生成报告

## 规划原则：
1. 每个任务应该具体、可执行
2. 搜索任务应覆盖多个相关平台
3. 分析任务应在搜索任务之后
4. 最后一个任务应该是 synthesize（综合）
5. 控制任务数量在 3-6 个之间

请以 JSON 格式返回任务列表。";

/// 规划结果（LLM 输出格式，同时用于生成注入 prompt 的 JSON Schema）
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PlanResponse {
    /// 对用户命令的简要分析
    #[serde(default)]
    pub analysis: String,
    pub tasks: Vec<PlannedTask>,
}

/// 单个计划任务
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PlannedTask {
    pub description: String,
    /// search | analyze | memory_search | synthesize
    pub task_type: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl PlannedTask {
    fn new(description: impl Into<String>, task_type: TaskType, parameters: Value) -> Self {
        Self {
            description: description.into(),
            task_type: task_type.into(),
            parameters: parameters.as_object().cloned().unwrap_or_default(),
        }
    }
}

/// Planner 参数
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    /// 计划的最大子任务数（含 synthesize）
    pub max_tasks: usize,
    /// 兜底计划搜索的平台（取前两个）
    pub default_platforms: Vec<String>,
    /// 单次 LLM 调用超时
    pub timeout: Duration,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 2048,
            max_tasks: 6,
            default_platforms: vec!["zhihu".to_string(), "wechat".to_string()],
            timeout: Duration::from_secs(60),
        }
    }
}

/// 返回 PlanResponse 的 JSON Schema 字符串，拼入 prompt
pub fn plan_schema_json() -> String {
    let schema = schema_for!(PlanResponse);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 解析 LLM 回复为 PlanResponse
pub fn parse_plan(text: &str) -> Result<PlanResponse, AgentError> {
    let json_str = extract_json(text).unwrap_or(text.trim());
    serde_json::from_str(json_str)
        .map_err(|e| AgentError::JsonParse(format!("{}: {}", e, truncate_chars(json_str, 120))))
}

/// Planner：持有 LLM 与参数
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self::with_config(llm, PlannerConfig::default())
    }

    pub fn with_config(llm: Arc<dyn LlmClient>, config: PlannerConfig) -> Self {
        Self { llm, config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// 为 state.original_command 生成计划并追加到 state；返回子任务数量
    pub async fn plan(&self, state: &mut RunState) -> usize {
        let start = Instant::now();
        let (result, tokens) = self.request_plan(&state.original_command).await;

        let (plan, error) = match result {
            Ok(plan) if !plan.tasks.is_empty() => (Some(plan), None),
            Ok(_) => (None, Some("规划结果为空".to_string())),
            Err(e) => (None, Some(e.to_string())),
        };

        match plan {
            Some(plan) => {
                let tasks = self.normalize(plan.tasks);
                let count = tasks.len();
                let names: Vec<String> = tasks.iter().map(|t| t.description.clone()).collect();
                for task in tasks {
                    state.add_subtask(task.description, TaskType::from(task.task_type), task.parameters);
                }
                let analysis = if plan.analysis.is_empty() {
                    state.original_command.clone()
                } else {
                    plan.analysis
                };
                state.push_thought(
                    ThoughtStep::new(
                        AgentPhase::Planning,
                        format!("任务分析: {}", truncate_chars(&analysis, 100)),
                    )
                    .with_action("decompose_task")
                    .with_observation(format!("创建了 {count} 个子任务: {}", names.join("; ")))
                    .with_tokens(tokens)
                    .with_duration_ms(start.elapsed().as_millis() as u64),
                );
                tracing::info!(tasks = count, "plan created");
                count
            }
            None => {
                let reason = error.unwrap_or_default();
                tracing::warn!(reason = %reason, "planning failed, using fallback plan");
                let tasks = self.fallback_tasks(&state.original_command);
                let count = tasks.len();
                for task in tasks {
                    state.add_subtask(task.description, TaskType::from(task.task_type), task.parameters);
                }
                state.push_thought(
                    ThoughtStep::new(AgentPhase::Planning, "规划任务时遇到问题，使用默认计划")
                        .with_action("fallback_plan")
                        .with_observation(format!(
                            "创建了 {count} 个默认子任务（原因: {}）",
                            truncate_chars(&reason, 80)
                        ))
                        .with_tokens(tokens)
                        .with_duration_ms(start.elapsed().as_millis() as u64),
                );
                count
            }
        }
    }

    /// 调用 LLM 并解析；返回解析结果与消耗的 token（解析失败时 token 仍计入）
    async fn request_plan(&self, command: &str) -> (Result<PlanResponse, AgentError>, u64) {
        let prompt = format!(
            "请为以下调研命令创建执行计划：\n\n命令: {command}\n\n\
             请分析这个命令，并返回一个 JSON 格式的任务计划。\n\
             确保任务计划覆盖信息搜集、分析和综合三个阶段。\n\n\
             返回内容必须符合以下 JSON Schema：\n{}",
            plan_schema_json()
        );
        let request = CompletionRequest::new(prompt)
            .with_system(PLANNER_SYSTEM_PROMPT)
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens);

        let completion = match tokio::time::timeout(self.config.timeout, self.llm.generate(&request)).await {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => return (Err(e.into()), 0),
            Err(_) => return (Err(LlmError::Timeout.into()), 0),
        };
        (parse_plan(&completion.text), completion.total_tokens())
    }

    /// 截断到 max_tasks，并保证最后一个是 synthesize
    fn normalize(&self, mut tasks: Vec<PlannedTask>) -> Vec<PlannedTask> {
        let max = self.config.max_tasks.max(1);
        tasks.truncate(max);
        let ends_with_synthesize = tasks
            .last()
            .map(|t| TaskType::from(t.task_type.as_str()) == TaskType::Synthesize)
            .unwrap_or(false);
        if !ends_with_synthesize {
            tasks.truncate(max - 1);
            tasks.push(PlannedTask::new(
                "综合所有信息生成情报摘要",
                TaskType::Synthesize,
                json!({}),
            ));
        }
        tasks
    }

    /// 兜底计划：两个平台各搜一次首个关键词 -> 摘要分析 -> 综合
    pub fn fallback_tasks(&self, command: &str) -> Vec<PlannedTask> {
        let keywords = extract_keywords(command, 5);
        let query = keywords.first().cloned().unwrap_or_else(|| command.trim().to_string());

        let mut platforms: Vec<&str> = self
            .config
            .default_platforms
            .iter()
            .map(String::as_str)
            .take(2)
            .collect();
        if platforms.is_empty() {
            platforms = vec!["zhihu", "wechat"];
        }

        let mut tasks: Vec<PlannedTask> = platforms
            .iter()
            .map(|p| {
                PlannedTask::new(
                    format!("在{}搜索 '{query}' 相关内容", platform_label(p)),
                    TaskType::Search,
                    json!({ "platforms": [p], "query": query, "time_range": "7d" }),
                )
            })
            .collect();
        tasks.push(PlannedTask::new(
            "分析收集到的内容情感和关键信息",
            TaskType::Analyze,
            json!({ "analysis_type": "summary" }),
        ));
        tasks.push(PlannedTask::new(
            "综合所有信息生成情报摘要",
            TaskType::Synthesize,
            json!({}),
        ));
        tasks
    }
}

fn platform_label(platform: &str) -> &str {
    match platform {
        "zhihu" => "知乎",
        "wechat" => "微信公众号",
        "xiaohongshu" => "小红书",
        "douyin" => "抖音",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SubtaskStatus;
    use crate::llm::MockLlmClient;

    fn planner(mock: MockLlmClient) -> Planner {
        Planner::new(Arc::new(mock))
    }

    #[tokio::test]
    async fn test_fallback_when_llm_unavailable() {
        let planner = planner(MockLlmClient::failing(LlmError::Request("connection refused".into())));
        let mut state = RunState::new("Monitor DeepSeek's latest developments");
        let count = planner.plan(&mut state).await;

        assert_eq!(count, 4);
        let types: Vec<&TaskType> = state.subtasks.iter().map(|t| &t.task_type).collect();
        assert_eq!(
            types,
            [&TaskType::Search, &TaskType::Search, &TaskType::Analyze, &TaskType::Synthesize]
        );
        assert_eq!(state.subtasks[0].parameters["query"], json!("DeepSeek"));
        assert_eq!(state.subtasks[0].parameters["platforms"], json!(["zhihu"]));
        assert_eq!(state.subtasks[1].parameters["platforms"], json!(["wechat"]));
        assert!(state.subtasks.iter().all(|t| t.status == SubtaskStatus::Pending));

        assert_eq!(state.thought_chain.len(), 1);
        assert_eq!(state.thought_chain[0].action.as_deref(), Some("fallback_plan"));
        assert!(state.thought_chain[0].observation.as_deref().unwrap().contains('4'));
    }

    #[tokio::test]
    async fn test_fenced_plan_is_parsed_and_synthesize_appended() {
        let reply = r#"好的，计划如下：
```json
{"analysis": "追踪 Kimi", "tasks": [
  {"description": "搜索知乎", "task_type": "search", "parameters": {"query": "Kimi", "platforms": ["zhihu"]}},
  {"description": "分析", "task_type": "analyze"}
]}
```"#;
        let planner = planner(MockLlmClient::new().with_reply(reply));
        let mut state = RunState::new("追踪 Kimi");
        assert_eq!(planner.plan(&mut state).await, 3);
        assert_eq!(state.subtasks.last().unwrap().task_type, TaskType::Synthesize);
        assert_eq!(state.thought_chain.len(), 1);
        assert_eq!(state.thought_chain[0].action.as_deref(), Some("decompose_task"));
        assert!(state.thought_chain[0].tokens_used > 0);
    }

    #[tokio::test]
    async fn test_unparseable_or_empty_plan_falls_back() {
        for reply in ["I cannot help with that", r#"{"analysis": "x", "tasks": []}"#] {
            let planner = planner(MockLlmClient::new().with_reply(reply));
            let mut state = RunState::new("监控人工智能");
            assert_eq!(planner.plan(&mut state).await, 4);
            assert_eq!(state.thought_chain[0].action.as_deref(), Some("fallback_plan"));
        }
    }

    #[tokio::test]
    async fn test_long_plan_truncated() {
        let tasks: Vec<Value> = (0..10)
            .map(|i| json!({"description": format!("t{i}"), "task_type": "search"}))
            .collect();
        let reply = json!({"analysis": "", "tasks": tasks}).to_string();
        let planner = planner(MockLlmClient::new().with_reply(reply));
        let mut state = RunState::new("cmd");
        assert_eq!(planner.plan(&mut state).await, 6);
        assert_eq!(state.subtasks[5].task_type, TaskType::Synthesize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_timeout_falls_back() {
        struct Hanging;
        #[async_trait::async_trait]
        impl LlmClient for Hanging {
            async fn generate(&self, _r: &CompletionRequest) -> Result<crate::llm::Completion, LlmError> {
                std::future::pending().await
            }
        }
        let planner = Planner::with_config(
            Arc::new(Hanging),
            PlannerConfig {
                timeout: Duration::from_secs(5),
                ..PlannerConfig::default()
            },
        );
        let mut state = RunState::new("Track OpenAI");
        assert_eq!(planner.plan(&mut state).await, 4);
        assert_eq!(state.subtasks[0].parameters["query"], json!("OpenAI"));
    }

    #[test]
    fn test_schema_mentions_tasks() {
        assert!(plan_schema_json().contains("task_type"));
    }
}

//! 编排器：一次运行的主控状态机
//!
//! 顺序：接收命令 -> Planner -> 子任务循环（故障交给 SelfHealer）-> Critic -> 搜索扩展 -> 完成。
//! 运行在独立的 tokio 任务中，思维链的每个新步骤按产生顺序推入有界 mpsc 通道；
//! 调用方通过 RunHandle 消费事件、取消运行或取回最终的 RunState。

use std::sync::Arc;
use std::time::Instant;

use futures_util::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::core::{
    AgentError, AgentPhase, RecoveryAction, RecoveryStrategy, RunLimits, RunState, SelfHealer,
    StepEvent, Subtask, ThoughtStep,
};
use crate::research::{Critic, Planner, SearchExpander, TaskExecutor};
use crate::text::{extract_keywords, truncate_chars};
use crate::tools::payload::parse_search;

/// 扩展搜索使用的工具
const EXPANSION_TOOL: &str = "platform_search";

/// 把思维链中尚未发送的步骤推入事件通道
struct EventSink {
    tx: mpsc::Sender<StepEvent>,
    emitted: usize,
}

impl EventSink {
    async fn flush(&mut self, state: &RunState) -> Result<(), AgentError> {
        while self.emitted < state.thought_chain.len() {
            let event = state.thought_chain[self.emitted].to_event();
            self.emitted += 1;
            self.tx
                .send(event)
                .await
                .map_err(|_| AgentError::StreamClosed)?;
        }
        Ok(())
    }
}

/// 运行句柄：事件接收端 + 取消令牌 + 后台任务
pub struct RunHandle {
    task_id: String,
    events: mpsc::Receiver<StepEvent>,
    cancel: CancellationToken,
    task: JoinHandle<RunState>,
}

impl RunHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// 请求取消；运行在下一个检查点以 cancelled 步骤结束
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 下一个事件；运行结束且事件取完后返回 None
    pub async fn next_event(&mut self) -> Option<StepEvent> {
        self.events.recv().await
    }

    /// 转为事件流（最终的 RunState 随之丢弃）
    pub fn into_stream(self) -> impl Stream<Item = StepEvent> {
        futures_util::stream::unfold(self.events, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }

    /// 丢弃剩余事件并等待运行结束
    pub async fn join(mut self) -> Result<RunState, AgentError> {
        while self.events.recv().await.is_some() {}
        self.task
            .await
            .map_err(|e| AgentError::TaskAborted(e.to_string()))
    }
}

/// 编排器：持有一次运行所需的全部协作者，可被多个并发运行共享
pub struct Orchestrator {
    planner: Planner,
    executor: TaskExecutor,
    critic: Critic,
    expander: SearchExpander,
    healer: Arc<SelfHealer>,
    limits: RunLimits,
    available_platforms: Vec<String>,
    expansion_search_limit: usize,
    event_buffer: usize,
}

impl Orchestrator {
    pub fn new(
        planner: Planner,
        executor: TaskExecutor,
        critic: Critic,
        expander: SearchExpander,
        healer: Arc<SelfHealer>,
    ) -> Self {
        Self {
            planner,
            executor,
            critic,
            expander,
            healer,
            limits: RunLimits::default(),
            available_platforms: ["zhihu", "wechat", "xiaohongshu", "douyin"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            expansion_search_limit: 5,
            event_buffer: 64,
        }
    }

    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_available_platforms(mut self, platforms: Vec<String>) -> Self {
        self.available_platforms = platforms;
        self
    }

    pub fn with_expansion_search_limit(mut self, limit: usize) -> Self {
        self.expansion_search_limit = limit.max(1);
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    pub fn healer(&self) -> &Arc<SelfHealer> {
        &self.healer
    }

    pub fn limits(&self) -> RunLimits {
        self.limits
    }

    /// 在后台任务中启动一次运行
    pub fn run(self: &Arc<Self>, command: impl Into<String>) -> RunHandle {
        let state = RunState::with_limits(command, self.limits);
        let task_id = state.task_id.clone();
        let (tx, rx) = mpsc::channel(self.event_buffer);
        let cancel = CancellationToken::new();

        let orchestrator = Arc::clone(self);
        let token = cancel.clone();
        let span = tracing::info_span!("run", task_id = %task_id);
        let task = tokio::spawn(
            async move {
                let mut state = state;
                orchestrator.drive(&mut state, tx, token).await;
                state
            }
            .instrument(span),
        );

        RunHandle {
            task_id,
            events: rx,
            cancel,
            task,
        }
    }

    /// 运行到结束，返回最终状态与全部事件
    pub async fn run_to_completion(
        self: &Arc<Self>,
        command: impl Into<String>,
    ) -> Result<(RunState, Vec<StepEvent>), AgentError> {
        let mut handle = self.run(command);
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        let state = handle.join().await?;
        Ok((state, events))
    }

    /// 执行整个序列；逃逸到这里的错误只做一次恢复尝试
    async fn drive(&self, state: &mut RunState, tx: mpsc::Sender<StepEvent>, cancel: CancellationToken) {
        let mut sink = EventSink { tx, emitted: 0 };
        let start = Instant::now();
        tracing::info!(command = %state.original_command, "run started");

        match self.execute(state, &mut sink, &cancel).await {
            Ok(()) => {}
            Err(e) if e.is_cancellation() => {
                tracing::info!(reason = %e, "run cancelled");
                state.mark_cancelled();
            }
            Err(e) => {
                tracing::error!(error = %e, "unhandled error in run");
                let mut ctx = self.healer.classify(&e, None);
                let action = self.healer.get_recovery_action(&ctx, &self.available_platforms);
                let result = self.healer.attempt_recovery(&mut ctx, &action).await;
                state.push_thought(
                    ThoughtStep::new(AgentPhase::Recovering, format!("运行异常: {}", truncate_chars(&e.to_string(), 100)))
                        .with_action(action.strategy.as_str())
                        .with_observation(result.message.clone()),
                );
                if result.success {
                    self.finish(state);
                } else {
                    state.mark_failed(&e.to_string());
                }
            }
        }

        // 消费端已关闭时无需再发送
        let _ = sink.flush(state).await;
        tracing::info!(
            status = %state.current_phase,
            steps = state.current_step(),
            evidence = state.collected_data.len(),
            tokens = state.total_tokens,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "run finished"
        );
    }

    async fn execute(
        &self,
        state: &mut RunState,
        sink: &mut EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        // (1) 规划
        state.mark_started();
        state.push_thought(
            ThoughtStep::new(AgentPhase::Planning, format!("收到任务: {}", state.original_command))
                .with_action("receive_command")
                .with_observation("开始分析任务..."),
        );
        sink.flush(state).await?;
        check_cancel(cancel)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            count = self.planner.plan(state) => {
                tracing::info!(subtasks = count, "planning finished");
            }
        }
        sink.flush(state).await?;

        // (2) 子任务循环
        state.current_phase = AgentPhase::Executing;
        while state.can_continue() && state.current_subtask().is_some() {
            check_cancel(cancel)?;
            self.run_subtask(state, sink, cancel).await?;
        }
        if state.error_count() >= state.limits.max_errors {
            state.mark_failed(&format!("错误次数达到上限 ({})", state.error_count()));
            return Ok(());
        }

        // (3) 评估
        check_cancel(cancel)?;
        if !state.collected_data.is_empty() {
            self.critique(state, cancel).await?;
            sink.flush(state).await?;
        }

        // (4) 扩展
        check_cancel(cancel)?;
        self.expand(state, sink, cancel).await?;

        // (5) 完成
        self.finish(state);
        Ok(())
    }

    /// 执行游标处的子任务；抛出的故障按 SelfHealer 的动作恢复后重试，恢复失败则以失败结束该子任务
    async fn run_subtask(
        &self,
        state: &mut RunState,
        sink: &mut EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let Some(subtask) = state.current_subtask() else {
            return Ok(());
        };
        let description = subtask.description.clone();
        let mut source = subtask_source(subtask);
        let mut retry_count = 0;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                r = self.executor.execute_current(state) => r,
            };

            let error = match outcome {
                Ok(Some(outcome)) if outcome.success => {
                    self.healer.record_success(&source);
                    state.complete_current_subtask(outcome.result);
                    return sink.flush(state).await;
                }
                Ok(Some(outcome)) => {
                    let error = outcome.error.unwrap_or_default();
                    state.complete_current_subtask_failed(&error);
                    return sink.flush(state).await;
                }
                Ok(None) => return Ok(()),
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => e,
            };
            sink.flush(state).await?;

            let mut ctx = self.healer.classify(&error, Some(&source));
            ctx.retry_count = retry_count;
            let action = self.healer.get_recovery_action(&ctx, &self.available_platforms);
            state.current_phase = AgentPhase::Recovering;
            state.push_thought(
                ThoughtStep::new(
                    AgentPhase::Recovering,
                    format!("遇到 {} 错误，尝试恢复: {}", ctx.kind, truncate_chars(&ctx.message, 100)),
                )
                .with_action(action.strategy.as_str())
                .with_observation(action.description.clone()),
            );
            sink.flush(state).await?;

            // 预算已耗尽时不再等待退避
            if !state.can_continue() {
                tracing::warn!(task = %description, "run budget exhausted, skipping subtask");
                return self
                    .skip_subtask(state, sink, &description, "运行预算已用尽，放弃恢复", &error)
                    .await;
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                r = self.healer.attempt_recovery(&mut ctx, &action) => r,
            };
            retry_count = ctx.retry_count;

            if !result.success {
                tracing::warn!(
                    task = %description,
                    strategy = %action.strategy,
                    "recovery failed, skipping subtask"
                );
                return self
                    .skip_subtask(state, sink, &description, &result.message, &error)
                    .await;
            }

            if let Some(new_source) = apply_recovery(state, &action) {
                source = new_source;
            }
            state.current_phase = AgentPhase::Executing;
        }
    }

    /// 放弃当前子任务：记录跳过步骤并以失败推进游标
    async fn skip_subtask(
        &self,
        state: &mut RunState,
        sink: &mut EventSink,
        description: &str,
        observation: &str,
        error: &AgentError,
    ) -> Result<(), AgentError> {
        state.push_thought(
            ThoughtStep::new(AgentPhase::Recovering, format!("恢复失败，跳过子任务: {description}"))
                .with_action("skip_subtask")
                .with_observation(observation),
        );
        state.complete_current_subtask_failed(&error.to_string());
        sink.flush(state).await
    }

    async fn critique(
        &self,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        state.current_phase = AgentPhase::Critiquing;
        let start = Instant::now();
        let (critique, tokens) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = self.critic.evaluate_with_llm(&state.collected_data, &state.original_command) => r,
        };

        state.quality_scores.insert("overall".to_string(), critique.overall_score);
        state
            .quality_scores
            .insert("credibility".to_string(), critique.credibility_score);
        state
            .quality_scores
            .insert("coverage".to_string(), critique.coverage_score);

        state.push_thought(
            ThoughtStep::new(AgentPhase::Critiquing, critique.summary.clone())
                .with_action("critique")
                .with_observation(critique.observation())
                .with_tokens(tokens)
                .with_duration_ms(start.elapsed().as_millis() as u64),
        );

        if critique.needs_improvement() {
            for search in critique.recommended_searches.iter().take(2) {
                state.add_discovered_keyword(search);
            }
        }

        if !critique.issues.is_empty() {
            let messages: Vec<&str> = critique
                .issues
                .iter()
                .take(5)
                .map(|i| i.message.as_str())
                .collect();
            state.push_thought(
                ThoughtStep::new(AgentPhase::Critiquing, format!("发现 {} 个问题需要关注", critique.issues.len()))
                    .with_action("identify_issues")
                    .with_observation(messages.join("; ")),
            );
        }
        Ok(())
    }

    async fn expand(
        &self,
        state: &mut RunState,
        sink: &mut EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        state.current_phase = AgentPhase::Expanding;
        let start = Instant::now();
        let already_searched = state.discovered_keywords().to_vec();
        let (plan, tokens) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = self.expander.analyze_with_llm(&state.collected_data, &state.original_command, &already_searched) => r,
        };

        for keyword in &plan.priority_keywords {
            state.enqueue_search(keyword);
        }
        let observation = if plan.priority_keywords.is_empty() {
            "无需追加搜索".to_string()
        } else {
            format!(
                "推荐扩展关键词: {}（预估价值 {:.0}%）",
                plan.priority_keywords.join(", "),
                plan.estimated_value * 100.0
            )
        };
        state.push_thought(
            ThoughtStep::new(AgentPhase::Expanding, format!("搜索扩展分析: {}", plan.reason))
                .with_action("expansion_analysis")
                .with_observation(observation)
                .with_tokens(tokens)
                .with_duration_ms(start.elapsed().as_millis() as u64),
        );
        sink.flush(state).await?;

        while state.can_continue() {
            check_cancel(cancel)?;
            let Some(keyword) = state.next_pending_search() else {
                break;
            };
            state.push_thought(
                ThoughtStep::new(AgentPhase::Expanding, format!("发现新关键词 '{keyword}'，进行追加搜索"))
                    .with_action("recursive_expand"),
            );
            sink.flush(state).await?;

            let mut params = serde_json::Map::new();
            params.insert("query".to_string(), json!(keyword));
            params.insert("limit".to_string(), json!(self.expansion_search_limit));
            let started = Instant::now();
            let invoked = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                r = self.executor.tools().invoke(EXPANSION_TOOL, params) => r,
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let step = match invoked {
                Ok(result) if result.success => {
                    let payload = parse_search(&result.data.unwrap_or_default());
                    let found = payload.results.len();
                    state.collected_data.extend(payload.results);
                    for discovered in &payload.discovered_keywords {
                        state.add_discovered_keyword(discovered);
                    }
                    let (thought, action) = if found == 0 {
                        (format!("追加搜索 '{keyword}' 没有找到结果"), "expand_empty")
                    } else {
                        (format!("追加搜索 '{keyword}' 完成"), "expand_search")
                    };
                    ThoughtStep::new(AgentPhase::Expanding, thought)
                        .with_action(action)
                        .with_observation(format!("新增 {found} 条结果"))
                        .with_tokens(result.tokens_used)
                }
                Ok(result) => ThoughtStep::new(AgentPhase::Expanding, format!("追加搜索 '{keyword}' 失败"))
                    .with_action("expand_error")
                    .with_observation(result.error.unwrap_or_default()),
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    tracing::warn!(keyword = %keyword, error = %e, "expansion search failed");
                    ThoughtStep::new(AgentPhase::Expanding, format!("追加搜索 '{keyword}' 出错"))
                        .with_action("expand_error")
                        .with_observation(truncate_chars(&e.to_string(), 200))
                }
            };
            state.push_thought(step.with_duration_ms(duration_ms));
            sink.flush(state).await?;
        }
        Ok(())
    }

    fn finish(&self, state: &mut RunState) {
        state.mark_completed();
        let observation = format!(
            "共执行 {} 步，收集 {} 条数据，发现 {} 个新关键词，消耗 {} tokens",
            state.current_step() + 1,
            state.collected_data.len(),
            state.discovered_keywords().len(),
            state.total_tokens
        );
        state.push_thought(
            ThoughtStep::new(AgentPhase::Completed, "任务执行完成")
                .with_action("complete")
                .with_observation(observation),
        );
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), AgentError> {
    if cancel.is_cancelled() {
        Err(AgentError::Cancelled)
    } else {
        Ok(())
    }
}

/// 熔断与平台切换使用的来源：首个平台，否则为工具名
fn subtask_source(subtask: &Subtask) -> String {
    subtask
        .parameters
        .get("platforms")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .and_then(Value::as_str)
        .or_else(|| subtask.parameters.get("platform").and_then(Value::as_str))
        .or_else(|| subtask.task_type.tool_name())
        .unwrap_or_else(|| subtask.task_type.as_str())
        .to_string()
}

/// 把恢复动作作用到当前子任务；平台切换时返回新的来源
fn apply_recovery(state: &mut RunState, action: &RecoveryAction) -> Option<String> {
    let command = state.original_command.clone();
    let subtask = state.current_subtask_mut()?;
    match action.strategy {
        RecoveryStrategy::SwitchPlatform => {
            let platform = action.new_platform()?.to_string();
            subtask
                .parameters
                .insert("platforms".to_string(), json!([platform]));
            Some(platform)
        }
        RecoveryStrategy::SimplifyQuery => {
            let query = subtask
                .parameters
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or(&command)
                .to_string();
            let simplified = extract_keywords(&query, 2).join(" ");
            if !simplified.is_empty() && simplified != query {
                subtask
                    .parameters
                    .insert("query".to_string(), json!(simplified));
            }
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskType;
    use serde_json::Map;

    #[test]
    fn test_subtask_source_prefers_platform() {
        let task = Subtask::new("s", TaskType::Search, json!({"platforms": ["douyin", "zhihu"]}).as_object().cloned().unwrap());
        assert_eq!(subtask_source(&task), "douyin");
        let task = Subtask::new("a", TaskType::Analyze, Map::new());
        assert_eq!(subtask_source(&task), "analyze");
        let task = Subtask::new("x", TaskType::from("scrape"), Map::new());
        assert_eq!(subtask_source(&task), "scrape");
    }

    #[test]
    fn test_apply_recovery_rewrites_subtask() {
        let healer = SelfHealer::default();
        let mut state = RunState::new("Monitor DeepSeek latest developments");
        state.add_subtask(
            "search",
            TaskType::Search,
            json!({"platforms": ["zhihu"], "query": "Monitor DeepSeek latest developments"})
                .as_object()
                .cloned()
                .unwrap(),
        );

        healer.trip_circuit_breaker("zhihu", None);
        let ctx = healer.classify_message("boom", Some("zhihu"));
        let action = healer.get_recovery_action(&ctx, &["zhihu".to_string(), "wechat".to_string()]);
        assert_eq!(action.strategy, RecoveryStrategy::SwitchPlatform);
        assert_eq!(apply_recovery(&mut state, &action).as_deref(), Some("wechat"));
        assert_eq!(state.subtasks[0].parameters["platforms"], json!(["wechat"]));

        let ctx = healer.classify_message("request timeout", Some("wechat"));
        let action = healer.get_recovery_action(&ctx, &[]);
        let action = RecoveryAction {
            strategy: RecoveryStrategy::SimplifyQuery,
            ..action
        };
        assert_eq!(apply_recovery(&mut state, &action), None);
        assert_eq!(
            state.subtasks[0].parameters["query"],
            json!("DeepSeek developments")
        );
    }
}

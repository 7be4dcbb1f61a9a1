//! 运行状态：RunState / Subtask / ThoughtStep
//!
//! 一次运行（Run）持有一个 RunState，Planner / Executor / Orchestrator 只通过这里的 mutator 修改它。
//! ThoughtStep 只追加不修改，整条思维链即审计日志；进度由阶段推导，不单独存储。

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::Evidence;

/// 运行阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Idle,
    Planning,
    Executing,
    Searching,
    Scraping,
    Expanding,
    Critiquing,
    Synthesizing,
    Recovering,
    Completed,
    Failed,
}

impl AgentPhase {
    /// 阶段对应的固定进度（0-100）
    pub fn progress(&self) -> u8 {
        match self {
            AgentPhase::Idle => 0,
            AgentPhase::Planning => 10,
            AgentPhase::Executing => 30,
            AgentPhase::Searching => 40,
            AgentPhase::Scraping => 50,
            AgentPhase::Expanding => 60,
            AgentPhase::Recovering => 70,
            AgentPhase::Critiquing => 80,
            AgentPhase::Synthesizing => 90,
            AgentPhase::Completed | AgentPhase::Failed => 100,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentPhase::Completed | AgentPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentPhase::Idle => "idle",
            AgentPhase::Planning => "planning",
            AgentPhase::Executing => "executing",
            AgentPhase::Searching => "searching",
            AgentPhase::Scraping => "scraping",
            AgentPhase::Expanding => "expanding",
            AgentPhase::Critiquing => "critiquing",
            AgentPhase::Synthesizing => "synthesizing",
            AgentPhase::Recovering => "recovering",
            AgentPhase::Completed => "completed",
            AgentPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 子任务类型；规划器可能给出未知类型，保留原文交给 Executor 报错
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    Search,
    Analyze,
    MemorySearch,
    Synthesize,
    Other(String),
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::Search => "search",
            TaskType::Analyze => "analyze",
            TaskType::MemorySearch => "memory_search",
            TaskType::Synthesize => "synthesize",
            TaskType::Other(s) => s,
        }
    }

    /// 任务类型 -> 工具名
    pub fn tool_name(&self) -> Option<&'static str> {
        match self {
            TaskType::Search => Some("platform_search"),
            TaskType::Analyze => Some("analyze"),
            TaskType::MemorySearch => Some("memory_search"),
            TaskType::Synthesize => Some("synthesize"),
            TaskType::Other(_) => None,
        }
    }

    /// 任务类型 -> 上报阶段
    pub fn phase(&self) -> AgentPhase {
        match self {
            TaskType::Search | TaskType::MemorySearch => AgentPhase::Searching,
            TaskType::Synthesize => AgentPhase::Synthesizing,
            TaskType::Analyze | TaskType::Other(_) => AgentPhase::Executing,
        }
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "search" => TaskType::Search,
            "analyze" => TaskType::Analyze,
            "memory_search" => TaskType::MemorySearch,
            "synthesize" => TaskType::Synthesize,
            _ => TaskType::Other(s),
        }
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        TaskType::from(s.to_string())
    }
}

impl From<TaskType> for String {
    fn from(t: TaskType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 子任务状态：pending -> running -> completed | failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// 规划出的一个子任务
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    pub task_type: TaskType,
    pub parameters: Map<String, Value>,
    pub status: SubtaskStatus,
    pub result: Option<Map<String, Value>>,
    /// 工具调用次数（含恢复后的重试）
    #[serde(default)]
    pub attempts: u32,
}

impl Subtask {
    pub fn new(description: impl Into<String>, task_type: TaskType, parameters: Map<String, Value>) -> Self {
        Self {
            id: short_id(),
            description: description.into(),
            task_type,
            parameters,
            status: SubtaskStatus::Pending,
            result: None,
            attempts: 0,
        }
    }
}

/// 思维链中的一步（只追加）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThoughtStep {
    pub step_id: String,
    pub phase: AgentPhase,
    pub timestamp: DateTime<Utc>,
    pub thought: String,
    pub action: Option<String>,
    pub observation: Option<String>,
    pub tokens_used: u64,
    pub duration_ms: u64,
}

impl ThoughtStep {
    pub fn new(phase: AgentPhase, thought: impl Into<String>) -> Self {
        Self {
            step_id: short_id(),
            phase,
            timestamp: Utc::now(),
            thought: thought.into(),
            action: None,
            observation: None,
            tokens_used: 0,
            duration_ms: 0,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_observation(mut self, observation: impl Into<String>) -> Self {
        self.observation = Some(observation.into());
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn progress(&self) -> u8 {
        self.phase.progress()
    }

    /// 转为对外事件记录
    pub fn to_event(&self) -> StepEvent {
        StepEvent {
            step_id: self.step_id.clone(),
            phase: self.phase,
            timestamp: self.timestamp,
            thought: self.thought.clone(),
            action: self.action.clone(),
            observation: self.observation.clone(),
            progress: self.progress(),
            tokens_used: self.tokens_used,
        }
    }
}

/// 对外输出的进度事件（可序列化为 JSON 推给前端 / SSE）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub step_id: String,
    pub phase: AgentPhase,
    pub timestamp: DateTime<Utc>,
    pub thought: String,
    pub action: Option<String>,
    pub observation: Option<String>,
    pub progress: u8,
    pub tokens_used: u64,
}

impl StepEvent {
    /// 流的终止事件：complete 动作或 failed 阶段
    pub fn is_terminal(&self) -> bool {
        self.action.as_deref() == Some("complete") || self.phase == AgentPhase::Failed
    }
}

/// 运行上限
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLimits {
    pub max_steps: usize,
    pub max_expansions: usize,
    pub max_errors: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_steps: 20,
            max_expansions: 3,
            max_errors: 3,
        }
    }
}

/// 运行摘要
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub task_id: String,
    pub command: String,
    pub status: AgentPhase,
    pub total_steps: usize,
    pub total_tokens: u64,
    pub data_collected: usize,
    pub keywords_discovered: usize,
    pub error_count: usize,
    pub duration_ms: u64,
}

/// 一次运行的完整状态
#[derive(Clone, Debug)]
pub struct RunState {
    pub task_id: String,
    pub original_command: String,
    pub current_phase: AgentPhase,

    pub subtasks: Vec<Subtask>,
    current_subtask_index: usize,

    pub thought_chain: Vec<ThoughtStep>,

    discovered_keywords: Vec<String>,
    /// 小写后的已发现关键词，用于大小写无关去重
    keyword_index: HashSet<String>,
    pending_searches: VecDeque<String>,

    pub collected_data: Vec<Evidence>,
    pub quality_scores: HashMap<String, f64>,

    pub total_tokens: u64,
    pub total_duration_ms: u64,
    error_count: usize,

    pub limits: RunLimits,
    current_step: usize,
    expansion_count: usize,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new(command: impl Into<String>) -> Self {
        Self::with_limits(command, RunLimits::default())
    }

    pub fn with_limits(command: impl Into<String>, limits: RunLimits) -> Self {
        Self {
            task_id: format!("task_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
            original_command: command.into(),
            current_phase: AgentPhase::Idle,
            subtasks: Vec::new(),
            current_subtask_index: 0,
            thought_chain: Vec::new(),
            discovered_keywords: Vec::new(),
            keyword_index: HashSet::new(),
            pending_searches: VecDeque::new(),
            collected_data: Vec::new(),
            quality_scores: HashMap::new(),
            total_tokens: 0,
            total_duration_ms: 0,
            error_count: 0,
            limits,
            current_step: 0,
            expansion_count: 0,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn current_subtask_index(&self) -> usize {
        self.current_subtask_index
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn expansion_count(&self) -> usize {
        self.expansion_count
    }

    pub fn discovered_keywords(&self) -> &[String] {
        &self.discovered_keywords
    }

    pub fn pending_searches(&self) -> impl Iterator<Item = &String> {
        self.pending_searches.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending_searches.len()
    }

    /// 追加思维步骤：同时累加 token 与步数
    pub fn push_thought(&mut self, step: ThoughtStep) -> &ThoughtStep {
        self.total_tokens += step.tokens_used;
        self.total_duration_ms += step.duration_ms;
        self.current_step += 1;
        self.thought_chain.push(step);
        &self.thought_chain[self.thought_chain.len() - 1]
    }

    pub fn add_subtask(
        &mut self,
        description: impl Into<String>,
        task_type: TaskType,
        parameters: Map<String, Value>,
    ) -> &Subtask {
        self.subtasks.push(Subtask::new(description, task_type, parameters));
        &self.subtasks[self.subtasks.len() - 1]
    }

    pub fn current_subtask(&self) -> Option<&Subtask> {
        self.subtasks.get(self.current_subtask_index)
    }

    pub fn current_subtask_mut(&mut self) -> Option<&mut Subtask> {
        self.subtasks.get_mut(self.current_subtask_index)
    }

    /// 完成当前子任务并推进游标（子任务只能通过这里完成）
    pub fn complete_current_subtask(&mut self, result: Option<Map<String, Value>>) {
        if let Some(subtask) = self.subtasks.get_mut(self.current_subtask_index) {
            subtask.status = SubtaskStatus::Completed;
            subtask.result = result;
            self.current_subtask_index += 1;
        }
    }

    /// 以失败状态结束当前子任务并推进游标，避免同一失败子任务被反复执行
    pub fn complete_current_subtask_failed(&mut self, error: &str) {
        if let Some(subtask) = self.subtasks.get_mut(self.current_subtask_index) {
            subtask.status = SubtaskStatus::Failed;
            let mut result = Map::new();
            result.insert("error".to_string(), Value::String(error.to_string()));
            subtask.result = Some(result);
            self.current_subtask_index += 1;
        }
    }

    /// 错误计数只增不减
    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    /// 剩余扩展额度
    pub fn remaining_expansions(&self) -> usize {
        self.limits.max_expansions.saturating_sub(self.expansion_count)
    }

    /// 登记新发现的关键词；返回是否为新词。新词在扩展额度内时入队待搜索。
    pub fn add_discovered_keyword(&mut self, keyword: &str) -> bool {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return false;
        }
        if !self.keyword_index.insert(keyword.to_lowercase()) {
            return false;
        }
        self.discovered_keywords.push(keyword.to_string());
        self.enqueue_search(keyword);
        true
    }

    /// 加入待搜索队列：队列内大小写无关去重，长度不超过剩余扩展额度
    pub fn enqueue_search(&mut self, keyword: &str) -> bool {
        let lower = keyword.to_lowercase();
        if self.pending_searches.iter().any(|k| k.to_lowercase() == lower) {
            return false;
        }
        if self.pending_searches.len() >= self.remaining_expansions() {
            return false;
        }
        self.pending_searches.push_back(keyword.to_string());
        true
    }

    /// 取出下一个待扩展关键词并消耗一次扩展额度
    pub fn next_pending_search(&mut self) -> Option<String> {
        if self.remaining_expansions() == 0 {
            return None;
        }
        let keyword = self.pending_searches.pop_front()?;
        self.expansion_count += 1;
        Some(keyword)
    }

    pub fn can_continue(&self) -> bool {
        self.current_step < self.limits.max_steps
            && !self.current_phase.is_terminal()
            && self.error_count < self.limits.max_errors
    }

    pub fn mark_started(&mut self) {
        self.started_at = Some(Utc::now());
        self.current_phase = AgentPhase::Planning;
    }

    pub fn mark_completed(&mut self) {
        self.completed_at = Some(Utc::now());
        self.current_phase = AgentPhase::Completed;
    }

    /// 标记失败并追加终止步骤
    pub fn mark_failed(&mut self, error: &str) -> &ThoughtStep {
        self.completed_at = Some(Utc::now());
        self.current_phase = AgentPhase::Failed;
        self.push_thought(
            ThoughtStep::new(AgentPhase::Failed, format!("任务失败: {error}")).with_action("fail"),
        )
    }

    /// 调用方取消：以失败结束，终止步骤带取消语义
    pub fn mark_cancelled(&mut self) -> &ThoughtStep {
        self.completed_at = Some(Utc::now());
        self.current_phase = AgentPhase::Failed;
        let observation = format!(
            "已完成 {} 步，收集 {} 条数据",
            self.current_step,
            self.collected_data.len()
        );
        self.push_thought(
            ThoughtStep::new(AgentPhase::Failed, "任务已被取消")
                .with_action("cancelled")
                .with_observation(observation),
        )
    }

    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => self.total_duration_ms,
        }
    }

    pub fn to_summary(&self) -> RunSummary {
        RunSummary {
            task_id: self.task_id.clone(),
            command: self.original_command.clone(),
            status: self.current_phase,
            total_steps: self.current_step,
            total_tokens: self.total_tokens,
            data_collected: self.collected_data.len(),
            keywords_discovered: self.discovered_keywords.len(),
            error_count: self.error_count,
            duration_ms: self.duration_ms(),
        }
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

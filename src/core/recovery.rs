//! 自愈引擎（SelfHealer）
//!
//! classify 把错误归为九类之一；get_recovery_action 按类别的策略列表选出第一个可用策略；
//! attempt_recovery 执行策略（退避等待，或通知调用方切换平台 / 代理 / 简化查询）。
//! 熔断器按来源记录冷却期：同一来源连续失败达到阈值后自动熔断，冷却期内一律切换平台。
//!
//! SelfHealer 可在多个并发运行间共享，内部状态由一把锁保护（锁从不跨越 await）。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use crate::core::{AgentError, ErrorKind};

/// 最近错误保留条数
const RECENT_ERRORS: usize = 50;

/// 恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    #[serde(rename = "retry_backoff")]
    RetryWithBackoff,
    SwitchPlatform,
    SwitchProxy,
    SimplifyQuery,
    Skip,
    Fallback,
    Escalate,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::RetryWithBackoff => "retry_backoff",
            RecoveryStrategy::SwitchPlatform => "switch_platform",
            RecoveryStrategy::SwitchProxy => "switch_proxy",
            RecoveryStrategy::SimplifyQuery => "simplify_query",
            RecoveryStrategy::Skip => "skip",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::Escalate => "escalate",
        }
    }

    /// skip / escalate 是终止性策略，不会带来重试
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecoveryStrategy::Skip | RecoveryStrategy::Escalate)
    }
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次错误的上下文；retry_count 由 attempt_recovery 递增，调用方不要自行修改
#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    pub kind: ErrorKind,
    pub message: String,
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub recoverable: bool,
}

/// 恢复动作：策略 + 参数 + 预期成功率
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryAction {
    pub strategy: RecoveryStrategy,
    pub parameters: Map<String, Value>,
    pub description: String,
    pub expected_success_rate: f64,
}

impl RecoveryAction {
    fn new(strategy: RecoveryStrategy, description: impl Into<String>, rate: f64) -> Self {
        Self {
            strategy,
            parameters: Map::new(),
            description: description.into(),
            expected_success_rate: rate.clamp(0.0, 1.0),
        }
    }

    fn with_param(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn backoff_ms(&self) -> Option<u64> {
        self.parameters.get("backoff_ms").and_then(Value::as_u64)
    }

    pub fn new_platform(&self) -> Option<&str> {
        self.parameters.get("new_platform").and_then(Value::as_str)
    }
}

/// 恢复尝试结果
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub action_taken: RecoveryAction,
    pub message: String,
}

/// 错误统计
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStats {
    pub total_errors: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub recent_errors: Vec<RecentError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentError {
    pub kind: ErrorKind,
    pub message: String,
    pub source: Option<String>,
}

/// 退避与熔断参数
#[derive(Debug, Clone)]
pub struct HealerConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: u64,
    pub breaker_cooldown: Duration,
    /// 同一来源连续失败多少次后自动熔断
    pub breaker_threshold: u32,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2,
            breaker_cooldown: Duration::from_secs(60),
            breaker_threshold: 5,
        }
    }
}

#[derive(Debug, Default)]
struct HealerInner {
    total_errors: usize,
    by_kind: HashMap<ErrorKind, usize>,
    recent: VecDeque<RecentError>,
    /// source -> 冷却截止时间
    breakers: HashMap<String, Instant>,
    consecutive_failures: HashMap<String, u32>,
}

/// 自愈引擎
#[derive(Debug, Default)]
pub struct SelfHealer {
    config: HealerConfig,
    inner: Mutex<HealerInner>,
}

/// 按顺序匹配，先命中者为准（超时优先于网络，"connection timeout" 归为 timeout）
const CLASSIFY_RULES: &[(ErrorKind, &[&str])] = &[
    (ErrorKind::Timeout, &["timeout", "timed out", "超时"]),
    (
        ErrorKind::Network,
        &["connection", "network", "unreachable", "dns", "连接"],
    ),
    (
        ErrorKind::RateLimit,
        &["rate limit", "429", "too many requests", "频率"],
    ),
    (
        ErrorKind::Blocked,
        &["403", "blocked", "forbidden", "access denied", "封禁"],
    ),
    (ErrorKind::Parse, &["parse", "json", "decode", "format", "解析"]),
    (ErrorKind::Auth, &["401", "auth", "unauthorized", "token"]),
    (ErrorKind::Llm, &["llm", "model", "api key", "quota"]),
    (ErrorKind::Tool, &["tool"]),
];

/// 按错误文本分类（仅用于无结构化类别的外部错误）
pub fn classify_text(text: &str) -> ErrorKind {
    let lower = text.to_lowercase();
    CLASSIFY_RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

impl SelfHealer {
    pub fn new(config: HealerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(HealerInner::default()),
        }
    }

    pub fn config(&self) -> &HealerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HealerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 每类错误的最大重试次数
    pub fn max_retries(kind: ErrorKind) -> u32 {
        match kind {
            ErrorKind::Network | ErrorKind::Timeout => 3,
            ErrorKind::RateLimit | ErrorKind::Parse | ErrorKind::Tool | ErrorKind::Llm => 2,
            ErrorKind::Blocked | ErrorKind::Auth | ErrorKind::Unknown => 1,
        }
    }

    /// 每类错误按优先级排列的候选策略
    pub fn strategies(kind: ErrorKind) -> &'static [RecoveryStrategy] {
        use RecoveryStrategy::*;
        match kind {
            ErrorKind::Network => &[RetryWithBackoff, SwitchProxy, Skip],
            ErrorKind::RateLimit => &[RetryWithBackoff, SwitchPlatform, Skip],
            ErrorKind::Blocked => &[SwitchProxy, SwitchPlatform, Skip],
            ErrorKind::Parse => &[Retry, Fallback, Skip],
            ErrorKind::Timeout => &[RetryWithBackoff, SimplifyQuery, Skip],
            ErrorKind::Auth => &[Escalate],
            ErrorKind::Tool => &[Retry, Fallback, Skip],
            ErrorKind::Llm => &[RetryWithBackoff, Fallback, Skip],
            ErrorKind::Unknown => &[Retry, Skip],
        }
    }

    /// 分类运行期错误：优先使用结构化类别，否则按文本匹配
    pub fn classify(&self, error: &AgentError, source: Option<&str>) -> ErrorContext {
        let message = error.to_string();
        let kind = error.kind().unwrap_or_else(|| match error {
            // 包装文本本身含 "tool"，只看工具给出的原始信息
            AgentError::Tool { source, .. } => classify_text(&source.message),
            _ => classify_text(&message),
        });
        self.record(kind, message, source)
    }

    /// 分类外部错误文本
    pub fn classify_message(&self, message: &str, source: Option<&str>) -> ErrorContext {
        self.record(classify_text(message), message.to_string(), source)
    }

    fn record(&self, kind: ErrorKind, message: String, source: Option<&str>) -> ErrorContext {
        let ctx = ErrorContext {
            kind,
            message,
            source: source.map(str::to_string),
            timestamp: Utc::now(),
            retry_count: 0,
            recoverable: kind.is_recoverable(),
        };
        tracing::debug!(kind = %kind, source = ?source, "classified error: {}", ctx.message);

        let mut trip = None;
        {
            let mut inner = self.lock();
            inner.total_errors += 1;
            *inner.by_kind.entry(kind).or_insert(0) += 1;
            inner.recent.push_back(RecentError {
                kind,
                message: ctx.message.chars().take(100).collect(),
                source: ctx.source.clone(),
            });
            while inner.recent.len() > RECENT_ERRORS {
                inner.recent.pop_front();
            }
            if let Some(src) = source {
                let count = inner.consecutive_failures.entry(src.to_string()).or_insert(0);
                *count += 1;
                if *count >= self.config.breaker_threshold {
                    *count = 0;
                    trip = Some(src.to_string());
                }
            }
        }
        if let Some(src) = trip {
            self.trip_circuit_breaker(&src, None);
        }
        ctx
    }

    /// 来源执行成功：清零连续失败计数
    pub fn record_success(&self, source: &str) {
        self.lock().consecutive_failures.remove(source);
    }

    /// 计算指数退避：min(initial * multiplier^retry, max)
    pub fn backoff_ms(&self, retry_count: u32) -> u64 {
        let factor = self
            .config
            .backoff_multiplier
            .checked_pow(retry_count)
            .unwrap_or(u64::MAX);
        self.config
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.config.max_backoff_ms)
    }

    /// 选择恢复动作：预算耗尽 -> skip；来源熔断中 -> switch_platform；否则取第一个可用策略
    pub fn get_recovery_action(
        &self,
        context: &ErrorContext,
        available_platforms: &[String],
    ) -> RecoveryAction {
        if context.retry_count >= Self::max_retries(context.kind) {
            return RecoveryAction::new(
                RecoveryStrategy::Skip,
                format!("已达到最大重试次数 ({})", context.retry_count),
                0.0,
            );
        }

        let alternative = alternative_platform(context.source.as_deref(), available_platforms);

        if let Some(source) = context.source.as_deref() {
            if self.is_circuit_open(source) {
                let mut action = RecoveryAction::new(
                    RecoveryStrategy::SwitchPlatform,
                    format!("{source} 处于冷却期"),
                    0.6,
                )
                .with_param("reason", json!("circuit_breaker"));
                if let Some(platform) = alternative {
                    action = action.with_param("new_platform", json!(platform));
                }
                return action;
            }
        }

        let retries = context.retry_count as f64;
        for strategy in Self::strategies(context.kind) {
            let action = match strategy {
                RecoveryStrategy::Retry => {
                    RecoveryAction::new(*strategy, "简单重试", 0.5 - retries * 0.1)
                }
                RecoveryStrategy::RetryWithBackoff => {
                    let backoff = self.backoff_ms(context.retry_count);
                    RecoveryAction::new(
                        *strategy,
                        format!("等待 {backoff}ms 后重试"),
                        0.6 - retries * 0.1,
                    )
                    .with_param("backoff_ms", json!(backoff))
                }
                RecoveryStrategy::SwitchPlatform => match alternative {
                    Some(platform) => RecoveryAction::new(
                        *strategy,
                        format!("切换到 {platform} 平台"),
                        0.7,
                    )
                    .with_param("new_platform", json!(platform)),
                    None => continue,
                },
                RecoveryStrategy::SwitchProxy => {
                    RecoveryAction::new(*strategy, "切换代理后重试", 0.6)
                }
                RecoveryStrategy::SimplifyQuery => {
                    RecoveryAction::new(*strategy, "简化查询后重试", 0.5)
                }
                RecoveryStrategy::Fallback => {
                    RecoveryAction::new(*strategy, "使用备用数据源", 0.8)
                }
                RecoveryStrategy::Escalate => {
                    RecoveryAction::new(*strategy, "需要人工介入", 0.0)
                }
                RecoveryStrategy::Skip => RecoveryAction::new(*strategy, "跳过此任务", 0.0),
            };
            return action;
        }

        RecoveryAction::new(RecoveryStrategy::Skip, "跳过此任务", 0.0)
    }

    /// 执行恢复动作并递增 retry_count；skip / escalate 总是返回失败
    pub async fn attempt_recovery(
        &self,
        context: &mut ErrorContext,
        action: &RecoveryAction,
    ) -> RecoveryResult {
        context.retry_count += 1;

        let (success, message) = match action.strategy {
            RecoveryStrategy::Retry => (true, "可以重试".to_string()),
            RecoveryStrategy::RetryWithBackoff => {
                let backoff = action
                    .backoff_ms()
                    .unwrap_or(self.config.initial_backoff_ms);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                (true, format!("等待 {backoff}ms 后可以重试"))
            }
            RecoveryStrategy::SwitchProxy => (true, "已切换代理，请重试".to_string()),
            RecoveryStrategy::SwitchPlatform => match action.new_platform() {
                Some(platform) => (true, format!("已切换到 {platform}")),
                None => (false, "没有可切换的平台".to_string()),
            },
            RecoveryStrategy::SimplifyQuery => (true, "请使用简化的查询重试".to_string()),
            RecoveryStrategy::Fallback => (true, "使用备用数据".to_string()),
            RecoveryStrategy::Skip => (false, "已跳过此任务".to_string()),
            RecoveryStrategy::Escalate => (false, "需要人工介入处理".to_string()),
        };

        RecoveryResult {
            success,
            action_taken: action.clone(),
            message,
        }
    }

    /// 熔断指定来源；cooldown 为 None 时使用配置的冷却期
    pub fn trip_circuit_breaker(&self, source: &str, cooldown: Option<Duration>) {
        let cooldown = cooldown.unwrap_or(self.config.breaker_cooldown);
        self.lock()
            .breakers
            .insert(source.to_string(), Instant::now() + cooldown);
        tracing::warn!(source, cooldown_secs = cooldown.as_secs(), "circuit breaker tripped");
    }

    pub fn reset_circuit_breaker(&self, source: &str) {
        let mut inner = self.lock();
        inner.breakers.remove(source);
        inner.consecutive_failures.remove(source);
    }

    pub fn is_circuit_open(&self, source: &str) -> bool {
        let mut inner = self.lock();
        match inner.breakers.get(source) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                inner.breakers.remove(source);
                false
            }
            None => false,
        }
    }

    pub fn error_stats(&self) -> ErrorStats {
        let inner = self.lock();
        ErrorStats {
            total_errors: inner.total_errors,
            by_kind: inner
                .by_kind
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
            recent_errors: inner.recent.iter().rev().take(5).rev().cloned().collect(),
        }
    }

    pub fn clear_history(&self) {
        let mut inner = self.lock();
        inner.total_errors = 0;
        inner.by_kind.clear();
        inner.recent.clear();
    }
}

fn alternative_platform<'a>(current: Option<&str>, available: &'a [String]) -> Option<&'a str> {
    available
        .iter()
        .map(String::as_str)
        .find(|p| Some(*p) != current)
}

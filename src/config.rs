//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SCOUT__*` 覆盖（双下划线表示嵌套，如 `SCOUT__LLM__PROVIDER=openai`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{HealerConfig, RunLimits};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub run: RunSection,
    pub planner: PlannerSection,
    pub tools: ToolsSection,
    pub healer: HealerSection,
    pub critic: CriticSection,
    pub expander: ExpanderSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai；没有对应 API Key 时使用 Mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [run] 段：单次运行的步数 / 扩展 / 错误上限与事件通道容量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub max_steps: usize,
    pub max_expansions: usize,
    pub max_errors: usize,
    /// 事件通道容量（有界，消费者过慢时生产者等待）
    pub event_buffer: usize,
}

impl Default for RunSection {
    fn default() -> Self {
        let limits = RunLimits::default();
        Self {
            max_steps: limits.max_steps,
            max_expansions: limits.max_expansions,
            max_errors: limits.max_errors,
            event_buffer: 64,
        }
    }
}

impl RunSection {
    pub fn limits(&self) -> RunLimits {
        RunLimits {
            max_steps: self.max_steps,
            max_expansions: self.max_expansions,
            max_errors: self.max_errors,
        }
    }
}

/// [planner] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    pub temperature: f32,
    pub max_tokens: u32,
    /// 兜底规划与扩展搜索使用的平台
    pub default_platforms: Vec<String>,
    /// 计划的最大子任务数（含 synthesize）
    pub max_tasks: usize,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 2048,
            default_platforms: vec!["zhihu".to_string(), "wechat".to_string()],
            max_tasks: 6,
        }
    }
}

/// [tools] 段：工具超时与离线语料
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// platform_search 使用的 JSON 语料文件；未设置或不存在时返回空结果
    pub corpus_path: Option<PathBuf>,
    /// 扩展搜索每次返回的条数
    pub expansion_search_limit: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            corpus_path: None,
            expansion_search_limit: 5,
        }
    }
}

/// [healer] 段：退避与熔断
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealerSection {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: u64,
    pub breaker_cooldown_secs: u64,
    pub breaker_threshold: u32,
    /// switch_platform 可切换的平台
    pub available_platforms: Vec<String>,
}

impl Default for HealerSection {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2,
            breaker_cooldown_secs: 60,
            breaker_threshold: 5,
            available_platforms: vec![
                "zhihu".to_string(),
                "wechat".to_string(),
                "xiaohongshu".to_string(),
                "douyin".to_string(),
            ],
        }
    }
}

impl HealerSection {
    pub fn to_healer_config(&self) -> HealerConfig {
        HealerConfig {
            initial_backoff_ms: self.initial_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
            backoff_multiplier: self.backoff_multiplier.max(1),
            breaker_cooldown: Duration::from_secs(self.breaker_cooldown_secs),
            breaker_threshold: self.breaker_threshold.max(1),
        }
    }
}

/// [critic] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CriticSection {
    /// 是否在规则评分之外调用 LLM 做额外评估
    pub use_llm: bool,
    /// 覆盖内置的平台基础可信度
    pub platform_credibility: HashMap<String, f64>,
}

/// [expander] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExpanderSection {
    pub max_candidates: usize,
    pub use_llm: bool,
}

impl Default for ExpanderSection {
    fn default() -> Self {
        Self {
            max_candidates: 20,
            use_llm: false,
        }
    }
}

/// 从 config 目录加载配置，环境变量 SCOUT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SCOUT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SCOUT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（调用方决定是否用新配置重建 Orchestrator）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

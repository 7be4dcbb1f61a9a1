//! Orchestrator 构建器：按配置装配 LLM、工具注册表与各研究组件
//!
//! CLI 与测试共用同一套装配逻辑，测试通过 with_llm / with_corpus / with_tool 注入替身。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{load_config, AppConfig};
use crate::core::{AgentError, Evidence, Orchestrator, SelfHealer};
use crate::llm::{create_llm_from_config, LlmClient};
use crate::research::{Critic, Planner, PlannerConfig, SearchExpander, TaskExecutor};
use crate::tools::{
    AnalyzeTool, MemorySearchTool, MemoryStore, PlatformSearchTool, SynthesizeTool, Tool,
    ToolExecutor, ToolRegistry,
};

pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    healer: Option<Arc<SelfHealer>>,
    memory: Option<Arc<MemoryStore>>,
    corpus: Option<Vec<Evidence>>,
    extra_tools: Vec<Arc<dyn Tool>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            healer: None,
            memory: None,
            corpus: None,
            extra_tools: Vec::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 指定 LLM 客户端（默认按配置与环境变量创建）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 共享外部的 SelfHealer（熔断状态跨 Orchestrator 生效）
    pub fn with_healer(mut self, healer: Arc<SelfHealer>) -> Self {
        self.healer = Some(healer);
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// 直接给定搜索语料，忽略 tools.corpus_path
    pub fn with_corpus(mut self, corpus: Vec<Evidence>) -> Self {
        self.corpus = Some(corpus);
        self
    }

    /// 额外工具；先于内置工具注册，同名时覆盖内置实现
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.extra_tools.push(tool);
        self
    }

    fn resolve_llm(&self) -> Arc<dyn LlmClient> {
        self.llm
            .clone()
            .unwrap_or_else(|| create_llm_from_config(&self.config))
    }

    /// 构建工具注册表：platform_search / analyze / memory_search / synthesize
    pub fn build_tool_registry(
        &self,
        llm: Arc<dyn LlmClient>,
        memory: Arc<MemoryStore>,
    ) -> Result<ToolRegistry, AgentError> {
        let mut tools = ToolRegistry::new();
        for tool in &self.extra_tools {
            tools.register_arc(Arc::clone(tool));
        }

        let search = match (&self.corpus, &self.config.tools.corpus_path) {
            (Some(corpus), _) => PlatformSearchTool::new(corpus.clone()),
            (None, Some(path)) => PlatformSearchTool::from_path(path)
                .map_err(|e| AgentError::Config(format!("search corpus: {e}")))?,
            (None, None) => PlatformSearchTool::default(),
        };
        tools.register(search);
        tools.register(AnalyzeTool::new().with_llm(Arc::clone(&llm)));
        tools.register(MemorySearchTool::new(Arc::clone(&memory)));
        tools.register(SynthesizeTool::new().with_llm(llm).with_memory(memory));

        tracing::debug!(tools = ?tools.tool_names(), "tool registry built");
        Ok(tools)
    }

    pub fn build(self) -> Result<Orchestrator, AgentError> {
        let cfg = &self.config;
        let llm = self.resolve_llm();
        let memory = self
            .memory
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let planner_config = PlannerConfig {
            temperature: cfg.planner.temperature,
            max_tokens: cfg.planner.max_tokens,
            max_tasks: cfg.planner.max_tasks,
            default_platforms: cfg.planner.default_platforms.clone(),
            timeout: Duration::from_secs(cfg.llm.timeouts.request),
        };
        let planner = Planner::with_config(Arc::clone(&llm), planner_config);

        let registry = self.build_tool_registry(Arc::clone(&llm), memory)?;
        let executor = TaskExecutor::new(ToolExecutor::new(registry, cfg.tools.tool_timeout_secs));

        let critic = Critic::from_config(&cfg.critic, Some(Arc::clone(&llm)));
        let expander = SearchExpander::from_config(&cfg.expander, Some(llm));
        let healer = self
            .healer
            .clone()
            .unwrap_or_else(|| Arc::new(SelfHealer::new(cfg.healer.to_healer_config())));

        Ok(Orchestrator::new(planner, executor, critic, expander, healer)
            .with_limits(cfg.run.limits())
            .with_available_platforms(cfg.healer.available_platforms.clone())
            .with_event_buffer(cfg.run.event_buffer)
            .with_expansion_search_limit(cfg.tools.expansion_search_limit))
    }
}

/// 从配置文件创建 Orchestrator
pub fn create_orchestrator(config_path: Option<PathBuf>) -> Result<Orchestrator, AgentError> {
    let config = load_config(config_path).map_err(|e| AgentError::Config(e.to_string()))?;
    OrchestratorBuilder::new(config).build()
}

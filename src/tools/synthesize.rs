//! 报告综合工具（synthesize）
//!
//! 把收集到的数据与分析结果综合成情报报告。LLM 不可用或调用失败时生成规则报告；
//! 配置了 MemoryStore 时把执行摘要写入记忆，供后续运行的 memory_search 回忆。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::core::{Evidence, ToolError};
use crate::llm::{CompletionRequest, LlmClient};
use crate::text::{extract_json, truncate_chars};
use crate::tools::memory::{MemoryEntry, MemoryStore, MemoryType};
use crate::tools::{ParamType, Params, Tool, ToolParameter, ToolResult};

const SYNTHESIZE_SYSTEM_PROMPT: &str = "你是一个专业的情报综合分析师。你的任务是将收集到的所有信息综合成一份简洁、有洞察力的情报报告。

报告要求：
1. 开门见山，直接给出核心发现
2. 分点列出关键信息
3. 标注信息可信度
4. 指出需要关注的风险或机会
5. 提供可执行的建议

请以 JSON 格式返回。";

/// 综合工具
#[derive(Clone, Default)]
pub struct SynthesizeTool {
    llm: Option<Arc<dyn LlmClient>>,
    memory: Option<Arc<MemoryStore>>,
}

impl SynthesizeTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    fn prepare_context(items: &[Evidence], analysis: Option<&Map<String, Value>>) -> String {
        let mut parts = Vec::new();
        if !items.is_empty() {
            parts.push(format!("## 收集的数据 (共 {} 条)", items.len()));
            for (i, item) in items.iter().take(15).enumerate() {
                parts.push(format!(
                    "{}. [{}] {}: {}",
                    i + 1,
                    item.platform(),
                    if item.title().is_empty() { "无标题" } else { item.title() },
                    truncate_chars(item.content(), 200)
                ));
            }
        }
        if let Some(analysis) = analysis.filter(|a| !a.is_empty()) {
            parts.push("\n## 分析结果".to_string());
            if let Some(points) = analysis.get("main_points").and_then(Value::as_array) {
                parts.push("主要发现:".to_string());
                for point in points.iter().filter_map(Value::as_str) {
                    parts.push(format!("  - {point}"));
                }
            }
            if let Some(sentiment) = analysis.get("sentiment") {
                parts.push(format!("情感分析: {sentiment}"));
            }
        }
        parts.join("\n")
    }

    /// 规则报告：标题作为关键发现，统计平台覆盖
    fn rule_based(command: &str, items: &[Evidence], analysis: Option<&Map<String, Value>>) -> Map<String, Value> {
        let platforms: BTreeSet<&str> = items.iter().map(Evidence::platform).collect();
        let findings: Vec<String> = analysis
            .and_then(|a| a.get("main_points"))
            .and_then(Value::as_array)
            .map(|points| points.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .filter(|v: &Vec<String>| !v.is_empty())
            .unwrap_or_else(|| {
                items
                    .iter()
                    .map(Evidence::title)
                    .filter(|t| !t.is_empty())
                    .take(5)
                    .map(str::to_string)
                    .collect()
            });
        let summary = if items.is_empty() {
            format!("关于「{command}」未收集到有效数据")
        } else {
            format!(
                "关于「{command}」共收集 {} 条信息，覆盖 {} 个平台",
                items.len(),
                platforms.len()
            )
        };

        let mut markdown = format!("# {command} 情报摘要\n\n{summary}\n");
        if !findings.is_empty() {
            markdown.push_str("\n## 关键发现\n\n");
            for finding in &findings {
                markdown.push_str(&format!("- {finding}\n"));
            }
        }
        if !platforms.is_empty() {
            let list: Vec<&str> = platforms.iter().copied().collect();
            markdown.push_str(&format!("\n## 数据来源\n\n{}\n", list.join("、")));
        }

        let mut report = Map::new();
        report.insert("executive_summary".to_string(), json!(summary));
        report.insert("markdown".to_string(), json!(markdown));
        report.insert("key_findings".to_string(), json!(findings));
        report.insert(
            "data_quality".to_string(),
            json!({
                "total_sources": items.len(),
                "platforms": platforms,
            }),
        );
        report.insert("rule_based".to_string(), json!(true));
        report
    }

    fn parse_report(text: &str) -> Map<String, Value> {
        extract_json(text)
            .and_then(|s| serde_json::from_str::<Map<String, Value>>(s).ok())
            .unwrap_or_else(|| {
                let mut m = Map::new();
                m.insert("executive_summary".to_string(), json!(truncate_chars(text.trim(), 200)));
                m.insert("key_findings".to_string(), json!(["分析结果解析失败，请查看原始输出"]));
                m.insert("raw_output".to_string(), json!(text));
                m.insert("parsing_failed".to_string(), json!(true));
                m
            })
    }

    fn remember(&self, command: &str, report: &Map<String, Value>) {
        let (Some(memory), Some(summary)) = (
            &self.memory,
            report.get("executive_summary").and_then(Value::as_str),
        ) else {
            return;
        };
        memory.remember(
            MemoryEntry::new(summary, MemoryType::Summary).with_entities(vec![command.to_string()]),
        );
    }
}

#[async_trait]
impl Tool for SynthesizeTool {
    fn name(&self) -> &str {
        "synthesize"
    }

    fn description(&self) -> &str {
        "综合所有收集和分析的数据，生成最终的情报报告。"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter::required("collected_data", ParamType::Array, "收集到的原始数据"),
            ToolParameter::optional("analysis_results", ParamType::Object, "分析结果"),
            ToolParameter::required("original_command", ParamType::String, "原始用户命令"),
        ]
    }

    async fn execute(&self, params: Params) -> Result<ToolResult, ToolError> {
        let items: Vec<Evidence> = params
            .get("collected_data")
            .and_then(Value::as_array)
            .map(|a| a.iter().cloned().filter_map(Evidence::from_value).collect())
            .unwrap_or_default();
        let command = params
            .get("original_command")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let analysis = params.get("analysis_results").and_then(Value::as_object);

        let (report, tokens) = match &self.llm {
            Some(llm) => {
                let prompt = format!(
                    "基于以下收集和分析的信息，请生成一份情报报告。\n\n原始任务: {command}\n\n收集的信息:\n{}\n\n\
                     请生成 JSON 格式的情报报告，包含 executive_summary（50字以内）、key_findings、\
                     market_dynamics、risks_and_opportunities、recommendations、data_quality 字段。",
                    Self::prepare_context(&items, analysis)
                );
                let request = CompletionRequest::new(prompt)
                    .with_system(SYNTHESIZE_SYSTEM_PROMPT)
                    .with_temperature(0.4)
                    .with_max_tokens(2000);
                match llm.generate(&request).await {
                    Ok(c) => (Self::parse_report(&c.text), c.total_tokens()),
                    Err(e) => {
                        tracing::warn!(error = %e, "synthesize llm call failed, using rule-based report");
                        (Self::rule_based(command, &items, analysis), 0)
                    }
                }
            }
            None => (Self::rule_based(command, &items, analysis), 0),
        };

        self.remember(command, &report);
        Ok(ToolResult::ok(report).with_tokens(tokens))
    }
}

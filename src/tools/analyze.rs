//! 数据分析工具（analyze）
//!
//! 配置了 LLM 时用 LLM 分析并解析 JSON；LLM 调用失败时退回规则分析（平台分布、标题要点、情感词计数），
//! 保证分析子任务总能产出结果。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::core::{Evidence, ToolError};
use crate::llm::{CompletionRequest, LlmClient};
use crate::text::{extract_json, truncate_chars};
use crate::tools::{ParamType, Params, Tool, ToolParameter, ToolResult};

const ANALYZE_SYSTEM_PROMPT: &str = "你是一个专业的情报分析师，负责分析和总结收集到的信息。

分析时请注意：
1. 提取关键信息和核心观点
2. 识别信息来源的可信度（官方公告 > 专业分析 > 用户评论）
3. 发现信息之间的矛盾或冲突
4. 标注时效性（信息是否过时）
5. 提炼行动建议

请以结构化的 JSON 格式返回分析结果。";

const POSITIVE_WORDS: &[&str] = &["突破", "领先", "增长", "好用", "乐观", "利好", "强大", "breakthrough", "growth"];
const NEGATIVE_WORDS: &[&str] = &["下降", "风险", "争议", "下线", "问题", "质疑", "decline", "risk"];

/// 分析工具
#[derive(Clone, Default)]
pub struct AnalyzeTool {
    llm: Option<Arc<dyn LlmClient>>,
}

impl AnalyzeTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    fn prepare_text(items: &[Evidence]) -> String {
        items
            .iter()
            .take(20)
            .enumerate()
            .map(|(i, item)| {
                format!(
                    "[{}] 平台: {}\n    标题: {}\n    作者: {}\n    摘要: {}\n",
                    i + 1,
                    item.platform(),
                    if item.title().is_empty() { "无标题" } else { item.title() },
                    if item.author().is_empty() { "未知" } else { item.author() },
                    truncate_chars(item.content(), 200),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn build_prompt(data_text: &str, analysis_type: &str) -> String {
        let base = format!("请分析以下收集到的信息：\n\n{data_text}\n\n");
        let tail = match analysis_type {
            "sentiment" => r#"请分析每条信息的情感倾向，并返回 JSON 格式：
{"overall_sentiment": "positive/negative/neutral", "sentiment_score": 0.0-1.0, "items": [{"id": 1, "sentiment": "positive/negative/neutral"}]}"#,
            "extract_entities" => r#"请提取所有提到的实体（公司、产品、人物），返回 JSON 格式：
{"companies": [{"name": "公司名", "mentions": 1}], "products": [{"name": "产品名"}], "persons": [{"name": "人名"}]}"#,
            "full" => r#"请进行全面分析，返回 JSON 格式：
{"summary": "综合摘要", "main_points": ["要点"], "sentiment": {"overall": "neutral", "score": 0.5}, "contradictions": [], "recommendations": []}"#,
            _ => r#"请总结这些信息的核心内容，返回 JSON 格式：
{"main_points": ["要点1", "要点2"], "key_entities": ["实体1"], "timeline": "时间线描述", "brief_summary": "100字以内的简短总结"}"#,
        };
        base + tail
    }

    /// 规则分析
    fn rule_based(items: &[Evidence], analysis_type: &str) -> Map<String, Value> {
        let mut platforms: BTreeMap<&str, usize> = BTreeMap::new();
        let (mut positive, mut negative) = (0usize, 0usize);
        for item in items {
            *platforms.entry(item.platform()).or_insert(0) += 1;
            let text = format!("{} {}", item.title(), item.content()).to_lowercase();
            positive += POSITIVE_WORDS.iter().filter(|w| text.contains(*w)).count();
            negative += NEGATIVE_WORDS.iter().filter(|w| text.contains(*w)).count();
        }
        let sentiment = match positive.cmp(&negative) {
            std::cmp::Ordering::Greater => "positive",
            std::cmp::Ordering::Less => "negative",
            std::cmp::Ordering::Equal => "neutral",
        };
        let score = if positive + negative == 0 {
            0.5
        } else {
            positive as f64 / (positive + negative) as f64
        };
        let main_points: Vec<&str> = items
            .iter()
            .map(Evidence::title)
            .filter(|t| !t.is_empty())
            .take(5)
            .collect();

        let mut out = Map::new();
        out.insert("analysis_type".to_string(), json!(analysis_type));
        out.insert("main_points".to_string(), json!(main_points));
        out.insert("platform_distribution".to_string(), json!(platforms));
        out.insert(
            "sentiment".to_string(),
            json!({ "overall": sentiment, "score": score }),
        );
        out.insert(
            "brief_summary".to_string(),
            json!(format!("共 {} 条数据，来自 {} 个平台", items.len(), platforms.len())),
        );
        out.insert("rule_based".to_string(), json!(true));
        out
    }
}

#[async_trait]
impl Tool for AnalyzeTool {
    fn name(&self) -> &str {
        "analyze"
    }

    fn description(&self) -> &str {
        "分析收集到的数据，提取关键信息、情感倾向和重要洞察。"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter::required("data", ParamType::Array, "要分析的数据列表"),
            ToolParameter::optional(
                "analysis_type",
                ParamType::String,
                "分析类型: sentiment, summary, extract_entities, full",
            )
            .with_enum(&["sentiment", "summary", "extract_entities", "full"]),
        ]
    }

    async fn execute(&self, params: Params) -> Result<ToolResult, ToolError> {
        let items: Vec<Evidence> = params
            .get("data")
            .and_then(Value::as_array)
            .map(|a| a.iter().cloned().filter_map(Evidence::from_value).collect())
            .unwrap_or_default();
        let analysis_type = params
            .get("analysis_type")
            .and_then(Value::as_str)
            .unwrap_or("summary");

        if items.is_empty() {
            let mut data = Map::new();
            data.insert("analysis".to_string(), json!("没有数据需要分析"));
            data.insert("items".to_string(), json!([]));
            return Ok(ToolResult::ok(data));
        }

        let Some(llm) = &self.llm else {
            return Ok(ToolResult::ok(Self::rule_based(&items, analysis_type)));
        };

        let request = CompletionRequest::new(Self::build_prompt(&Self::prepare_text(&items), analysis_type))
            .with_system(ANALYZE_SYSTEM_PROMPT)
            .with_temperature(0.3);
        match llm.generate(&request).await {
            Ok(completion) => {
                let parsed = extract_json(&completion.text)
                    .and_then(|s| serde_json::from_str::<Map<String, Value>>(s).ok());
                let data = parsed.unwrap_or_else(|| {
                    let mut m = Map::new();
                    m.insert("raw_analysis".to_string(), json!(completion.text));
                    m.insert("parsing_failed".to_string(), json!(true));
                    m
                });
                Ok(ToolResult::ok(data).with_tokens(completion.total_tokens()))
            }
            Err(e) => {
                tracing::warn!(error = %e, "analyze llm call failed, using rule-based analysis");
                Ok(ToolResult::ok(Self::rule_based(&items, analysis_type)))
            }
        }
    }
}

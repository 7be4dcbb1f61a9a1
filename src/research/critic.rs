//! Critic：收集数据的批判性评估
//!
//! 三个子分数：可信度（平台基础分 + 互动 / 作者 / 内容修正）、覆盖度（按查询推断的主题方面）、
//! 质量（正文长度、链接、时间戳、重复标题、平台多样性），按 0.4 / 0.35 / 0.25 加权为综合分。
//! 缺失的方面用于生成改进建议与追加搜索词。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::CriticSection;
use crate::core::Evidence;
use crate::llm::{CompletionRequest, LlmClient};
use crate::text::truncate_chars;

const DEFAULT_PLATFORM_CREDIBILITY: &[(&str, f64)] = &[
    ("zhihu", 0.7),
    ("wechat", 0.6),
    ("xiaohongshu", 0.5),
    ("douyin", 0.4),
];

const UNKNOWN_PLATFORM_CREDIBILITY: f64 = 0.5;

const EXPERT_MARKERS: &[&str] = &["专家", "分析师"];

const PROMOTIONAL_SIGNALS: &[&str] = &[
    "限时优惠", "立即购买", "点击链接", "扫码", "优惠券", "折扣", "促销", "广告",
];

type AspectTable = Vec<(&'static str, &'static [&'static str])>;

/// 问题严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// 评估中发现的一个问题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CritiqueIssue {
    #[serde(rename = "type")]
    pub issue_type: String,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

impl CritiqueIssue {
    fn new(issue_type: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            issue_type: issue_type.to_string(),
            severity,
            message: message.into(),
            item_id: None,
        }
    }

    fn for_item(mut self, item: &Evidence) -> Self {
        self.item_id = item.id();
        self
    }
}

/// 一次评估的结果（生成后不再修改）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CritiqueResult {
    pub overall_score: f64,
    pub credibility_score: f64,
    pub coverage_score: f64,
    pub quality_score: f64,
    pub issues: Vec<CritiqueIssue>,
    pub suggestions: Vec<String>,
    pub missing_aspects: Vec<String>,
    pub recommended_searches: Vec<String>,
    pub summary: String,
}

impl CritiqueResult {
    /// 综合分低于 0.7 或存在缺失方面
    pub fn needs_improvement(&self) -> bool {
        self.overall_score < 0.7 || !self.missing_aspects.is_empty()
    }

    pub fn has_critical_issues(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }

    /// 思维步骤用的紧凑观察文本
    pub fn observation(&self) -> String {
        format!(
            "可信度: {}, 覆盖度: {}, 质量: {}",
            percent(self.credibility_score),
            percent(self.coverage_score),
            percent(self.quality_score)
        )
    }
}

fn percent(score: f64) -> String {
    format!("{:.0}%", score * 100.0)
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// 评估器：平台可信度表可配置，LLM 增强可选
#[derive(Clone)]
pub struct Critic {
    platform_credibility: HashMap<String, f64>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl Default for Critic {
    fn default() -> Self {
        Self::new()
    }
}

impl Critic {
    pub fn new() -> Self {
        Self {
            platform_credibility: DEFAULT_PLATFORM_CREDIBILITY
                .iter()
                .map(|(p, c)| (p.to_string(), *c))
                .collect(),
            llm: None,
        }
    }

    /// 从配置创建；use_llm 为 false 时忽略传入的 LLM
    pub fn from_config(config: &CriticSection, llm: Option<Arc<dyn LlmClient>>) -> Self {
        let critic = Self::new().with_platform_credibility(config.platform_credibility.clone());
        match llm {
            Some(llm) if config.use_llm => critic.with_llm(llm),
            _ => critic,
        }
    }

    /// 覆盖部分平台的基础可信度
    pub fn with_platform_credibility(mut self, overrides: HashMap<String, f64>) -> Self {
        for (platform, score) in overrides {
            self.platform_credibility.insert(platform, clamp01(score));
        }
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    /// 规则评估
    pub fn evaluate(&self, data: &[Evidence], original_query: &str) -> CritiqueResult {
        if data.is_empty() {
            return CritiqueResult {
                issues: vec![CritiqueIssue::new(
                    "no_data",
                    Severity::Critical,
                    "没有收集到任何数据",
                )],
                suggestions: vec![
                    "尝试扩展搜索关键词".to_string(),
                    "检查平台连接状态".to_string(),
                ],
                summary: "数据收集失败，需要重新执行搜索".to_string(),
                ..CritiqueResult::default()
            };
        }

        let (credibility, mut issues) = self.evaluate_credibility(data);
        let (coverage, missing) = evaluate_coverage(data, original_query);
        let (quality, quality_issues) = evaluate_quality(data);
        issues.extend(quality_issues);

        let overall = clamp01(credibility * 0.4 + coverage * 0.35 + quality * 0.25);
        let suggestions = generate_suggestions(credibility, coverage, quality, &missing);
        let recommended_searches = generate_recommendations(data, original_query, &missing);
        let summary = generate_summary(overall, credibility, coverage, data.len());

        tracing::debug!(
            overall,
            credibility,
            coverage,
            quality,
            issues = issues.len(),
            "critique finished"
        );

        CritiqueResult {
            overall_score: overall,
            credibility_score: credibility,
            coverage_score: coverage,
            quality_score: quality,
            issues,
            suggestions,
            missing_aspects: missing,
            recommended_searches,
            summary,
        }
    }

    /// 规则评估后按需调用 LLM 复核；结果已足够好（≥0.8 且无严重问题）时不调用
    pub async fn evaluate_with_llm(&self, data: &[Evidence], original_query: &str) -> (CritiqueResult, u64) {
        let mut result = self.evaluate(data, original_query);
        let Some(llm) = &self.llm else {
            return (result, 0);
        };
        if result.overall_score >= 0.8 && !result.has_critical_issues() {
            return (result, 0);
        }

        let content_summary = data
            .iter()
            .take(10)
            .map(|item| {
                format!(
                    "- [{}] {}: {}",
                    item.platform(),
                    if item.title().is_empty() { "无标题" } else { item.title() },
                    truncate_chars(item.content(), 100)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "请评估以下关于\"{original_query}\"的情报数据质量:\n\n{content_summary}\n\n\
             请从以下角度评估:\n\
             1. 信息是否全面覆盖了主题的关键方面?\n\
             2. 数据来源是否可信?\n\
             3. 是否存在明显的信息缺口?\n\
             4. 建议补充搜索哪些关键词?\n\n\
             请用JSON格式返回评估结果。"
        );
        let request = CompletionRequest::new(prompt)
            .with_system("你是一个专业的情报分析师，擅长评估信息质量。")
            .with_temperature(0.3);

        match llm.generate(&request).await {
            Ok(completion) => {
                if completion.text.contains("缺口") || completion.text.contains("不足") {
                    result
                        .suggestions
                        .push("LLM分析发现: 需要补充更多角度的信息".to_string());
                }
                (result, completion.total_tokens())
            }
            Err(e) => {
                tracing::warn!(error = %e, "critic llm evaluation failed, keeping rule-based result");
                (result, 0)
            }
        }
    }

    fn base_credibility(&self, platform: &str) -> f64 {
        self.platform_credibility
            .get(platform)
            .copied()
            .unwrap_or(UNKNOWN_PLATFORM_CREDIBILITY)
    }

    fn evaluate_credibility(&self, data: &[Evidence]) -> (f64, Vec<CritiqueIssue>) {
        let mut issues = Vec::new();
        let mut total = 0.0;

        for item in data {
            let mut score = self.base_credibility(item.platform());

            let engagement = item.engagement();
            if engagement > 1000 {
                score += 0.1;
            } else if engagement > 100 {
                score += 0.05;
            }

            let author = item.author();
            if EXPERT_MARKERS.iter().any(|m| author.contains(m)) {
                score += 0.1;
            }

            let content = item.content();
            if content.chars().count() < 50 {
                issues.push(
                    CritiqueIssue::new("low_content", Severity::Warning, "内容过短，可能缺乏深度")
                        .for_item(item),
                );
                score -= 0.1;
            }
            if is_promotional(content) {
                issues.push(
                    CritiqueIssue::new("promotional", Severity::Warning, "可能为推广内容").for_item(item),
                );
                score -= 0.15;
            }

            total += clamp01(score);
        }

        let mut avg = total / data.len() as f64;
        if data.len() < 3 {
            issues.push(CritiqueIssue::new(
                "few_sources",
                Severity::Warning,
                format!("仅有 {} 个数据源，建议增加更多来源", data.len()),
            ));
            avg *= 0.9;
        }
        (avg, issues)
    }
}

fn is_promotional(content: &str) -> bool {
    let lower = content.to_lowercase();
    PROMOTIONAL_SIGNALS.iter().any(|s| lower.contains(s))
}

/// 按查询关键词推断应覆盖的主题方面（保持插入顺序）
pub fn infer_expected_aspects(query: &str) -> AspectTable {
    let q = query.to_lowercase();
    let mut aspects: AspectTable = Vec::new();

    if ["ai", "人工智能", "模型", "llm"].iter().any(|k| q.contains(k)) {
        aspects.push(("技术特点", &["技术", "架构", "算法", "模型", "参数"]));
        aspects.push(("性能表现", &["性能", "效果", "评测", "benchmark", "测试"]));
        aspects.push(("应用场景", &["应用", "场景", "用例", "案例"]));
        aspects.push(("市场分析", &["市场", "竞争", "份额", "趋势"]));
    }
    if ["公司", "企业", "融资"].iter().any(|k| q.contains(k)) {
        aspects.push(("融资情况", &["融资", "估值", "投资", "vc"]));
        aspects.push(("团队背景", &["创始人", "团队", "背景", "经历"]));
    }
    if ["产品", "功能", "更新"].iter().any(|k| q.contains(k)) {
        aspects.push(("产品功能", &["功能", "特性", "feature", "能力"]));
        aspects.push(("用户反馈", &["用户", "反馈", "评价", "体验"]));
        aspects.push(("定价策略", &["价格", "定价", "收费", "免费"]));
    }

    if aspects.is_empty() {
        aspects.push(("基本信息", &["是什么", "介绍", "简介"]));
        aspects.push(("详细分析", &["分析", "解读", "深度"]));
    }
    aspects
}

fn evaluate_coverage(data: &[Evidence], query: &str) -> (f64, Vec<String>) {
    let aspects = infer_expected_aspects(query);
    let all_content = data
        .iter()
        .map(|item| format!("{} {}", item.content(), item.title()))
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let missing: Vec<String> = aspects
        .iter()
        .filter(|(_, keywords)| !keywords.iter().any(|k| all_content.contains(&k.to_lowercase())))
        .map(|(aspect, _)| aspect.to_string())
        .collect();
    let covered = aspects.len() - missing.len();
    (covered as f64 / aspects.len() as f64, missing)
}

fn evaluate_quality(data: &[Evidence]) -> (f64, Vec<CritiqueIssue>) {
    let mut issues = Vec::new();
    let mut total = 0.0;

    for (i, item) in data.iter().enumerate() {
        let mut score = 0.7;

        let len = item.content().chars().count();
        if len > 500 {
            score += 0.15;
        } else if len > 200 {
            score += 0.1;
        }
        if item.url().is_some() {
            score += 0.05;
        }
        if item.published_at().is_some() {
            score += 0.05;
        }

        let title = item.title();
        if !title.is_empty() {
            let duplicates = data
                .iter()
                .enumerate()
                .filter(|(j, other)| *j != i && other.title() == title)
                .count();
            if duplicates > 0 {
                score -= 0.1 * duplicates as f64;
                issues.push(CritiqueIssue::new("duplicate", Severity::Info, "发现重复内容").for_item(item));
            }
        }

        total += clamp01(score);
    }

    let mut avg = total / data.len() as f64;
    let platforms: BTreeSet<&str> = data.iter().map(Evidence::platform).collect();
    if platforms.len() < 2 {
        issues.push(CritiqueIssue::new(
            "low_diversity",
            Severity::Warning,
            "数据来源单一，建议增加其他平台",
        ));
        avg *= 0.95;
    }
    (avg, issues)
}

fn generate_suggestions(credibility: f64, coverage: f64, quality: f64, gaps: &[String]) -> Vec<String> {
    let mut suggestions = Vec::new();
    if credibility < 0.6 {
        suggestions.push("建议增加权威来源的数据，如行业报告或专家观点".to_string());
    }
    if coverage < 0.7 && !gaps.is_empty() {
        let top: Vec<&str> = gaps.iter().take(3).map(String::as_str).collect();
        suggestions.push(format!("信息覆盖不完整，缺少以下方面: {}", top.join(", ")));
    }
    if quality < 0.6 {
        suggestions.push("数据质量有待提高，建议筛选更详细的内容".to_string());
    }
    if credibility >= 0.7 && coverage >= 0.7 && quality >= 0.7 {
        suggestions.push("数据质量良好，可以进行综合分析".to_string());
    }
    suggestions
}

/// 追加搜索建议：前两个缺失方面拼接查询，再加一个作者限定的搜索，最多 3 条
fn generate_recommendations(data: &[Evidence], query: &str, gaps: &[String]) -> Vec<String> {
    let mut out: Vec<String> = gaps.iter().take(2).map(|gap| format!("{query} {gap}")).collect();

    let entity = data
        .iter()
        .map(Evidence::author)
        .find(|a| !a.is_empty() && a.chars().count() < 20 && !query.contains(a));
    if let (Some(entity), Some(first_word)) = (entity, query.split_whitespace().next()) {
        out.push(format!("{entity} {first_word}"));
    }

    out.truncate(3);
    out
}

fn generate_summary(overall: f64, credibility: f64, coverage: f64, count: usize) -> String {
    let level = if overall >= 0.8 {
        "优秀"
    } else if overall >= 0.6 {
        "良好"
    } else if overall >= 0.4 {
        "一般"
    } else {
        "较差"
    };
    format!(
        "数据评估结果: {level} (综合评分: {})\n共收集 {count} 条数据，可信度 {}，覆盖度 {}",
        percent(overall),
        percent(credibility),
        percent(coverage)
    )
}

//! 搜索扩展：从已收集证据中挖掘值得追加搜索的关键词
//!
//! 三个独立抽取器：正文模式匹配（至少在 2 条证据中出现）、已知实体表、标题短语。
//! 候选按小写关键词合并（频次相加、相关度取最大），过滤已搜索过的词后打分排序，
//! 前 5 个作为优先关键词。LLM 抽取是可选补充。

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ExpanderSection;
use crate::core::Evidence;
use crate::llm::{CompletionRequest, LlmClient};
use crate::text::{tokenize_to_set, truncate_chars};

const KNOWN_COMPANIES: &[&str] = &[
    "DeepSeek", "OpenAI", "Anthropic", "Google", "Meta", "Microsoft", "百度", "阿里", "腾讯",
    "字节跳动", "华为", "商汤", "旷视", "Moonshot", "智谱", "百川", "零一万物", "MiniMax", "阶跃星辰",
];

const KNOWN_PRODUCTS: &[&str] = &[
    "GPT-4", "GPT-5", "Claude", "Gemini", "Llama", "Mistral", "文心一言", "通义千问", "Kimi", "豆包",
    "星火", "DeepSeek-V3", "DeepSeek-R1", "GLM-4",
];

const KNOWN_CONCEPTS: &[&str] = &[
    "RAG", "Agent", "多模态", "长上下文", "思维链", "强化学习", "RLHF", "DPO", "MoE", "Transformer",
    "推理优化",
];

/// 优先关键词数量
const PRIORITY_COUNT: usize = 5;

/// 候选来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Content,
    Title,
    KnownEntity,
    Llm,
}

/// 扩展候选；小写关键词相同即视为同一候选
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpansionCandidate {
    pub keyword: String,
    pub source: CandidateSource,
    pub relevance_score: f64,
    pub frequency: usize,
    pub context: Option<String>,
}

impl ExpansionCandidate {
    pub fn new(keyword: impl Into<String>, source: CandidateSource, relevance_score: f64, frequency: usize) -> Self {
        Self {
            keyword: keyword.into(),
            source,
            relevance_score,
            frequency,
            context: None,
        }
    }

    fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    fn key(&self) -> String {
        self.keyword.to_lowercase()
    }
}

impl PartialEq for ExpansionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ExpansionCandidate {}

impl Hash for ExpansionCandidate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// 扩展建议
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpansionPlan {
    pub candidates: Vec<ExpansionCandidate>,
    pub priority_keywords: Vec<String>,
    pub estimated_value: f64,
    pub reason: String,
}

impl ExpansionPlan {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

fn content_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"[A-Z][a-zA-Z]+(?:\s+[A-Z][a-zA-Z]+)*",
            r"[\x{4e00}-\x{9fa5}]{2,6}(?:公司|科技|AI|智能)",
            r"[A-Z]{2,6}(?:-\d+)?",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn title_caps_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"[A-Z][a-zA-Z0-9]+(?:\s+[A-Z][a-zA-Z0-9]+)*").ok())
        .as_ref()
}

fn title_cjk_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"[\x{4e00}-\x{9fa5}]{2,8}").ok())
        .as_ref()
}

/// 搜索扩展器
#[derive(Clone)]
pub struct SearchExpander {
    max_candidates: usize,
    llm: Option<Arc<dyn LlmClient>>,
}

impl Default for SearchExpander {
    fn default() -> Self {
        Self::new(20)
    }
}

impl SearchExpander {
    pub fn new(max_candidates: usize) -> Self {
        Self {
            max_candidates,
            llm: None,
        }
    }

    pub fn from_config(config: &ExpanderSection, llm: Option<Arc<dyn LlmClient>>) -> Self {
        let expander = Self::new(config.max_candidates);
        match llm {
            Some(llm) if config.use_llm => expander.with_llm(llm),
            _ => expander,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn max_candidates(&self) -> usize {
        self.max_candidates
    }

    /// 规则分析
    pub fn analyze(&self, data: &[Evidence], original_query: &str, already_searched: &[String]) -> ExpansionPlan {
        let seen = seen_set(original_query, already_searched);
        let mut candidates = extract_from_content(data, &seen);
        candidates.extend(match_known_entities(data, &seen));
        candidates.extend(extract_from_titles(data, original_query, &seen));
        self.build_plan(candidates, data.len(), original_query, &seen)
    }

    /// 规则分析 + LLM 抽取（未配置 LLM 时等同 analyze）；返回计划与消耗的 token
    pub async fn analyze_with_llm(
        &self,
        data: &[Evidence],
        original_query: &str,
        already_searched: &[String],
    ) -> (ExpansionPlan, u64) {
        let seen = seen_set(original_query, already_searched);
        let mut candidates = extract_from_content(data, &seen);
        candidates.extend(match_known_entities(data, &seen));
        candidates.extend(extract_from_titles(data, original_query, &seen));
        let (llm_candidates, tokens) = self.extract_with_llm(data, original_query).await;
        candidates.extend(llm_candidates);
        (self.build_plan(candidates, data.len(), original_query, &seen), tokens)
    }

    /// 让 LLM 提取值得深入搜索的关键词；失败时返回空列表
    pub async fn extract_with_llm(&self, data: &[Evidence], original_query: &str) -> (Vec<ExpansionCandidate>, u64) {
        let Some(llm) = &self.llm else {
            return (Vec::new(), 0);
        };
        if data.is_empty() {
            return (Vec::new(), 0);
        }

        let content_summary = data
            .iter()
            .take(8)
            .map(|item| format!("- {}: {}", item.title(), truncate_chars(item.content(), 150)))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "分析以下关于\"{original_query}\"的内容，提取值得深入搜索的关键词:\n\n{content_summary}\n\n\
             请提取:\n1. 相关公司/产品名称\n2. 重要技术概念\n3. 关键人物\n4. 值得追踪的话题\n\n\
             以JSON数组格式返回关键词列表，每个最多10个字。"
        );
        let request = CompletionRequest::new(prompt)
            .with_system("你是一个信息提取专家。只返回JSON数组，不要其他内容。")
            .with_temperature(0.3)
            .with_max_tokens(500);

        match llm.generate(&request).await {
            Ok(completion) => (parse_llm_keywords(&completion.text), completion.total_tokens()),
            Err(e) => {
                tracing::warn!(error = %e, "expander llm extraction failed");
                (Vec::new(), 0)
            }
        }
    }

    fn build_plan(
        &self,
        candidates: Vec<ExpansionCandidate>,
        data_len: usize,
        original_query: &str,
        seen: &HashSet<String>,
    ) -> ExpansionPlan {
        let query_lower = original_query.to_lowercase();
        let query_tokens = tokenize_to_set(original_query);

        let mut ranked: Vec<ExpansionCandidate> = merge_candidates(candidates)
            .into_iter()
            .filter(|c| {
                let key = c.key();
                !key.trim().is_empty() && !seen.contains(&key) && !query_lower.contains(&key)
            })
            .map(|mut c| {
                c.relevance_score = score(&c, &query_tokens);
                c
            })
            .collect();
        ranked.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        ranked.truncate(self.max_candidates);

        let priority_keywords: Vec<String> = ranked
            .iter()
            .take(PRIORITY_COUNT)
            .map(|c| c.keyword.clone())
            .collect();
        let estimated_value = estimate_value(&ranked, data_len);
        let reason = describe(&ranked);

        ExpansionPlan {
            candidates: ranked,
            priority_keywords,
            estimated_value,
            reason,
        }
    }
}

fn seen_set(original_query: &str, already_searched: &[String]) -> HashSet<String> {
    already_searched
        .iter()
        .map(|s| s.trim().to_lowercase())
        .chain(std::iter::once(original_query.trim().to_lowercase()))
        .collect()
}

/// 正文模式匹配：同一关键词在至少 2 条证据中出现才保留
fn extract_from_content(data: &[Evidence], seen: &HashSet<String>) -> Vec<ExpansionCandidate> {
    let mut freq: HashMap<String, (String, usize)> = HashMap::new();
    for item in data {
        let text = format!("{} {}", item.str_field("content").unwrap_or(""), item.summary());
        let mut in_item: HashSet<String> = HashSet::new();
        for pattern in content_patterns() {
            for m in pattern.find_iter(&text) {
                let keyword = m.as_str().trim();
                let key = keyword.to_lowercase();
                if keyword.chars().count() < 2 || seen.contains(&key) || !in_item.insert(key.clone()) {
                    continue;
                }
                freq.entry(key)
                    .or_insert_with(|| (keyword.to_string(), 0))
                    .1 += 1;
            }
        }
    }

    let mut out: Vec<ExpansionCandidate> = freq
        .into_values()
        .filter(|(_, n)| *n >= 2)
        .map(|(keyword, n)| ExpansionCandidate::new(keyword, CandidateSource::Content, 0.5, n))
        .collect();
    out.sort_by(|a, b| b.frequency.cmp(&a.frequency).then_with(|| a.keyword.cmp(&b.keyword)));
    out
}

/// 已知实体表匹配，频次为在全部文本中出现的次数
fn match_known_entities(data: &[Evidence], seen: &HashSet<String>) -> Vec<ExpansionCandidate> {
    let all_text = data
        .iter()
        .map(|item| format!("{} {} {}", item.title(), item.str_field("content").unwrap_or(""), item.summary()))
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let tables: [(&str, &[&str]); 3] = [
        ("company", KNOWN_COMPANIES),
        ("product", KNOWN_PRODUCTS),
        ("concept", KNOWN_CONCEPTS),
    ];
    tables
        .iter()
        .flat_map(|(category, entities)| entities.iter().map(move |e| (*category, *e)))
        .filter_map(|(category, entity)| {
            let key = entity.to_lowercase();
            if seen.contains(&key) {
                return None;
            }
            let count = all_text.matches(key.as_str()).count();
            (count > 0).then(|| {
                ExpansionCandidate::new(entity, CandidateSource::KnownEntity, 0.7, count).with_context(category)
            })
        })
        .collect()
}

/// 标题中的大写短语与中文短语；查询本身包含的片段不算
fn extract_from_titles(data: &[Evidence], original_query: &str, seen: &HashSet<String>) -> Vec<ExpansionCandidate> {
    let query_lower = original_query.to_lowercase();
    let mut out = Vec::new();
    for item in data {
        let title = item.title();
        if title.is_empty() {
            continue;
        }
        if let Some(re) = title_caps_pattern() {
            for m in re.find_iter(title) {
                let key = m.as_str().to_lowercase();
                if m.as_str().chars().count() >= 3 && !seen.contains(&key) && !query_lower.contains(&key) {
                    out.push(ExpansionCandidate::new(m.as_str(), CandidateSource::Title, 0.6, 1).with_context(title));
                }
            }
        }
        if let Some(re) = title_cjk_pattern() {
            for m in re.find_iter(title) {
                if !seen.contains(m.as_str()) && !query_lower.contains(m.as_str()) {
                    out.push(ExpansionCandidate::new(m.as_str(), CandidateSource::Title, 0.5, 1).with_context(title));
                }
            }
        }
    }
    out
}

/// 按小写关键词合并：频次相加，相关度取最大，来源跟随相关度最高的那条
fn merge_candidates(candidates: Vec<ExpansionCandidate>) -> Vec<ExpansionCandidate> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, ExpansionCandidate> = HashMap::new();
    for c in candidates {
        let key = c.key();
        match merged.get_mut(&key) {
            Some(existing) => {
                existing.frequency += c.frequency;
                if c.relevance_score > existing.relevance_score {
                    existing.relevance_score = c.relevance_score;
                    existing.source = c.source;
                    if c.context.is_some() {
                        existing.context = c.context;
                    }
                }
            }
            None => {
                order.push(key.clone());
                merged.insert(key, c);
            }
        }
    }
    order.into_iter().filter_map(|k| merged.remove(&k)).collect()
}

fn score(c: &ExpansionCandidate, query_tokens: &HashSet<String>) -> f64 {
    let mut score = c.relevance_score;
    if c.frequency >= 5 {
        score += 0.2;
    } else if c.frequency >= 3 {
        score += 0.1;
    }
    if c.source == CandidateSource::KnownEntity {
        score += 0.15;
    }
    if !tokenize_to_set(&c.keyword).is_disjoint(query_tokens) {
        score += 0.1;
    }
    let len = c.keyword.chars().count();
    if len < 2 {
        score -= 0.3;
    } else if len > 30 {
        score -= 0.2;
    }
    score.clamp(0.0, 1.0)
}

fn estimate_value(candidates: &[ExpansionCandidate], data_len: usize) -> f64 {
    if candidates.is_empty() {
        return 0.0;
    }
    let high = candidates.iter().filter(|c| c.relevance_score >= 0.7).count();
    let known = candidates
        .iter()
        .filter(|c| c.source == CandidateSource::KnownEntity)
        .count();
    let mut value = 0.5;
    value += (0.1 * high as f64).min(0.3);
    value += (0.05 * known as f64).min(0.2);
    if data_len < 5 {
        value += 0.1;
    }
    value.min(1.0)
}

fn describe(candidates: &[ExpansionCandidate]) -> String {
    if candidates.is_empty() {
        return "未发现需要扩展的关键词".to_string();
    }
    let entities: Vec<&str> = candidates
        .iter()
        .filter(|c| c.source == CandidateSource::KnownEntity)
        .take(3)
        .map(|c| c.keyword.as_str())
        .collect();
    let frequent: Vec<&str> = candidates
        .iter()
        .filter(|c| c.frequency >= 3)
        .take(3)
        .map(|c| c.keyword.as_str())
        .collect();

    let mut parts = Vec::new();
    if !entities.is_empty() {
        parts.push(format!("发现相关实体: {}", entities.join(", ")));
    }
    if !frequent.is_empty() {
        parts.push(format!("高频关键词: {}", frequent.join(", ")));
    }
    if parts.is_empty() {
        format!("发现 {} 个潜在扩展方向", candidates.len())
    } else {
        parts.join("; ")
    }
}

/// JSON 数组优先，否则按行取 2-20 字的短语
fn parse_llm_keywords(text: &str) -> Vec<ExpansionCandidate> {
    let array = match (text.find('['), text.rfind(']')) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str::<Vec<serde_json::Value>>(&text[start..=end]).ok()
        }
        _ => None,
    };

    match array {
        Some(items) => items
            .iter()
            .filter_map(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|kw| kw.chars().count() >= 2)
            .take(10)
            .map(|kw| ExpansionCandidate::new(kw, CandidateSource::Llm, 0.75, 1))
            .collect(),
        None => text
            .lines()
            .map(|line| line.trim().trim_start_matches(|c: char| c == '-' || c == '*' || c == '•' || c.is_ascii_digit() || c == '.'))
            .map(str::trim)
            .filter(|line| (2..=20).contains(&line.chars().count()))
            .take(10)
            .map(|kw| ExpansionCandidate::new(kw, CandidateSource::Llm, 0.6, 1))
            .collect(),
    }
}

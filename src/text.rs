//! 文本工具：中英文混合分词、关键词抽取、从 LLM 输出中截取 JSON
//!
//! 使用 jieba-rs 进行中文分词，英文按空白分词。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

/// 全局 Jieba 实例（延迟初始化）
static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

/// 判断字符是否为 CJK（中日韩）字符
pub fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |   // CJK Unified Ideographs
        '\u{3400}'..='\u{4DBF}' |   // CJK Unified Ideographs Extension A
        '\u{F900}'..='\u{FAFF}' |   // CJK Compatibility Ideographs
        '\u{3040}'..='\u{309F}' |   // Hiragana
        '\u{30A0}'..='\u{30FF}'     // Katakana
    )
}

/// 判断文本是否包含 CJK 字符
pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// 命令中的常见功能词（中文虚词 + 英文调研动词 / 冠词 / 介词）
const STOPWORDS: &[&str] = &[
    "的", "了", "在", "是", "我", "有", "和", "就", "不", "人", "都", "一", "个", "上", "也", "很",
    "到", "说", "要", "去", "你", "会", "着", "没有", "看", "好", "自己", "这", "监控", "分析", "搜索",
    "追踪", "最新", "最近", "动态", "一下", "帮我", "monitor", "analyze", "search", "find", "track",
    "latest", "recent", "the", "a", "an", "for", "of", "and", "to", "in", "on",
];

fn is_stopword(word: &str) -> bool {
    let lower = word.to_lowercase();
    STOPWORDS.contains(&lower.as_str())
}

/// 保留大小写的切分：先按引号与空白切开，含 CJK 的片段再交给 jieba
pub fn segment(text: &str) -> Vec<String> {
    let cleaned = text.replace(['\'', '"', '’', '“', '”'], " ");
    let mut out = Vec::new();
    for piece in cleaned.split_whitespace() {
        if contains_cjk(piece) {
            out.extend(get_jieba().cut(piece, false).into_iter().map(str::to_string));
        } else {
            out.push(piece.to_string());
        }
    }
    out.into_iter()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

/// 从命令中抽取关键词：去停用词，长度至少 2 个字符，去重后取前 limit 个
pub fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    segment(text)
        .into_iter()
        .filter(|w| w.chars().count() > 1 && !is_stopword(w))
        .filter(|w| seen.insert(w.to_lowercase()))
        .take(limit)
        .collect()
}

/// 小写分词（用于检索匹配）
pub fn tokenize(text: &str) -> Vec<String> {
    segment(text)
        .into_iter()
        .map(|s| s.to_lowercase())
        .filter(|s| s.chars().count() > 1 || s.chars().next().map(is_cjk).unwrap_or(false))
        .collect()
}

/// 分词并返回词集合（用于相似度计算）
pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// 两个词集合的 Jaccard 相似度
pub fn jaccard_similarity(set1: &HashSet<String>, set2: &HashSet<String>) -> f32 {
    if set1.is_empty() || set2.is_empty() {
        return 0.0;
    }
    let intersection = set1.intersection(set2).count() as f32;
    let union = set1.union(set2).count() as f32;
    intersection / union
}

/// 从 LLM 输出中截取 JSON：```json 代码块 > 普通 ``` 代码块 > 第一个 `{` 到最后一个 `}`
pub fn extract_json(text: &str) -> Option<&str> {
    let text = text.trim();
    if let Some(start) = text.find("```json") {
        let body = &text[start + 7..];
        let end = body.find("```").unwrap_or(body.len());
        return Some(body[..end].trim());
    }
    if let Some(start) = text.find("```") {
        let body = &text[start + 3..];
        let end = body.find("```").unwrap_or(body.len());
        return Some(body[..end].trim());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// 按字符截断（不切断多字节字符）
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        format!("{}...", text.chars().take(max).collect::<String>())
    }
}

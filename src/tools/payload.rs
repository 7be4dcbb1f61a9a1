//! 工具结果的类型化视图
//!
//! 工具与 RunState 之间仍以 JSON 对象传递；Executor 在边界处按工具类别解析为 ToolPayload，
//! 只从中取出证据、新关键词和观察文本。

use serde_json::{Map, Value};

use crate::core::{Evidence, TaskType};
use crate::text::truncate_chars;

/// 搜索类结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPayload {
    pub results: Vec<Evidence>,
    pub total: usize,
    pub discovered_keywords: Vec<String>,
}

/// 按工具类别区分的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ToolPayload {
    Search(SearchPayload),
    Analysis(Map<String, Value>),
    Memory {
        total: usize,
        timeline_changes: usize,
    },
    Report(Map<String, Value>),
    Other(Map<String, Value>),
}

impl ToolPayload {
    /// 按任务类型解析工具返回的 data
    pub fn parse(task_type: &TaskType, data: &Map<String, Value>) -> Self {
        match task_type {
            TaskType::Search => ToolPayload::Search(parse_search(data)),
            TaskType::Analyze => ToolPayload::Analysis(data.clone()),
            TaskType::MemorySearch => ToolPayload::Memory {
                total: data
                    .get("total")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or_else(|| array_len(data, "results")),
                timeline_changes: array_len(data, "timeline_changes"),
            },
            TaskType::Synthesize => ToolPayload::Report(data.clone()),
            TaskType::Other(_) => ToolPayload::Other(data.clone()),
        }
    }

    /// 可并入 collected_data 的证据（仅搜索类）
    pub fn evidence(&self) -> &[Evidence] {
        match self {
            ToolPayload::Search(p) => &p.results,
            _ => &[],
        }
    }

    pub fn discovered_keywords(&self) -> &[String] {
        match self {
            ToolPayload::Search(p) => &p.discovered_keywords,
            _ => &[],
        }
    }

    /// 成功步骤的观察文本
    pub fn observation(&self) -> String {
        match self {
            ToolPayload::Search(p) => {
                let mut obs = format!("找到 {} 条结果", p.total);
                if !p.discovered_keywords.is_empty() {
                    obs.push_str(&format!("，发现新关键词: {}", p.discovered_keywords.join(", ")));
                }
                obs
            }
            ToolPayload::Analysis(data) => {
                let mut obs = "分析完成".to_string();
                let points = array_len(data, "main_points");
                if points > 0 {
                    obs.push_str(&format!("，提取了 {points} 个要点"));
                }
                obs
            }
            ToolPayload::Memory {
                total,
                timeline_changes,
            } => {
                let mut obs = format!("找到 {total} 条历史记录");
                if *timeline_changes > 0 {
                    obs.push_str(&format!("，检测到 {timeline_changes} 个时间线变化"));
                }
                obs
            }
            ToolPayload::Report(data) => {
                let mut obs = "情报报告生成完成".to_string();
                if let Some(summary) = data.get("executive_summary").and_then(Value::as_str) {
                    obs.push_str(&format!(": {}", truncate_chars(summary, 50)));
                }
                obs
            }
            ToolPayload::Other(_) => "执行完成".to_string(),
        }
    }
}

/// 解析搜索结果：results 中的非对象条目被丢弃，total 缺失时取结果条数
pub fn parse_search(data: &Map<String, Value>) -> SearchPayload {
    let results: Vec<Evidence> = data
        .get("results")
        .and_then(Value::as_array)
        .map(|items| items.iter().cloned().filter_map(Evidence::from_value).collect())
        .unwrap_or_default();
    let total = data
        .get("total")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(results.len());
    let discovered_keywords = data
        .get("discovered_keywords")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    SearchPayload {
        results,
        total,
        discovered_keywords,
    }
}

fn array_len(data: &Map<String, Value>, key: &str) -> usize {
    data.get(key).and_then(Value::as_array).map(Vec::len).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_search_payload() {
        let data = map(json!({
            "results": [{"platform": "zhihu", "title": "t"}, "junk"],
            "discovered_keywords": ["DeepSeek R1", 3]
        }));
        let payload = ToolPayload::parse(&TaskType::Search, &data);
        assert_eq!(payload.evidence().len(), 1);
        assert_eq!(payload.discovered_keywords(), ["DeepSeek R1".to_string()]);
        assert_eq!(payload.observation(), "找到 1 条结果，发现新关键词: DeepSeek R1");
    }

    #[test]
    fn test_non_search_payload_has_no_evidence() {
        let data = map(json!({"results": [{"platform": "zhihu"}], "total": 1}));
        let payload = ToolPayload::parse(&TaskType::MemorySearch, &data);
        assert!(payload.evidence().is_empty());
        assert_eq!(payload.observation(), "找到 1 条历史记录");
    }

    #[test]
    fn test_analysis_observation_counts_points() {
        let data = map(json!({"main_points": ["a", "b"]}));
        let payload = ToolPayload::parse(&TaskType::Analyze, &data);
        assert_eq!(payload.observation(), "分析完成，提取了 2 个要点");
    }
}

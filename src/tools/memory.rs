//! 历史情报库检索（memory_search）
//!
//! MemoryStore 是进程内的情报记忆：synthesize 生成报告后写入摘要，后续运行通过 memory_search 回忆。
//! 相关度用分词后的 Jaccard 相似度，主体（subject）命中实体时加分。

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::core::ToolError;
use crate::text::{jaccard_similarity, tokenize_to_set};
use crate::tools::{ParamType, Params, Tool, ToolParameter, ToolResult};

/// 记忆类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Fact,
    Insight,
    Pattern,
    Summary,
    Entity,
}

impl MemoryType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fact" => Some(MemoryType::Fact),
            "insight" => Some(MemoryType::Insight),
            "pattern" => Some(MemoryType::Pattern),
            "summary" => Some(MemoryType::Summary),
            "entity" => Some(MemoryType::Entity),
            _ => None,
        }
    }
}

/// 一条记忆
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub content: String,
    pub memory_type: MemoryType,
    /// 相关主体（公司 / 产品名）
    pub entities: Vec<String>,
    pub importance: f64,
    /// 时间线变化类型（如 feature_removed / pricing_change）；None 表示普通记忆
    pub change_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(content: impl Into<String>, memory_type: MemoryType) -> Self {
        Self {
            id: format!("mem_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            content: content.into(),
            memory_type,
            entities: Vec::new(),
            importance: 0.5,
            change_type: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_entities(mut self, entities: Vec<String>) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_change(mut self, change_type: impl Into<String>) -> Self {
        self.change_type = Some(change_type.into());
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    fn mentions(&self, subject: &str) -> bool {
        let subject = subject.to_lowercase();
        self.entities.iter().any(|e| e.to_lowercase() == subject)
            || self.content.to_lowercase().contains(&subject)
    }
}

/// 检索命中
#[derive(Debug, Clone, Serialize)]
pub struct MemoryHit {
    #[serde(flatten)]
    pub entry: MemoryEntry,
    pub relevance_score: f64,
}

/// 进程内记忆库（可在多个运行间共享）
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<Vec<MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, entry: MemoryEntry) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按相关度回忆：subject 命中实体 +0.3，低于 min_relevance 的丢弃
    pub fn recall(
        &self,
        query: &str,
        subject: Option<&str>,
        memory_type: Option<MemoryType>,
        limit: usize,
        min_relevance: f64,
    ) -> Vec<MemoryHit> {
        let query_tokens = tokenize_to_set(query);
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut hits: Vec<MemoryHit> = entries
            .iter()
            .filter(|e| memory_type.map_or(true, |t| e.memory_type == t))
            .map(|e| {
                let mut score =
                    jaccard_similarity(&query_tokens, &tokenize_to_set(&e.content)) as f64;
                if e.content.to_lowercase().contains(&query.to_lowercase()) {
                    score += 0.3;
                }
                if subject.map_or(false, |s| e.mentions(s)) {
                    score += 0.3;
                }
                MemoryHit {
                    entry: e.clone(),
                    relevance_score: score.min(1.0),
                }
            })
            .filter(|h| h.relevance_score >= min_relevance)
            .collect();
        hits.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        hits.truncate(limit);
        hits
    }

    /// 主体的时间线变化（按时间升序）
    pub fn detect_changes(&self, subject: &str) -> Vec<MemoryEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut changes: Vec<MemoryEntry> = entries
            .iter()
            .filter(|e| e.change_type.is_some() && e.mentions(subject))
            .cloned()
            .collect();
        changes.sort_by_key(|e| e.created_at);
        changes
    }
}

/// 历史情报检索工具
#[derive(Debug, Clone, Default)]
pub struct MemorySearchTool {
    store: Arc<MemoryStore>,
}

impl MemorySearchTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "在历史情报库中搜索相关的历史信息，可以发现跨时间的变化。"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter::required("query", ParamType::String, "搜索查询"),
            ToolParameter::optional("subject", ParamType::String, "关注的主体（公司/产品名）"),
            ToolParameter::optional("memory_type", ParamType::String, "记忆类型过滤")
                .with_enum(&["fact", "insight", "pattern", "summary", "entity"]),
            ToolParameter::optional("detect_changes", ParamType::Boolean, "是否检测时间线变化"),
            ToolParameter::optional("limit", ParamType::Integer, "返回的最大结果数"),
        ]
    }

    async fn execute(&self, params: Params) -> Result<ToolResult, ToolError> {
        let query = params.get("query").and_then(Value::as_str).unwrap_or_default();
        let subject = params.get("subject").and_then(Value::as_str);
        let memory_type = params
            .get("memory_type")
            .and_then(Value::as_str)
            .and_then(MemoryType::parse);
        let detect = params
            .get("detect_changes")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(10);

        let hits = self.store.recall(query, subject, memory_type, limit, 0.3);

        let mut data = Map::new();
        data.insert("total".to_string(), json!(hits.len()));
        data.insert("results".to_string(), json!(hits));
        let changes = match (detect, subject) {
            (true, Some(s)) => json!(self
                .store
                .detect_changes(s)
                .iter()
                .map(|e| json!({
                    "change_type": e.change_type,
                    "description": e.content,
                    "detected_at": e.created_at,
                }))
                .collect::<Vec<_>>()),
            (true, None) => json!([]),
            _ => Value::Null,
        };
        data.insert("timeline_changes".to_string(), changes);
        Ok(ToolResult::ok(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.remember(
            MemoryEntry::new("DeepSeek API 价格下调 50%", MemoryType::Fact)
                .with_entities(vec!["DeepSeek".into()])
                .with_change("pricing_change")
                .with_created_at(Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap()),
        );
        store.remember(
            MemoryEntry::new("DeepSeek 聊天功能下线", MemoryType::Pattern)
                .with_entities(vec!["DeepSeek".into()])
                .with_change("feature_removed")
                .with_created_at(Utc.with_ymd_and_hms(2025, 11, 15, 12, 0, 0).unwrap()),
        );
        store.remember(MemoryEntry::new("Kimi 长文本能力", MemoryType::Insight));
        store
    }

    #[test]
    fn test_recall_ranks_relevant_entries() {
        let store = store();
        let hits = store.recall("DeepSeek", None, None, 10, 0.3);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.entry.content.contains("DeepSeek")));

        let facts = store.recall("DeepSeek", None, Some(MemoryType::Fact), 10, 0.3);
        assert_eq!(facts.len(), 1);
    }

    #[test]
    fn test_detect_changes_chronological() {
        let changes = store().detect_changes("deepseek");
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change_type.as_deref(), Some("feature_removed"));
    }

    #[tokio::test]
    async fn test_tool_output() {
        let tool = MemorySearchTool::new(store());
        let params = json!({"query": "DeepSeek", "subject": "DeepSeek", "detect_changes": true});
        let result = tool
            .execute(params.as_object().cloned().unwrap())
            .await
            .unwrap();
        let data = result.data.unwrap();
        assert_eq!(data["total"], json!(2));
        assert_eq!(data["timeline_changes"].as_array().unwrap().len(), 2);
    }
}

//! 平台搜索工具（platform_search）
//!
//! 离线实现：在本地 JSON 语料（证据对象数组）中检索。每个平台最多返回 limit 条；
//! 命中条目上的 `keywords` 字段汇总为 discovered_keywords（最多 3 个，不含查询本身）。
//! 语料文件缺失时返回空结果而不是报错。

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::core::{ErrorKind, Evidence, ToolError};
use crate::text::tokenize;
use crate::tools::{ParamType, Params, Tool, ToolParameter, ToolResult};

const DEFAULT_PLATFORMS: &[&str] = &["zhihu", "wechat"];
const MAX_DISCOVERED: usize = 3;

/// 多平台搜索
#[derive(Debug, Clone, Default)]
pub struct PlatformSearchTool {
    corpus: Vec<Evidence>,
}

impl PlatformSearchTool {
    pub fn new(corpus: Vec<Evidence>) -> Self {
        Self { corpus }
    }

    /// 从 JSON 文件加载语料；文件不存在时为空语料，格式错误返回 Parse 类错误
    pub fn from_path(path: &Path) -> Result<Self, ToolError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "search corpus not found, searches will return nothing");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ToolError::external(format!("read corpus {}: {e}", path.display())))?;
        let items: Vec<Value> = serde_json::from_str(&text)
            .map_err(|e| ToolError::new(ErrorKind::Parse, format!("corpus json: {e}")))?;
        let corpus: Vec<Evidence> = items.into_iter().filter_map(Evidence::from_value).collect();
        tracing::info!(items = corpus.len(), "search corpus loaded");
        Ok(Self { corpus })
    }

    pub fn corpus_len(&self) -> usize {
        self.corpus.len()
    }

    fn matches(item: &Evidence, query_lower: &str, tokens: &[String]) -> bool {
        let mut haystack = format!("{} {}", item.title(), item.content()).to_lowercase();
        if let Some(keywords) = item.0.get("keywords").and_then(Value::as_array) {
            for k in keywords.iter().filter_map(Value::as_str) {
                haystack.push(' ');
                haystack.push_str(&k.to_lowercase());
            }
        }
        haystack.contains(query_lower)
            || (!tokens.is_empty() && tokens.iter().all(|t| haystack.contains(t.as_str())))
    }
}

#[async_trait]
impl Tool for PlatformSearchTool {
    fn name(&self) -> &str {
        "platform_search"
    }

    fn description(&self) -> &str {
        "在中国主流社交媒体平台搜索相关内容。支持微信公众号、知乎、小红书、抖音。"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter::required("query", ParamType::String, "搜索关键词"),
            ToolParameter::optional(
                "platforms",
                ParamType::Array,
                "要搜索的平台列表 (wechat, zhihu, xiaohongshu, douyin)",
            ),
            ToolParameter::optional("time_range", ParamType::String, "时间范围: 1d, 7d, 30d, 90d")
                .with_enum(&["1d", "7d", "30d", "90d"]),
            ToolParameter::optional("limit", ParamType::Integer, "每个平台返回的最大结果数"),
        ]
    }

    async fn execute(&self, params: Params) -> Result<ToolResult, ToolError> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        let platforms: Vec<String> = params
            .get("platforms")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .filter(|v: &Vec<String>| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_PLATFORMS.iter().map(|s| s.to_string()).collect());
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(10);

        let query_lower = query.to_lowercase();
        let tokens = tokenize(&query);

        let mut results = Vec::new();
        for platform in &platforms {
            results.extend(
                self.corpus
                    .iter()
                    .filter(|item| item.platform() == platform)
                    .filter(|item| Self::matches(item, &query_lower, &tokens))
                    .take(limit)
                    .cloned(),
            );
        }

        let mut seen = HashSet::new();
        seen.insert(query_lower.clone());
        let discovered: Vec<String> = results
            .iter()
            .filter_map(|item| item.0.get("keywords").and_then(Value::as_array))
            .flatten()
            .filter_map(Value::as_str)
            .filter(|k| seen.insert(k.to_lowercase()))
            .take(MAX_DISCOVERED)
            .map(str::to_string)
            .collect();

        let mut data = Map::new();
        data.insert("total".to_string(), json!(results.len()));
        data.insert("results".to_string(), json!(results));
        data.insert("platforms_searched".to_string(), json!(platforms));
        data.insert("discovered_keywords".to_string(), json!(discovered));
        Ok(ToolResult::ok(data))
    }
}

//! 证据条目：工具收集到的松散类型记录
//!
//! 只有 `platform` 视为常在字段；其余字段（title / content / summary / author / url /
//! published_at / metrics）都可能缺失，访问器统一返回空串或 None。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 一条证据（透明包装 JSON 对象）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Evidence(pub Map<String, Value>);

impl Evidence {
    pub fn new(platform: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("platform".to_string(), Value::String(platform.into()));
        Self(map)
    }

    /// 构建器风格设置任意字段
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// 从 JSON 值转换；非对象返回 None
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn platform(&self) -> &str {
        self.str_field("platform").unwrap_or("unknown")
    }

    pub fn title(&self) -> &str {
        self.str_field("title").unwrap_or("")
    }

    /// 正文：优先 content，缺失时退回 summary
    pub fn content(&self) -> &str {
        self.str_field("content")
            .or_else(|| self.str_field("summary"))
            .unwrap_or("")
    }

    pub fn summary(&self) -> &str {
        self.str_field("summary").unwrap_or("")
    }

    pub fn author(&self) -> &str {
        self.str_field("author").unwrap_or("")
    }

    pub fn url(&self) -> Option<&str> {
        self.str_field("url")
    }

    pub fn published_at(&self) -> Option<&str> {
        self.str_field("published_at")
    }

    /// id 可能是字符串或数字
    pub fn id(&self) -> Option<String> {
        match self.0.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// 互动量：voteup + likes + reads
    ///
    /// 有 metrics 对象时只读其中的计数，否则读条目顶层的同名字段（语料文件的扁平格式）。
    pub fn engagement(&self) -> i64 {
        let counters = self
            .0
            .get("metrics")
            .and_then(Value::as_object)
            .unwrap_or(&self.0);
        ["voteup", "likes", "reads"]
            .iter()
            .filter_map(|k| counters.get(*k))
            .filter_map(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .sum()
    }
}

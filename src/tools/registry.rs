//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters / execute），由 ToolRegistry 按名注册与查找，
//! ToolExecutor 在调用前校验参数、调用时加超时并统一转 AgentError。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::core::ToolError;

/// 工具参数（JSON 对象）
pub type Params = Map<String, Value>;

/// 参数类型（用于调用前的基本类型检查）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

/// 参数定义
#[derive(Debug, Clone, Serialize)]
pub struct ToolParameter {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub description: &'static str,
    pub required: bool,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<&'static [&'static str]>,
}

impl ToolParameter {
    pub fn required(name: &'static str, param_type: ParamType, description: &'static str) -> Self {
        Self {
            name,
            param_type,
            description,
            required: true,
            enum_values: None,
        }
    }

    pub fn optional(name: &'static str, param_type: ParamType, description: &'static str) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    pub fn with_enum(mut self, values: &'static [&'static str]) -> Self {
        self.enum_values = Some(values);
        self
    }
}

/// 工具执行结果：success=false 是工具正常报告的失败（区别于 Err(ToolError) 的故障）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub data: Option<Map<String, Value>>,
    pub error: Option<String>,
    pub tokens_used: u64,
}

impl ToolResult {
    pub fn ok(data: Map<String, Value>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            tokens_used: 0,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            tokens_used: 0,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数定义、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（任务类型映射到这里）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数定义；ToolExecutor 在调用前据此校验
    fn parameters(&self) -> Vec<ToolParameter> {
        Vec::new()
    }

    /// 参数 JSON Schema（由 parameters 生成）
    fn parameters_schema(&self) -> Value {
        let params = self.parameters();
        let properties: Map<String, Value> = params
            .iter()
            .map(|p| {
                let mut prop = json!({ "type": p.param_type.as_str(), "description": p.description });
                if let Some(values) = p.enum_values {
                    prop["enum"] = json!(values);
                }
                (p.name.to_string(), prop)
            })
            .collect();
        let required: Vec<&str> = params.iter().filter(|p| p.required).map(|p| p.name).collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required
        })
    }

    /// 执行工具；Err 表示故障（网络、超时、第三方异常），交给 SelfHealer 处理
    async fn execute(&self, params: Params) -> Result<ToolResult, ToolError>;
}

/// 调用前校验：必填、基本类型、枚举；通过返回 None，否则返回错误文本
pub fn validate_params(definitions: &[ToolParameter], params: &Params) -> Option<String> {
    for def in definitions {
        match params.get(def.name) {
            None | Some(Value::Null) if def.required => {
                return Some(format!("Missing required parameter: {}", def.name));
            }
            None | Some(Value::Null) => {}
            Some(value) => {
                if !def.param_type.matches(value) {
                    return Some(format!(
                        "Parameter {} must be {}",
                        def.name,
                        def.param_type.as_str()
                    ));
                }
                if let (Some(values), Some(s)) = (def.enum_values, value.as_str()) {
                    if !values.contains(&s) {
                        return Some(format!(
                            "Parameter {} must be one of: {}",
                            def.name,
                            values.join(", ")
                        ));
                    }
                }
            }
        }
    }
    None
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名工具已存在时保留原有的并返回 false
    pub fn register(&mut self, tool: impl Tool + 'static) -> bool {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> bool {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            tracing::warn!(tool = %name, "duplicate tool registration ignored");
            return false;
        }
        self.tools.insert(name, tool);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 工具 schema JSON（name / description / parameters）
    pub fn to_schema_json(&self) -> String {
        let mut tools: Vec<Value> = self
            .tools
            .iter()
            .map(|(name, tool)| {
                json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        tools.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

use crate::template::Template;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a single tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declared type of a tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    /// JSON Schema type name
    pub fn as_str(self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
            ParameterType::Object => "object",
        }
    }

    /// Validator for values of this type.
    ///
    /// All type checking goes through this table so the loader (defaults) and
    /// the sandbox (call arguments) agree on what each tag accepts.
    pub fn validator(self) -> fn(&Value) -> bool {
        match self {
            ParameterType::String => Value::is_string,
            ParameterType::Integer => |v| v.is_i64() || v.is_u64(),
            ParameterType::Number => Value::is_number,
            ParameterType::Boolean => Value::is_boolean,
            ParameterType::Array => Value::is_array,
            ParameterType::Object => Value::is_object,
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        (self.validator())(value)
    }
}

impl std::fmt::Display for ParameterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the JSON type of a value, as reported in type mismatch errors
pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Extra constraint on a string parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterFormat {
    /// Relative path that stays inside the tool's working directory
    Path,
}

/// A declared tool parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Substitute unquoted into shell templates (discouraged)
    #[serde(default)]
    pub raw: bool,
    /// Hide the value in audit records
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ParameterFormat>,
}

/// Operation class a tool belongs to, matched against token scopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Write,
}

impl Default for Operation {
    fn default() -> Self {
        Operation::Write
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Read => f.write_str("read"),
            Operation::Write => f.write_str("write"),
        }
    }
}

/// How a tool's process is launched
#[derive(Debug, Clone, PartialEq)]
pub enum CommandTemplate {
    /// Rendered string passed to `sh -c`
    Shell(Template),
    /// Program plus argument templates, no shell involved
    Argv { command: String, args: Vec<Template> },
}

/// Validated execution block of a tool
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub template: CommandTemplate,
    pub timeout: Option<Duration>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, Template>,
    pub secrets: Vec<String>,
    pub max_output_bytes: Option<usize>,
    pub retries: u32,
    pub streaming: bool,
}

/// A tool loaded from the manifest. Immutable for the life of the process.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
    pub access: Operation,
    pub execution: Execution,
}

impl ToolDefinition {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// JSON Schema for the tool's arguments. Never includes execution details.
    pub fn input_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        for param in &self.parameters {
            let mut property = serde_json::json!({ "type": param.param_type.as_str() });
            if let Some(description) = &param.description {
                property["description"] = Value::String(description.clone());
            }
            if let Some(default) = &param.default {
                property["default"] = default.clone();
            }
            properties.insert(param.name.clone(), property);
        }

        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

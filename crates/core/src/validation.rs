// Argument validation for tool calls

use crate::types::{value_type_name, ParameterFormat, ParameterType, ToolDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Component, Path};
use thiserror::Error;

/// Characters a `raw` parameter may never contain
pub const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>', '\n', '\r', '\\', '\'', '"',
];

/// Per-request argument failures. Execution never starts when one is returned.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("missing required parameter '{0}'")]
    MissingRequired(String),

    #[error("parameter '{name}' must be of type {expected}, got {got}")]
    TypeMismatch {
        name: String,
        expected: ParameterType,
        got: &'static str,
    },

    #[error("unexpected parameter '{0}'")]
    UnexpectedArgument(String),

    #[error("parameter '{name}' rejected: {reason}")]
    UnsafeValue { name: String, reason: String },

    #[error("arguments must be a JSON object")]
    ArgumentsNotObject,
}

impl ValidationError {
    /// Stable kind string for the wire
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::MissingRequired(_) => "MissingRequired",
            ValidationError::TypeMismatch { .. } => "TypeMismatch",
            ValidationError::UnexpectedArgument(_) => "UnexpectedArgument",
            ValidationError::UnsafeValue { .. } => "UnsafeValue",
            ValidationError::ArgumentsNotObject => "InvalidArguments",
        }
    }
}

/// What to do with arguments the tool does not declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownArgumentPolicy {
    #[default]
    Reject,
    Ignore,
}

/// Arguments that passed validation, with defaults applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedArguments(BTreeMap<String, Value>);

impl ValidatedArguments {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Validate call arguments against the tool's declared parameters
pub fn validate_arguments(
    tool: &ToolDefinition,
    arguments: &Value,
    policy: UnknownArgumentPolicy,
) -> Result<ValidatedArguments, ValidationError> {
    let empty = serde_json::Map::new();
    let provided = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => return Err(ValidationError::ArgumentsNotObject),
    };

    if policy == UnknownArgumentPolicy::Reject {
        if let Some(extra) = provided.keys().find(|k| tool.parameter(k).is_none()) {
            return Err(ValidationError::UnexpectedArgument(extra.clone()));
        }
    }

    let mut validated = BTreeMap::new();
    for param in &tool.parameters {
        // An explicit null counts as omitted
        let value = match provided.get(&param.name) {
            Some(Value::Null) | None => match &param.default {
                Some(default) => default.clone(),
                None if param.required => {
                    return Err(ValidationError::MissingRequired(param.name.clone()))
                }
                None => continue,
            },
            Some(value) => value.clone(),
        };

        if !param.param_type.accepts(&value) {
            return Err(ValidationError::TypeMismatch {
                name: param.name.clone(),
                expected: param.param_type,
                got: value_type_name(&value),
            });
        }

        check_value(&param.name, &value, param.raw, param.format)?;
        validated.insert(param.name.clone(), value);
    }

    Ok(ValidatedArguments(validated))
}

fn check_value(
    name: &str,
    value: &Value,
    raw: bool,
    format: Option<ParameterFormat>,
) -> Result<(), ValidationError> {
    let unsafe_value = |reason: &str| ValidationError::UnsafeValue {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    match value {
        Value::String(s) => {
            if s.contains('\0') {
                return Err(unsafe_value("contains a NUL byte"));
            }
            if raw && s.contains(SHELL_METACHARACTERS) {
                return Err(unsafe_value("contains shell metacharacters"));
            }
            if format == Some(ParameterFormat::Path) && !is_contained_path(s) {
                return Err(unsafe_value("path must be relative and stay inside the working directory"));
            }
            Ok(())
        }
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| check_value(name, item, raw, format)),
        Value::Object(map) => {
            if raw {
                return Err(unsafe_value("objects cannot be substituted raw"));
            }
            map.values().try_for_each(|v| check_value(name, v, false, None))
        }
        _ => Ok(()),
    }
}

/// True when `path` is relative and never climbs above its starting point
pub fn is_contained_path(path: &str) -> bool {
    if path.starts_with('/') || path.starts_with('\\') || path.starts_with('~') {
        return false;
    }
    Path::new(path).components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

// Rendering a tool's command template into a concrete program invocation

use crate::types::{CommandTemplate, ToolDefinition};
use crate::validation::ValidatedArguments;
use serde_json::Value;

/// A fully rendered command, ready to spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Quote a value for POSIX `sh` so it is always a single literal word
pub fn shell_quote(value: &str) -> String {
    const SAFE: &[u8] = b"_-.,/:=@%+";
    if !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || SAFE.contains(&b))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Text form of a value for substitution outside a shell
fn plain_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Shell form of a value. Arrays become one quoted word per element.
fn shell_text(value: &Value, raw: bool) -> String {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| shell_text(item, raw))
            .collect::<Vec<_>>()
            .join(" "),
        _ if raw => plain_text(value),
        Value::Null => String::new(),
        _ => shell_quote(&plain_text(value)),
    }
}

/// Render the tool's execution template with validated arguments.
///
/// Omitted optional parameters render as empty text (shell) or are dropped
/// when they make up a whole argv entry.
pub fn prepare(tool: &ToolDefinition, args: &ValidatedArguments) -> PreparedCommand {
    let value_of = |name: &str| args.get(name).unwrap_or(&Value::Null);

    let (program, argv) = match &tool.execution.template {
        CommandTemplate::Shell(template) => {
            let script = template.render(|name| {
                let raw = tool.parameter(name).map(|p| p.raw).unwrap_or(false);
                shell_text(value_of(name), raw)
            });
            ("sh".to_string(), vec!["-c".to_string(), script])
        }
        CommandTemplate::Argv { command, args: templates } => {
            let mut argv = Vec::with_capacity(templates.len());
            for template in templates {
                match template.sole_placeholder().map(value_of) {
                    Some(Value::Array(items)) => argv.extend(items.iter().map(plain_text)),
                    Some(Value::Null) => {}
                    _ => argv.push(template.render(|name| plain_text(value_of(name)))),
                }
            }
            (command.clone(), argv)
        }
    };

    let env = tool
        .execution
        .env
        .iter()
        .map(|(key, template)| (key.clone(), template.render(|name| plain_text(value_of(name)))))
        .collect();

    PreparedCommand {
        program,
        args: argv,
        env,
    }
}

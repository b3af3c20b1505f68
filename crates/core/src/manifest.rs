// Tool manifest loading and validation
//
// A manifest is parsed into raw document structs first, then every tool is
// validated and converted. The first violation aborts the load, so callers
// either get a complete registry or nothing.

use crate::registry::{ManifestInfo, ToolRegistry};
use crate::template::Template;
use crate::types::{CommandTemplate, Execution, Operation, ParameterSpec, ToolDefinition};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Manifest loading failures. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Parse(String),

    #[error("malformed tool '{tool}': {reason}")]
    Malformed { tool: String, reason: String },
}

impl LoadError {
    fn malformed(tool: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }
}

/// Source format of a manifest document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Yaml,
    Json,
}

impl ManifestFormat {
    /// Guess from the file extension. Unknown extensions are read as YAML,
    /// which also accepts JSON documents.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ManifestFormat::Json,
            _ => ManifestFormat::Yaml,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    version: Option<serde_yaml::Value>,
    #[serde(default)]
    tools: ToolEntries,
}

/// `tools` may be a list, or a mapping keyed by tool name
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ToolEntries {
    List(Vec<RawTool>),
    Map(BTreeMap<String, RawTool>),
}

impl Default for ToolEntries {
    fn default() -> Self {
        ToolEntries::List(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTool {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Vec<ParameterSpec>,
    #[serde(default)]
    access: Operation,
    execution: RawExecution,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
struct RawExecution {
    #[serde(default)]
    shell: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    /// Seconds
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default, alias = "workingDir")]
    working_dir: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    secrets: Vec<String>,
    #[serde(default, alias = "maxOutputBytes")]
    max_output_bytes: Option<usize>,
    #[serde(default)]
    retries: u32,
    #[serde(default)]
    streaming: bool,
}

/// Load a manifest file into an immutable registry
pub fn load(path: impl AsRef<Path>) -> Result<ToolRegistry, LoadError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let registry = load_str_with_base(&source, ManifestFormat::from_path(path), &base_dir)?;

    tracing::info!(
        manifest = %path.display(),
        tools = registry.len(),
        "Loaded tool manifest"
    );
    Ok(registry)
}

/// Load a manifest from memory. Relative working directories stay relative.
pub fn load_str(source: &str, format: ManifestFormat) -> Result<ToolRegistry, LoadError> {
    load_str_with_base(source, format, Path::new(""))
}

fn load_str_with_base(
    source: &str,
    format: ManifestFormat,
    base_dir: &Path,
) -> Result<ToolRegistry, LoadError> {
    let document: ManifestDocument = match format {
        ManifestFormat::Json => {
            serde_json::from_str(source).map_err(|e| LoadError::Parse(e.to_string()))?
        }
        ManifestFormat::Yaml => {
            serde_yaml::from_str(source).map_err(|e| LoadError::Parse(e.to_string()))?
        }
    };

    let raw_tools: Vec<(String, RawTool)> = match document.tools {
        ToolEntries::List(tools) => tools
            .into_iter()
            .enumerate()
            .map(|(i, tool)| {
                let name = tool.name.clone().unwrap_or_default();
                if name.is_empty() {
                    Err(LoadError::malformed(&format!("#{}", i), "tool has no name"))
                } else {
                    Ok((name, tool))
                }
            })
            .collect::<Result<_, _>>()?,
        ToolEntries::Map(tools) => tools
            .into_iter()
            .map(|(key, tool)| match &tool.name {
                Some(name) if name != &key => Err(LoadError::malformed(
                    &key,
                    format!("name '{}' does not match its key", name),
                )),
                _ => Ok((key, tool)),
            })
            .collect::<Result<_, _>>()?,
    };

    let mut seen = HashSet::new();
    let mut tools = Vec::with_capacity(raw_tools.len());
    for (name, raw) in raw_tools {
        if !seen.insert(name.clone()) {
            return Err(LoadError::malformed(&name, "duplicate tool name"));
        }
        tools.push(validate_tool(name, raw, base_dir)?);
    }

    let info = ManifestInfo {
        name: document.name.unwrap_or_else(|| "gantz".to_string()),
        description: document.description,
        version: document.version.map(|v| match v {
            serde_yaml::Value::String(s) => s,
            other => serde_yaml::to_string(&other)
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
        }),
    };

    Ok(ToolRegistry::from_tools(info, tools))
}

fn validate_tool(name: String, raw: RawTool, base_dir: &Path) -> Result<ToolDefinition, LoadError> {
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(LoadError::malformed(
            &name,
            "name may only contain letters, digits, '_', '-' and '.'",
        ));
    }

    if raw.description.trim().is_empty() {
        return Err(LoadError::malformed(&name, "description must not be empty"));
    }

    let mut param_names = HashSet::new();
    for param in &raw.parameters {
        if param.name.is_empty() {
            return Err(LoadError::malformed(&name, "parameter has no name"));
        }
        if !param_names.insert(param.name.as_str()) {
            return Err(LoadError::malformed(
                &name,
                format!("duplicate parameter '{}'", param.name),
            ));
        }
        if let Some(default) = &param.default {
            if param.required {
                return Err(LoadError::malformed(
                    &name,
                    format!("required parameter '{}' cannot have a default", param.name),
                ));
            }
            if !param.param_type.accepts(default) {
                return Err(LoadError::malformed(
                    &name,
                    format!(
                        "default for '{}' is not of type {}",
                        param.name, param.param_type
                    ),
                ));
            }
        }
    }

    let execution = validate_execution(&name, raw.execution, &param_names, base_dir)?;

    Ok(ToolDefinition {
        name,
        description: raw.description.trim().to_string(),
        parameters: raw.parameters,
        access: raw.access,
        execution,
    })
}

fn validate_execution(
    tool: &str,
    raw: RawExecution,
    params: &HashSet<&str>,
    base_dir: &Path,
) -> Result<Execution, LoadError> {
    let parse = |source: &str| -> Result<Template, LoadError> {
        let template =
            Template::parse(source).map_err(|e| LoadError::malformed(tool, e.to_string()))?;
        if let Some(missing) = template.placeholders().into_iter().find(|p| !params.contains(p)) {
            return Err(LoadError::malformed(
                tool,
                format!("placeholder '{{{{{}}}}}' has no matching parameter", missing),
            ));
        }
        Ok(template)
    };

    let template = match (raw.shell, raw.command) {
        (Some(_), Some(_)) => {
            return Err(LoadError::malformed(
                tool,
                "execution must define either 'shell' or 'command', not both",
            ))
        }
        (None, None) => {
            return Err(LoadError::malformed(
                tool,
                "execution must define 'shell' or 'command'",
            ))
        }
        (Some(shell), None) => {
            if !raw.args.is_empty() {
                return Err(LoadError::malformed(tool, "'args' requires 'command'"));
            }
            let template = parse(&shell)?;
            template
                .check_shell_context()
                .map_err(|e| LoadError::malformed(tool, e.to_string()))?;
            CommandTemplate::Shell(template)
        }
        (None, Some(command)) => {
            // The program itself is never caller-controlled
            let program = Template::parse(&command).map_err(|e| LoadError::malformed(tool, e.to_string()))?;
            if !program.placeholders().is_empty() {
                return Err(LoadError::malformed(
                    tool,
                    "'command' cannot contain placeholders; use 'args'",
                ));
            }
            if command.trim().is_empty() {
                return Err(LoadError::malformed(tool, "'command' must not be empty"));
            }
            let args = raw
                .args
                .iter()
                .map(|arg| parse(arg))
                .collect::<Result<Vec<_>, _>>()?;
            CommandTemplate::Argv { command, args }
        }
    };

    let timeout = match raw.timeout {
        Some(secs) if !(secs.is_finite() && secs > 0.0) => {
            return Err(LoadError::malformed(tool, "timeout must be a positive number of seconds"))
        }
        Some(secs) => Some(
            Duration::try_from_secs_f64(secs)
                .map_err(|_| LoadError::malformed(tool, "timeout out of range"))?,
        ),
        None => None,
    };

    let working_dir = match raw.working_dir {
        Some(dir) => {
            let text = dir.to_string_lossy();
            if text.contains("{{") {
                return Err(LoadError::malformed(tool, "'working_dir' cannot contain placeholders"));
            }
            Some(if dir.is_absolute() { dir } else { base_dir.join(dir) })
        }
        None => None,
    };

    let mut env = BTreeMap::new();
    for (key, value) in &raw.env {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(LoadError::malformed(tool, format!("invalid env name '{}'", key)));
        }
        env.insert(key.clone(), parse(value)?);
    }

    for secret in &raw.secrets {
        if secret.is_empty() || secret.contains('=') {
            return Err(LoadError::malformed(tool, format!("invalid secret name '{}'", secret)));
        }
    }

    if raw.max_output_bytes == Some(0) {
        return Err(LoadError::malformed(tool, "max_output_bytes must be positive"));
    }

    Ok(Execution {
        template,
        timeout,
        working_dir,
        env,
        secrets: raw.secrets,
        max_output_bytes: raw.max_output_bytes,
        retries: raw.retries,
        streaming: raw.streaming,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParameterType;
    use std::io::Write;

    const MANIFEST: &str = r#"
name: ops-tools
description: Tools for the ops team
version: "1.2"
tools:
  - name: echo_tool
    description: Echo a message back
    access: read
    parameters:
      - name: msg
        type: string
        required: true
        description: Message to echo
    execution:
      shell: "echo {{msg}}"
      timeout: 5
  - name: list_files
    description: List files in a directory
    parameters:
      - name: dir
        type: string
        default: "."
        format: path
      - name: flags
        type: array
    execution:
      command: ls
      args: ["{{flags}}", "{{dir}}"]
      working_dir: /tmp
"#;

    #[test]
    fn test_load_valid_manifest() {
        let registry = load_str(MANIFEST, ManifestFormat::Yaml).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.info().name, "ops-tools");
        assert_eq!(registry.info().version.as_deref(), Some("1.2"));

        let echo = registry.get("echo_tool").unwrap();
        assert_eq!(echo.access, Operation::Read);
        assert_eq!(echo.parameters[0].param_type, ParameterType::String);
        assert_eq!(echo.execution.timeout, Some(Duration::from_secs(5)));
        assert!(matches!(echo.execution.template, CommandTemplate::Shell(_)));

        let ls = registry.get("list_files").unwrap();
        assert_eq!(ls.access, Operation::Write);
        assert_eq!(ls.execution.working_dir.as_deref(), Some(Path::new("/tmp")));
    }

    #[test]
    fn test_load_tools_as_mapping() {
        let source = r#"
tools:
  greet:
    description: Say hello
    execution:
      command: echo
      args: ["hello"]
"#;
        let registry = load_str(source, ManifestFormat::Yaml).unwrap();
        assert!(registry.get("greet").is_some());
        assert_eq!(registry.info().name, "gantz");
    }

    #[test]
    fn test_load_json_manifest() {
        let source = r#"{
            "name": "json-tools",
            "version": 3,
            "tools": [{
                "name": "date",
                "description": "Print the date",
                "execution": { "command": "date" }
            }]
        }"#;
        let registry = load_str(source, ManifestFormat::Json).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.info().version.as_deref(), Some("3"));
    }

    #[test]
    fn test_unresolved_placeholder_fails() {
        let source = r#"
tools:
  - name: ok_tool
    description: fine
    execution: { shell: "true" }
  - name: bad_tool
    description: references an undeclared parameter
    parameters:
      - { name: msg, type: string, required: true }
    execution:
      shell: "echo {{msg}} {{target}}"
"#;
        match load_str(source, ManifestFormat::Yaml) {
            Err(LoadError::Malformed { tool, reason }) => {
                assert_eq!(tool, "bad_tool");
                assert!(reason.contains("target"));
            }
            other => panic!("expected Malformed, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_duplicate_tool_names_fail() {
        let source = r#"
tools:
  - { name: a, description: one, execution: { shell: "true" } }
  - { name: a, description: two, execution: { shell: "true" } }
"#;
        assert!(matches!(
            load_str(source, ManifestFormat::Yaml),
            Err(LoadError::Malformed { tool, .. }) if tool == "a"
        ));
    }

    #[test]
    fn test_required_with_default_fails() {
        let source = r#"
tools:
  - name: t
    description: d
    parameters:
      - { name: x, type: string, required: true, default: "y" }
    execution: { shell: "echo {{x}}" }
"#;
        assert!(matches!(
            load_str(source, ManifestFormat::Yaml),
            Err(LoadError::Malformed { .. })
        ));
    }

    #[test]
    fn test_ill_typed_default_fails() {
        let source = r#"
tools:
  - name: t
    description: d
    parameters:
      - { name: count, type: integer, default: "ten" }
    execution: { shell: "seq {{count}}" }
"#;
        let err = load_str(source, ManifestFormat::Yaml).unwrap_err();
        assert!(err.to_string().contains("count"));
    }

    #[test]
    fn test_empty_description_fails() {
        let source = r#"
tools:
  - { name: t, description: "  ", execution: { shell: "true" } }
"#;
        assert!(matches!(
            load_str(source, ManifestFormat::Yaml),
            Err(LoadError::Malformed { .. })
        ));
    }

    #[test]
    fn test_shell_and_command_exclusive() {
        let source = r#"
tools:
  - name: t
    description: d
    execution: { shell: "true", command: "true" }
"#;
        assert!(load_str(source, ManifestFormat::Yaml).is_err());

        let source = r#"
tools:
  - name: t
    description: d
    execution: { timeout: 3 }
"#;
        assert!(load_str(source, ManifestFormat::Yaml).is_err());
    }

    #[test]
    fn test_placeholder_in_command_fails() {
        let source = r#"
tools:
  - name: t
    description: d
    parameters: [{ name: prog, type: string }]
    execution: { command: "{{prog}}" }
"#;
        assert!(load_str(source, ManifestFormat::Yaml).is_err());
    }

    #[test]
    fn test_non_positive_timeout_fails() {
        let source = r#"
tools:
  - name: t
    description: d
    execution: { shell: "true", timeout: 0 }
"#;
        assert!(load_str(source, ManifestFormat::Yaml).is_err());
    }

    #[test]
    fn test_huge_timeout_is_malformed() {
        let source = r#"
tools:
  - name: t
    description: d
    execution: { shell: "true", timeout: 1e300 }
"#;
        match load_str(source, ManifestFormat::Yaml) {
            Err(LoadError::Malformed { tool, reason }) => {
                assert_eq!(tool, "t");
                assert_eq!(reason, "timeout out of range");
            }
            other => panic!("expected Malformed, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_quoted_shell_placeholder_fails() {
        for shell in [
            r#"'echo "Hello {{msg}}"'"#,
            r#""echo 'Hello {{msg}}'""#,
            r#""echo $(printf %s {{msg}})""#,
            r#""echo `printf %s {{msg}}`""#,
        ] {
            let source = format!(
                "tools:\n  - name: greet\n    description: d\n    parameters: [{{ name: msg, type: string }}]\n    execution: {{ shell: {} }}\n",
                shell
            );
            match load_str(&source, ManifestFormat::Yaml) {
                Err(LoadError::Malformed { tool, reason }) => {
                    assert_eq!(tool, "greet");
                    assert!(reason.contains("placeholder 'msg'"), "{}", reason);
                }
                other => panic!("{} should fail to load, got {:?}", shell, other.map(|r| r.len())),
            }
        }
    }

    #[test]
    fn test_syntax_error_is_parse_error() {
        let err = load_str("tools: [", ManifestFormat::Yaml).unwrap_err();
        assert!(matches!(err, LoadError::Parse(_)));
    }

    #[test]
    fn test_load_file_resolves_relative_working_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gantz.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "tools:\n  - name: t\n    description: d\n    execution:\n      shell: pwd\n      working_dir: scripts"
        )
        .unwrap();

        let registry = load(&path).unwrap();
        let tool = registry.get("t").unwrap();
        assert_eq!(
            tool.execution.working_dir.as_deref(),
            Some(dir.path().join("scripts").as_path())
        );
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load("/nonexistent/gantz.yaml").unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }
}

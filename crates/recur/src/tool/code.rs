use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::json;

use crate::error::Error;
use crate::interp::{ExecProfile, Sandbox, Value};
use crate::llm::types::ToolDefinition;
use crate::tool::{Tool, ToolOutput};

/// Session used when the model does not name one. The agent runner's
/// FINAL_VAR terminal reads from the same default.
pub const DEFAULT_SESSION: &str = "default";

/// Name of the sandbox execution tool. The engine recognizes results from
/// this tool and attaches them to trajectory events as interpreter
/// results.
pub const EXECUTE_CODE_TOOL: &str = "execute_code";

fn session_arg(input: &serde_json::Value) -> String {
    input
        .get("session")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_SESSION)
        .to_string()
}

/// Runs code in the sandbox and returns the full `InterpreterResult` as
/// JSON, errors included, so the model can adapt to failures.
pub struct ExecuteCodeTool {
    sandbox: Arc<Sandbox>,
}

impl ExecuteCodeTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

impl Tool for ExecuteCodeTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: EXECUTE_CODE_TOOL.into(),
            description: "Execute code in a sandboxed interpreter with persistent session \
                          variables. Supports assignments, loops, functions, and imports of \
                          pure utility modules (math, json, re, time, collections, path, url). \
                          Variables bound at top level persist across calls in the same session."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "The code to execute"
                    },
                    "session": {
                        "type": "string",
                        "description": "Session id for persistent state (default: 'default')"
                    },
                    "profile": {
                        "type": "string",
                        "enum": ["quick", "default", "analysis", "extended"],
                        "description": "Resource profile (default: 'default')"
                    },
                    "context": {
                        "type": "object",
                        "description": "Variables to overlay onto the session for this run"
                    }
                },
                "required": ["code"]
            }),
        }
    }

    fn execute(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let code = input
                .get("code")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Engine("execute_code: code is required".into()))?;
            let session = session_arg(&input);
            let profile = match input.get("profile").and_then(|v| v.as_str()) {
                Some(name) => ExecProfile::parse(name).ok_or_else(|| {
                    Error::Engine(format!("execute_code: unknown profile '{name}'"))
                })?,
                None => ExecProfile::Default,
            };
            let overrides = input
                .get("context")
                .and_then(|v| v.as_object())
                .map(|obj| {
                    obj.iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v)))
                        .collect::<BTreeMap<String, Value>>()
                });

            let result = self.sandbox.execute(code, &session, profile, overrides).await;
            let is_error = result.is_error();
            let content = serde_json::to_string(&result)?;
            Ok(ToolOutput {
                content,
                is_error,
            })
        })
    }
}

/// Reads one variable from a session without running code.
pub struct ReadVariableTool {
    sandbox: Arc<Sandbox>,
}

impl ReadVariableTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

impl Tool for ReadVariableTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_variable".into(),
            description: "Read the value of a variable from an interpreter session.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": {
                        "type": "string",
                        "description": "Variable name"
                    },
                    "session": {
                        "type": "string",
                        "description": "Session id (default: 'default')"
                    }
                },
                "required": ["name"]
            }),
        }
    }

    fn execute(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let name = input
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Engine("read_variable: name is required".into()))?;
            let session = session_arg(&input);
            match self.sandbox.read_variable(&session, name).await {
                Some(value) => Ok(ToolOutput::success(value.to_repr())),
                None => Ok(ToolOutput::error(format!(
                    "Variable '{name}' not found in session '{session}'"
                ))),
            }
        })
    }
}

/// Binds one variable in a session without running code.
pub struct WriteVariableTool {
    sandbox: Arc<Sandbox>,
}

impl WriteVariableTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

impl Tool for WriteVariableTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write_variable".into(),
            description: "Set a variable in an interpreter session to a JSON value.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": {
                        "type": "string",
                        "description": "Variable name"
                    },
                    "value": {
                        "description": "JSON value to bind"
                    },
                    "session": {
                        "type": "string",
                        "description": "Session id (default: 'default')"
                    }
                },
                "required": ["name", "value"]
            }),
        }
    }

    fn execute(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let name = input
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Engine("write_variable: name is required".into()))?;
            let value = input
                .get("value")
                .ok_or_else(|| Error::Engine("write_variable: value is required".into()))?;
            let session = session_arg(&input);
            self.sandbox
                .write_variable(&session, name, Value::from_json(value))
                .await;
            Ok(ToolOutput::success(format!(
                "Set '{name}' in session '{session}'"
            )))
        })
    }
}

/// Lists live interpreter sessions.
pub struct ListSessionsTool {
    sandbox: Arc<Sandbox>,
}

impl ListSessionsTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

impl Tool for ListSessionsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_sessions".into(),
            description: "List live interpreter sessions and their variable counts.".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    fn execute(
        &self,
        _input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let infos = self.sandbox.sessions().list().await;
            Ok(ToolOutput::success(serde_json::to_string(&infos)?))
        })
    }
}

/// All sandbox-backed tools, ready for registry registration.
pub fn code_tools(sandbox: Arc<Sandbox>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ExecuteCodeTool::new(sandbox.clone())),
        Arc::new(ReadVariableTool::new(sandbox.clone())),
        Arc::new(WriteVariableTool::new(sandbox.clone())),
        Arc::new(ListSessionsTool::new(sandbox)),
    ]
}

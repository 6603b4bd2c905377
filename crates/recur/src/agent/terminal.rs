use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::error::Error;
use crate::interp::Sandbox;
use crate::llm::types::ToolDefinition;
use crate::tool::{Tool, ToolOutput};

use super::TerminalKind;

/// Mutable state tracking agent termination, shared between the terminal
/// tools and the runner.
#[derive(Debug, Default)]
pub struct AgentState {
    pub is_terminal: bool,
    pub terminal_value: Option<String>,
    pub terminal_kind: Option<TerminalKind>,
}

/// Build the FINAL / FINAL_VAR terminal tools for one agent run. Injected
/// as per-call extras, never into the global registry.
pub(crate) fn terminal_tools(
    state: Arc<Mutex<AgentState>>,
    sandbox: Arc<Sandbox>,
    session: String,
) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(FinalTool {
            state: state.clone(),
        }),
        Arc::new(FinalVarTool {
            state,
            sandbox,
            session,
        }),
    ]
}

fn preview(text: &str) -> &str {
    let cut = text
        .char_indices()
        .nth(100)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    &text[..cut]
}

struct FinalTool {
    state: Arc<Mutex<AgentState>>,
}

impl Tool for FinalTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "FINAL".into(),
            description: "Terminate the agent and return your answer. Call this when you have \
                          fully solved the task and are ready to report the result."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "answer": {
                        "type": "string",
                        "description": "The final answer to the task"
                    }
                },
                "required": ["answer"]
            }),
        }
    }

    fn execute(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let answer = input
                .get("answer")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Agent("FINAL: answer is required".into()))?;

            let mut state = self.state.lock().expect("agent state lock poisoned");
            state.is_terminal = true;
            state.terminal_value = Some(answer.to_string());
            state.terminal_kind = Some(TerminalKind::NaturalLanguage);

            Ok(ToolOutput::success(format!(
                "Agent terminated with answer: {}",
                preview(answer)
            )))
        })
    }
}

struct FinalVarTool {
    state: Arc<Mutex<AgentState>>,
    sandbox: Arc<Sandbox>,
    session: String,
}

impl Tool for FinalVarTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "FINAL_VAR".into(),
            description: "Terminate the agent and return the value of a session variable. \
                          Use this when the answer is stored in a computed variable."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "variable_name": {
                        "type": "string",
                        "description": "Name of the session variable to return"
                    }
                },
                "required": ["variable_name"]
            }),
        }
    }

    fn execute(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let name = input
                .get("variable_name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Agent("FINAL_VAR: variable_name is required".into()))?;

            // An undefined variable does not terminate the run; the agent
            // gets the error and continues.
            let Some(value) = self.sandbox.read_variable(&self.session, name).await else {
                let available = self.sandbox.variable_names(&self.session).await;
                return Ok(ToolOutput::error(format!(
                    "Variable '{name}' not found in session '{}'. Available: [{}]",
                    self.session,
                    available.join(", ")
                )));
            };

            let rendered = value.to_display();
            let mut state = self.state.lock().expect("agent state lock poisoned");
            state.is_terminal = true;
            state.terminal_value = Some(rendered.clone());
            state.terminal_kind = Some(TerminalKind::ComputedVariable);

            Ok(ToolOutput::success(format!(
                "Agent terminated with variable '{name}' = {}",
                preview(&rendered)
            )))
        })
    }
}

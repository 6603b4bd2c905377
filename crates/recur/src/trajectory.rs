use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::interp::InterpreterResult;
use crate::llm::types::{ToolCall, ToolResult};

/// Maximum byte size for prompt/response snapshots in an event.
const EVENT_MAX_PAYLOAD_BYTES: usize = 8192;

/// Truncate a payload string at a UTF-8 boundary, appending a
/// `[truncated: N bytes omitted]` suffix past the cap.
pub(crate) fn truncate_payload(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let omitted = text.len() - cut;
    format!("{}[truncated: {omitted} bytes omitted]", &text[..cut])
}

/// One turn of a completion, recorded immutably after the turn finishes.
///
/// Events form a strict tree: sub-completion events carry a
/// `parent_call_id` naming the turn that spawned them and a depth strictly
/// greater than their parent's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryEvent {
    pub trajectory_id: Uuid,
    pub call_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_call_id: Option<Uuid>,
    pub depth: u32,
    /// Snapshot of the prompt that drove this turn.
    pub prompt: String,
    /// Assistant response text.
    #[serde(default)]
    pub response: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interpreter_results: Vec<InterpreterResult>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
    /// `"sub_complete"` or `"batch_complete"` on events produced inside a
    /// sub-call; `None` at the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_call_type: Option<String>,
}

impl TrajectoryEvent {
    pub fn new(trajectory_id: Uuid, depth: u32, prompt: &str) -> Self {
        Self {
            trajectory_id,
            call_id: Uuid::new_v4(),
            parent_call_id: None,
            depth,
            prompt: truncate_payload(prompt, EVENT_MAX_PAYLOAD_BYTES),
            response: String::new(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            interpreter_results: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            duration_ms: 0,
            timestamp: Utc::now(),
            error: None,
            estimated_cost: None,
            sub_call_type: None,
        }
    }
}

/// Append-only destination for trajectory events, invoked in creation
/// order. Implementations must not block for long; the engine emits
/// synchronously.
pub trait TrajectorySink: Send + Sync {
    fn emit(&self, event: &TrajectoryEvent);
}

/// Collects events in memory, mostly for tests and dashboards.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<TrajectoryEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TrajectoryEvent> {
        self.events.lock().expect("sink lock poisoned").clone()
    }
}

impl TrajectorySink for MemorySink {
    fn emit(&self, event: &TrajectoryEvent) {
        self.events
            .lock()
            .expect("sink lock poisoned")
            .push(event.clone());
    }
}

/// Appends one JSON object per line to `<dir>/<trajectory_id>.jsonl`.
///
/// Write failures are logged and swallowed: the event stream is an
/// observability surface, not a correctness dependency.
pub struct JsonlSink {
    dir: PathBuf,
    file: Mutex<Option<(Uuid, std::fs::File)>>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            file: Mutex::new(None),
        }
    }
}

impl TrajectorySink for JsonlSink {
    fn emit(&self, event: &TrajectoryEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize trajectory event");
                return;
            }
        };

        let mut guard = self.file.lock().expect("sink lock poisoned");
        let needs_open = match guard.as_ref() {
            Some((id, _)) => *id != event.trajectory_id,
            None => true,
        };
        if needs_open {
            if let Err(e) = std::fs::create_dir_all(&self.dir) {
                tracing::error!(error = %e, "failed to create trajectory log dir");
                return;
            }
            let path = self.dir.join(format!("{}.jsonl", event.trajectory_id));
            match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => *guard = Some((event.trajectory_id, file)),
                Err(e) => {
                    tracing::error!(error = %e, path = %path.display(), "failed to open trajectory log");
                    return;
                }
            }
        }

        if let Some((_, file)) = guard.as_mut()
            && let Err(e) = writeln!(file, "{line}")
        {
            tracing::error!(error = %e, "failed to append trajectory event");
        }
    }
}

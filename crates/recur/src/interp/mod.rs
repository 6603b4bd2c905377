//! Sandboxed script interpreter.
//!
//! Executes untrusted-but-not-adversarial code fragments in a small
//! Python-flavored language with persistent per-session state. The
//! isolation story: no host bindings exist at all (no filesystem, network,
//! process, or reflection surface to guard), imports resolve against a
//! fixed allowlist of pure utility modules, blocked identifiers are
//! rejected at parse time, and the evaluator enforces op, memory, output,
//! and deadline budgets while it runs.

pub mod ast;
mod eval;
mod lexer;
mod modules;
mod parser;
mod value;

pub mod sandbox;

pub use sandbox::{ExecProfile, Sandbox};
pub use value::{Key, Value};

use serde::{Deserialize, Serialize};

/// Modules importable inside the sandbox. Everything else is a security
/// violation.
pub const ALLOWED_MODULES: &[&str] = &["collections", "json", "math", "path", "re", "time", "url"];

/// Identifiers that are rejected at parse time: dynamic execution,
/// filesystem/process access, and reflection entry points.
pub const BLOCKED_IDENTIFIERS: &[&str] = &[
    "__import__",
    "breakpoint",
    "compile",
    "delattr",
    "dir",
    "eval",
    "exec",
    "exit",
    "getattr",
    "globals",
    "input",
    "locals",
    "open",
    "quit",
    "setattr",
    "vars",
];

/// Classified interpreter failure, mirrored into tool results so the LLM
/// can adapt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecErrorKind {
    ExecutionError,
    Timeout,
    SecurityViolation,
    ResourceExceeded,
}

/// Internal execution failure. Rendered to a string (plus kind) on the
/// [`InterpreterResult`] boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecError {
    Syntax(String),
    Runtime(String),
    Security {
        module: Option<String>,
        operation: Option<String>,
    },
    Timeout {
        timeout_ms: u64,
    },
    ResourceExceeded(String),
}

impl ExecError {
    pub fn kind(&self) -> ExecErrorKind {
        match self {
            Self::Syntax(_) | Self::Runtime(_) => ExecErrorKind::ExecutionError,
            Self::Security { .. } => ExecErrorKind::SecurityViolation,
            Self::Timeout { .. } => ExecErrorKind::Timeout,
            Self::ResourceExceeded(_) => ExecErrorKind::ResourceExceeded,
        }
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax(msg) => write!(f, "SyntaxError: {msg}"),
            Self::Runtime(msg) => write!(f, "{msg}"),
            Self::Security {
                module: Some(module),
                ..
            } => write!(
                f,
                "SecurityViolation: import of '{module}' is not allowed; allowed modules: {}",
                ALLOWED_MODULES.join(", ")
            ),
            Self::Security {
                operation: Some(op),
                ..
            } => write!(f, "SecurityViolation: use of '{op}' is not allowed"),
            Self::Security { .. } => write!(f, "SecurityViolation"),
            Self::Timeout { timeout_ms } => {
                write!(f, "TimeoutError: execution exceeded {timeout_ms}ms")
            }
            Self::ResourceExceeded(msg) => write!(f, "ResourceExceeded: {msg}"),
        }
    }
}

/// Result of one sandboxed execution, as delivered to tools and events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterResult {
    pub stdout: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ExecErrorKind>,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_peak_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_ms: Option<u64>,
}

impl InterpreterResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_classify() {
        assert_eq!(
            ExecError::Syntax("x".into()).kind(),
            ExecErrorKind::ExecutionError
        );
        assert_eq!(
            ExecError::Timeout { timeout_ms: 10 }.kind(),
            ExecErrorKind::Timeout
        );
        assert_eq!(
            ExecError::Security {
                module: Some("os".into()),
                operation: None
            }
            .kind(),
            ExecErrorKind::SecurityViolation
        );
    }

    #[test]
    fn security_violation_names_module_and_allowlist() {
        let err = ExecError::Security {
            module: Some("os".into()),
            operation: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("'os'"), "{msg}");
        assert!(msg.contains("math"), "{msg}");
        assert!(msg.contains("json"), "{msg}");
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ExecErrorKind::SecurityViolation).unwrap();
        assert_eq!(json, "\"security_violation\"");
    }

    #[test]
    fn allowlist_is_sorted_and_pure() {
        let mut sorted = ALLOWED_MODULES.to_vec();
        sorted.sort();
        assert_eq!(sorted, ALLOWED_MODULES);
        assert!(!ALLOWED_MODULES.contains(&"os"));
        assert!(!ALLOWED_MODULES.contains(&"sys"));
    }
}

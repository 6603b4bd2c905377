use thiserror::Error;

use crate::budget::BudgetViolation;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited by provider")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("SSE parse error: {0}")]
    SseParse(String),

    #[error("budget violated: {0}")]
    Budget(BudgetViolation),

    #[error("tool already registered: {0}")]
    ToolConflict(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("streaming does not support tool use")]
    StreamingWithTools,

    #[error("engine error: {0}")]
    Engine(String),

    #[error("agent error: {0}")]
    Agent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = Error::Api {
            status: 429,
            message: "rate limited".into(),
        };
        assert_eq!(err.to_string(), "API error (429): rate limited");

        let err = Error::ToolNotFound("unknown_tool".into());
        assert_eq!(err.to_string(), "tool not found: unknown_tool");

        let err = Error::ToolConflict("execute_code".into());
        assert_eq!(err.to_string(), "tool already registered: execute_code");

        let err = Error::StreamingWithTools;
        assert_eq!(err.to_string(), "streaming does not support tool use");
    }

    #[test]
    fn budget_violation_wraps_into_error() {
        let err = Error::Budget(BudgetViolation::TokenExhausted {
            used: 1200,
            budget: 1000,
        });
        assert!(err.to_string().contains("token budget exhausted"));
    }
}

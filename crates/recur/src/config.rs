use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::llm::types::ResponseFormat;

/// Policy knobs for sub-completion tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubCallPolicy {
    /// Register `sub_complete`/`batch_complete` as per-call extras.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cap on sub-calls issued within one top-level completion turn.
    #[serde(default = "default_max_per_turn")]
    pub max_per_turn: u32,
    /// Fraction of the parent's remaining token budget a sub-call may inherit.
    #[serde(default = "default_inheritance")]
    pub budget_inheritance: f64,
    /// Dollar cap on the accumulated cost of all sub-calls in one session.
    #[serde(default = "default_max_cost_per_session")]
    pub max_cost_per_session: f64,
}

impl Default for SubCallPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_turn: default_max_per_turn(),
            budget_inheritance: default_inheritance(),
            max_cost_per_session: default_max_cost_per_session(),
        }
    }
}

/// Options for one top-level completion. Every field is either a budget or
/// a policy knob; the engine never mutates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOptions {
    /// Cap on recursion depth (0 = no sub-calls permitted).
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Max combined input+output tokens per top-level call.
    #[serde(default = "default_token_budget")]
    pub token_budget: u64,
    /// Max estimated cost in dollars. `None` disables cost accounting limits.
    #[serde(default)]
    pub cost_budget: Option<f64>,
    /// Max tool-call invocations.
    #[serde(default = "default_tool_budget")]
    pub tool_budget: u32,
    /// Wallclock deadline for the whole completion tree.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Dispatch a turn's tool calls concurrently.
    #[serde(default)]
    pub parallel_tools: bool,
    /// Semaphore size for parallel dispatch.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Sampling temperature forwarded to the provider.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Stop sequences forwarded to the provider.
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    /// JSON-schema-constrained output request.
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    /// Sub-completion policy.
    #[serde(default)]
    pub sub_calls: SubCallPolicy,
    /// Attach the event list to the returned result.
    #[serde(default = "default_true")]
    pub include_events: bool,
    /// Gate registration of memory store/recall tools by the embedder.
    /// The engine itself treats those as ordinary registered tools.
    #[serde(default)]
    pub memory_enabled: bool,
    /// Reserved for file-tool collaborators; the core only plumbs it.
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            token_budget: default_token_budget(),
            cost_budget: None,
            tool_budget: default_tool_budget(),
            timeout_seconds: default_timeout_seconds(),
            parallel_tools: false,
            max_parallel: default_max_parallel(),
            temperature: None,
            stop_sequences: Vec::new(),
            response_format: None,
            sub_calls: SubCallPolicy::default(),
            include_events: true,
            memory_enabled: false,
            allowed_paths: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_depth() -> u32 {
    3
}

fn default_token_budget() -> u64 {
    100_000
}

fn default_tool_budget() -> u32 {
    25
}

fn default_timeout_seconds() -> u64 {
    120
}

fn default_max_parallel() -> usize {
    4
}

fn default_max_per_turn() -> u32 {
    5
}

fn default_inheritance() -> f64 {
    0.5
}

fn default_max_cost_per_session() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let opts = CompletionOptions::default();
        assert_eq!(opts.max_depth, 3);
        assert_eq!(opts.token_budget, 100_000);
        assert_eq!(opts.tool_budget, 25);
        assert_eq!(opts.timeout_seconds, 120);
        assert!(!opts.parallel_tools);
        assert!(opts.sub_calls.enabled);
        assert_eq!(opts.sub_calls.max_per_turn, 5);
        assert!((opts.sub_calls.budget_inheritance - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_json_deserializes_to_defaults() {
        let opts: CompletionOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.max_depth, 3);
        assert!(opts.cost_budget.is_none());
        assert!(opts.include_events);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let opts: CompletionOptions =
            serde_json::from_str(r#"{"token_budget": 500, "parallel_tools": true}"#).unwrap();
        assert_eq!(opts.token_budget, 500);
        assert!(opts.parallel_tools);
        assert_eq!(opts.tool_budget, 25);
    }

    #[test]
    fn sub_call_policy_roundtrips() {
        let policy = SubCallPolicy {
            enabled: false,
            max_per_turn: 2,
            budget_inheritance: 0.25,
            max_cost_per_session: 0.5,
        };
        let json = serde_json::to_string(&policy).unwrap();
        let back: SubCallPolicy = serde_json::from_str(&json).unwrap();
        assert!(!back.enabled);
        assert_eq!(back.max_per_turn, 2);
    }
}

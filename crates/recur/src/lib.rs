// --- Core modules ---
pub mod agent;
pub mod budget;
pub mod config;
pub mod engine;
pub mod error;
pub mod interp;
pub mod llm;
pub mod session;
pub mod tool;
pub mod trajectory;

// --- Agent re-exports ---
pub use agent::{
    AgentConfig, AgentResult, AgentRunner, AgentStatus, IterationSummary, TerminalKind,
};

// --- Budget re-exports ---
pub use budget::{BudgetLedger, BudgetViolation};

// --- Config re-exports ---
pub use config::{CompletionOptions, SubCallPolicy};

// --- Engine re-exports ---
pub use engine::subcall::MAX_DEPTH_SENTINEL;
pub use engine::{CONTEXT_QUERY_TOOL, CompletionResult, Engine, EngineBuilder};

// --- Error re-exports ---
pub use error::Error;

// --- Interpreter re-exports ---
pub use interp::{
    ALLOWED_MODULES, ExecErrorKind, ExecProfile, InterpreterResult, Sandbox, Value,
};

// --- LLM re-exports ---
pub use llm::anthropic::AnthropicProvider;
pub use llm::pricing::{estimate_cost, format_cost};
pub use llm::retry::{RetryConfig, RetryingProvider};
pub use llm::types::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, ResponseFormat, Role,
    StopReason, TokenUsage, ToolCall, ToolDefinition, ToolResult,
};
pub use llm::{BoxedProvider, DynLlmProvider, LlmProvider, OnText};

// --- Session re-exports ---
pub use session::{Session, SessionInfo, SessionManager};

// --- Tool re-exports ---
pub use tool::code::{DEFAULT_SESSION, EXECUTE_CODE_TOOL, code_tools};
pub use tool::registry::ToolRegistry;
pub use tool::{Tool, ToolOutput, validate_tool_input};

// --- Trajectory re-exports ---
pub use trajectory::{JsonlSink, MemorySink, TrajectoryEvent, TrajectorySink};

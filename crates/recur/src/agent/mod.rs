pub mod prompts;
pub mod terminal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CompletionOptions;
use crate::engine::{CONTEXT_QUERY_TOOL, Engine};
use crate::llm::LlmProvider;
use crate::tool::code::DEFAULT_SESSION;
use crate::trajectory::TrajectoryEvent;

use self::prompts::{ACTION_WINDOW, AGENT_SYSTEM_PROMPT, build_iteration_prompt};
use self::terminal::AgentState;

// Hard safety limits, applied silently at construction.
pub const ABSOLUTE_MAX_ITERATIONS: u32 = 50;
pub const ABSOLUTE_MAX_DEPTH: u32 = 5;
pub const ABSOLUTE_MAX_COST: f64 = 10.0;
pub const ABSOLUTE_MAX_TIMEOUT_SECONDS: u64 = 600;

/// Configuration for an autonomous agent run. Values beyond the hard
/// safety limits are clamped when the runner is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub max_depth: u32,
    pub token_budget: u64,
    pub cost_limit: f64,
    pub timeout_seconds: u64,
    pub tool_budget: u32,
    /// Query the documentation-retrieval tool with the task on the first
    /// iteration and fold the result into the system prompt.
    pub auto_context: bool,
    pub context_budget: u64,
    /// Attach the full event list to the result.
    pub trajectory_log: bool,
    /// Interpreter session shared by execute_code and FINAL_VAR.
    pub session: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_depth: 3,
            token_budget: 50_000,
            cost_limit: 2.0,
            timeout_seconds: 120,
            tool_budget: 50,
            auto_context: true,
            context_budget: 8_000,
            trajectory_log: true,
            session: DEFAULT_SESSION.to_string(),
        }
    }
}

impl AgentConfig {
    fn clamped(mut self) -> Self {
        self.max_iterations = self.max_iterations.min(ABSOLUTE_MAX_ITERATIONS).max(1);
        self.max_depth = self.max_depth.min(ABSOLUTE_MAX_DEPTH);
        self.cost_limit = self.cost_limit.min(ABSOLUTE_MAX_COST);
        self.timeout_seconds = self.timeout_seconds.min(ABSOLUTE_MAX_TIMEOUT_SECONDS);
        self
    }
}

/// How an agent run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    /// FINAL was called.
    NaturalLanguage,
    /// FINAL_VAR was called.
    ComputedVariable,
    IterationLimit,
    CostLimit,
    TokenLimit,
    Timeout,
    Cancelled,
    Error,
}

impl TerminalKind {
    pub fn is_forced(self) -> bool {
        !matches!(self, Self::NaturalLanguage | Self::ComputedVariable)
    }
}

/// Summary of one iteration, kept on the result for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: u32,
    pub tokens: u64,
    pub cost: Option<f64>,
    pub tool_calls: usize,
    pub response_preview: String,
}

/// Result of an agent run. Always structured; failures are recorded in
/// `terminal`/`error` rather than surfaced as exceptions.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub answer: String,
    pub terminal: TerminalKind,
    pub iterations: u32,
    pub total_tokens: u64,
    pub total_cost: Option<f64>,
    pub duration_ms: u64,
    pub forced_termination: bool,
    pub run_id: String,
    pub error: Option<String>,
    pub events: Vec<TrajectoryEvent>,
    pub iteration_summaries: Vec<IterationSummary>,
}

impl AgentResult {
    pub fn success(&self) -> bool {
        !self.forced_termination
    }
}

/// Snapshot of a live run for dashboards and cancellation decisions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStatus {
    pub run_id: Option<String>,
    pub iteration: u32,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub is_terminal: bool,
    pub cancelled: bool,
}

/// Iteration-based outer loop on top of the engine: observe → think → act
/// until a terminal tool fires or a guardrail trips.
pub struct AgentRunner<P: LlmProvider> {
    engine: Engine<P>,
    config: AgentConfig,
    cancelled: Arc<AtomicBool>,
    status: Mutex<AgentStatus>,
}

impl<P: LlmProvider + 'static> AgentRunner<P> {
    pub fn new(engine: Engine<P>, config: AgentConfig) -> Self {
        Self {
            engine,
            config: config.clamped(),
            cancelled: Arc::new(AtomicBool::new(false)),
            status: Mutex::new(AgentStatus::default()),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Request cancellation. Checked at iteration boundaries; in-flight
    /// tool handlers run to completion.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn status(&self) -> AgentStatus {
        self.status.lock().expect("status lock poisoned").clone()
    }

    /// Run the agent on a task until a terminal tool fires or a limit is
    /// reached. Never panics or errors out: every outcome is an
    /// [`AgentResult`].
    pub async fn run(&self, task: &str) -> AgentResult {
        let run_id = Uuid::new_v4().to_string()[..8].to_string();
        let started = Instant::now();
        let deadline = started + std::time::Duration::from_secs(self.config.timeout_seconds);
        self.cancelled.store(false, Ordering::SeqCst);
        {
            let mut status = self.status.lock().expect("status lock poisoned");
            *status = AgentStatus {
                run_id: Some(run_id.clone()),
                ..AgentStatus::default()
            };
        }

        let state = Arc::new(Mutex::new(AgentState::default()));
        let terminal_tools = terminal::terminal_tools(
            state.clone(),
            self.engine.sandbox().clone(),
            self.config.session.clone(),
        );

        let mut system_prompt = AGENT_SYSTEM_PROMPT.to_string();
        if self.config.auto_context {
            if let Some(context) = self.fetch_auto_context(task).await {
                system_prompt = format!("{system_prompt}\n\nRelevant context for this task:\n{context}");
            }
        }

        let mut iteration: u32 = 0;
        let mut total_tokens: u64 = 0;
        let mut total_cost: Option<f64> = Some(0.0);
        let mut previous_actions: Vec<String> = Vec::new();
        let mut all_events: Vec<TrajectoryEvent> = Vec::new();
        let mut iteration_summaries: Vec<IterationSummary> = Vec::new();
        let mut last_response = String::new();

        let finish = |answer: String,
                      terminal: TerminalKind,
                      iterations: u32,
                      total_tokens: u64,
                      total_cost: Option<f64>,
                      error: Option<String>,
                      events: Vec<TrajectoryEvent>,
                      summaries: Vec<IterationSummary>| AgentResult {
            answer,
            terminal,
            iterations,
            total_tokens,
            total_cost,
            duration_ms: started.elapsed().as_millis() as u64,
            forced_termination: terminal.is_forced(),
            run_id: run_id.clone(),
            error,
            events,
            iteration_summaries: summaries,
        };

        loop {
            // Guardrails, checked before every iteration.
            if self.cancelled.load(Ordering::SeqCst) {
                self.status.lock().expect("status lock poisoned").cancelled = true;
                return finish(
                    "Agent was cancelled.".into(),
                    TerminalKind::Cancelled,
                    iteration,
                    total_tokens,
                    total_cost,
                    None,
                    all_events,
                    iteration_summaries,
                );
            }
            if iteration >= self.config.max_iterations {
                break;
            }
            if let Some(cost) = total_cost
                && cost >= self.config.cost_limit
            {
                debug!(run_id = %run_id, cost, "agent cost limit reached");
                return finish(
                    last_response.clone(),
                    TerminalKind::CostLimit,
                    iteration,
                    total_tokens,
                    total_cost,
                    None,
                    all_events,
                    iteration_summaries,
                );
            }
            if total_tokens >= self.config.token_budget {
                debug!(run_id = %run_id, total_tokens, "agent token budget exhausted");
                return finish(
                    last_response.clone(),
                    TerminalKind::TokenLimit,
                    iteration,
                    total_tokens,
                    total_cost,
                    None,
                    all_events,
                    iteration_summaries,
                );
            }
            if Instant::now() >= deadline {
                return finish(
                    last_response.clone(),
                    TerminalKind::Timeout,
                    iteration,
                    total_tokens,
                    total_cost,
                    None,
                    all_events,
                    iteration_summaries,
                );
            }

            let remaining = self.config.token_budget.saturating_sub(total_tokens);
            let prompt = build_iteration_prompt(
                task,
                iteration,
                self.config.max_iterations,
                &previous_actions,
                Some(remaining),
            );

            // Per-iteration token slice: enough headroom to make progress,
            // bounded by what remains.
            let slice =
                remaining.min(2 * self.config.token_budget / u64::from(self.config.max_iterations));
            let options = CompletionOptions {
                max_depth: self.config.max_depth,
                token_budget: slice.max(1),
                tool_budget: self.config.tool_budget,
                timeout_seconds: self.config.timeout_seconds,
                include_events: self.config.trajectory_log,
                ..Default::default()
            };

            debug!(
                run_id = %run_id,
                iteration,
                total_tokens,
                "agent iteration"
            );

            let result = self
                .engine
                .complete_with_extras(
                    &prompt,
                    Some(system_prompt.as_str()),
                    options,
                    terminal_tools.clone(),
                )
                .await;

            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "agent iteration failed");
                    return finish(
                        format!("Agent failed: {e}"),
                        TerminalKind::Error,
                        iteration,
                        total_tokens,
                        total_cost,
                        Some(e.to_string()),
                        all_events,
                        iteration_summaries,
                    );
                }
            };

            total_tokens += result.total_tokens;
            total_cost = match (total_cost, result.total_cost) {
                (Some(acc), Some(cost)) => Some(acc + cost),
                _ => None,
            };
            last_response = result.response.clone();
            all_events.extend(result.events.iter().cloned());

            iteration_summaries.push(IterationSummary {
                iteration,
                tokens: result.total_tokens,
                cost: result.total_cost,
                tool_calls: result.total_tool_calls,
                response_preview: result.response.chars().take(200).collect(),
            });

            previous_actions.push(summarize_iteration(iteration, &result));
            if previous_actions.len() > ACTION_WINDOW {
                previous_actions.remove(0);
            }

            iteration += 1;
            {
                let mut status = self.status.lock().expect("status lock poisoned");
                status.iteration = iteration;
                status.total_tokens = total_tokens;
                status.total_cost = total_cost.unwrap_or(status.total_cost);
            }

            let terminal = {
                let state = state.lock().expect("agent state lock poisoned");
                state
                    .is_terminal
                    .then(|| (state.terminal_value.clone(), state.terminal_kind))
            };
            if let Some((value, kind)) = terminal {
                self.status.lock().expect("status lock poisoned").is_terminal = true;
                return finish(
                    value.unwrap_or_default(),
                    kind.unwrap_or(TerminalKind::NaturalLanguage),
                    iteration,
                    total_tokens,
                    total_cost,
                    None,
                    all_events,
                    iteration_summaries,
                );
            }
        }

        // Iteration limit reached without a terminal tool.
        warn!(run_id = %run_id, iterations = iteration, "agent forced termination");
        finish(
            last_response,
            TerminalKind::IterationLimit,
            iteration,
            total_tokens,
            total_cost,
            None,
            all_events,
            iteration_summaries,
        )
    }

    async fn fetch_auto_context(&self, task: &str) -> Option<String> {
        let retrieval = self.engine.registry().get(CONTEXT_QUERY_TOOL)?;
        let input = serde_json::json!({
            "query": task,
            "max_tokens": self.config.context_budget,
        });
        match retrieval.execute(input).await {
            Ok(output) if !output.is_error => Some(output.content),
            Ok(output) => {
                warn!(error = %output.content, "auto-context failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "auto-context failed");
                None
            }
        }
    }
}

/// Compress one iteration into a single line for later prompts. Keeps
/// context growth bounded regardless of tool output sizes.
fn summarize_iteration(iteration: u32, result: &crate::engine::CompletionResult) -> String {
    let mut summary = format!("[Iter {}] ", iteration + 1);
    if result.total_tool_calls > 0 {
        let tool_names: Vec<String> = result
            .events
            .iter()
            .flat_map(|e| e.tool_calls.iter().map(|c| c.name.clone()))
            .take(5)
            .collect();
        summary.push_str(&format!("Tools: {}", tool_names.join(", ")));
        if !result.response.is_empty() {
            let preview: String = result.response.chars().take(80).collect();
            summary.push_str(&format!(" -> {preview}"));
        }
    } else if result.response.is_empty() {
        summary.push_str("No response");
    } else {
        let preview: String = result.response.chars().take(100).collect();
        summary.push_str(&format!("Response: {preview}"));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::*;
    use crate::llm::types::ToolCall;
    use crate::tool::registry::ToolRegistry;
    use serde_json::json;

    fn agent(provider: MockProvider, config: AgentConfig) -> AgentRunner<MockProvider> {
        let engine = Engine::builder(Arc::new(provider))
            .registry(Arc::new(ToolRegistry::new()))
            .build();
        for tool in crate::tool::code::code_tools(engine.sandbox().clone()) {
            engine.registry().register(tool).unwrap();
        }
        AgentRunner::new(engine, config)
    }

    fn config() -> AgentConfig {
        AgentConfig {
            auto_context: false,
            ..Default::default()
        }
    }

    fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }
    }

    #[tokio::test]
    async fn computes_answer_via_interpreter_and_final_var() {
        // Iteration 1: run code; iteration 2: FINAL_VAR("result").
        let provider = MockProvider::new(vec![
            tool_response(
                vec![call(
                    "c1",
                    "execute_code",
                    json!({"code": "result = sum(range(1, 101))"}),
                )],
                100,
                20,
            ),
            text_response("computed, will report next", 50, 10),
            tool_response(
                vec![call("c2", "FINAL_VAR", json!({"variable_name": "result"}))],
                40,
                10,
            ),
            text_response("reported", 10, 5),
        ]);
        let runner = agent(provider, config());
        let result = runner.run("What is 1+2+...+100?").await;

        assert!(result.success(), "terminal: {:?}", result.terminal);
        assert_eq!(result.answer, "5050");
        assert_eq!(result.terminal, TerminalKind::ComputedVariable);
        assert_eq!(result.iterations, 2);
        assert!(!result.forced_termination);
    }

    #[tokio::test]
    async fn final_tool_terminates_with_text_answer() {
        let provider = MockProvider::new(vec![
            tool_response(
                vec![call("c1", "FINAL", json!({"answer": "the answer is 4"}))],
                20,
                5,
            ),
            text_response("done", 5, 2),
        ]);
        let runner = agent(provider, config());
        let result = runner.run("what is 2+2?").await;

        assert_eq!(result.terminal, TerminalKind::NaturalLanguage);
        assert_eq!(result.answer, "the answer is 4");
        assert_eq!(result.iterations, 1);
    }

    #[tokio::test]
    async fn final_var_on_undefined_variable_continues() {
        let provider = MockProvider::new(vec![
            // Iteration 1 tries FINAL_VAR on a variable that does not exist.
            tool_response(
                vec![call("c1", "FINAL_VAR", json!({"variable_name": "ghost"}))],
                20,
                5,
            ),
            text_response("hmm, it was not defined", 10, 5),
            // Iteration 2 terminates properly.
            tool_response(vec![call("c2", "FINAL", json!({"answer": "done"}))], 10, 5),
            text_response("ok", 5, 2),
        ]);
        let runner = agent(provider, config());
        let result = runner.run("task").await;

        assert_eq!(result.iterations, 2);
        assert_eq!(result.terminal, TerminalKind::NaturalLanguage);
        assert_eq!(result.answer, "done");
    }

    #[tokio::test]
    async fn forced_termination_after_iteration_limit() {
        let provider = MockProvider::new(vec![
            text_response("thinking about it", 10, 5),
            text_response("still thinking", 10, 5),
        ]);
        let runner = agent(
            provider,
            AgentConfig {
                max_iterations: 2,
                ..config()
            },
        );
        let result = runner.run("task").await;

        assert!(result.forced_termination);
        assert_eq!(result.terminal, TerminalKind::IterationLimit);
        assert_eq!(result.answer, "still thinking");
        assert_eq!(result.iterations, 2);
    }

    #[tokio::test]
    async fn final_iteration_prompt_contains_warning() {
        let provider = MockProvider::new(vec![
            text_response("first", 10, 5),
            text_response("second", 10, 5),
        ]);
        let runner = agent(
            provider,
            AgentConfig {
                max_iterations: 2,
                ..config()
            },
        );
        runner.run("task").await;
        let provider = runner.engine.provider();
        let requests = provider.requests.lock().unwrap();
        let prompts: Vec<String> = requests
            .iter()
            .map(|r| {
                r.messages
                    .first()
                    .map(|m| m.text_content())
                    .unwrap_or_default()
            })
            .collect();
        assert!(!prompts[0].contains("FINAL ITERATION"));
        assert!(prompts[1].contains("THIS IS YOUR FINAL ITERATION"));
    }

    #[tokio::test]
    async fn token_budget_guardrail_stops_the_loop() {
        let provider = MockProvider::new(vec![
            text_response("one", 600, 0),
            text_response("two", 600, 0),
            text_response("never", 1, 1),
        ]);
        let runner = agent(
            provider,
            AgentConfig {
                token_budget: 1000,
                max_iterations: 10,
                ..config()
            },
        );
        let result = runner.run("task").await;
        assert_eq!(result.terminal, TerminalKind::TokenLimit);
        assert!(result.forced_termination);
        assert!(result.total_tokens >= 1000);
    }

    struct SlowProvider {
        inner: MockProvider,
        delay: std::time::Duration,
    }

    impl LlmProvider for SlowProvider {
        async fn complete(
            &self,
            request: crate::llm::types::CompletionRequest,
        ) -> Result<crate::llm::types::CompletionResponse, crate::error::Error> {
            tokio::time::sleep(self.delay).await;
            self.inner.complete(request).await
        }
    }

    #[tokio::test]
    async fn cancellation_checked_at_iteration_boundary() {
        let provider = SlowProvider {
            inner: MockProvider::new(vec![
                text_response("one", 1, 1),
                text_response("two", 1, 1),
            ]),
            delay: std::time::Duration::from_millis(100),
        };
        let engine = Engine::builder(Arc::new(provider))
            .registry(Arc::new(ToolRegistry::new()))
            .build();
        let runner = Arc::new(AgentRunner::new(engine, config()));

        let background = runner.clone();
        let handle = tokio::spawn(async move { background.run("task").await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        runner.cancel();

        let result = handle.await.unwrap();
        assert_eq!(result.terminal, TerminalKind::Cancelled);
        // The in-flight iteration ran to completion; no further one started.
        assert_eq!(result.iterations, 1);
        assert!(result.forced_termination);
    }

    #[tokio::test]
    async fn adapter_failure_is_structured_not_panicking() {
        let provider = MockProvider::new(vec![]);
        let runner = agent(provider, config());
        let result = runner.run("task").await;
        assert_eq!(result.terminal, TerminalKind::Error);
        assert!(result.forced_termination);
        assert!(result.error.is_some());
    }

    #[test]
    fn config_clamps_to_hard_limits() {
        let config = AgentConfig {
            max_iterations: 500,
            max_depth: 20,
            cost_limit: 100.0,
            timeout_seconds: 86_400,
            ..AgentConfig::default()
        };
        let provider = MockProvider::new(vec![]);
        let runner = agent(provider, config);
        assert_eq!(runner.config().max_iterations, ABSOLUTE_MAX_ITERATIONS);
        assert_eq!(runner.config().max_depth, ABSOLUTE_MAX_DEPTH);
        assert_eq!(runner.config().cost_limit, ABSOLUTE_MAX_COST);
        assert_eq!(
            runner.config().timeout_seconds,
            ABSOLUTE_MAX_TIMEOUT_SECONDS
        );
    }

    #[test]
    fn summarize_iteration_formats() {
        let result = crate::engine::CompletionResult {
            response: "found the answer".into(),
            trajectory_id: Uuid::new_v4(),
            total_calls: 1,
            total_tokens: 10,
            total_input_tokens: 5,
            total_output_tokens: 5,
            total_tool_calls: 0,
            duration_ms: 1,
            total_cost: None,
            parsed: None,
            violation: None,
            events: vec![],
        };
        let summary = summarize_iteration(0, &result);
        assert!(summary.starts_with("[Iter 1]"));
        assert!(summary.contains("found the answer"));
    }
}

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::budget::BudgetLedger;
use crate::config::CompletionOptions;
use crate::error::Error;
use crate::llm::LlmProvider;
use crate::llm::types::{Message, ToolDefinition};
use crate::tool::{Tool, ToolOutput};

use super::{CONTEXT_QUERY_TOOL, EngineInner, LoopParams, SharedState, run_loop};

/// Returned instead of recursing once the depth cap is reached. The model
/// is expected to wrap up with what it already has.
pub const MAX_DEPTH_SENTINEL: &str =
    "Maximum recursion depth reached; summarize with available context";

/// Per-level state the sub-call tools are bound to: the level's ledger for
/// budget derivation, the in-flight turn for parent links, and the
/// per-turn sub-call counter.
pub(crate) struct LevelContext {
    pub(crate) ledger: Arc<Mutex<BudgetLedger>>,
    current_call: Mutex<Option<Uuid>>,
    calls_this_turn: AtomicU32,
    pub(crate) depth: u32,
    pub(crate) options: CompletionOptions,
}

impl LevelContext {
    pub(crate) fn new(
        ledger: Arc<Mutex<BudgetLedger>>,
        depth: u32,
        options: CompletionOptions,
    ) -> Self {
        Self {
            ledger,
            current_call: Mutex::new(None),
            calls_this_turn: AtomicU32::new(0),
            depth,
            options,
        }
    }

    /// Called by the engine when a turn starts dispatching tools. Resets
    /// the per-turn sub-call allowance and records the parent link for
    /// events produced by nested completions.
    pub(crate) fn begin_turn(&self, call_id: Uuid) {
        *self.current_call.lock().expect("level lock poisoned") = Some(call_id);
        self.calls_this_turn.store(0, Ordering::SeqCst);
    }

    fn current_call(&self) -> Option<Uuid> {
        *self.current_call.lock().expect("level lock poisoned")
    }

    /// Claim one of the per-turn sub-call slots.
    fn claim_call_slot(&self) -> Result<(), String> {
        let max = self.options.sub_calls.max_per_turn;
        let claimed = self.calls_this_turn.fetch_add(1, Ordering::SeqCst);
        if claimed >= max {
            self.calls_this_turn.fetch_sub(1, Ordering::SeqCst);
            return Err(format!(
                "Sub-call limit reached for this turn ({max}); continue with available context."
            ));
        }
        Ok(())
    }
}

/// Derive a sub-call token budget: the requested amount capped by the
/// inheritable fraction of the parent's remaining tokens.
fn inherited_budget(requested: Option<u64>, parent_remaining: u64, fraction: f64) -> u64 {
    let inherited = (parent_remaining as f64 * fraction) as u64;
    match requested {
        Some(requested) => requested.min(inherited),
        None => inherited,
    }
}

struct SubOutcome {
    response: String,
    tokens_used: u64,
    cost: f64,
    calls: usize,
}

/// Check the session-wide sub-call cost cap.
fn check_session_cost(shared: &SharedState, cap: f64) -> Result<(), String> {
    let spent = *shared
        .sub_call_cost
        .lock()
        .expect("sub-call cost lock poisoned");
    if spent >= cap {
        return Err(format!(
            "Sub-call cost cap reached (${spent:.4}/${cap:.4}); continue with available context."
        ));
    }
    Ok(())
}

/// Run one sub-completion: derive a child ledger from the parent, re-enter
/// the turn loop one level deeper, then charge the consumption back.
async fn run_sub<P: LlmProvider + 'static>(
    engine: Arc<EngineInner<P>>,
    shared: Arc<SharedState>,
    level: Arc<LevelContext>,
    query: String,
    system: Option<String>,
    token_budget: u64,
    sub_call_type: &'static str,
) -> Result<SubOutcome, Error> {
    let policy = &level.options.sub_calls;
    let child_ledger = {
        let parent = level.ledger.lock().expect("ledger lock poisoned");
        let fraction = policy.budget_inheritance;
        let cost_budget = parent.remaining_cost().map(|remaining| {
            let spent = *shared
                .sub_call_cost
                .lock()
                .expect("sub-call cost lock poisoned");
            (remaining * fraction).min((policy.max_cost_per_session - spent).max(0.0))
        });
        let tool_budget =
            ((parent.remaining_tool_calls() as f64 * fraction) as u32).max(1);
        parent.child(token_budget, cost_budget, tool_budget)
    };
    let child_ledger = Arc::new(Mutex::new(child_ledger));

    let mut sub_options = level.options.clone();
    sub_options.token_budget = token_budget;
    sub_options.response_format = None;

    debug!(
        depth = level.depth + 1,
        token_budget, sub_call_type, "entering sub-completion"
    );

    let outcome = run_loop(
        engine,
        shared.clone(),
        LoopParams {
            system: system.unwrap_or_default(),
            messages: vec![Message::user(&query)],
            options: sub_options,
            ledger: child_ledger.clone(),
            depth: level.depth + 1,
            parent_call_id: level.current_call(),
            sub_call_type: Some(sub_call_type.to_string()),
            extras: Vec::new(),
        },
    )
    .await?;

    let (tokens_used, cost) = {
        let child = child_ledger.lock().expect("ledger lock poisoned");
        let mut parent = level.ledger.lock().expect("ledger lock poisoned");
        parent.absorb(&child);
        (child.tokens_used(), child.cost_used())
    };
    *shared
        .sub_call_cost
        .lock()
        .expect("sub-call cost lock poisoned") += cost;

    Ok(SubOutcome {
        response: outcome.response,
        tokens_used,
        cost,
        calls: outcome.turns,
    })
}

/// Build the sub-completion extras for one level. Scoped to that level;
/// never registered globally.
pub(crate) fn sub_call_tools<P: LlmProvider + 'static>(
    engine: Arc<EngineInner<P>>,
    shared: Arc<SharedState>,
    level: Arc<LevelContext>,
) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(SubCompleteTool {
            engine: engine.clone(),
            shared: shared.clone(),
            level: level.clone(),
        }),
        Arc::new(BatchCompleteTool {
            engine,
            shared,
            level,
        }),
    ]
}

// --- sub_complete ---

#[derive(Deserialize)]
struct SubCompleteInput {
    query: String,
    #[serde(default)]
    max_tokens: Option<u64>,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    context_query: Option<String>,
}

struct SubCompleteTool<P: LlmProvider> {
    engine: Arc<EngineInner<P>>,
    shared: Arc<SharedState>,
    level: Arc<LevelContext>,
}

impl<P: LlmProvider + 'static> Tool for SubCompleteTool<P> {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "sub_complete".into(),
            description: "Delegate a focused sub-problem to a fresh LLM call with its own \
                          context window and budget. Use this when the current task can be \
                          broken into independent sub-tasks."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The sub-problem to solve"
                    },
                    "max_tokens": {
                        "type": "integer",
                        "description": "Optional token budget for the sub-call"
                    },
                    "system": {
                        "type": "string",
                        "description": "Optional system prompt for the sub-call"
                    },
                    "context_query": {
                        "type": "string",
                        "description": "Optional documentation query whose results are prepended to the sub-call's system prompt"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    fn execute(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let input: SubCompleteInput = serde_json::from_value(input)
                .map_err(|e| Error::Engine(format!("invalid sub_complete input: {e}")))?;

            // Depth cap: answer with the sentinel instead of recursing.
            if self.level.depth >= self.level.options.max_depth {
                return Ok(ToolOutput::success(MAX_DEPTH_SENTINEL));
            }
            if let Err(reason) =
                check_session_cost(&self.shared, self.level.options.sub_calls.max_cost_per_session)
            {
                return Ok(ToolOutput::error(reason));
            }
            if let Err(reason) = self.level.claim_call_slot() {
                return Ok(ToolOutput::error(reason));
            }

            let parent_remaining = self
                .level
                .ledger
                .lock()
                .expect("ledger lock poisoned")
                .remaining_tokens();
            let sub_tokens = inherited_budget(
                input.max_tokens,
                parent_remaining,
                self.level.options.sub_calls.budget_inheritance,
            );

            // Optional documentation context, prepended to the sub-call's
            // system prompt when the retrieval tool is registered.
            let mut system = input.system;
            if let Some(context_query) = input.context_query
                && let Some(retrieval) = self.engine.registry.get(CONTEXT_QUERY_TOOL)
            {
                let budget = (sub_tokens / 2).min(4000);
                match retrieval
                    .execute(json!({"query": context_query, "max_tokens": budget}))
                    .await
                {
                    Ok(output) if !output.is_error => {
                        let prefix = system.map(|s| s + "\n\n").unwrap_or_default();
                        system = Some(format!("{prefix}Relevant context:\n{}", output.content));
                    }
                    Ok(output) => {
                        tracing::warn!(error = %output.content, "context query failed");
                        system = system.or(Some(String::new()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "context query failed");
                        system = system.or(Some(String::new()));
                    }
                }
            }

            let outcome = run_sub(
                self.engine.clone(),
                self.shared.clone(),
                self.level.clone(),
                input.query,
                system,
                sub_tokens,
                "sub_complete",
            )
            .await;

            match outcome {
                Ok(outcome) => Ok(ToolOutput::success(
                    json!({
                        "response": outcome.response,
                        "tokens_used": outcome.tokens_used,
                        "cost": outcome.cost,
                        "calls": outcome.calls,
                    })
                    .to_string(),
                )),
                Err(e) => Ok(ToolOutput::error(format!("Sub-completion failed: {e}"))),
            }
        })
    }
}

// --- batch_complete ---

#[derive(Deserialize)]
struct BatchQuery {
    query: String,
    #[serde(default)]
    system: Option<String>,
}

#[derive(Deserialize)]
struct BatchCompleteInput {
    queries: Vec<BatchQuery>,
    #[serde(default = "default_batch_parallel")]
    max_parallel: usize,
    #[serde(default)]
    total_budget: Option<u64>,
}

fn default_batch_parallel() -> usize {
    3
}

struct BatchCompleteTool<P: LlmProvider> {
    engine: Arc<EngineInner<P>>,
    shared: Arc<SharedState>,
    level: Arc<LevelContext>,
}

impl<P: LlmProvider + 'static> Tool for BatchCompleteTool<P> {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "batch_complete".into(),
            description: "Execute multiple sub-LLM calls in parallel. Each query gets an \
                          equal share of the total budget. Use for independent sub-tasks \
                          that can run concurrently."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "queries": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "query": {"type": "string"},
                                "system": {"type": "string"}
                            },
                            "required": ["query"]
                        },
                        "description": "Sub-problems to solve in parallel"
                    },
                    "max_parallel": {
                        "type": "integer",
                        "description": "Maximum concurrent sub-calls (default: 3)"
                    },
                    "total_budget": {
                        "type": "integer",
                        "description": "Total token budget split evenly across all queries"
                    }
                },
                "required": ["queries"]
            }),
        }
    }

    fn execute(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let input: BatchCompleteInput = serde_json::from_value(input)
                .map_err(|e| Error::Engine(format!("invalid batch_complete input: {e}")))?;

            if input.queries.is_empty() {
                return Ok(ToolOutput::success(json!({"results": []}).to_string()));
            }
            if self.level.depth >= self.level.options.max_depth {
                return Ok(ToolOutput::success(MAX_DEPTH_SENTINEL));
            }

            let parent_remaining = self
                .level
                .ledger
                .lock()
                .expect("ledger lock poisoned")
                .remaining_tokens();
            let total = inherited_budget(
                input.total_budget,
                parent_remaining,
                self.level.options.sub_calls.budget_inheritance,
            );
            let per_query = total / input.queries.len() as u64;

            let semaphore = Arc::new(tokio::sync::Semaphore::new(input.max_parallel.max(1)));
            let mut join_set = tokio::task::JoinSet::new();

            for (idx, query) in input.queries.into_iter().enumerate() {
                let engine = self.engine.clone();
                let shared = self.shared.clone();
                let level = self.level.clone();
                let semaphore = semaphore.clone();
                join_set.spawn(async move {
                    let _permit = semaphore.acquire().await;
                    if let Err(reason) = check_session_cost(
                        &shared,
                        level.options.sub_calls.max_cost_per_session,
                    ) {
                        return (idx, json!({"query": query.query, "error": reason}));
                    }
                    if let Err(reason) = level.claim_call_slot() {
                        return (idx, json!({"query": query.query, "error": reason}));
                    }
                    let outcome = run_sub(
                        engine,
                        shared,
                        level,
                        query.query.clone(),
                        query.system,
                        per_query,
                        "batch_complete",
                    )
                    .await;
                    let entry = match outcome {
                        Ok(outcome) => json!({
                            "query": query.query,
                            "response": outcome.response,
                            "tokens_used": outcome.tokens_used,
                            "cost": outcome.cost,
                        }),
                        Err(e) => json!({
                            "query": query.query,
                            "error": e.to_string(),
                            "tokens_used": 0,
                            "cost": 0,
                        }),
                    };
                    (idx, entry)
                });
            }

            let mut entries: Vec<Option<serde_json::Value>> = Vec::new();
            entries.resize_with(join_set.len(), || None);
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((idx, entry)) => entries[idx] = Some(entry),
                    Err(e) => tracing::error!(error = %e, "batch sub-call panicked"),
                }
            }
            let results: Vec<serde_json::Value> = entries
                .into_iter()
                .map(|e| e.unwrap_or_else(|| json!({"error": "sub-call panicked"})))
                .collect();

            Ok(ToolOutput::success(json!({"results": results}).to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::*;
    use crate::engine::{Engine, EngineInner};
    use crate::llm::types::ToolCall;
    use crate::tool::registry::ToolRegistry;

    fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }
    }

    fn engine(provider: MockProvider) -> Engine<MockProvider> {
        Engine::builder(Arc::new(provider))
            .registry(Arc::new(ToolRegistry::new()))
            .build()
    }

    fn options() -> CompletionOptions {
        CompletionOptions {
            token_budget: 10_000,
            max_depth: 2,
            ..Default::default()
        }
    }

    #[test]
    fn inherited_budget_caps_requested() {
        assert_eq!(inherited_budget(Some(10_000), 1000, 0.5), 500);
        assert_eq!(inherited_budget(Some(200), 1000, 0.5), 200);
        assert_eq!(inherited_budget(None, 1000, 0.5), 500);
        assert_eq!(inherited_budget(None, 1000, 0.25), 250);
    }

    #[tokio::test]
    async fn sub_complete_runs_nested_completion() {
        let provider = MockProvider::new(vec![
            // Root turn asks for a sub-completion.
            tool_response(
                vec![call("c1", "sub_complete", json!({"query": "solve part A"}))],
                100,
                20,
            ),
            // The sub-completion answers directly.
            text_response("part A solved", 50, 10),
            // Root wraps up.
            text_response("all done", 60, 10),
        ]);
        let engine = engine(provider);
        let result = engine.complete("task", None, options()).await.unwrap();

        assert_eq!(result.response, "all done");
        assert_eq!(result.events.len(), 3);

        // The sub event carries depth 1 and links to the root turn.
        let sub_event = result
            .events
            .iter()
            .find(|e| e.depth == 1)
            .expect("sub event present");
        assert_eq!(sub_event.sub_call_type.as_deref(), Some("sub_complete"));
        let root_call_id = result.events[0].call_id;
        assert_eq!(sub_event.parent_call_id, Some(root_call_id));
        // Parent precedes child in the stream.
        let parent_idx = result
            .events
            .iter()
            .position(|e| e.call_id == root_call_id)
            .unwrap();
        let child_idx = result
            .events
            .iter()
            .position(|e| e.call_id == sub_event.call_id)
            .unwrap();
        assert!(parent_idx < child_idx);

        // The sub-call's usage was charged back to the totals.
        assert_eq!(result.total_tokens, 100 + 20 + 50 + 10 + 60 + 10);
    }

    #[tokio::test]
    async fn sub_budget_is_bounded_by_inheritance_fraction() {
        let provider = MockProvider::new(vec![
            tool_response(
                vec![call(
                    "c1",
                    "sub_complete",
                    json!({"query": "q", "max_tokens": 999_999}),
                )],
                1000,
                1000,
            ),
            text_response("sub answer", 10, 5),
            text_response("done", 10, 5),
        ]);
        let engine = engine(provider);
        let mut opts = options();
        opts.token_budget = 10_000;
        let result = engine.complete("task", None, opts).await.unwrap();

        // After the first turn 2000 tokens are consumed, so the sub-call's
        // budget is at most (10000-2000) * 0.5 = 4000 despite the request.
        let sub_event = result.events.iter().find(|e| e.depth == 1).unwrap();
        let root_event = &result.events[0];
        let tool_result = &root_event.tool_results[0];
        let payload: serde_json::Value = serde_json::from_str(&tool_result.content).unwrap();
        assert_eq!(payload["response"], "sub answer");
        assert!(sub_event.input_tokens + sub_event.output_tokens <= 4000);
    }

    #[tokio::test]
    async fn depth_cap_returns_sentinel_without_recursing() {
        // Every response calls sub_complete; with max_depth=2 the chain is
        // root(0) -> sub(1) -> sub(2), whose own sub_complete gets the
        // sentinel, after which each level wraps up.
        let sub_call = |id: &str| {
            tool_response(
                vec![call(id, "sub_complete", json!({"query": "recurse"}))],
                10,
                10,
            )
        };
        let provider = MockProvider::new(vec![
            sub_call("c1"),              // root turn
            sub_call("c2"),              // depth-1 turn
            sub_call("c3"),              // depth-2 turn; tool returns sentinel
            text_response("d2 done", 1, 1), // depth-2 wraps up
            text_response("d1 done", 1, 1), // depth-1 wraps up
            text_response("root done", 1, 1), // root wraps up
        ]);
        let engine = engine(provider);
        let result = engine.complete("task", None, options()).await.unwrap();

        assert_eq!(result.response, "root done");
        assert!(result.violation.is_none());

        let depth2_event = result
            .events
            .iter()
            .find(|e| e.depth == 2 && !e.tool_results.is_empty())
            .expect("depth-2 turn with tool results");
        assert!(
            depth2_event.tool_results[0]
                .content
                .contains("Maximum recursion depth reached"),
        );
        assert!(result.events.iter().all(|e| e.depth <= 2));
    }

    #[tokio::test]
    async fn per_turn_sub_call_cap_errors_excess_calls() {
        let calls: Vec<ToolCall> = (0..7)
            .map(|i| call(&format!("c{i}"), "sub_complete", json!({"query": "q"})))
            .collect();
        // 5 sub-calls succeed (cap), 2 get error results; then wrap up.
        let mut responses = vec![tool_response(calls, 10, 10)];
        for _ in 0..5 {
            responses.push(text_response("sub ok", 1, 1));
        }
        responses.push(text_response("done", 1, 1));

        let engine = engine(MockProvider::new(responses));
        let mut opts = options();
        opts.tool_budget = 50;
        let result = engine.complete("task", None, opts).await.unwrap();

        assert_eq!(result.response, "done");
        let root_results = &result.events[0].tool_results;
        let errors = root_results.iter().filter(|r| r.is_error).count();
        assert_eq!(errors, 2);
        assert!(
            root_results
                .iter()
                .filter(|r| r.is_error)
                .all(|r| r.content.contains("Sub-call limit reached"))
        );
    }

    #[tokio::test]
    async fn batch_complete_preserves_input_order() {
        let provider = MockProvider::new(vec![
            tool_response(
                vec![call(
                    "c1",
                    "batch_complete",
                    json!({"queries": [{"query": "first"}, {"query": "second"}]}),
                )],
                10,
                10,
            ),
            // Two sub-completions (order of service nondeterministic).
            text_response("answer one", 1, 1),
            text_response("answer two", 1, 1),
            text_response("done", 1, 1),
        ]);
        let engine = engine(provider);
        let result = engine.complete("task", None, options()).await.unwrap();

        let payload: serde_json::Value =
            serde_json::from_str(&result.events[0].tool_results[0].content).unwrap();
        let results = payload["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["query"], "first");
        assert_eq!(results[1]["query"], "second");
        assert!(results[0]["response"].is_string());
    }

    #[tokio::test]
    async fn sub_calls_disabled_offers_no_extras() {
        let provider = MockProvider::new(vec![text_response("done", 1, 1)]);
        let engine = engine(provider);
        let mut opts = options();
        opts.sub_calls.enabled = false;
        engine.complete("task", None, opts).await.unwrap();

        let requests = engine_provider_requests(&engine);
        assert!(requests[0].tools.iter().all(|d| d.name != "sub_complete"));
    }

    fn engine_provider_requests(
        engine: &Engine<MockProvider>,
    ) -> Vec<crate::llm::types::CompletionRequest> {
        let inner: &Arc<EngineInner<MockProvider>> = &engine.inner;
        let requests = inner.provider.requests.lock().unwrap();
        requests.clone()
    }
}

pub mod subcall;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::debug;
use uuid::Uuid;

use crate::budget::{BudgetLedger, BudgetViolation};
use crate::config::CompletionOptions;
use crate::error::Error;
use crate::interp::Sandbox;
use crate::llm::pricing::estimate_cost;
use crate::llm::types::{
    CompletionRequest, Message, ToolCall, ToolDefinition, ToolResult,
};
use crate::llm::{LlmProvider, OnText};
use crate::session::SessionManager;
use crate::tool::code::EXECUTE_CODE_TOOL;
use crate::tool::registry::ToolRegistry;
use crate::tool::{Tool, ToolOutput, validate_tool_input};
use crate::trajectory::{TrajectoryEvent, TrajectorySink};

/// Name of the documentation-retrieval tool the engine integrates with
/// when a `context_query` is supplied. Registered by an external
/// collaborator; the engine treats it as an ordinary tool otherwise.
pub const CONTEXT_QUERY_TOOL: &str = "context_query";

/// Result of one completion. On a budget violation the result is still
/// fully populated (`violation` names the breached budget); only adapter
/// failures surface as `Err`.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub response: String,
    pub trajectory_id: Uuid,
    pub total_calls: usize,
    pub total_tokens: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tool_calls: usize,
    pub duration_ms: u64,
    pub total_cost: Option<f64>,
    pub parsed: Option<serde_json::Value>,
    pub violation: Option<BudgetViolation>,
    pub events: Vec<TrajectoryEvent>,
}

/// The recursive completion engine.
///
/// Cheap to clone; all state (registry, sandbox, sink) is shared. One
/// `complete()` call drives one completion tree to termination.
pub struct Engine<P: LlmProvider> {
    inner: Arc<EngineInner<P>>,
}

impl<P: LlmProvider> Clone for Engine<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct EngineInner<P: LlmProvider> {
    pub(crate) provider: Arc<P>,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) sandbox: Arc<Sandbox>,
    pub(crate) sink: Option<Arc<dyn TrajectorySink>>,
    pub(crate) max_tokens_per_call: u32,
}

/// Completion-global state shared across every level of the tree.
pub(crate) struct SharedState {
    pub(crate) trajectory_id: Uuid,
    pub(crate) events: Mutex<Vec<TrajectoryEvent>>,
    /// Accumulated cost of sub-calls for the whole completion.
    pub(crate) sub_call_cost: Mutex<f64>,
}

pub(crate) struct LoopOutcome {
    pub(crate) response: String,
    pub(crate) parsed: Option<serde_json::Value>,
    pub(crate) violation: Option<BudgetViolation>,
    /// LLM calls made at this level and below.
    pub(crate) turns: usize,
}

pub(crate) struct LoopParams {
    pub(crate) system: String,
    pub(crate) messages: Vec<Message>,
    pub(crate) options: CompletionOptions,
    pub(crate) ledger: Arc<Mutex<BudgetLedger>>,
    pub(crate) depth: u32,
    pub(crate) parent_call_id: Option<Uuid>,
    pub(crate) sub_call_type: Option<String>,
    /// Caller-scoped extra tools (terminal tools, injected context tools).
    pub(crate) extras: Vec<Arc<dyn Tool>>,
}

impl<P: LlmProvider + 'static> Engine<P> {
    pub fn builder(provider: Arc<P>) -> EngineBuilder<P> {
        EngineBuilder {
            provider,
            registry: None,
            sessions: None,
            sink: None,
            max_tokens_per_call: 4096,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.inner.registry
    }

    #[cfg(test)]
    pub(crate) fn provider(&self) -> &Arc<P> {
        &self.inner.provider
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.inner.sandbox
    }

    /// Drive one completion: prompt → turn → tool dispatch → … until the
    /// model stops calling tools or a budget runs out.
    pub async fn complete(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: CompletionOptions,
    ) -> Result<CompletionResult, Error> {
        self.complete_with_extras(prompt, system, options, Vec::new())
            .await
    }

    /// Like [`Engine::complete`], with extra tools scoped to this call.
    /// Extras shadow registry entries of the same name and are never
    /// observable outside this completion.
    pub async fn complete_with_extras(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: CompletionOptions,
        extras: Vec<Arc<dyn Tool>>,
    ) -> Result<CompletionResult, Error> {
        let started = Instant::now();
        let trajectory_id = Uuid::new_v4();
        let shared = Arc::new(SharedState {
            trajectory_id,
            events: Mutex::new(Vec::new()),
            sub_call_cost: Mutex::new(0.0),
        });
        let ledger = Arc::new(Mutex::new(BudgetLedger::new(&options)));

        debug!(%trajectory_id, prompt_len = prompt.len(), "starting completion");

        let params = LoopParams {
            system: system.unwrap_or_default().to_string(),
            messages: vec![Message::user(prompt)],
            options: options.clone(),
            ledger,
            depth: 0,
            parent_call_id: None,
            sub_call_type: None,
            extras,
        };
        let outcome = run_loop(self.inner.clone(), shared.clone(), params).await;

        let events = std::mem::take(
            &mut *shared.events.lock().expect("events lock poisoned"),
        );
        if let Some(sink) = &self.inner.sink {
            for event in &events {
                sink.emit(event);
            }
        }

        let outcome = outcome?;

        let total_input_tokens: u64 = events.iter().map(|e| e.input_tokens).sum();
        let total_output_tokens: u64 = events.iter().map(|e| e.output_tokens).sum();
        let total_tool_calls: usize = events.iter().map(|e| e.tool_calls.len()).sum();
        let event_costs: Vec<Option<f64>> = events.iter().map(|e| e.estimated_cost).collect();
        let total_cost = if event_costs.iter().all(|c| c.is_some()) {
            Some(event_costs.iter().flatten().sum())
        } else {
            None
        };

        debug!(
            %trajectory_id,
            total_calls = events.len(),
            total_tokens = total_input_tokens + total_output_tokens,
            violation = ?outcome.violation,
            "completion finished"
        );

        Ok(CompletionResult {
            response: outcome.response,
            trajectory_id,
            total_calls: events.len(),
            total_tokens: total_input_tokens + total_output_tokens,
            total_input_tokens,
            total_output_tokens,
            total_tool_calls,
            duration_ms: started.elapsed().as_millis() as u64,
            total_cost,
            parsed: outcome.parsed,
            violation: outcome.violation,
            events: if options.include_events {
                events
            } else {
                Vec::new()
            },
        })
    }

    /// Stream a tool-less completion, invoking `on_text` per delta.
    ///
    /// Streaming with tools is unsupported; the cost budget is pre-checked
    /// against a rough input-token estimate (~4 chars per token).
    pub async fn stream(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: &CompletionOptions,
        on_text: &OnText,
    ) -> Result<String, Error> {
        if let Some(budget) = options.cost_budget {
            let estimated_input =
                (prompt.len() + system.map(str::len).unwrap_or(0)) as u64 / 4;
            let usage = crate::llm::types::TokenUsage {
                input_tokens: estimated_input,
                output_tokens: 0,
            };
            if let Some(model) = self.inner.provider.model_name()
                && let Some(cost) = estimate_cost(model, &usage)
                && cost >= budget
            {
                return Err(Error::Budget(BudgetViolation::CostExhausted {
                    used: cost,
                    budget,
                }));
            }
        }

        let request = CompletionRequest {
            system: system.unwrap_or_default().to_string(),
            messages: vec![Message::user(prompt)],
            tools: Vec::new(),
            max_tokens: self.inner.max_tokens_per_call,
            temperature: options.temperature,
            stop_sequences: options.stop_sequences.clone(),
            response_format: None,
        };
        let response = self.inner.provider.stream_complete(request, on_text).await?;
        Ok(response.text)
    }
}

pub struct EngineBuilder<P: LlmProvider> {
    provider: Arc<P>,
    registry: Option<Arc<ToolRegistry>>,
    sessions: Option<Arc<SessionManager>>,
    sink: Option<Arc<dyn TrajectorySink>>,
    max_tokens_per_call: u32,
}

impl<P: LlmProvider + 'static> EngineBuilder<P> {
    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn TrajectorySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn max_tokens_per_call(mut self, max_tokens: u32) -> Self {
        self.max_tokens_per_call = max_tokens;
        self
    }

    pub fn build(self) -> Engine<P> {
        let sessions = self.sessions.unwrap_or_default();
        Engine {
            inner: Arc::new(EngineInner {
                provider: self.provider,
                registry: self.registry.unwrap_or_default(),
                sandbox: Arc::new(Sandbox::new(sessions)),
                sink: self.sink,
                max_tokens_per_call: self.max_tokens_per_call,
            }),
        }
    }
}

/// One level of the completion tree: the turn loop of §4.6.
pub(crate) async fn run_loop<P: LlmProvider + 'static>(
    engine: Arc<EngineInner<P>>,
    shared: Arc<SharedState>,
    params: LoopParams,
) -> Result<LoopOutcome, Error> {
    let LoopParams {
        system,
        mut messages,
        options,
        ledger,
        depth,
        parent_call_id,
        sub_call_type,
        extras: mut caller_extras,
    } = params;

    let level = Arc::new(subcall::LevelContext::new(ledger.clone(), depth, options.clone()));
    let mut extras: Vec<Arc<dyn Tool>> = std::mem::take(&mut caller_extras);
    if options.sub_calls.enabled {
        extras.extend(subcall::sub_call_tools(
            engine.clone(),
            shared.clone(),
            level.clone(),
        ));
    }

    let mut last_response = String::new();
    let mut turns = 0usize;

    loop {
        // (a) Pre-call budget check.
        let check = ledger.lock().expect("ledger lock poisoned").check();
        if let Err(violation) = check {
            debug!(?violation, depth, "budget violated, halting loop");
            return Ok(LoopOutcome {
                response: last_response,
                parsed: None,
                violation: Some(violation),
                turns,
            });
        }

        // (b) Call the adapter with registry ∪ extras (extras shadow).
        let tools = effective_tools(&engine.registry, &extras);
        let request = CompletionRequest {
            system: system.clone(),
            messages: messages.clone(),
            tools,
            max_tokens: engine.max_tokens_per_call,
            temperature: options.temperature,
            stop_sequences: options.stop_sequences.clone(),
            response_format: options.response_format.clone(),
        };

        let turn_started = Instant::now();
        let response = engine.provider.complete(request).await?;
        let turn_ms = turn_started.elapsed().as_millis() as u64;
        turns += 1;

        // (c) Charge usage and estimated cost.
        let cost = engine
            .provider
            .model_name()
            .and_then(|model| estimate_cost(model, &response.usage));
        ledger
            .lock()
            .expect("ledger lock poisoned")
            .charge(response.usage.input_tokens, response.usage.output_tokens, cost);

        // (d) Record the turn event. The slot is reserved now so events of
        // nested sub-completions land after their parent in the stream.
        let prompt_snapshot = messages
            .last()
            .map(|m| m.text_content())
            .unwrap_or_default();
        let mut event = TrajectoryEvent::new(shared.trajectory_id, depth, &prompt_snapshot);
        event.parent_call_id = parent_call_id;
        event.response = response.text.clone();
        event.tool_calls = response.tool_calls.clone();
        event.input_tokens = response.usage.input_tokens;
        event.output_tokens = response.usage.output_tokens;
        event.duration_ms = turn_ms;
        event.estimated_cost = cost;
        event.sub_call_type = sub_call_type.clone();
        let call_id = event.call_id;
        let event_index = {
            let mut events = shared.events.lock().expect("events lock poisoned");
            events.push(event);
            events.len() - 1
        };

        last_response = response.text.clone();

        // (e) No tool calls: the completion is done.
        if response.tool_calls.is_empty() {
            return Ok(LoopOutcome {
                response: response.text,
                parsed: response.parsed,
                violation: None,
                turns,
            });
        }

        // (f)+(g) Validate and dispatch, charging per invocation.
        level.begin_turn(call_id);
        let results =
            dispatch_tools(&engine, &extras, &ledger, &options, &response.tool_calls).await;

        // Attach results to the reserved event, interpreter results included.
        {
            let mut events = shared.events.lock().expect("events lock poisoned");
            let event = &mut events[event_index];
            for (call, result) in response.tool_calls.iter().zip(&results) {
                if call.name == EXECUTE_CODE_TOOL
                    && let Ok(parsed) = serde_json::from_str(&result.content)
                {
                    event.interpreter_results.push(parsed);
                }
            }
            event.tool_results = results.clone();
        }

        // (h) Feed results back in the model's original call order.
        messages.push(Message::assistant_with_calls(
            response.text,
            response.tool_calls,
        ));
        for result in &results {
            messages.push(Message::tool_result(result));
        }
    }
}

/// Registry definitions plus extras, with extras shadowing registry
/// entries of the same name.
fn effective_tools(registry: &ToolRegistry, extras: &[Arc<dyn Tool>]) -> Vec<ToolDefinition> {
    let extra_defs: Vec<ToolDefinition> = extras.iter().map(|t| t.definition()).collect();
    let shadowed: Vec<&str> = extra_defs.iter().map(|d| d.name.as_str()).collect();
    let mut defs: Vec<ToolDefinition> = registry
        .definitions()
        .into_iter()
        .filter(|d| !shadowed.contains(&d.name.as_str()))
        .collect();
    defs.extend(extra_defs);
    defs
}

fn lookup_tool(
    registry: &ToolRegistry,
    extras: &[Arc<dyn Tool>],
    name: &str,
) -> Option<Arc<dyn Tool>> {
    extras
        .iter()
        .find(|t| t.definition().name == name)
        .cloned()
        .or_else(|| registry.get(name))
}

/// Dispatch one turn's tool calls. Results come back indexed by the
/// model's call order regardless of completion order; handler failures
/// become error results, never a crashed loop.
async fn dispatch_tools<P: LlmProvider>(
    engine: &EngineInner<P>,
    extras: &[Arc<dyn Tool>],
    ledger: &Mutex<BudgetLedger>,
    options: &CompletionOptions,
    calls: &[ToolCall],
) -> Vec<ToolResult> {
    // Tool budget is charged per invocation; calls past the budget get
    // error results but the turn still completes.
    let mut allowed = 0usize;
    {
        let mut ledger = ledger.lock().expect("ledger lock poisoned");
        for _ in calls {
            if ledger.remaining_tool_calls() == 0 {
                break;
            }
            ledger.charge_tool_call();
            allowed += 1;
        }
    }

    let mut prepared: Vec<Result<(Arc<dyn Tool>, serde_json::Value), String>> = Vec::new();
    for call in &calls[..allowed] {
        match lookup_tool(&engine.registry, extras, &call.name) {
            None => {
                let mut available: Vec<String> = engine.registry.list();
                available.extend(extras.iter().map(|t| t.definition().name));
                prepared.push(Err(format!(
                    "Tool '{}' not found. Available tools: {}",
                    call.name,
                    available.join(", ")
                )));
            }
            Some(tool) => {
                match validate_tool_input(&tool.definition().parameters, &call.arguments) {
                    Err(reason) => prepared.push(Err(format!(
                        "Invalid arguments for tool '{}': {reason}",
                        call.name
                    ))),
                    Ok(()) => prepared.push(Ok((tool, call.arguments.clone()))),
                }
            }
        }
    }

    let mut results: Vec<Option<ToolResult>> = vec![None; calls.len()];

    if options.parallel_tools && allowed > 1 {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(options.max_parallel.max(1)));
        let mut join_set = tokio::task::JoinSet::new();
        for (idx, prep) in prepared.into_iter().enumerate() {
            let call_id = calls[idx].id.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let result = match prep {
                    Err(reason) => ToolResult::error(call_id, reason),
                    Ok((tool, input)) => {
                        let _permit = semaphore.acquire().await;
                        match tool.execute(input).await {
                            Ok(output) => output_to_result(call_id, output),
                            Err(e) => ToolResult::error(call_id, e.to_string()),
                        }
                    }
                };
                (idx, result)
            });
        }
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(e) => tracing::error!(error = %e, "tool task panicked"),
            }
        }
    } else {
        for (idx, prep) in prepared.into_iter().enumerate() {
            let call_id = calls[idx].id.clone();
            let result = match prep {
                Err(reason) => ToolResult::error(call_id, reason),
                Ok((tool, input)) => match tool.execute(input).await {
                    Ok(output) => output_to_result(call_id, output),
                    Err(e) => ToolResult::error(call_id, e.to_string()),
                },
            };
            results[idx] = Some(result);
        }
    }

    // Budget-exceeded and panicked slots become error results.
    calls
        .iter()
        .enumerate()
        .map(|(idx, call)| {
            results[idx].take().unwrap_or_else(|| {
                if idx >= allowed {
                    ToolResult::error(
                        call.id.clone(),
                        "Tool budget exceeded; this call was not executed.",
                    )
                } else {
                    ToolResult::error(call.id.clone(), "Tool execution panicked")
                }
            })
        })
        .collect()
}

fn output_to_result(call_id: String, output: ToolOutput) -> ToolResult {
    if output.is_error {
        ToolResult::error(call_id, output.content)
    } else {
        ToolResult::success(call_id, output.content)
    }
}

/// Shared by unit and integration tests: a provider that replays scripted
/// responses.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::llm::types::{CompletionResponse, StopReason, TokenUsage};

    pub(crate) struct MockProvider {
        responses: Mutex<Vec<CompletionResponse>>,
        pub(crate) requests: Mutex<Vec<CompletionRequest>>,
        model: Option<&'static str>,
    }

    impl MockProvider {
        pub(crate) fn new(responses: Vec<CompletionResponse>) -> Self {
            Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
                model: None,
            }
        }

        pub(crate) fn with_model(mut self, model: &'static str) -> Self {
            self.model = Some(model);
            self
        }
    }

    impl LlmProvider for MockProvider {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, Error> {
            self.requests.lock().unwrap().push(request);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(Error::Engine("no more mock responses".into()));
            }
            Ok(responses.remove(0))
        }

        fn model_name(&self) -> Option<&str> {
            self.model
        }
    }

    pub(crate) fn text_response(text: &str, input: u64, output: u64) -> CompletionResponse {
        CompletionResponse {
            text: text.into(),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage {
                input_tokens: input,
                output_tokens: output,
            },
            parsed: None,
        }
    }

    pub(crate) fn tool_response(calls: Vec<ToolCall>, input: u64, output: u64) -> CompletionResponse {
        CompletionResponse {
            text: String::new(),
            tool_calls: calls,
            stop_reason: StopReason::ToolUse,
            usage: TokenUsage {
                input_tokens: input,
                output_tokens: output,
            },
            parsed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    struct SleepTool {
        name: &'static str,
        delay: Duration,
    }

    impl Tool for SleepTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: self.name.into(),
                description: format!("sleeps for {:?}", self.delay),
                parameters: json!({"type": "object"}),
            }
        }

        fn execute(
            &self,
            _input: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
            let delay = self.delay;
            let name = self.name;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(ToolOutput::success(format!("{name} done")))
            })
        }
    }

    struct EchoTool;

    impl Tool for EchoTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo".into(),
                description: "echoes the message".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {"message": {"type": "string"}},
                    "required": ["message"]
                }),
            }
        }

        fn execute(
            &self,
            input: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
            Box::pin(async move {
                let message = input["message"].as_str().unwrap_or_default().to_string();
                Ok(ToolOutput::success(message))
            })
        }
    }

    fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }
    }

    fn engine_with(
        provider: MockProvider,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Engine<MockProvider> {
        let registry = Arc::new(ToolRegistry::new());
        for tool in tools {
            registry.register(tool).unwrap();
        }
        Engine::builder(Arc::new(provider)).registry(registry).build()
    }

    fn options() -> CompletionOptions {
        CompletionOptions {
            token_budget: 100_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn completes_without_tools() {
        let engine = engine_with(
            MockProvider::new(vec![text_response("Hello!", 10, 5)]),
            vec![],
        );
        let result = engine.complete("hi", None, options()).await.unwrap();
        assert_eq!(result.response, "Hello!");
        assert_eq!(result.total_calls, 1);
        assert_eq!(result.total_tokens, 15);
        assert!(result.violation.is_none());
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].depth, 0);
        assert!(result.events[0].parent_call_id.is_none());
    }

    #[tokio::test]
    async fn dispatches_tool_and_feeds_result_back() {
        let engine = engine_with(
            MockProvider::new(vec![
                tool_response(vec![call("c1", "echo", json!({"message": "ping"}))], 20, 10),
                text_response("got ping", 30, 5),
            ]),
            vec![Arc::new(EchoTool)],
        );
        let result = engine.complete("say ping", None, options()).await.unwrap();
        assert_eq!(result.response, "got ping");
        assert_eq!(result.total_tool_calls, 1);
        assert_eq!(result.events.len(), 2);
        assert_eq!(result.events[0].tool_results.len(), 1);
        assert_eq!(result.events[0].tool_results[0].content, "ping");
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_result() {
        let engine = engine_with(
            MockProvider::new(vec![
                tool_response(vec![call("c1", "ghost", json!({}))], 5, 5),
                text_response("recovered", 5, 5),
            ]),
            vec![Arc::new(EchoTool)],
        );
        let result = engine.complete("x", None, options()).await.unwrap();
        assert_eq!(result.response, "recovered");
        let tool_result = &result.events[0].tool_results[0];
        assert!(tool_result.is_error);
        assert!(tool_result.content.contains("not found"));
        assert!(tool_result.content.contains("echo"));
    }

    #[tokio::test]
    async fn schema_validation_failure_becomes_error_result() {
        let engine = engine_with(
            MockProvider::new(vec![
                tool_response(vec![call("c1", "echo", json!({"message": 7}))], 5, 5),
                text_response("ok", 5, 5),
            ]),
            vec![Arc::new(EchoTool)],
        );
        let result = engine.complete("x", None, options()).await.unwrap();
        let tool_result = &result.events[0].tool_results[0];
        assert!(tool_result.is_error);
        assert!(tool_result.content.contains("must be of type string"));
    }

    #[tokio::test]
    async fn token_budget_exhaustion_reports_violation_with_partial_events() {
        let engine = engine_with(
            MockProvider::new(vec![
                tool_response(vec![call("c1", "echo", json!({"message": "a"}))], 300, 300),
                tool_response(vec![call("c2", "echo", json!({"message": "b"}))], 300, 300),
                text_response("never reached", 5, 5),
            ]),
            vec![Arc::new(EchoTool)],
        );
        let mut opts = options();
        opts.token_budget = 1000;
        let result = engine.complete("x", None, opts).await.unwrap();
        assert_eq!(
            result.violation,
            Some(BudgetViolation::TokenExhausted {
                used: 1200,
                budget: 1000
            })
        );
        assert_eq!(result.events.len(), 2);
        assert_eq!(result.total_tokens, 1200);
    }

    #[tokio::test]
    async fn parallel_dispatch_overlaps_and_preserves_call_order() {
        let engine = engine_with(
            MockProvider::new(vec![
                tool_response(
                    vec![
                        call("c1", "slow100", json!({})),
                        call("c2", "slow50", json!({})),
                        call("c3", "slow200", json!({})),
                    ],
                    5,
                    5,
                ),
                text_response("done", 5, 5),
            ]),
            vec![
                Arc::new(SleepTool {
                    name: "slow100",
                    delay: Duration::from_millis(100),
                }),
                Arc::new(SleepTool {
                    name: "slow50",
                    delay: Duration::from_millis(50),
                }),
                Arc::new(SleepTool {
                    name: "slow200",
                    delay: Duration::from_millis(200),
                }),
            ],
        );
        let mut opts = options();
        opts.parallel_tools = true;
        opts.max_parallel = 4;

        let started = Instant::now();
        let result = engine.complete("x", None, opts).await.unwrap();
        let elapsed = started.elapsed();

        // Concurrent: bounded by the slowest handler, not the sum.
        assert!(elapsed < Duration::from_millis(330), "took {elapsed:?}");

        // Results fed back to the model follow the original call order.
        let provider = &engine.inner.provider;
        let requests = provider.requests.lock().unwrap();
        let followup = &requests[1];
        let tool_messages: Vec<&Message> = followup
            .messages
            .iter()
            .filter(|m| m.tool_call_id.is_some())
            .collect();
        assert_eq!(tool_messages.len(), 3);
        assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(tool_messages[1].tool_call_id.as_deref(), Some("c2"));
        assert_eq!(tool_messages[2].tool_call_id.as_deref(), Some("c3"));
        assert_eq!(result.total_tool_calls, 3);
    }

    #[tokio::test]
    async fn sequential_dispatch_runs_in_order() {
        let engine = engine_with(
            MockProvider::new(vec![
                tool_response(
                    vec![call("c1", "slow50", json!({})), call("c2", "slow50", json!({}))],
                    5,
                    5,
                ),
                text_response("done", 5, 5),
            ]),
            vec![Arc::new(SleepTool {
                name: "slow50",
                delay: Duration::from_millis(50),
            })],
        );
        let started = Instant::now();
        engine.complete("x", None, options()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn tool_budget_truncates_excess_calls() {
        let engine = engine_with(
            MockProvider::new(vec![
                tool_response(
                    vec![
                        call("c1", "echo", json!({"message": "1"})),
                        call("c2", "echo", json!({"message": "2"})),
                        call("c3", "echo", json!({"message": "3"})),
                    ],
                    5,
                    5,
                ),
                text_response("done", 5, 5),
            ]),
            vec![Arc::new(EchoTool)],
        );
        let mut opts = options();
        opts.tool_budget = 2;
        let result = engine.complete("x", None, opts).await.unwrap();
        let results = &result.events[0].tool_results;
        assert!(!results[0].is_error);
        assert!(!results[1].is_error);
        assert!(results[2].is_error);
        assert!(results[2].content.contains("Tool budget exceeded"));
        // Next turn's pre-call check halts on the exhausted tool budget.
        assert_eq!(
            result.violation,
            Some(BudgetViolation::ToolExhausted { used: 2, budget: 2 })
        );
    }

    #[tokio::test]
    async fn adapter_failure_aborts_with_error() {
        let engine = engine_with(MockProvider::new(vec![]), vec![]);
        let err = engine.complete("x", None, options()).await.unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
    }

    #[tokio::test]
    async fn totals_match_event_sums() {
        let engine = engine_with(
            MockProvider::new(vec![
                tool_response(vec![call("c1", "echo", json!({"message": "hey"}))], 17, 3),
                text_response("bye", 23, 7),
            ]),
            vec![Arc::new(EchoTool)],
        );
        let result = engine.complete("x", None, options()).await.unwrap();
        let sum: u64 = result
            .events
            .iter()
            .map(|e| e.input_tokens + e.output_tokens)
            .sum();
        assert_eq!(result.total_tokens, sum);
        let calls: usize = result.events.iter().map(|e| e.tool_calls.len()).sum();
        assert_eq!(result.total_tool_calls, calls);
    }

    #[tokio::test]
    async fn cost_totals_are_none_for_unknown_model() {
        let engine = engine_with(
            MockProvider::new(vec![text_response("hi", 100, 50)]),
            vec![],
        );
        let result = engine.complete("x", None, options()).await.unwrap();
        assert!(result.total_cost.is_none());
    }

    #[tokio::test]
    async fn cost_totals_accumulate_for_known_model() {
        let provider = MockProvider::new(vec![text_response("hi", 1000, 500)])
            .with_model("claude-3-5-haiku-20241022");
        let engine = engine_with(provider, vec![]);
        let result = engine.complete("x", None, options()).await.unwrap();
        let cost = result.total_cost.unwrap();
        assert!(cost > 0.0);
        assert_eq!(result.events[0].estimated_cost, Some(cost));
    }

    #[tokio::test]
    async fn include_events_false_omits_events_but_keeps_totals() {
        let engine = engine_with(
            MockProvider::new(vec![text_response("hi", 10, 5)]),
            vec![],
        );
        let mut opts = options();
        opts.include_events = false;
        let result = engine.complete("x", None, opts).await.unwrap();
        assert!(result.events.is_empty());
        assert_eq!(result.total_tokens, 15);
    }

    #[tokio::test]
    async fn execute_code_results_attach_to_event() {
        let engine = engine_with(
            MockProvider::new(vec![
                tool_response(
                    vec![call("c1", EXECUTE_CODE_TOOL, json!({"code": "result = 1 + 1"}))],
                    5,
                    5,
                ),
                text_response("done", 5, 5),
            ]),
            vec![],
        );
        // Register the sandbox-backed tools against this engine's sandbox.
        for tool in crate::tool::code::code_tools(engine.sandbox().clone()) {
            engine.registry().register(tool).unwrap();
        }
        let result = engine.complete("x", None, options()).await.unwrap();
        assert_eq!(result.events[0].interpreter_results.len(), 1);
        assert!(result.events[0].interpreter_results[0].error.is_none());
    }

    #[tokio::test]
    async fn deadline_reached_before_first_call() {
        let engine = engine_with(
            MockProvider::new(vec![text_response("hi", 10, 5)]),
            vec![],
        );
        let mut opts = options();
        opts.timeout_seconds = 0;
        let result = engine.complete("x", None, opts).await.unwrap();
        assert!(matches!(
            result.violation,
            Some(BudgetViolation::DeadlineReached { .. })
        ));
        assert_eq!(result.total_calls, 0);
    }

    #[tokio::test]
    async fn sub_call_extras_are_offered_by_default() {
        let engine = engine_with(
            MockProvider::new(vec![text_response("done", 5, 5)]),
            vec![],
        );
        let result = engine.complete("x", None, options()).await.unwrap();
        assert!(result.violation.is_none());

        let provider = &engine.inner.provider;
        let requests = provider.requests.lock().unwrap();
        let names: Vec<&str> = requests[0].tools.iter().map(|d| d.name.as_str()).collect();
        // sub-call extras are offered to the model by default
        assert!(names.contains(&"sub_complete"));
        assert!(names.contains(&"batch_complete"));
    }
}

use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::error::Error;
use crate::llm::types::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, Role, StopReason, TokenUsage,
    ToolCall,
};
use crate::llm::{LlmProvider, OnText};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Synthetic tool used to force JSON-schema-constrained output.
const RESPOND_TOOL_NAME: &str = "__respond__";

/// Provider over the Anthropic Messages API.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, Error> {
        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(response);
        }
        match status {
            401 | 403 => Err(Error::Auth(format!("HTTP {status} from provider"))),
            429 => {
                let retry_after_ms = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(|secs| secs * 1000);
                Err(Error::RateLimited { retry_after_ms })
            }
            _ => {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|e| format!("<body read error: {e}>"));
                Err(Error::Api { status, message })
            }
        }
    }
}

impl LlmProvider for AnthropicProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let structured = request.response_format.is_some();
        let body = build_request_body(&self.model, &request)?;
        let response = self.post(&body).await?;
        let api_response: ApiResponse = response.json().await?;
        Ok(into_completion_response(api_response, structured))
    }

    async fn stream_complete(
        &self,
        request: CompletionRequest,
        on_text: &OnText,
    ) -> Result<CompletionResponse, Error> {
        if !request.tools.is_empty() {
            return Err(Error::StreamingWithTools);
        }
        let mut body = build_request_body(&self.model, &request)?;
        body["stream"] = serde_json::Value::Bool(true);

        let response = self.post(&body).await?;
        let mut stream = response.bytes_stream();
        let mut parser = SseParser::default();
        let mut text = String::new();
        let mut usage = TokenUsage::default();
        let mut stop_reason = StopReason::EndTurn;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Error::Http)?;
            for event in parser.feed(&String::from_utf8_lossy(&chunk)) {
                apply_stream_event(&event, &mut text, &mut usage, &mut stop_reason, on_text)?;
            }
        }
        for event in parser.flush() {
            apply_stream_event(&event, &mut text, &mut usage, &mut stop_reason, on_text)?;
        }

        Ok(CompletionResponse {
            text,
            tool_calls: vec![],
            stop_reason,
            usage,
            parsed: None,
        })
    }

    fn model_name(&self) -> Option<&str> {
        Some(&self.model)
    }
}

fn build_request_body(
    model: &str,
    request: &CompletionRequest,
) -> Result<serde_json::Value, Error> {
    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "messages": wire_messages(&request.messages),
    });

    if !request.system.is_empty() {
        body["system"] = serde_json::Value::String(request.system.clone());
    }
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if !request.stop_sequences.is_empty() {
        body["stop_sequences"] = serde_json::to_value(&request.stop_sequences)?;
    }

    let mut tools: Vec<serde_json::Value> = request
        .tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            })
        })
        .collect();

    // Structured output rides on a forced synthetic tool call.
    if let Some(format) = &request.response_format {
        tools.push(json!({
            "name": RESPOND_TOOL_NAME,
            "description": format!(
                "Produce your final structured response in the '{}' format.",
                format.name
            ),
            "input_schema": format.schema,
        }));
        body["tool_choice"] = json!({"type": "tool", "name": RESPOND_TOOL_NAME});
    }

    if !tools.is_empty() {
        body["tools"] = serde_json::Value::Array(tools);
    }

    Ok(body)
}

/// Map engine messages onto the Anthropic wire shape. System messages are
/// hoisted by the caller; tool-role messages become user turns carrying a
/// `tool_result` block, assistant tool calls become `tool_use` blocks.
fn wire_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    let mut wire = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::System => continue,
            Role::Tool => {
                let id = message.tool_call_id.clone().unwrap_or_default();
                wire.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": id,
                        "content": message.text_content(),
                    }],
                }));
            }
            Role::User => {
                wire.push(json!({
                    "role": "user",
                    "content": wire_content(&message.content),
                }));
            }
            Role::Assistant => {
                let mut content = wire_content(&message.content);
                for call in &message.tool_calls {
                    content.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                wire.push(json!({"role": "assistant", "content": content}));
            }
        }
    }
    wire
}

fn wire_content(blocks: &[ContentBlock]) -> Vec<serde_json::Value> {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if text.is_empty() => None,
            ContentBlock::Text { text } => Some(json!({"type": "text", "text": text})),
            ContentBlock::ImageUrl { url } => Some(json!({
                "type": "image",
                "source": {"type": "url", "url": url},
            })),
            ContentBlock::Audio { .. } => {
                tracing::warn!("audio content blocks are not supported upstream, dropping");
                None
            }
        })
        .collect()
}

// --- Response mapping ---

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
}

fn into_completion_response(api: ApiResponse, structured: bool) -> CompletionResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut parsed = None;

    for block in api.content {
        match block {
            ApiContentBlock::Text { text: t } => text.push_str(&t),
            ApiContentBlock::ToolUse { id, name, input } => {
                if structured && name == RESPOND_TOOL_NAME {
                    parsed = Some(input);
                } else {
                    tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments: input,
                    });
                }
            }
            ApiContentBlock::Other => {}
        }
    }

    let stop_reason = match api.stop_reason.as_deref() {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    };

    CompletionResponse {
        text,
        tool_calls,
        stop_reason,
        usage: TokenUsage {
            input_tokens: api.usage.input_tokens,
            output_tokens: api.usage.output_tokens,
        },
        parsed,
    }
}

// --- SSE parsing (text streaming only) ---

#[derive(Default)]
struct SseParser {
    buffer: String,
    event_type: String,
    data_lines: Vec<String>,
}

struct SseEvent {
    event_type: String,
    data: String,
}

impl SseParser {
    fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            self.process_line(line.trim_end_matches(['\n', '\r']), &mut events);
        }
        events
    }

    fn flush(mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.process_line(line.trim_end_matches('\r'), &mut events);
        }
        if let Some(event) = self.emit() {
            events.push(event);
        }
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if let Some(event) = self.emit() {
                events.push(event);
            }
        } else if line.starts_with(':') {
            // comment
        } else if let Some(rest) = line.strip_prefix("event:") {
            self.event_type = rest.trim_start().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data_lines
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }

    fn emit(&mut self) -> Option<SseEvent> {
        if self.event_type.is_empty() && self.data_lines.is_empty() {
            return None;
        }
        Some(SseEvent {
            event_type: std::mem::take(&mut self.event_type),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        })
    }
}

fn apply_stream_event(
    event: &SseEvent,
    text: &mut String,
    usage: &mut TokenUsage,
    stop_reason: &mut StopReason,
    on_text: &OnText,
) -> Result<(), Error> {
    match event.event_type.as_str() {
        "content_block_delta" => {
            let data: serde_json::Value = serde_json::from_str(&event.data)
                .map_err(|e| Error::SseParse(format!("bad delta event: {e}")))?;
            if let Some(delta) = data["delta"]["text"].as_str() {
                text.push_str(delta);
                on_text(delta);
            }
        }
        "message_start" => {
            if let Ok(data) = serde_json::from_str::<serde_json::Value>(&event.data)
                && let Some(n) = data["message"]["usage"]["input_tokens"].as_u64()
            {
                usage.input_tokens = n;
            }
        }
        "message_delta" => {
            if let Ok(data) = serde_json::from_str::<serde_json::Value>(&event.data) {
                if let Some(n) = data["usage"]["output_tokens"].as_u64() {
                    usage.output_tokens = n;
                }
                if data["delta"]["stop_reason"].as_str() == Some("max_tokens") {
                    *stop_reason = StopReason::MaxTokens;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{ResponseFormat, ToolDefinition};
    use serde_json::json;

    fn request_with_tools() -> CompletionRequest {
        CompletionRequest {
            system: "be brief".into(),
            messages: vec![Message::user("hi")],
            tools: vec![ToolDefinition {
                name: "search".into(),
                description: "Search".into(),
                parameters: json!({"type": "object"}),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn body_includes_system_and_tools() {
        let body = build_request_body("claude-3-5-haiku-20241022", &request_with_tools()).unwrap();
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["tools"][0]["name"], "search");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn response_format_adds_forced_synthetic_tool() {
        let mut request = request_with_tools();
        request.response_format = Some(ResponseFormat {
            name: "answer".into(),
            schema: json!({"type": "object", "properties": {"value": {"type": "string"}}}),
        });
        let body = build_request_body("m", &request).unwrap();
        assert_eq!(body["tool_choice"]["name"], RESPOND_TOOL_NAME);
        assert_eq!(body["tools"][1]["name"], RESPOND_TOOL_NAME);
    }

    #[test]
    fn tool_role_becomes_tool_result_block() {
        let messages = vec![
            Message::user("run it"),
            Message::assistant_with_calls(
                "",
                vec![ToolCall {
                    id: "c1".into(),
                    name: "search".into(),
                    arguments: json!({}),
                }],
            ),
            Message::tool_result(&crate::llm::types::ToolResult::success("c1", "found")),
        ];
        let wire = wire_messages(&messages);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1]["content"][0]["type"], "tool_use");
        assert_eq!(wire[2]["role"], "user");
        assert_eq!(wire[2]["content"][0]["type"], "tool_result");
        assert_eq!(wire[2]["content"][0]["tool_use_id"], "c1");
    }

    #[test]
    fn structured_respond_call_becomes_parsed() {
        let api = ApiResponse {
            content: vec![ApiContentBlock::ToolUse {
                id: "c1".into(),
                name: RESPOND_TOOL_NAME.into(),
                input: json!({"value": "42"}),
            }],
            stop_reason: Some("tool_use".into()),
            usage: ApiUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
        };
        let response = into_completion_response(api, true);
        assert!(response.tool_calls.is_empty());
        assert_eq!(response.parsed.unwrap()["value"], "42");
    }

    #[test]
    fn sse_parser_splits_events() {
        let mut parser = SseParser::default();
        let mut events = parser.feed("event: content_block_delta\ndata: {\"a\":1}\n\n");
        events.extend(parser.feed("event: message_stop\ndata: {}\n\n"));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "content_block_delta");
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn sse_parser_handles_split_chunks() {
        let mut parser = SseParser::default();
        let mut events = parser.feed("event: conte");
        assert!(events.is_empty());
        events.extend(parser.feed("nt_block_delta\ndata: {}\n"));
        assert!(events.is_empty());
        events.extend(parser.feed("\n"));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn stream_event_accumulates_text() {
        let mut text = String::new();
        let mut usage = TokenUsage::default();
        let mut stop = StopReason::EndTurn;
        let collected = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
        let collected_clone = collected.clone();
        let on_text: &OnText = &move |t| collected_clone.lock().unwrap().push_str(t);

        let event = SseEvent {
            event_type: "content_block_delta".into(),
            data: r#"{"delta":{"type":"text_delta","text":"hello"}}"#.into(),
        };
        apply_stream_event(&event, &mut text, &mut usage, &mut stop, on_text).unwrap();
        assert_eq!(text, "hello");
        assert_eq!(*collected.lock().unwrap(), "hello");
    }
}

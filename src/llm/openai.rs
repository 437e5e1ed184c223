//! OpenAI-compatible backend (`/v1/chat/completions`)
//!
//! Speaks to llama.cpp, vLLM, LM Studio and friends. JSON response format
//! and the reasoning-effort hint are requested optimistically; if the
//! server rejects either parameter the request is retried once without it
//! and the parameter stays off for the rest of the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::LlmConfig;

use super::{ChatBackend, ChatMessage, ChatOutcome, LlmError, Role, ToolCall, ToolSpec};

pub struct OpenAiClient {
    http: reqwest::blocking::Client,
    base_url: String,
    model: Option<String>,
    /// Cleared when the server rejects `response_format`.
    json_format_supported: AtomicBool,
    /// Cleared when the server rejects `reasoning_effort`.
    reasoning_effort_supported: AtomicBool,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .unwrap_or_default();
        OpenAiClient {
            http,
            base_url: config.base_url(),
            model: config.model.clone(),
            json_format_supported: AtomicBool::new(true),
            reasoning_effort_supported: AtomicBool::new(true),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn build_body(&self, messages: &[ChatMessage], tools: &[ToolSpec], want_json: bool) -> Value {
        let mut body = json!({
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
            "stream": false,
        });
        if let Some(model) = &self.model {
            body["model"] = json!(model);
        }
        if want_json && self.json_format_supported.load(Ordering::Relaxed) {
            body["response_format"] = json!({"type": "json_object"});
        }
        if self.reasoning_effort_supported.load(Ordering::Relaxed) {
            body["reasoning_effort"] = json!("high");
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|spec| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": spec.name,
                                "description": spec.description,
                                "parameters": spec.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        body
    }

    fn post_once(&self, body: &Value) -> Result<(u16, String), LlmError> {
        let response = self
            .http
            .post(self.completions_url())
            .json(body)
            .send()
            .map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let text = response.text().map_err(classify_reqwest_error)?;
        Ok((status, text))
    }
}

impl ChatBackend for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai-compatible backend"
    }

    fn exchange(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        want_json: bool,
    ) -> Result<ChatOutcome, LlmError> {
        loop {
            let body = self.build_body(messages, tools, want_json);
            let (status, text) = self.post_once(&body)?;

            if status >= 400 {
                if is_context_overflow(&text) {
                    return Err(LlmError::ContextOverflow(truncate(&text)));
                }
                // Unsupported optional parameters get one transparent
                // retry without them.
                if text.contains("response_format")
                    && self.json_format_supported.swap(false, Ordering::Relaxed)
                {
                    log::debug!("server rejected response_format; retrying without it");
                    continue;
                }
                if text.contains("reasoning_effort")
                    && self
                        .reasoning_effort_supported
                        .swap(false, Ordering::Relaxed)
                {
                    log::debug!("server rejected reasoning_effort; retrying without it");
                    continue;
                }
                return Err(LlmError::Protocol(format!(
                    "HTTP {status}: {}",
                    truncate(&text)
                )));
            }

            return parse_completion(&text);
        }
    }

    fn check_connection(&self) -> Result<(), LlmError> {
        let response = self
            .http
            .get(format!("{}/v1/models", self.base_url))
            .send()
            .map_err(classify_reqwest_error)?;
        if !response.status().is_success() {
            return Err(LlmError::Protocol(format!(
                "GET /v1/models returned HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }

    fn server_context_limit(&self) -> Result<Option<usize>, LlmError> {
        let response = self
            .http
            .get(format!("{}/v1/models", self.base_url))
            .send()
            .map_err(classify_reqwest_error)?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let listing: Value = response
            .json()
            .map_err(|e| LlmError::Protocol(format!("bad /v1/models JSON: {e}")))?;

        let entries = listing
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let chosen = match &self.model {
            Some(model) => entries
                .iter()
                .find(|entry| entry.get("id").and_then(Value::as_str) == Some(model.as_str()))
                .or_else(|| entries.first()),
            None => entries.first(),
        };
        Ok(chosen.and_then(find_context_length))
    }
}

fn wire_message(msg: &ChatMessage) -> Value {
    match msg.role {
        Role::System => json!({"role": "system", "content": msg.content}),
        Role::User => json!({"role": "user", "content": msg.content}),
        Role::Assistant => {
            let mut wire = json!({"role": "assistant", "content": msg.content});
            if !msg.tool_calls.is_empty() {
                wire["tool_calls"] = Value::Array(
                    msg.tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    // OpenAI wire format carries arguments
                                    // as a JSON-encoded string.
                                    "arguments": call.arguments.to_string(),
                                }
                            })
                        })
                        .collect(),
                );
            }
            wire
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.as_deref().unwrap_or(""),
            "content": msg.content,
        }),
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: WireAssistant,
}

#[derive(Deserialize)]
struct WireAssistant {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: Option<usize>,
}

fn parse_completion(text: &str) -> Result<ChatOutcome, LlmError> {
    let response: CompletionResponse = serde_json::from_str(text)
        .map_err(|e| LlmError::Protocol(format!("bad completion JSON: {e}")))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Protocol("completion had no choices".into()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .enumerate()
        .map(|(idx, call)| ToolCall {
            id: call.id.unwrap_or_else(|| format!("call_{idx}")),
            name: call.function.name,
            // Arguments the model failed to encode as JSON are passed
            // through raw; the executor answers them with a structured
            // invalid_arguments error the model can recover from.
            arguments: serde_json::from_str(&call.function.arguments)
                .unwrap_or(Value::String(call.function.arguments)),
        })
        .collect();

    let mut message = ChatMessage::assistant(choice.message.content.unwrap_or_default());
    message.tool_calls = tool_calls;
    Ok(ChatOutcome {
        message,
        tokens_used: response.usage.and_then(|u| u.total_tokens),
    })
}

fn classify_reqwest_error(e: reqwest::Error) -> LlmError {
    if e.is_decode() {
        LlmError::Protocol(e.to_string())
    } else {
        // Refused, reset, timed out, DNS — anything below HTTP semantics.
        LlmError::Transport(e.to_string())
    }
}

fn is_context_overflow(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("context_length_exceeded")
        || (lower.contains("context") && (lower.contains("length") || lower.contains("window")))
        || lower.contains("maximum context")
}

/// Recursively find a context-length field in a model listing entry.
fn find_context_length(entry: &Value) -> Option<usize> {
    const FIELDS: &[&str] = &[
        "context_length",
        "max_context_length",
        "max_model_len",
        "n_ctx",
        "max_position_embeddings",
    ];
    match entry {
        Value::Object(map) => {
            for (key, value) in map {
                if FIELDS.contains(&key.as_str())
                    && let Some(n) = value.as_u64()
                {
                    return Some(n as usize);
                }
            }
            map.values().find_map(find_context_length)
        }
        Value::Array(items) => items.iter().find_map(find_context_length),
        _ => None,
    }
}

fn truncate(text: &str) -> String {
    const LIMIT: usize = 400;
    if text.len() <= LIMIT {
        text.to_string()
    } else {
        let mut end = LIMIT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_final_assistant_message() {
        let text = r#"{
            "choices": [{"message": {"content": "{\"issues\": []}"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let outcome = parse_completion(text).unwrap();
        assert_eq!(outcome.message.content, "{\"issues\": []}");
        assert!(outcome.message.tool_calls.is_empty());
        assert_eq!(outcome.tokens_used, Some(15));
    }

    #[test]
    fn parses_tool_calls_with_string_encoded_arguments() {
        let text = r#"{
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_abc",
                    "type": "function",
                    "function": {"name": "read_file", "arguments": "{\"path\": \"src/main.rs\"}"}
                }]
            }}]
        }"#;
        let outcome = parse_completion(text).unwrap();
        assert_eq!(outcome.message.tool_calls.len(), 1);
        let call = &outcome.message.tool_calls[0];
        assert_eq!(call.name, "read_file");
        assert_eq!(call.arguments["path"], "src/main.rs");
    }

    #[test]
    fn bad_tool_arguments_are_passed_through_raw() {
        let text = r#"{
            "choices": [{"message": {
                "tool_calls": [{
                    "id": "c1",
                    "function": {"name": "read_file", "arguments": "not json"}
                }]
            }}]
        }"#;
        let outcome = parse_completion(text).unwrap();
        assert_eq!(
            outcome.message.tool_calls[0].arguments,
            Value::String("not json".into())
        );
    }

    #[test]
    fn empty_choices_is_a_protocol_error() {
        let err = parse_completion(r#"{"choices": []}"#).unwrap_err();
        assert!(matches!(err, LlmError::Protocol(_)));
    }

    #[test]
    fn context_overflow_detection() {
        assert!(is_context_overflow(
            r#"{"error": {"code": "context_length_exceeded"}}"#
        ));
        assert!(is_context_overflow(
            "This model's maximum context length is 8192 tokens"
        ));
        assert!(!is_context_overflow(r#"{"error": "model not found"}"#));
    }

    #[test]
    fn finds_context_length_in_nested_model_entry() {
        let entry = json!({
            "id": "qwen",
            "meta": {"details": {"max_model_len": 32768}}
        });
        assert_eq!(find_context_length(&entry), Some(32768));
        assert_eq!(find_context_length(&json!({"id": "x"})), None);
    }

    #[test]
    fn assistant_tool_call_round_trips_to_wire_shape() {
        let mut msg = ChatMessage::assistant("");
        msg.tool_calls = vec![ToolCall {
            id: "c9".into(),
            name: "search_text".into(),
            arguments: json!({"patterns": ["foo"]}),
        }];
        let wire = wire_message(&msg);
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "search_text");
        // Arguments must be string-encoded on the wire.
        assert!(wire["tool_calls"][0]["function"]["arguments"].is_string());
    }
}

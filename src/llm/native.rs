//! Native chat backend (`/api/chat`, Ollama-style)
//!
//! Differences from the OpenAI shape: the model name is mandatory, JSON
//! enforcement uses `"format": "json"`, tool-call arguments arrive as JSON
//! objects rather than encoded strings, and usage comes back as
//! `prompt_eval_count` / `eval_count`. The context window is pinned via
//! `options.num_ctx` and `/api/show` reports the model's trained limit,
//! which this backend treats as authoritative.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::LlmConfig;

use super::{ChatBackend, ChatMessage, ChatOutcome, LlmError, Role, ToolCall, ToolSpec};

pub struct NativeChatClient {
    http: reqwest::blocking::Client,
    base_url: String,
    model: String,
    context_limit: usize,
    /// Cleared when the server rejects `format: "json"`.
    json_format_supported: AtomicBool,
}

impl NativeChatClient {
    pub fn new(config: &LlmConfig) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .unwrap_or_default();
        NativeChatClient {
            http,
            base_url: config.base_url(),
            // Config validation guarantees a model for this backend.
            model: config.model.clone().unwrap_or_default(),
            context_limit: config.context_limit,
            json_format_supported: AtomicBool::new(true),
        }
    }

    fn build_body(&self, messages: &[ChatMessage], tools: &[ToolSpec], want_json: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
            "stream": false,
            "options": {"num_ctx": self.context_limit},
        });
        if want_json && self.json_format_supported.load(Ordering::Relaxed) {
            body["format"] = json!("json");
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
}

impl ChatBackend for NativeChatClient {
    fn name(&self) -> &'static str {
        "native-chat backend"
    }

    fn exchange(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        want_json: bool,
    ) -> Result<ChatOutcome, LlmError> {
        loop {
            let body = self.build_body(messages, tools, want_json);
            let response = self
                .http
                .post(format!("{}/api/chat", self.base_url))
                .json(&body)
                .send()
                .map_err(classify_reqwest_error)?;
            let status = response.status().as_u16();
            let text = response.text().map_err(classify_reqwest_error)?;

            if status >= 400 {
                if is_context_overflow(&text) {
                    return Err(LlmError::ContextOverflow(truncate(&text)));
                }
                if text.contains("format")
                    && self.json_format_supported.swap(false, Ordering::Relaxed)
                {
                    log::debug!("server rejected format=json; retrying without it");
                    continue;
                }
                return Err(LlmError::Protocol(format!(
                    "HTTP {status}: {}",
                    truncate(&text)
                )));
            }

            return parse_chat_response(&text);
        }
    }

    fn check_connection(&self) -> Result<(), LlmError> {
        let response = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .map_err(classify_reqwest_error)?;
        if !response.status().is_success() {
            return Err(LlmError::Protocol(format!(
                "GET /api/tags returned HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }

    fn server_context_limit(&self) -> Result<Option<usize>, LlmError> {
        let response = self
            .http
            .post(format!("{}/api/show", self.base_url))
            .json(&json!({"model": self.model}))
            .send()
            .map_err(classify_reqwest_error)?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let info: Value = response
            .json()
            .map_err(|e| LlmError::Protocol(format!("bad /api/show JSON: {e}")))?;
        Ok(context_length_from_show(&info))
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
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments,
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
            "content": msg.content,
            "tool_name": msg.tool_name.as_deref().unwrap_or(""),
        }),
    }
}

#[derive(Deserialize)]
struct NativeResponse {
    message: NativeMessage,
    #[serde(default)]
    prompt_eval_count: Option<usize>,
    #[serde(default)]
    eval_count: Option<usize>,
}

#[derive(Deserialize)]
struct NativeMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<NativeToolCall>,
}

#[derive(Deserialize)]
struct NativeToolCall {
    function: NativeFunction,
}

#[derive(Deserialize)]
struct NativeFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

fn parse_chat_response(text: &str) -> Result<ChatOutcome, LlmError> {
    let response: NativeResponse = serde_json::from_str(text)
        .map_err(|e| LlmError::Protocol(format!("bad chat JSON: {e}")))?;

    let tool_calls = response
        .message
        .tool_calls
        .into_iter()
        .enumerate()
        .map(|(idx, call)| ToolCall {
            // The native shape has no call ids; synthesize stable ones so
            // the driver can pair results with calls.
            id: format!("call_{idx}"),
            name: call.function.name,
            arguments: call.function.arguments,
        })
        .collect();

    let tokens_used = match (response.prompt_eval_count, response.eval_count) {
        (None, None) => None,
        (prompt, eval) => Some(prompt.unwrap_or(0) + eval.unwrap_or(0)),
    };

    let mut message = ChatMessage::assistant(response.message.content);
    message.tool_calls = tool_calls;
    Ok(ChatOutcome {
        message,
        tokens_used,
    })
}

fn classify_reqwest_error(e: reqwest::Error) -> LlmError {
    if e.is_decode() {
        LlmError::Protocol(e.to_string())
    } else {
        LlmError::Transport(e.to_string())
    }
}

fn is_context_overflow(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    (lower.contains("context") && (lower.contains("length") || lower.contains("window")))
        || lower.contains("exceeds the available context")
}

/// `/api/show` nests the limit under `model_info` with an
/// architecture-specific prefix, e.g. `llama.context_length`.
fn context_length_from_show(info: &Value) -> Option<usize> {
    let model_info = info.get("model_info")?.as_object()?;
    model_info
        .iter()
        .find(|(key, _)| key.ends_with("context_length"))
        .and_then(|(_, value)| value.as_u64())
        .map(|n| n as usize)
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
    fn parses_final_message_with_usage() {
        let text = r#"{
            "message": {"role": "assistant", "content": "{\"issues\": []}"},
            "prompt_eval_count": 120,
            "eval_count": 30
        }"#;
        let outcome = parse_chat_response(text).unwrap();
        assert_eq!(outcome.message.content, "{\"issues\": []}");
        assert_eq!(outcome.tokens_used, Some(150));
    }

    #[test]
    fn parses_object_arguments_directly() {
        let text = r#"{
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{"function": {"name": "list_directory",
                                             "arguments": {"path": "src", "recursive": true}}}]
            }
        }"#;
        let outcome = parse_chat_response(text).unwrap();
        let call = &outcome.message.tool_calls[0];
        assert_eq!(call.name, "list_directory");
        assert_eq!(call.arguments["recursive"], true);
        assert_eq!(call.id, "call_0");
    }

    #[test]
    fn missing_usage_is_none() {
        let outcome =
            parse_chat_response(r#"{"message": {"role": "assistant", "content": "x"}}"#).unwrap();
        assert_eq!(outcome.tokens_used, None);
    }

    #[test]
    fn show_response_context_length_is_found_under_any_architecture() {
        let info = json!({
            "model_info": {
                "general.architecture": "qwen2",
                "qwen2.context_length": 32768,
                "qwen2.embedding_length": 3584
            }
        });
        assert_eq!(context_length_from_show(&info), Some(32768));
        assert_eq!(context_length_from_show(&json!({})), None);
    }

    #[test]
    fn tool_result_message_carries_tool_name() {
        let call = ToolCall {
            id: "call_0".into(),
            name: "read_file".into(),
            arguments: json!({}),
        };
        let msg = ChatMessage::tool_result(&call, "contents");
        let wire = wire_message(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_name"], "read_file");
    }
}

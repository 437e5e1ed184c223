//! LLM client contract
//!
//! Two backends (openai-compatible and native-chat) implement the same
//! low-level [`ChatBackend`] exchange; everything above that — the JSON
//! enforcement, the reformat-on-failure retry, the tool loop, the dynamic
//! token budget, and the reconnect-forever policy for transport failures —
//! lives in [`LlmClient`] and is identical for both. All model calls in
//! the scanner go through [`LlmClient::query`].

mod native;
mod openai;

pub use native::NativeChatClient;
pub use openai::OpenAiClient;

use std::path::{Component, Path};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;

use crate::config::{Backend, LlmConfig};

/// Upper bound on model-request / tool-execution rounds inside one check.
pub const MAX_TOOL_ITERATIONS: usize = 10;

/// Parse retries per response; each retry is preceded by one reformat
/// request that does not itself count.
const MAX_PARSE_RETRIES: usize = 3;

/// Cadence of the reconnect loop during an LLM outage.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Fraction of the context limit at which the tool loop is told to wrap up.
const FINALIZE_BUDGET_RATIO: f64 = 0.85;

const REFORMAT_PROMPT: &str = "Reformat your previous message as strict JSON: a single object \
     {\"issues\": [{\"file\": \"...\", \"line_number\": 1, \"description\": \"...\", \
     \"suggested_fix\": \"...\"}]}. Output only the JSON object, nothing else.";

const FINALIZE_PROMPT: &str = "You are running low on context. Stop using tools and reply now \
     with your final JSON object of issues.";

/// One finding as the model reports it, before tracker ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawIssue {
    pub file: String,
    pub line_number: u32,
    pub description: String,
    #[serde(default)]
    pub suggested_fix: String,
}

#[derive(Debug, Deserialize)]
struct IssueReport {
    issues: Vec<RawIssue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Backend-neutral chat message. Each backend serializes this into its own
/// wire shape.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Tool invocations requested by an assistant message.
    pub tool_calls: Vec<ToolCall>,
    /// Which call a tool-role message answers.
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage::plain(Role::Assistant, content)
    }

    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call.id.clone()),
            tool_name: Some(call.name.clone()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Description of one callable tool, in JSON-schema terms.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Something that executes tool calls on behalf of the model.
///
/// The executor is a stateless dispatcher; the client owns all wire
/// serialization, which keeps the two backends interchangeable.
pub trait ToolRunner {
    fn specs(&self) -> Vec<ToolSpec>;
    fn run(&self, name: &str, arguments: &serde_json::Value) -> serde_json::Value;
}

/// One request/response exchange as seen by the driver.
#[derive(Debug)]
pub struct ChatOutcome {
    pub message: ChatMessage,
    /// Total tokens the server reported for this exchange, if any.
    pub tokens_used: Option<usize>,
}

#[derive(Debug)]
pub enum LlmError {
    /// Connection refused/reset/timeout; retried forever.
    Transport(String),
    /// Response the client cannot make sense of; the check is skipped.
    Protocol(String),
    /// The conversation no longer fits the model context.
    ContextOverflow(String),
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmError::Transport(msg) => write!(f, "transport error: {msg}"),
            LlmError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            LlmError::ContextOverflow(msg) => write!(f, "context overflow: {msg}"),
        }
    }
}

impl std::error::Error for LlmError {}

/// Low-level exchange implemented per backend.
pub trait ChatBackend: Send {
    fn name(&self) -> &'static str;

    /// Send the conversation, get one assistant turn back.
    ///
    /// `want_json` asks for a JSON-object response format; backends fall
    /// back transparently (one retry without the parameter) when the
    /// server rejects it.
    fn exchange(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        want_json: bool,
    ) -> Result<ChatOutcome, LlmError>;

    /// Cheap reachability probe used by the startup gate.
    fn check_connection(&self) -> Result<(), LlmError>;

    /// Server-reported context limit, when the backend exposes one.
    fn server_context_limit(&self) -> Result<Option<usize>, LlmError>;
}

/// Why a query produced no result at all (as opposed to an empty issue
/// list, which is a perfectly good result).
#[derive(Debug, PartialEq, Eq)]
pub enum QueryAbort {
    /// Shutdown flag observed; the caller is expected to stop.
    Shutdown,
    /// Context overflow; this batch is abandoned.
    Abandoned,
}

pub struct LlmClient {
    backend: Box<dyn ChatBackend>,
    context_limit: usize,
    shutdown: Arc<AtomicBool>,
}

impl LlmClient {
    pub fn from_config(config: &LlmConfig, shutdown: Arc<AtomicBool>) -> Self {
        let backend: Box<dyn ChatBackend> = match config.backend {
            Backend::OpenaiCompatible => Box::new(OpenAiClient::new(config)),
            Backend::NativeChat => Box::new(NativeChatClient::new(config)),
        };
        LlmClient {
            backend,
            context_limit: config.context_limit,
            shutdown,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_backend(
        backend: Box<dyn ChatBackend>,
        context_limit: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        LlmClient {
            backend,
            context_limit,
            shutdown,
        }
    }

    pub fn check_connection(&self) -> Result<(), LlmError> {
        self.backend.check_connection()
    }

    pub fn server_context_limit(&self) -> Result<Option<usize>, LlmError> {
        self.backend.server_context_limit()
    }

    /// Run one check conversation to completion.
    ///
    /// Returns the parsed issues; an empty list on protocol failure after
    /// retries (logged), `Err` only for shutdown or an abandoned batch.
    pub fn query(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        tools: Option<&dyn ToolRunner>,
        max_tool_iterations: usize,
    ) -> Result<Vec<RawIssue>, QueryAbort> {
        let mut messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(user_prompt),
        ];
        let specs = tools.map(|t| t.specs()).unwrap_or_default();

        let mut tokens_seen = estimate_tokens_of(&messages);
        let mut iterations = 0usize;
        let mut finalizing = false;

        loop {
            let active_specs: &[ToolSpec] = if finalizing { &[] } else { &specs };
            let outcome = self.exchange_with_reconnect(&messages, active_specs, true)?;
            match outcome {
                Err(LlmError::Protocol(msg)) => {
                    log::warn!("model returned an unusable response, skipping check: {msg}");
                    return Ok(Vec::new());
                }
                Err(LlmError::ContextOverflow(msg)) => {
                    log::error!("batch abandoned, conversation exceeded the context limit: {msg}");
                    return Err(QueryAbort::Abandoned);
                }
                Err(LlmError::Transport(_)) => unreachable!("transport errors are retried"),
                Ok(outcome) => {
                    tokens_seen = outcome
                        .tokens_used
                        .unwrap_or_else(|| tokens_seen + estimate_tokens(&outcome.message.content));

                    if !outcome.message.tool_calls.is_empty() {
                        if finalizing {
                            // The model ignored the finalize instruction;
                            // parse whatever content it attached rather
                            // than looping forever.
                            log::warn!("model kept requesting tools after finalize");
                            return self
                                .parse_with_reformat(&mut messages, outcome.message.content);
                        }
                        if iterations >= max_tool_iterations {
                            messages.push(outcome.message);
                            messages.push(ChatMessage::user(FINALIZE_PROMPT));
                            finalizing = true;
                            continue;
                        }
                        iterations += 1;
                        let calls = outcome.message.tool_calls.clone();
                        messages.push(outcome.message);
                        for call in &calls {
                            if self.shutdown.load(Ordering::Relaxed) {
                                return Err(QueryAbort::Shutdown);
                            }
                            let result = match tools {
                                Some(runner) => runner.run(&call.name, &call.arguments),
                                None => serde_json::json!({
                                    "error": {"kind": "tool_unavailable",
                                              "message": "no tools are available"}
                                }),
                            };
                            let rendered = result.to_string();
                            tokens_seen += estimate_tokens(&rendered);
                            messages.push(ChatMessage::tool_result(call, rendered));
                        }
                        if tokens_seen as f64 >= self.context_limit as f64 * FINALIZE_BUDGET_RATIO {
                            log::debug!(
                                "token budget at {tokens_seen}/{}, asking the model to finalize",
                                self.context_limit
                            );
                            finalizing = true;
                            messages.push(ChatMessage::user(FINALIZE_PROMPT));
                        }
                        continue;
                    }

                    return self.parse_with_reformat(&mut messages, outcome.message.content);
                }
            }
        }
    }

    /// Parse the assistant's final message, asking it to reformat on
    /// failure. Each reformat-then-parse cycle counts as one retry.
    fn parse_with_reformat(
        &self,
        messages: &mut Vec<ChatMessage>,
        mut content: String,
    ) -> Result<Vec<RawIssue>, QueryAbort> {
        for retry in 0..=MAX_PARSE_RETRIES {
            match parse_issue_report(&content) {
                Ok(issues) => return Ok(issues),
                Err(parse_err) => {
                    if retry == MAX_PARSE_RETRIES {
                        break;
                    }
                    log::debug!("response was not valid JSON ({parse_err}); requesting a reformat");
                    messages.push(ChatMessage::assistant(content.clone()));
                    messages.push(ChatMessage::user(REFORMAT_PROMPT));
                    match self.exchange_with_reconnect(messages, &[], true)? {
                        Ok(outcome) => content = outcome.message.content,
                        Err(LlmError::ContextOverflow(msg)) => {
                            log::error!("batch abandoned during reformat: {msg}");
                            return Err(QueryAbort::Abandoned);
                        }
                        Err(err) => {
                            log::warn!("reformat request failed ({err}); skipping check");
                            return Ok(Vec::new());
                        }
                    }
                }
            }
        }
        log::warn!("model never produced valid JSON after {MAX_PARSE_RETRIES} retries; check yields no issues");
        Ok(Vec::new())
    }

    /// One exchange, retried every 10 s for as long as the transport is
    /// down. The scanner makes no progress during the pause, which is the
    /// point: the schedule must not advance past a check that never ran.
    fn exchange_with_reconnect(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        want_json: bool,
    ) -> Result<Result<ChatOutcome, LlmError>, QueryAbort> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(QueryAbort::Shutdown);
            }
            match self.backend.exchange(messages, tools, want_json) {
                Err(LlmError::Transport(msg)) => {
                    log::warn!(
                        "{} unreachable ({msg}); scanner paused, retrying in {}s",
                        self.backend.name(),
                        RECONNECT_INTERVAL.as_secs()
                    );
                    if !self.sleep_interruptible(RECONNECT_INTERVAL) {
                        return Err(QueryAbort::Shutdown);
                    }
                }
                other => return Ok(other),
            }
        }
    }

    /// Sleep in slices so shutdown stays responsive. Returns false when
    /// the shutdown flag was raised.
    fn sleep_interruptible(&self, total: Duration) -> bool {
        let slice = Duration::from_millis(250);
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.shutdown.load(Ordering::Relaxed) {
                return false;
            }
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining -= step;
        }
        !self.shutdown.load(Ordering::Relaxed)
    }
}

/// Conservative chars/4 token estimate, used for packing and the dynamic
/// budget when the server does not report usage.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

fn estimate_tokens_of(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

/// Strip a ``` fence (with optional language tag) wrapped around a JSON
/// object. Applying it twice equals applying it once.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line (e.g. ```json).
    let body = match rest.split_once('\n') {
        Some((_tag, body)) => body,
        None => rest,
    };
    match body.rsplit_once("```") {
        Some((inner, _)) => inner.trim(),
        None => trimmed,
    }
}

/// Parse the wire contract `{"issues": [...]}`, dropping issues with empty
/// paths or paths pointing outside the target.
fn parse_issue_report(content: &str) -> Result<Vec<RawIssue>, serde_json::Error> {
    let report: IssueReport = serde_json::from_str(strip_code_fences(content))?;
    Ok(report
        .issues
        .into_iter()
        .filter(|issue| {
            if !is_safe_repo_relative(&issue.file) {
                log::debug!("discarding issue with unusable path {:?}", issue.file);
                return false;
            }
            if issue.line_number == 0 {
                log::debug!("discarding issue with line 0 in {:?}", issue.file);
                return false;
            }
            true
        })
        .collect())
}

/// A usable issue path is non-empty, relative, and never climbs out of the
/// repository.
fn is_safe_repo_relative(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    let path = Path::new(path);
    if path.is_absolute() {
        return false;
    }
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

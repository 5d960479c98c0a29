//! Reqwest-based LLM client for OpenAI-compatible Chat Completions streaming.

use std::{collections::BTreeMap, pin::Pin, time::Duration};

use anyhow::{Context, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_core::Stream;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Reply to `call`.
    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            name: Some(call.function.name.clone()),
            tool_call_id: call.id.clone(),
            ..Self::new(Role::Tool, content)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type")]
    pub r#type: String, // must be "function"
    pub function: FunctionSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub r#type: String, // "function"
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub seed: Option<u64>,
    pub tools: Option<Vec<ToolSchema>>,
    pub parallel_tool_calls: bool,
    pub tool_choice: Option<String>, // e.g., "auto"
}

impl ChatOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: None,
            seed: None,
            tools: None,
            parallel_tool_calls: false,
            tool_choice: None,
        }
    }

    fn body(&self, messages: &[ChatMessage]) -> Result<serde_json::Value> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(n) = self.max_tokens {
            body["max_tokens"] = serde_json::json!(n);
        }
        if let Some(seed) = self.seed {
            body["seed"] = serde_json::json!(seed);
        }
        if let Some(tools) = self.tools.as_ref().filter(|t| !t.is_empty()) {
            body["tools"] = serde_json::to_value(tools)?;
            body["parallel_tool_calls"] = serde_json::json!(self.parallel_tool_calls);
            if let Some(choice) = &self.tool_choice {
                body["tool_choice"] = serde_json::json!(choice);
            }
        }
        Ok(body)
    }
}

/// A whole assistant reply assembled from stream events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Folds [`StreamEvent`]s into a [`Completion`]; tool call fragments are keyed by index.
#[derive(Debug, Default)]
pub struct CompletionBuilder {
    content: String,
    calls: BTreeMap<usize, ToolCall>,
}

impl CompletionBuilder {
    pub fn push(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Content(t) => self.content.push_str(t),
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                let call = self.calls.entry(*index).or_insert_with(|| ToolCall {
                    id: None,
                    r#type: "function".into(),
                    function: FunctionCall {
                        name: String::new(),
                        arguments: String::new(),
                    },
                });
                if let Some(id) = id {
                    call.id = Some(id.clone());
                }
                if let Some(n) = name {
                    call.function.name.push_str(n);
                }
                if let Some(a) = arguments {
                    call.function.arguments.push_str(a);
                }
            }
            StreamEvent::ToolCallsFinish | StreamEvent::Done => {}
        }
    }

    pub fn finish(self) -> Completion {
        Completion {
            content: self.content,
            tool_calls: self
                .calls
                .into_values()
                .filter(|c| !c.function.name.is_empty())
                .collect(),
        }
    }
}

/// The seam between the agent loop and a chat model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Requests one reply; `on_text` sees content chunks as they arrive.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
        on_text: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<Completion>;
}

#[derive(Debug)]
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl LlmClient {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let api_key = cfg.require("OPENROUTER_API_KEY")?;
        let timeout = cfg
            .get("REQUEST_TIMEOUT")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(600);
        let base_url = cfg
            .get("API_BASE_URL")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "https://openrouter.ai/api/v1".into())
            .trim_end_matches('/')
            .to_string();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;

        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    pub fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        opts: ChatOptions,
    ) -> Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>> {
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let api_key = self.api_key.clone();

        Box::pin(try_stream! {
            let url = format!("{}/chat/completions", base_url);

            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("text/event-stream"));
            let hv = HeaderValue::from_str(&format!("Bearer {}", api_key))?;
            headers.insert(AUTHORIZATION, hv);

            let body = opts.body(&messages)?;
            debug!(model = %opts.model, messages = messages.len(), "sending chat request");

            let resp = http
                .post(url)
                .headers(headers)
                .json(&body)
                .send()
                .await
                .context("failed to send chat request")?;

            let status = resp.status();
            let resp = if status.is_success() {
                resp
            } else {
                let text = resp.text().await.unwrap_or_default();
                Err::<reqwest::Response, _>(anyhow::anyhow!("LLM error: {} {}", status, text.trim()))?
            };

            let mut lines = LineBuffer::default();
            let mut stream = resp.bytes_stream();
            use futures_util::StreamExt as _;

            while let Some(chunk) = stream.next().await {
                let bytes = chunk.context("stream error")?;
                for line in lines.push(&bytes) {
                    match parse_sse_line(&line) {
                        SseLine::Skip => {}
                        SseLine::Done => { yield StreamEvent::Done; return; }
                        SseLine::Events(events) => {
                            for ev in events { yield ev; }
                        }
                    }
                }
            }
            yield StreamEvent::Done;
        })
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
        on_text: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<Completion> {
        use futures_util::StreamExt as _;

        let mut stream = self.chat_stream(messages.to_vec(), opts.clone());
        let mut builder = CompletionBuilder::default();
        while let Some(ev) = stream.next().await {
            let ev = ev?;
            if let StreamEvent::Content(t) = &ev {
                on_text(t);
            }
            let done = matches!(ev, StreamEvent::Done);
            builder.push(&ev);
            if done {
                break;
            }
        }
        Ok(builder.finish())
    }
}

/// Splits a byte stream into lines. Only complete lines are decoded, so a
/// multi-byte character cut across two chunks arrives intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Content(String),
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },
    ToolCallsFinish,
    Done,
}

#[derive(Debug, PartialEq)]
pub enum SseLine {
    Skip,
    Done,
    Events(Vec<StreamEvent>),
}

/// Interprets one server-sent-events line.
pub fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Skip;
    }
    let Some(payload) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    let chunk = match serde_json::from_str::<Chunk>(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(error = %e, "ignoring malformed stream chunk");
            return SseLine::Skip;
        }
    };
    let mut events = Vec::new();
    for choice in chunk.choices {
        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                events.push(StreamEvent::Content(content));
            }
            for (pos, t) in delta.tool_calls.unwrap_or_default().into_iter().enumerate() {
                let (name, arguments) = match t.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                events.push(StreamEvent::ToolCallDelta {
                    index: t.index.unwrap_or(pos),
                    id: t.id,
                    name,
                    arguments,
                });
            }
        }
        if choice.finish_reason.as_deref() == Some("tool_calls") {
            events.push(StreamEvent::ToolCallsFinish);
        }
    }
    SseLine::Events(events)
}

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    delta: Option<Delta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDeltaPart>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDeltaPart {
    index: Option<usize>,
    id: Option<String>,
    function: Option<FunctionDeltaPart>,
}

#[derive(Debug, Deserialize)]
struct FunctionDeltaPart {
    name: Option<String>,
    arguments: Option<String>,
}

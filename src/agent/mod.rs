//! The code-act turn loop: ask the model, run what it asks for, feed the result back.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::llm::{ChatMessage, ChatModel, ChatOptions, Role, ToolCall};
use crate::sandbox::{Evaluation, Evaluator, TurnContext};
use crate::tools::ToolDispatch;

const OBSERVATION_PREFIX: &str = "Observation:\n";

#[derive(Debug, Clone, PartialEq)]
pub struct AgentOptions {
    pub model: String,
    pub max_turns: usize,
    pub max_tokens: Option<u32>,
    pub seed: Option<u64>,
}

impl AgentOptions {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(Self {
            model: cfg
                .get("DEFAULT_MODEL")
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "google/gemini-2.5-pro".into()),
            max_turns: cfg.parse::<usize>("MAX_TURNS")?.unwrap_or(25).max(1),
            max_tokens: cfg.parse("MAX_COMPLETION_TOKENS")?,
            seed: cfg.parse("SEED")?,
        })
    }
}

/// Message history plus the variables threaded between turns.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    pub messages: Vec<ChatMessage>,
    pub context: TurnContext,
}

impl Conversation {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::new(Role::System, system)],
            context: TurnContext::new(),
        }
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::new(Role::User, text));
    }
}

/// Hooks for showing a run as it happens. Every method defaults to doing nothing.
pub trait TurnObserver: Send {
    fn assistant_text(&mut self, _chunk: &str) {}
    fn assistant_done(&mut self, _text: &str) {}
    fn code(&mut self, _code: &str) {}
    fn execution(&mut self, _evaluation: &Evaluation) {}
    fn tool_call(&mut self, _call: &ToolCall) {}
    fn tool_result(&mut self, _name: &str, _text: &str, _is_error: bool) {}
}

pub struct SilentObserver;

impl TurnObserver for SilentObserver {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    /// The model replied without code or tool calls.
    Answer { text: String, turns: usize },
    /// `max_turns` model turns went by without a final answer.
    BudgetExhausted { last: String, turns: usize },
}

impl AgentOutcome {
    pub fn text(&self) -> &str {
        match self {
            AgentOutcome::Answer { text, .. } => text,
            AgentOutcome::BudgetExhausted { last, .. } => last,
        }
    }
}

pub struct Agent {
    model: Box<dyn ChatModel>,
    evaluator: Arc<dyn Evaluator>,
    tools: Arc<dyn ToolDispatch>,
    options: AgentOptions,
}

impl Agent {
    pub fn new(
        model: Box<dyn ChatModel>,
        evaluator: Arc<dyn Evaluator>,
        tools: Arc<dyn ToolDispatch>,
        options: AgentOptions,
    ) -> Self {
        Self {
            model,
            evaluator,
            tools,
            options,
        }
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// Runs turns until the model answers or the budget is spent.
    ///
    /// Snippet and tool faults become observations; only model transport errors end
    /// the run early.
    pub async fn run(&self, conv: &mut Conversation, observer: &mut dyn TurnObserver) -> Result<AgentOutcome> {
        let mut opts = ChatOptions::new(self.options.model.clone());
        opts.max_tokens = self.options.max_tokens;
        opts.seed = self.options.seed;
        let schemas = self.tools.schemas();
        if !schemas.is_empty() {
            opts.tools = Some(schemas);
            opts.tool_choice = Some("auto".into());
        }

        let mut last = String::new();
        for turn in 1..=self.options.max_turns {
            debug!(turn, messages = conv.messages.len(), "requesting completion");
            let completion = {
                let mut on_text = |chunk: &str| observer.assistant_text(chunk);
                self.model.complete(&conv.messages, &opts, &mut on_text).await?
            };
            observer.assistant_done(&completion.content);
            last = completion.content.clone();

            if !completion.tool_calls.is_empty() {
                info!(turn, calls = completion.tool_calls.len(), "dispatching tool calls");
                conv.messages.push(ChatMessage::assistant_tool_calls(
                    completion.content,
                    completion.tool_calls.clone(),
                ));
                for call in &completion.tool_calls {
                    self.dispatch(call, conv, observer).await;
                }
                continue;
            }

            conv.messages.push(ChatMessage::new(Role::Assistant, completion.content.clone()));
            match extract_code(&completion.content) {
                Some(code) => {
                    info!(turn, bytes = code.len(), "executing code block");
                    observer.code(&code);
                    let evaluation = self.evaluator.evaluate(&code, &conv.context).await;
                    observer.execution(&evaluation);
                    conv.messages.push(ChatMessage::new(
                        Role::User,
                        format!("{OBSERVATION_PREFIX}{}", evaluation.output),
                    ));
                    conv.context = evaluation.context;
                }
                None => {
                    info!(turn, "final answer");
                    return Ok(AgentOutcome::Answer {
                        text: completion.content,
                        turns: turn,
                    });
                }
            }
        }

        warn!(max_turns = self.options.max_turns, "turn budget exhausted");
        Ok(AgentOutcome::BudgetExhausted {
            last,
            turns: self.options.max_turns,
        })
    }

    async fn dispatch(&self, call: &ToolCall, conv: &mut Conversation, observer: &mut dyn TurnObserver) {
        observer.tool_call(call);
        let name = call.function.name.as_str();
        let (text, is_error) = match self.tools.call(name, &call.function.arguments, &conv.context).await {
            Ok(outcome) => {
                conv.context = outcome.context;
                (outcome.summary, false)
            }
            Err(e) => {
                warn!(tool = name, error = %e, "tool call failed");
                (format!("Error: {e}"), true)
            }
        };
        observer.tool_result(name, &text, is_error);
        conv.messages.push(ChatMessage::tool_result(call, text));
    }
}

/// Joins every ```python (or untagged) fenced block in `text`.
///
/// An unterminated fence runs to the end of the reply.
pub fn extract_code(text: &str) -> Option<String> {
    enum Fence<'a> {
        Outside,
        Code(Vec<&'a str>),
        Other,
    }

    let mut blocks: Vec<String> = Vec::new();
    let mut state = Fence::Outside;
    for line in text.lines() {
        let fence = line.trim_start().strip_prefix("```");
        state = match (state, fence) {
            (Fence::Outside, Some(tag)) => match tag.trim().to_ascii_lowercase().as_str() {
                "" | "python" | "py" | "python3" => Fence::Code(Vec::new()),
                _ => Fence::Other,
            },
            (Fence::Outside, None) => Fence::Outside,
            (Fence::Code(lines), Some(_)) => {
                blocks.push(lines.join("\n"));
                Fence::Outside
            }
            (Fence::Code(mut lines), None) => {
                lines.push(line);
                Fence::Code(lines)
            }
            (Fence::Other, Some(_)) => Fence::Outside,
            (Fence::Other, None) => Fence::Other,
        };
    }
    if let Fence::Code(lines) = state {
        blocks.push(lines.join("\n"));
    }

    blocks.retain(|b| !b.trim().is_empty());
    if blocks.is_empty() {
        None
    } else {
        Some(blocks.join("\n\n"))
    }
}

//! Wiring from config to a running agent, plus the terminal observer.

use std::{
    fs,
    io::{self, Write},
    sync::Arc,
};

use anyhow::{Context, Result};
use tracing::info;

use adsorb_agent::{
    agent::{Agent, AgentOptions, AgentOutcome, Conversation, TurnObserver},
    cache::{ChatSession, Transcript},
    config::Config,
    llm::{LlmClient, ToolCall},
    prompt::system_prompt,
    sandbox::{Evaluation, Sandbox, SandboxOptions},
    tools::{ToolRegistry, TOOL_SOURCE},
};

use crate::printer::{MarkdownPrinter, TextPrinter, Tone};

pub mod repl;
pub mod task;

/// Command-line overrides of config values.
#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    pub model: Option<String>,
    pub max_turns: Option<usize>,
    pub markdown: bool,
    pub chat_id: Option<String>,
}

/// A started agent and the chat it works on.
pub struct Session {
    pub agent: Agent,
    pub conversation: Conversation,
    chats: ChatSession,
    chat_id: Option<String>,
}

impl Session {
    /// Everything that can fail at startup fails here, before the first turn.
    pub async fn start(cfg: &Config, settings: &RunSettings) -> Result<Self> {
        let client = LlmClient::from_config(cfg)?;
        let mut options = AgentOptions::from_config(cfg)?;
        if let Some(model) = &settings.model {
            options.model = model.clone();
        }
        if let Some(turns) = settings.max_turns {
            options.max_turns = turns.max(1);
        }

        let output_dir = cfg.output_dir();
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("creating output directory {}", output_dir.display()))?;

        let sandbox = Arc::new(Sandbox::start(SandboxOptions::from_config(cfg, TOOL_SOURCE)?).await?);
        let tools = Arc::new(ToolRegistry::new(Arc::clone(&sandbox), output_dir));

        let chats = ChatSession::from_config(cfg);
        let saved = match &settings.chat_id {
            Some(id) => chats.read(id)?,
            None => Transcript::default(),
        };
        let conversation = if saved.messages.is_empty() {
            Conversation::new(system_prompt(&sandbox.baseline()))
        } else {
            info!(chat = ?settings.chat_id, messages = saved.messages.len(), "resuming chat");
            Conversation {
                messages: saved.messages,
                context: saved.context,
            }
        };

        info!(model = %options.model, max_turns = options.max_turns, "agent ready");
        let agent = Agent::new(Box::new(client), sandbox, tools, options);
        Ok(Self {
            agent,
            conversation,
            chats,
            chat_id: settings.chat_id.clone(),
        })
    }

    /// Sends `text` and runs turns until the agent answers or gives up.
    pub async fn ask(&mut self, text: &str, observer: &mut TranscriptPrinter) -> Result<AgentOutcome> {
        self.conversation.push_user(text);
        let outcome = self.agent.run(&mut self.conversation, observer).await;
        self.save()?;
        let outcome = outcome?;
        observer.outcome(&outcome);
        Ok(outcome)
    }

    fn save(&self) -> Result<()> {
        if let Some(id) = &self.chat_id {
            self.chats.write(
                id,
                &Transcript {
                    messages: self.conversation.messages.clone(),
                    context: self.conversation.context.clone(),
                },
            )?;
        }
        Ok(())
    }
}

/// Prints a run to the terminal as it happens.
pub struct TranscriptPrinter {
    markdown: bool,
}

impl TranscriptPrinter {
    pub fn new(markdown: bool) -> Self {
        Self { markdown }
    }

    pub fn outcome(&self, outcome: &AgentOutcome) {
        if let AgentOutcome::BudgetExhausted { turns, .. } = outcome {
            TextPrinter::new(Tone::Error).print(&format!(
                "Stopped after {turns} turns without a final answer (raise --max-turns or MAX_TURNS)."
            ));
        }
    }
}

impl TurnObserver for TranscriptPrinter {
    fn assistant_text(&mut self, chunk: &str) {
        if !self.markdown {
            print!("{chunk}");
            let _ = io::stdout().flush();
        }
    }

    fn assistant_done(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.markdown {
            MarkdownPrinter::default().print(text);
        } else {
            println!();
        }
    }

    fn execution(&mut self, evaluation: &Evaluation) {
        let printer = TextPrinter::new(if evaluation.failed { Tone::Error } else { Tone::Output });
        printer.heading("output");
        printer.print(evaluation.output.trim_end());
    }

    fn tool_call(&mut self, call: &ToolCall) {
        let printer = TextPrinter::new(Tone::Tool);
        printer.heading(&format!("tool {}", call.function.name));
        printer.print(&call.function.arguments);
    }

    fn tool_result(&mut self, _name: &str, text: &str, is_error: bool) {
        TextPrinter::new(if is_error { Tone::Error } else { Tone::Output }).print(text);
    }
}

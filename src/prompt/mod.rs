//! Task template and the code-act system message.

use std::{fs, path::PathBuf};

use thiserror::Error;

use crate::config::Config;
use crate::sandbox::{BaselineScope, BindingKind};
use crate::tools::ToolRegistry;

const BUILTIN_TEMPLATE: &str = include_str!("task.md");

/// Placeholders every template must contain.
pub const PLACEHOLDERS: [&str; 3] = ["SMILES", "SLAB_XYZ", "USER_REQUEST"];

pub const DEFAULT_USER_REQUEST: &str = "Find a stable adsorption configuration.";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("cannot read prompt template {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("prompt template has no {{{{{0}}}}} placeholder")]
    MissingPlaceholder(&'static str),
    #[error("prompt template uses unknown placeholder {{{{{0}}}}}")]
    UnknownPlaceholder(String),
    #[error("prompt template has an unterminated `{{{{` at byte {0}")]
    Unterminated(usize),
}

/// What the user wants done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub smiles: String,
    pub slab_path: String,
    pub user_request: String,
}

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    text: String,
}

impl PromptTemplate {
    pub fn builtin() -> Self {
        Self {
            text: BUILTIN_TEMPLATE.to_string(),
        }
    }

    /// `PROMPT_TEMPLATE_PATH` if set, otherwise the built-in template.
    pub fn from_config(cfg: &Config) -> Result<Self, TemplateError> {
        match cfg.get_path("PROMPT_TEMPLATE_PATH") {
            Some(path) => {
                let text = fs::read_to_string(&path).map_err(|source| TemplateError::Read { path, source })?;
                Self::parse(text)
            }
            None => Ok(Self::builtin()),
        }
    }

    pub fn parse(text: impl Into<String>) -> Result<Self, TemplateError> {
        let text = text.into();
        let found = placeholders(&text)?;
        if let Some(unknown) = found.iter().find(|p| !PLACEHOLDERS.contains(&p.as_str())) {
            return Err(TemplateError::UnknownPlaceholder(unknown.clone()));
        }
        if let Some(missing) = PLACEHOLDERS.iter().find(|p| !found.iter().any(|f| f == *p)) {
            return Err(TemplateError::MissingPlaceholder(missing));
        }
        Ok(Self { text })
    }

    pub fn render(&self, task: &TaskSpec) -> String {
        self.text
            .replace("{{SMILES}}", &task.smiles)
            .replace("{{SLAB_XYZ}}", &task.slab_path)
            .replace("{{USER_REQUEST}}", &task.user_request)
    }
}

fn placeholders(text: &str) -> Result<Vec<String>, TemplateError> {
    let mut found = Vec::new();
    let mut rest = text;
    let mut offset = 0;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or(TemplateError::Unterminated(offset + start))?;
        found.push(after[..end].trim().to_string());
        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    Ok(found)
}

/// The system message explaining the code-act protocol.
pub fn system_prompt(baseline: &BaselineScope) -> String {
    let mut modules: Vec<&str> = baseline.names_of_kind(BindingKind::Module).collect();
    modules.retain(|m| !m.starts_with('_'));
    let tools = ToolRegistry::signatures()
        .into_iter()
        .map(|s| format!("- {s}"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You are a careful computational chemist who solves tasks by writing and running Python code.\n\
         \n\
         To run code, reply with a single ```python fenced block. It is executed in a persistent \
         Python {python} session: variables, functions and imports you define stay available in \
         later blocks. Whatever the code prints to stdout is sent back to you; if it raises, you \
         receive the traceback instead and should fix the code. Print the values you need to see.\n\
         \n\
         Preloaded modules: {modules}.\n\
         \n\
         These functions are preloaded in the session and can also be invoked as tool calls \
         (tool calls take variable names for structure arguments and store the result in a \
         variable):\n\
         {tools}\n\
         \n\
         Relaxation and dynamics are slow; do not call them in a loop. When the task is done, \
         reply with your final answer and no code block.",
        python = baseline.python_version(),
        modules = if modules.is_empty() { "none".to_string() } else { modules.join(", ") },
    )
}

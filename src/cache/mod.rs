//! Chat transcript persistence.

use std::{fs, path::PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::Config,
    llm::{ChatMessage, Role},
    sandbox::TurnContext,
};

/// What a saved chat holds: the messages and the variables threaded between turns.
///
/// Handles in `context` belong to the worker that created them; after a restart the
/// sandbox drops them and says so in its next observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub context: TurnContext,
}

#[derive(Debug, Clone)]
pub struct ChatSession {
    length: usize,
    storage_path: PathBuf,
}

impl ChatSession {
    pub fn from_config(cfg: &Config) -> Self {
        let len = cfg.get_usize("CHAT_CACHE_LENGTH").unwrap_or(100);
        Self::new(cfg.chat_cache_path(), len)
    }

    pub fn new(storage_path: impl Into<PathBuf>, length: usize) -> Self {
        Self {
            length: length.max(2),
            storage_path: storage_path.into(),
        }
    }

    fn file_path(&self, chat_id: &str) -> Result<PathBuf> {
        if !is_chat_id(chat_id) {
            bail!("invalid chat id `{chat_id}`: use letters, digits, `_`, `-` and `.`, not starting with `.`");
        }
        Ok(self.storage_path.join(format!("{chat_id}.json")))
    }

    pub fn exists(&self, chat_id: &str) -> bool {
        self.file_path(chat_id).is_ok_and(|p| p.exists())
    }

    pub fn invalidate(&self, chat_id: &str) {
        if let Ok(p) = self.file_path(chat_id) {
            let _ = fs::remove_file(p);
        }
    }

    /// An empty transcript when `chat_id` was never saved.
    pub fn read(&self, chat_id: &str) -> Result<Transcript> {
        let p = self.file_path(chat_id)?;
        if !p.exists() {
            return Ok(Transcript::default());
        }
        let text = fs::read_to_string(&p).with_context(|| format!("reading chat {}", p.display()))?;
        serde_json::from_str(&text).with_context(|| format!("chat {} is not a valid transcript", p.display()))
    }

    pub fn write(&self, chat_id: &str, transcript: &Transcript) -> Result<()> {
        let p = self.file_path(chat_id)?;
        fs::create_dir_all(&self.storage_path)
            .with_context(|| format!("creating {}", self.storage_path.display()))?;
        let saved = Transcript {
            messages: truncate(&transcript.messages, self.length),
            context: transcript.context.clone(),
        };
        fs::write(&p, serde_json::to_string_pretty(&saved)?)?;
        debug!(chat = chat_id, messages = saved.messages.len(), "chat saved");
        Ok(())
    }

    /// Saved chat ids, oldest first.
    pub fn list(&self) -> Vec<String> {
        let Ok(read_dir) = fs::read_dir(&self.storage_path) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = read_dir
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort_by_key(|p| fs::metadata(p).and_then(|m| m.modified()).ok());
        files
            .iter()
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect()
    }
}

/// A chat id names a file in the cache directory and nothing else.
fn is_chat_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Keeps the first message and the newest ones, `length` in total.
///
/// A cut never leaves tool results whose assistant request was dropped.
fn truncate(messages: &[ChatMessage], length: usize) -> Vec<ChatMessage> {
    if messages.len() <= length {
        return messages.to_vec();
    }
    let mut tail = &messages[messages.len() - (length - 1)..];
    while tail.first().is_some_and(|m| m.role == Role::Tool) {
        tail = &tail[1..];
    }
    std::iter::once(&messages[0]).chain(tail).cloned().collect()
}

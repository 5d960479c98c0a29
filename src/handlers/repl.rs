//! Line-based chat with the agent; the turn context carries over between messages.

use std::io::{self, BufRead, Write};

use anyhow::Result;
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;

use super::{Session, TranscriptPrinter};

const EXIT_WORDS: [&str; 3] = ["exit", "quit", ":q"];

pub struct ReplHandler;

impl ReplHandler {
    pub async fn run(session: &mut Session, markdown: bool) -> Result<()> {
        let interactive = io::stdin().is_terminal();
        if interactive {
            println!("{}", "Type a message for the agent; `exit` or Ctrl-D quits.".dimmed());
        }
        let mut printer = TranscriptPrinter::new(markdown);
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            if interactive {
                print!("{} ", ">>>".magenta());
                io::stdout().flush()?;
            }
            line.clear();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            if EXIT_WORDS.contains(&text) {
                break;
            }
            session.ask(text, &mut printer).await?;
        }
        Ok(())
    }
}

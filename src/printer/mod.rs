//! Printers: text and markdown (termimad).

use owo_colors::OwoColorize;
use termimad::MadSkin;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Plain,
    Output,
    Tool,
    Error,
}

pub struct TextPrinter {
    pub tone: Tone,
}

impl TextPrinter {
    pub fn new(tone: Tone) -> Self {
        Self { tone }
    }

    pub fn print(&self, text: &str) {
        match self.tone {
            Tone::Output => println!("{}", text.green()),
            Tone::Tool => println!("{}", text.magenta()),
            Tone::Error => println!("{}", text.yellow()),
            Tone::Plain => println!("{}", text),
        }
    }

    /// A dimmed `--- title ---` rule.
    pub fn heading(&self, title: &str) {
        println!("{}", format!("--- {title} ---").dimmed());
    }
}

pub struct MarkdownPrinter {
    pub skin: MadSkin,
}

impl Default for MarkdownPrinter {
    fn default() -> Self {
        Self { skin: MadSkin::default() }
    }
}

impl MarkdownPrinter {
    pub fn print(&self, text: &str) {
        self.skin.print_text(text);
        println!();
    }
}

use clap::{ArgGroup, Parser};

use adsorb_agent::prompt::DEFAULT_USER_REQUEST;

#[derive(Parser, Debug, Clone)]
#[command(name = "adsorb-agent", about = "LLM agent that places ligands on catalyst slabs by writing and running Python", version)]
#[command(group(ArgGroup::new("md_switch").args(["md", "no_md"]).multiple(false)))]
#[command(group(ArgGroup::new("listing").args(["show_chat", "list_chats", "print_prompt"]).multiple(false)))]
pub struct Cli {
    /// Surrogate SMILES of the ligand (marker atom first).
    #[arg(long, value_name = "SMILES")]
    pub smiles: Option<String>,

    /// Structure file of the slab (xyz, cif, traj, ...).
    #[arg(long = "slab-path", value_name = "PATH")]
    pub slab_path: Option<String>,

    /// What to do with the ligand and slab.
    #[arg(long = "user-request", default_value = DEFAULT_USER_REQUEST)]
    pub user_request: String,

    /// Large language model to use.
    #[arg(long)]
    pub model: Option<String>,

    /// Stop after this many model turns without a final answer.
    #[arg(long = "max-turns", value_parser = clap::value_parser!(usize))]
    pub max_turns: Option<usize>,

    /// Render assistant replies as Markdown once complete.
    ///
    /// With `--no-md` (or `PRETTIFY_MARKDOWN=false`) replies stream to the terminal as they arrive.
    #[arg(long)]
    pub md: bool,
    /// Stream assistant replies as plain text.
    #[arg(long = "no-md")]
    pub no_md: bool,

    /// Save the conversation under this id; an existing chat is resumed.
    #[arg(long)]
    pub chat: Option<String>,

    /// Keep talking to the agent after the task: every line is a new message.
    #[arg(long)]
    pub repl: bool,

    /// Show all messages from provided chat id.
    #[arg(long = "show-chat")]
    pub show_chat: Option<String>,

    /// List all existing chat ids.
    #[arg(short = 'l', long = "list-chats", visible_alias = "lc")]
    pub list_chats: bool,

    /// Print the rendered task prompt and exit.
    #[arg(long = "print-prompt")]
    pub print_prompt: bool,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_flags() {
        let cli = Cli::try_parse_from([
            "adsorb-agent",
            "--smiles",
            "Cl[O+](C)C",
            "--slab-path",
            "cu111.xyz",
            "--max-turns",
            "10",
            "--no-md",
        ])
        .unwrap();
        assert_eq!(cli.smiles.as_deref(), Some("Cl[O+](C)C"));
        assert_eq!(cli.slab_path.as_deref(), Some("cu111.xyz"));
        assert_eq!(cli.user_request, DEFAULT_USER_REQUEST);
        assert_eq!(cli.max_turns, Some(10));
        assert!(cli.no_md && !cli.md);
    }

    #[test]
    fn conflicting_switches() {
        assert!(Cli::try_parse_from(["adsorb-agent", "--md", "--no-md"]).is_err());
        assert!(Cli::try_parse_from(["adsorb-agent", "--list-chats", "--show-chat", "a"]).is_err());
    }
}

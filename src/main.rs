mod cli;
mod handlers;
mod printer;

use anyhow::{bail, Result};
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

use adsorb_agent::{cache::ChatSession, config::Config, llm::Role};
use handlers::{repl::ReplHandler, task::TaskHandler, RunSettings, Session};
use printer::{MarkdownPrinter, TextPrinter, Tone};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("adsorb_agent=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = cli::Cli::parse();
    let cfg = Config::load();

    let md = if args.no_md {
        false
    } else if args.md {
        true
    } else {
        cfg.get_bool("PRETTIFY_MARKDOWN")
    };

    if let Some(id) = &args.show_chat {
        return show_chat(&cfg, id, md);
    }
    if args.list_chats {
        for id in ChatSession::from_config(&cfg).list() {
            println!("{id}");
        }
        return Ok(());
    }

    let has_task = args.smiles.is_some() || args.slab_path.is_some();
    let prompt = if has_task || !args.repl {
        Some(TaskHandler::prompt(
            &cfg,
            args.smiles.as_deref(),
            args.slab_path.as_deref(),
            &args.user_request,
        )?)
    } else {
        None
    };
    if args.print_prompt {
        if let Some(prompt) = &prompt {
            println!("{prompt}");
        }
        return Ok(());
    }

    let settings = RunSettings {
        model: args.model.clone(),
        max_turns: args.max_turns,
        markdown: md,
        chat_id: args.chat.clone(),
    };
    match prompt {
        Some(prompt) => {
            let (mut session, _outcome) = TaskHandler::run(&cfg, &prompt, &settings).await?;
            if args.repl {
                ReplHandler::run(&mut session, md).await?;
            }
        }
        None => {
            let mut session = Session::start(&cfg, &settings).await?;
            ReplHandler::run(&mut session, md).await?;
        }
    }
    Ok(())
}

fn show_chat(cfg: &Config, id: &str, md: bool) -> Result<()> {
    let session = ChatSession::from_config(cfg);
    if !session.exists(id) {
        bail!("chat not found: {id}");
    }
    let transcript = session.read(id)?;
    let label = |role: Role| match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    if md {
        let mut md_text = String::new();
        for m in &transcript.messages {
            md_text.push_str(&format!("### {}\n\n{}\n\n", label(m.role), m.content));
            for call in m.tool_calls.iter().flatten() {
                md_text.push_str(&format!("`{}({})`\n\n", call.function.name, call.function.arguments));
            }
        }
        MarkdownPrinter::default().print(&md_text);
    } else {
        for m in &transcript.messages {
            let header = match m.role {
                Role::System => label(m.role).cyan().to_string(),
                Role::User => label(m.role).magenta().to_string(),
                Role::Assistant => label(m.role).green().to_string(),
                Role::Tool => label(m.role).yellow().to_string(),
            };
            println!("{}: {}", header, m.content);
            for call in m.tool_calls.iter().flatten() {
                TextPrinter::new(Tone::Tool).print(&format!("{}({})", call.function.name, call.function.arguments));
            }
            println!();
        }
    }
    if !transcript.context.is_empty() {
        let printer = TextPrinter::new(Tone::Plain);
        printer.heading("variables");
        for (name, value) in transcript.context.iter() {
            printer.print(&format!("{name} = {value}"));
        }
    }
    Ok(())
}

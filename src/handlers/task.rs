//! One task run: render the prompt, run the agent to an answer.

use anyhow::{bail, Result};

use adsorb_agent::{
    agent::AgentOutcome,
    config::Config,
    prompt::{PromptTemplate, TaskSpec},
};

use super::{RunSettings, Session, TranscriptPrinter};

pub struct TaskHandler;

impl TaskHandler {
    /// Renders the task; fails when the template or the inputs are unusable.
    pub fn prompt(cfg: &Config, smiles: Option<&str>, slab_path: Option<&str>, user_request: &str) -> Result<String> {
        let (Some(smiles), Some(slab_path)) = (smiles, slab_path) else {
            bail!("--smiles and --slab-path are both required to start a task");
        };
        if smiles.trim().is_empty() {
            bail!("--smiles is empty");
        }
        let template = PromptTemplate::from_config(cfg)?;
        Ok(template.render(&TaskSpec {
            smiles: smiles.trim().to_string(),
            slab_path: slab_path.to_string(),
            user_request: user_request.to_string(),
        }))
    }

    pub async fn run(cfg: &Config, prompt: &str, settings: &RunSettings) -> Result<(Session, AgentOutcome)> {
        let mut session = Session::start(cfg, settings).await?;
        let mut printer = TranscriptPrinter::new(settings.markdown);
        let outcome = session.ask(prompt, &mut printer).await?;
        Ok((session, outcome))
    }
}

//! Code-execution sandbox: one long-lived Python worker, driven one request at a time.
//!
//! "Sandbox" means fault containment, not a security boundary. A snippet that raises,
//! exits, crashes the interpreter or (with `EXEC_TIMEOUT`) runs too long turns into an
//! `Error during execution:` report; the caller always gets an [`Evaluation`] back.

use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};

pub mod protocol;
pub mod scope;
mod worker;

use protocol::{CallReply, ExecReply, Failure, InitReply, Request};
pub use scope::{
    prepare_scope, BaselineScope, Binding, BindingKind, ContextValue, MissingModule,
    PreparedScope, TurnContext,
};
use worker::Worker;

/// Output when a snippet ran cleanly and printed nothing.
pub const NO_OUTPUT: &str = "<code ran, no output printed to stdout>";
/// Every failure report starts with this line.
pub const ERROR_PREFIX: &str = "Error during execution:\n";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to start python interpreter `{python}`")]
    Spawn {
        python: String,
        #[source]
        source: io::Error,
    },
    #[error("worker {0} pipe is not available")]
    MissingPipe(&'static str),
    #[error("worker i/o failed")]
    Io(#[from] io::Error),
    #[error("worker exited unexpectedly ({status})")]
    Exited { status: String },
    #[error("malformed worker message")]
    Protocol(#[from] serde_json::Error),
    #[error("worker failed to initialise:\n{0}")]
    Init(String),
    #[error("execution exceeded {0:?}; the worker was killed")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub python: String,
    /// `(alias, module)` pairs imported into the baseline.
    pub modules: Vec<(String, String)>,
    /// Source of the module whose `__all__` becomes the tool set.
    pub tools_source: String,
    pub timeout: Option<Duration>,
}

impl SandboxOptions {
    pub fn from_config(cfg: &Config, tools_source: impl Into<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            python: cfg.python_bin(),
            modules: cfg.sandbox_modules()?,
            tools_source: tools_source.into(),
            timeout: cfg.exec_timeout()?,
        })
    }
}

/// Result of one snippet execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub output: String,
    pub context: TurnContext,
    pub failed: bool,
}

impl Evaluation {
    fn fault(detail: impl std::fmt::Display, context: TurnContext, dropped: &[String]) -> Self {
        Self {
            output: with_stale_note(format!("{ERROR_PREFIX}{detail}"), dropped),
            context,
            failed: true,
        }
    }
}

/// The `evaluate` contract the agent loop depends on.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Never fails: faults are reported in [`Evaluation::output`].
    async fn evaluate(&self, code: &str, context: &TurnContext) -> Evaluation;

    /// Names every snippet can rely on.
    fn baseline(&self) -> Arc<BaselineScope>;
}

struct Live {
    worker: Worker,
    owner: u32,
}

pub struct Sandbox {
    options: SandboxOptions,
    baseline: Arc<BaselineScope>,
    live: Mutex<Option<Live>>,
}

impl Sandbox {
    /// Starts and initialises the worker; failure here is a startup fault.
    pub async fn start(options: SandboxOptions) -> Result<Self, SandboxError> {
        let (live, baseline) = launch(&options).await?;
        info!(
            python = baseline.python_version(),
            names = baseline.len(),
            pid = live.owner,
            "sandbox worker ready"
        );
        for m in baseline.missing() {
            warn!(alias = %m.alias, module = %m.module, "library unavailable in sandbox: {}", m.error);
        }
        if options.timeout.is_none() {
            warn!("EXEC_TIMEOUT is disabled: a non-terminating snippet or tool call blocks the session");
        }
        Ok(Self {
            options,
            baseline: Arc::new(baseline),
            live: Mutex::new(Some(live)),
        })
    }

    pub fn baseline(&self) -> Arc<BaselineScope> {
        Arc::clone(&self.baseline)
    }

    pub fn prepare_scope(&self, turn_context: &TurnContext) -> PreparedScope {
        prepare_scope(&self.baseline, turn_context)
    }

    pub async fn evaluate(&self, code: &str, context: &TurnContext) -> Evaluation {
        let mut slot = self.live.lock().await;
        let mut shipped = self.prepare_scope(context).into_overrides();

        let live = match self.ensure_live(&mut slot).await {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "sandbox worker unavailable");
                let (kept, dropped) = shipped.without_handles();
                return Evaluation::fault(format!("sandbox worker unavailable: {e}"), kept, &dropped);
            }
        };
        let mut dropped = shipped.retain_owned_by(live.owner);

        debug!(bytes = code.len(), bindings = shipped.len(), "executing snippet");
        let request = Request::Exec {
            code,
            context: &shipped,
        };
        match self.round_trip::<ExecReply>(live, &request).await {
            Ok(Ok(reply)) => {
                dropped.extend(reply.stale);
                Evaluation {
                    output: with_stale_note(reply.output, &dropped),
                    context: reply.context,
                    failed: reply.failed,
                }
            }
            Ok(Err(failure)) => {
                dropped.extend(failure.stale);
                Evaluation::fault(failure.error, shipped, &dropped)
            }
            Err(e) => {
                warn!(error = %e, "sandbox worker lost; it will be restarted");
                retire(&mut slot).await;
                let (kept, more) = shipped.without_handles();
                dropped.extend(more);
                Evaluation::fault(e, kept, &dropped)
            }
        }
    }

    /// Runs tool `tool` inside the worker and binds its result to `bind`.
    pub(crate) async fn call_tool(
        &self,
        tool: &str,
        args: &serde_json::Value,
        bind: &str,
        context: &TurnContext,
    ) -> Result<Result<CallReply, Failure>, SandboxError> {
        let mut slot = self.live.lock().await;
        let mut shipped = self.prepare_scope(context).into_overrides();
        let live = self.ensure_live(&mut slot).await?;
        let dropped = shipped.retain_owned_by(live.owner);

        debug!(tool, bind, "calling tool");
        let request = Request::Call {
            tool,
            args,
            bind,
            context: &shipped,
        };
        let result = self.round_trip::<CallReply>(live, &request).await;
        if result.is_err() {
            retire(&mut slot).await;
        }
        Ok(match result? {
            Ok(mut reply) => {
                reply.stale.extend(dropped);
                Ok(reply)
            }
            Err(mut failure) => {
                failure.stale.extend(dropped);
                Err(failure)
            }
        })
    }

    async fn ensure_live<'a>(&self, slot: &'a mut Option<Live>) -> Result<&'a mut Live, SandboxError> {
        let live = match slot.take() {
            Some(live) => live,
            None => {
                let (live, baseline) = launch(&self.options).await?;
                if !scope::baseline_matches(&self.baseline, &baseline) {
                    warn!("restarted worker reports a different baseline; keeping the original manifest");
                }
                info!(pid = live.owner, "sandbox worker restarted");
                live
            }
        };
        Ok(slot.insert(live))
    }

    async fn round_trip<T: DeserializeOwned>(
        &self,
        live: &mut Live,
        request: &Request<'_>,
    ) -> Result<Result<T, Failure>, SandboxError> {
        match self.options.timeout {
            Some(limit) => tokio::time::timeout(limit, live.worker.request(request))
                .await
                .map_err(|_| SandboxError::Timeout(limit))?,
            None => live.worker.request(request).await,
        }
    }
}

#[async_trait]
impl Evaluator for Sandbox {
    async fn evaluate(&self, code: &str, context: &TurnContext) -> Evaluation {
        Sandbox::evaluate(self, code, context).await
    }

    fn baseline(&self) -> Arc<BaselineScope> {
        Sandbox::baseline(self)
    }
}

async fn launch(options: &SandboxOptions) -> Result<(Live, BaselineScope), SandboxError> {
    let mut worker = Worker::spawn(&options.python).await?;
    let request = Request::Init {
        modules: &options.modules,
        tools: &options.tools_source,
    };
    let reply: InitReply = match worker.request(&request).await? {
        Ok(reply) => reply,
        Err(failure) => {
            worker.kill().await;
            return Err(SandboxError::Init(failure.error));
        }
    };
    let baseline = BaselineScope::new(reply.baseline, reply.missing, reply.python);
    Ok((
        Live {
            worker,
            owner: reply.pid,
        },
        baseline,
    ))
}

async fn retire(slot: &mut Option<Live>) {
    if let Some(mut live) = slot.take() {
        live.worker.kill().await;
    }
}

pub(crate) fn with_stale_note(mut output: String, dropped: &[String]) -> String {
    if dropped.is_empty() {
        return output;
    }
    if !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(&format!(
        "[sandbox] dropped bindings held by a previous worker: {}\n",
        dropped.join(", ")
    ));
    output
}

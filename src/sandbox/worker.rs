//! Python worker process bootstrap and I/O glue.

use serde::de::DeserializeOwned;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
};
use tracing::debug;

use super::protocol::{self, Failure, Request};
use super::SandboxError;

const WORKER_SOURCE: &str = include_str!("worker.py");

pub struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Worker {
    pub async fn spawn(python: &str) -> Result<Self, SandboxError> {
        let mut cmd = Command::new(python);
        cmd.arg("-u") // unbuffered
            .arg("-c")
            .arg(WORKER_SOURCE)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child: Child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            python: python.to_string(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(SandboxError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SandboxError::MissingPipe("stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let pid = child.id();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "adsorb_agent::worker", pid = ?pid, "{line}");
                }
            });
        }

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    /// Sends one request and waits for its reply line.
    pub async fn request<T: DeserializeOwned>(
        &mut self,
        request: &Request<'_>,
    ) -> Result<Result<T, Failure>, SandboxError> {
        let line = protocol::encode(request)?;
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        match self.stdout.next_line().await? {
            Some(reply) => protocol::decode(&reply),
            None => Err(SandboxError::Exited {
                status: self.exit_status().await,
            }),
        }
    }

    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "worker was already gone");
        }
    }

    async fn exit_status(&mut self) -> String {
        match self.child.wait().await {
            Ok(status) => status.to_string(),
            Err(e) => format!("status unavailable: {e}"),
        }
    }
}

//! External-process workers.
//!
//! `CommandWorker` runs an agent CLI in headless mode (for example
//! `claude --agent rustarch -p`), feeding the payload on stdin and reading
//! the reply from stdout. JSON replies in the `{"subtype", "result",
//! "error"}` shape are unwrapped; anything else is taken as raw text.
//!
//! The child is spawned with `kill_on_drop`, so dropping the invocation
//! future (timeout or cancellation) terminates the process.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::util::{preview, split_command};
use crate::worker::{InvocationRequest, Worker};

/// File the payload is mirrored to inside the invocation workspace.
pub const PROMPT_FILE: &str = "prompt.md";

/// Structured reply some agent CLIs emit with `--output-format json`.
#[derive(Debug, Deserialize)]
struct RawReply {
    subtype: Option<String>,
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// A worker backed by an external command.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandWorker {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }

    /// Parse a command line such as `claude --agent gad -p`.
    pub fn from_command_line(name: &str, line: &str) -> Result<Self> {
        let mut words = split_command(line)?;
        let program = words.remove(0);
        Ok(Self::new(name, program, words))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Whether the program resolves on `PATH`.
    pub fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }

    /// Resolved program path, if any.
    pub fn resolved_program(&self) -> Option<PathBuf> {
        which::which(&self.program).ok()
    }

    /// Interpret process output as worker text.
    pub fn parse_reply(stdout: &str, stderr: &str, success: bool, code: Option<i32>) -> Result<String> {
        if let Ok(raw) = serde_json::from_str::<RawReply>(stdout.trim()) {
            return match raw.subtype.as_deref() {
                Some("success") => non_empty(raw.result.unwrap_or_default()),
                Some("error") => Err(Error::InvocationFailure(
                    raw.error.or(raw.result).unwrap_or_default(),
                )),
                _ => match (raw.error, raw.result) {
                    (Some(error), _) => Err(Error::InvocationFailure(error)),
                    (None, Some(result)) => non_empty(result),
                    (None, None) => Err(Error::InvocationFailure(
                        "unrecognised reply format".to_string(),
                    )),
                },
            };
        }

        if !success {
            let message = if stderr.trim().is_empty() {
                format!("exited with code {}", code.unwrap_or(-1))
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::InvocationFailure(message));
        }

        non_empty(stdout.trim().to_string())
    }
}

fn non_empty(text: String) -> Result<String> {
    if text.trim().is_empty() {
        Err(Error::InvocationFailure("empty output".to_string()))
    } else {
        Ok(text)
    }
}

#[async_trait]
impl Worker for CommandWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<String> {
        tokio::fs::create_dir_all(&request.workspace).await?;
        tokio::fs::write(request.workspace.join(PROMPT_FILE), &request.payload).await?;

        debug!(
            worker = %self.name,
            program = %self.program,
            workspace = %request.workspace.display(),
            "spawning worker process"
        );
        trace!(worker = %self.name, payload = %preview(&request.payload, 200), "payload");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&request.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::InvocationFailure(format!("failed to spawn {}: {e}", self.program)))?;

        // Fed from its own task so a child that echoes while reading cannot
        // fill both pipes. A child that never reads stdin just closes it.
        if let Some(mut stdin) = child.stdin.take() {
            let payload = request.payload.clone();
            tokio::spawn(async move {
                let _ = stdin.write_all(payload.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let output = tokio::time::timeout(request.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::InvocationTimeout(request.timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        trace!(worker = %self.name, stdout = %preview(&stdout, 200), "worker replied");

        Self::parse_reply(&stdout, &stderr, output.status.success(), output.status.code())
    }
}

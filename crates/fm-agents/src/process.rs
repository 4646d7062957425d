use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use fm_core::config::RunnerConfig;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::error::{AgentError, Result};
use crate::runner::{AgentRunner, AgentTask};

/// Runs an external command per task.
///
/// The process receives `{"agent": .., "task": ..}` as JSON on stdin and must
/// print its result as a JSON object on stdout; the last object line wins, so
/// progress output before it is ignored. A non-zero exit is a failed attempt.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(cfg: &RunnerConfig) -> Self {
        Self::new(cfg.command.clone(), cfg.args.clone(), cfg.timeout())
    }
}

fn last_json_object(stdout: &str) -> Option<serde_json::Value> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter(serde_json::Value::is_object)
}

fn tail(text: &str, max: usize) -> &str {
    let start = text.len().saturating_sub(max);
    let start = (start..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(text.len());
    text[start..].trim()
}

#[async_trait]
impl AgentRunner for ProcessRunner {
    async fn execute(&self, agent: &Agent, task: &AgentTask) -> Result<serde_json::Value> {
        let input = serde_json::to_vec(&serde_json::json!({ "agent": agent, "task": task }))?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env("FOREMAN_AGENT_ID", agent.id.to_string())
            .env("FOREMAN_AGENT_TYPE", agent.agent_type.as_str())
            .env("FOREMAN_TENANT_ID", &agent.tenant_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        debug!(agent_id = %agent.id, command = %self.command, action = %task.action, "runner process spawned");

        if let Some(mut stdin) = child.stdin.take() {
            let written = match stdin.write_all(&input).await {
                Ok(()) => stdin.shutdown().await,
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => {}
                // The process may exit without reading its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(agent_id = %agent.id, "runner closed stdin early");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(agent_id = %agent.id, action = %task.action, "runner process timed out");
                return Err(AgentError::Timeout(self.timeout.as_secs()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Execution(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                tail(&stderr, 512)
            )));
        }

        last_json_object(&stdout).ok_or_else(|| {
            AgentError::Execution(format!(
                "{} printed no JSON object on stdout",
                self.command
            ))
        })
    }
}

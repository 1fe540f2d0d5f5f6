//! Runs dispatched prompts through the agent CLI, one at a time.

use crate::coordinator::TaskCoordinator;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const HOOK_PORT_ENV: &str = "TETHER_HOOK_PORT";

#[derive(Debug, Clone)]
pub struct AgentBackend {
	command: String,
	directory: PathBuf,
	hook_port: u16,
}

impl AgentBackend {
	pub fn new(command: impl Into<String>, directory: impl Into<PathBuf>, hook_port: u16) -> Self {
		Self {
			command: command.into(),
			directory: directory.into(),
			hook_port,
		}
	}

	/// `<agent_command> -p <prompt>` in the session directory.
	fn command(&self, prompt: &str) -> Result<Command> {
		let mut parts = self.command.split_whitespace();
		let Some(program) = parts.next() else {
			bail!("agent_command is empty");
		};
		let mut cmd = Command::new(program);
		cmd.args(parts)
			.arg("-p")
			.arg(prompt)
			.current_dir(&self.directory)
			.env(HOOK_PORT_ENV, self.hook_port.to_string())
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.kill_on_drop(true);
		Ok(cmd)
	}

	pub async fn run_prompt(&self, prompt: &str) -> Result<ExitStatus> {
		let mut child = self
			.command(prompt)?
			.spawn()
			.with_context(|| format!("Failed to start agent command {:?}", self.command))?;
		child.wait().await.context("Failed to wait for agent process")
	}
}

/// Feed prompts to the backend until the channel closes. Each finished prompt
/// reports idle to the coordinator, which may dispatch the next one.
pub async fn run_loop(
	backend: AgentBackend,
	mut prompts: mpsc::UnboundedReceiver<String>,
	coordinator: Arc<TaskCoordinator>,
) {
	while let Some(prompt) = prompts.recv().await {
		match backend.run_prompt(&prompt).await {
			Ok(status) if status.success() => info!("agent finished prompt"),
			Ok(status) => {
				warn!(%status, "agent failed");
				coordinator.mark_current_failed(Some(format!("agent exited with {status}")));
			}
			Err(e) => {
				warn!(error = %e, "agent could not run");
				coordinator.mark_current_failed(Some(format!("{e:#}")));
			}
		}
		coordinator.on_idle();
	}
}

//! Spawning session processes on behalf of the server.
//!
//! The daemon re-executes its own binary in remote mode, detached into its
//! own process group, and waits for the child to print the ready marker on
//! stdout. Every failure is returned to the caller; nothing is retried.

use crate::model::{StartedBy, TrackedSession};
use crate::registry::ProcessRegistry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Printed by `tether session` once it has a session id.
pub const READY_MARKER: &str = "tether-session-ready:";

#[derive(Debug, Error)]
pub enum SpawnError {
	#[error("directory does not exist: {0}")]
	DirectoryMissing(PathBuf),
	#[error("failed to spawn session process: {0}")]
	Spawn(#[source] std::io::Error),
	#[error("session process has no stdout")]
	NoStdout,
	#[error("session process exited before becoming ready (code {0:?})")]
	ExitedEarly(Option<i32>),
	#[error("session did not become ready within {0:?}")]
	Timeout(Duration),
	#[error("daemon is shutting down")]
	ShuttingDown,
}

/// Parameters of a spawn request, from the RPC or the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
	pub directory: PathBuf,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedSession {
	pub pid: u32,
	pub session_id: String,
}

/// Result payload sent back to whoever asked for the spawn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SpawnOutcome {
	#[serde(rename_all = "camelCase")]
	Success { session_id: String },
	#[serde(rename_all = "camelCase")]
	Error { error_message: String },
}

impl From<Result<SpawnedSession, SpawnError>> for SpawnOutcome {
	fn from(result: Result<SpawnedSession, SpawnError>) -> Self {
		match result {
			Ok(spawned) => SpawnOutcome::Success {
				session_id: spawned.session_id,
			},
			Err(e) => SpawnOutcome::Error {
				error_message: e.to_string(),
			},
		}
	}
}

/// Builds and runs the session subprocess invocation.
#[derive(Debug, Clone)]
pub struct SessionLauncher {
	program: PathBuf,
	args: Vec<String>,
	timeout: Duration,
}

impl SessionLauncher {
	pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
		Self {
			program: program.into(),
			args,
			timeout,
		}
	}

	/// `<this executable> session --remote --started-by daemon`
	pub fn current_exe(timeout: Duration) -> std::io::Result<Self> {
		let program = std::env::current_exe()?;
		let args = ["session", "--remote", "--started-by", StartedBy::Daemon.as_str()]
			.iter()
			.map(|s| s.to_string())
			.collect();
		Ok(Self::new(program, args, timeout))
	}

	fn command(&self, request: &SpawnRequest) -> Command {
		let mut cmd = Command::new(&self.program);
		cmd.args(&self.args);
		if let Some(resume) = &request.session_id {
			cmd.arg("--resume-session").arg(resume);
		}
		cmd.current_dir(&request.directory)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.process_group(0)
			.kill_on_drop(false);
		cmd
	}

	/// Spawn a session in `request.directory` and wait for its ready marker.
	///
	/// On timeout the process is killed and untracked. After the marker the
	/// process stays supervised, but its stdout is only drained.
	pub async fn spawn(
		&self,
		registry: &ProcessRegistry,
		request: &SpawnRequest,
	) -> Result<SpawnedSession, SpawnError> {
		if registry.is_closing() {
			return Err(SpawnError::ShuttingDown);
		}
		if !request.directory.is_dir() {
			return Err(SpawnError::DirectoryMissing(request.directory.clone()));
		}

		let mut child = self.command(request).spawn().map_err(SpawnError::Spawn)?;
		let stdout = child.stdout.take();
		let Some(pid) = child.id() else {
			return Err(SpawnError::ExitedEarly(None));
		};
		let session = TrackedSession::new(pid, &request.directory, StartedBy::Daemon);
		let Some((pid, mut exited)) = registry.supervise(child, session) else {
			return Err(SpawnError::ShuttingDown);
		};
		info!(pid, directory = %request.directory.display(), "spawned session process");

		let Some(stdout) = stdout else {
			registry.kill(pid);
			return Err(SpawnError::NoStdout);
		};
		let mut lines = BufReader::new(stdout).lines();
		let mut stdout_open = true;
		let deadline = tokio::time::sleep(self.timeout);
		tokio::pin!(deadline);

		loop {
			tokio::select! {
				line = lines.next_line(), if stdout_open => match line {
					Ok(Some(line)) => {
						if let Some(session_id) = parse_ready_marker(&line) {
							registry.set_session_id(pid, session_id);
							info!(pid, session_id, "session is ready");
							let session_id = session_id.to_string();
							// Keep the pipe drained so the child never blocks on a full stdout.
							tokio::spawn(async move {
								while let Ok(Some(_)) = lines.next_line().await {}
							});
							return Ok(SpawnedSession { pid, session_id });
						}
						debug!(pid, line = %line, "session output before ready");
					}
					Ok(None) => stdout_open = false,
					Err(e) => {
						debug!(pid, error = %e, "session stdout closed");
						stdout_open = false;
					}
				},
				code = &mut exited => {
					let code = code.ok().flatten();
					warn!(pid, ?code, "session exited before becoming ready");
					return Err(SpawnError::ExitedEarly(code));
				}
				_ = &mut deadline => {
					warn!(pid, timeout = ?self.timeout, "session never became ready, killing it");
					registry.kill(pid);
					return Err(SpawnError::Timeout(self.timeout));
				}
			}
		}
	}
}

/// `tether-session-ready: <id>` → `<id>`
pub fn parse_ready_marker(line: &str) -> Option<&str> {
	line.trim()
		.strip_prefix(READY_MARKER)
		.map(str::trim)
		.filter(|id| !id.is_empty() && !id.contains(char::is_whitespace))
}

pub fn ready_line(session_id: &str) -> String {
	format!("{READY_MARKER} {session_id}")
}

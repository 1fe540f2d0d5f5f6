use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const CLI_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Who launched a tracked session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartedBy {
	Daemon,
	Terminal,
}

impl StartedBy {
	pub fn as_str(self) -> &'static str {
		match self {
			StartedBy::Daemon => "daemon",
			StartedBy::Terminal => "terminal",
		}
	}
}

impl std::str::FromStr for StartedBy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"daemon" => Ok(StartedBy::Daemon),
			"terminal" => Ok(StartedBy::Terminal),
			other => Err(format!("unknown starter {other:?} (expected daemon or terminal)")),
		}
	}
}

/// Describes this install to the server. Built once at daemon start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineIdentity {
	pub machine_id: String,
	pub host: String,
	pub platform: String,
	pub cli_version: String,
	pub home_dir: PathBuf,
}

impl MachineIdentity {
	pub fn current(machine_id: impl Into<String>) -> Self {
		let host = nix::unistd::gethostname()
			.map(|h| h.to_string_lossy().into_owned())
			.unwrap_or_else(|_| "unknown".to_string());
		Self {
			machine_id: machine_id.into(),
			host,
			platform: std::env::consts::OS.to_string(),
			cli_version: CLI_VERSION.to_string(),
			home_dir: dirs::home_dir().unwrap_or_default(),
		}
	}
}

/// A child process the daemon is responsible for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrackedSession {
	pub pid: u32,
	pub session_id: Option<String>, // filled in once the process reports in
	pub directory: PathBuf,
	pub started_at: DateTime<Utc>,
	pub started_by: StartedBy,
}

impl TrackedSession {
	pub fn new(pid: u32, directory: impl Into<PathBuf>, started_by: StartedBy) -> Self {
		Self {
			pid,
			session_id: None,
			directory: directory.into(),
			started_at: Utc::now(),
			started_by,
		}
	}
}

/// Record written at daemon startup so CLI invocations can find it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonState {
	pub pid: u32,
	pub http_port: u16,
	pub start_time: DateTime<Utc>,
	pub started_with_cli_version: String,
}

impl DaemonState {
	pub fn for_current_process(http_port: u16) -> Self {
		Self {
			pid: std::process::id(),
			http_port,
			start_time: Utc::now(),
			started_with_cli_version: CLI_VERSION.to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_daemon_state_wire_names() {
		let state = DaemonState::for_current_process(4242);
		let json = serde_json::to_value(&state).unwrap();

		assert_eq!(json["httpPort"], 4242);
		assert_eq!(json["startedWithCliVersion"], CLI_VERSION);
		assert!(json["startTime"].as_str().unwrap().contains('T'));
	}

	#[test]
	fn test_started_by_parse() {
		assert_eq!("daemon".parse::<StartedBy>().unwrap(), StartedBy::Daemon);
		assert_eq!("terminal".parse::<StartedBy>().unwrap(), StartedBy::Terminal);
		assert!("cron".parse::<StartedBy>().is_err());
	}
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the base directory. Lets several daemons (or tests) run side by side.
pub const HOME_DIR_ENV: &str = "TETHER_HOME_DIR";

const DEFAULT_CONFIG: &str = r#"
[server]
url = "ws://127.0.0.1:3005/v1/updates"

[daemon]
heartbeat_interval_ms = 20000
reconnect_initial_ms = 1000
reconnect_max_ms = 5000
spawn_timeout_ms = 10000
kill_grace_ms = 1000
health_check_interval_ms = 60000
http_port = 0

[session]
agent_command = "claude"
prompt_prefix = ""
auto_advance = true
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
	pub server: Server,
	#[serde(default)]
	pub daemon: Daemon,
	#[serde(default)]
	pub session: Session,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
	pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Daemon {
	#[serde(default = "default_heartbeat_interval_ms")]
	pub heartbeat_interval_ms: u64,
	#[serde(default = "default_reconnect_initial_ms")]
	pub reconnect_initial_ms: u64,
	#[serde(default = "default_reconnect_max_ms")]
	pub reconnect_max_ms: u64,
	#[serde(default = "default_spawn_timeout_ms")]
	pub spawn_timeout_ms: u64,
	#[serde(default = "default_kill_grace_ms")]
	pub kill_grace_ms: u64,
	#[serde(default = "default_health_check_interval_ms")]
	pub health_check_interval_ms: u64,
	#[serde(default)]
	pub http_port: u16, // 0 = pick a free port
}

impl Default for Daemon {
	fn default() -> Self {
		Self {
			heartbeat_interval_ms: default_heartbeat_interval_ms(),
			reconnect_initial_ms: default_reconnect_initial_ms(),
			reconnect_max_ms: default_reconnect_max_ms(),
			spawn_timeout_ms: default_spawn_timeout_ms(),
			kill_grace_ms: default_kill_grace_ms(),
			health_check_interval_ms: default_health_check_interval_ms(),
			http_port: 0,
		}
	}
}

impl Daemon {
	pub fn heartbeat_interval(&self) -> Duration {
		Duration::from_millis(self.heartbeat_interval_ms)
	}

	pub fn reconnect_initial(&self) -> Duration {
		Duration::from_millis(self.reconnect_initial_ms)
	}

	pub fn reconnect_max(&self) -> Duration {
		Duration::from_millis(self.reconnect_max_ms)
	}

	pub fn spawn_timeout(&self) -> Duration {
		Duration::from_millis(self.spawn_timeout_ms)
	}

	pub fn kill_grace(&self) -> Duration {
		Duration::from_millis(self.kill_grace_ms)
	}

	pub fn health_check_interval(&self) -> Duration {
		Duration::from_millis(self.health_check_interval_ms)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
	#[serde(default = "default_agent_command")]
	pub agent_command: String,
	#[serde(default)]
	pub prompt_prefix: String,
	#[serde(default = "default_auto_advance")]
	pub auto_advance: bool,
}

impl Default for Session {
	fn default() -> Self {
		Self {
			agent_command: default_agent_command(),
			prompt_prefix: String::new(),
			auto_advance: default_auto_advance(),
		}
	}
}

fn default_heartbeat_interval_ms() -> u64 {
	20_000
}

fn default_reconnect_initial_ms() -> u64 {
	1_000
}

fn default_reconnect_max_ms() -> u64 {
	5_000
}

fn default_spawn_timeout_ms() -> u64 {
	10_000
}

fn default_kill_grace_ms() -> u64 {
	1_000
}

fn default_health_check_interval_ms() -> u64 {
	60_000
}

fn default_agent_command() -> String {
	"claude".to_string()
}

fn default_auto_advance() -> bool {
	true
}

/// Server-issued credentials for this machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
	pub token: String,
	pub machine_id: String,
}

pub fn load_or_init() -> Result<Config> {
	let base_dir = base_dir()?;
	load_or_init_in(&base_dir)
}

pub fn load_or_init_in(base_dir: &Path) -> Result<Config> {
	if !base_dir.exists() {
		fs::create_dir_all(base_dir)?;
	}

	let logs_dir = base_dir.join("logs");
	if !logs_dir.exists() {
		fs::create_dir_all(&logs_dir)?;
	}

	let config_path = base_dir.join("config.toml");
	if !config_path.exists() {
		fs::write(&config_path, DEFAULT_CONFIG.trim_start())?;
	}
	let content = fs::read_to_string(&config_path)
		.with_context(|| format!("failed to read {}", config_path.display()))?;
	let cfg: Config = toml::from_str(&content)
		.with_context(|| format!("failed to parse {}", config_path.display()))?;
	Ok(cfg)
}

pub fn load_credentials() -> Result<Credentials> {
	load_credentials_from(&credentials_path()?)
}

pub fn load_credentials_from(path: &Path) -> Result<Credentials> {
	let content = fs::read_to_string(path).with_context(|| {
		format!(
			"not authenticated: write {{\"token\": ..., \"machineId\": ...}} to {}",
			path.display()
		)
	})?;
	serde_json::from_str(&content)
		.with_context(|| format!("failed to parse credentials in {}", path.display()))
}

pub fn expand_path(input: &str) -> String {
	if input.starts_with("~/") {
		if let Some(home) = dirs::home_dir() {
			return home
				.join(input.trim_start_matches("~/"))
				.to_string_lossy()
				.into_owned();
		}
	}
	input.to_string()
}

pub fn base_dir() -> Result<PathBuf> {
	if let Ok(dir) = std::env::var(HOME_DIR_ENV) {
		if !dir.is_empty() {
			return Ok(PathBuf::from(expand_path(&dir)));
		}
	}
	dirs::home_dir()
		.map(|p| p.join(".tether"))
		.ok_or_else(|| anyhow::anyhow!("Failed to resolve home directory"))
}

pub fn credentials_path() -> Result<PathBuf> {
	Ok(base_dir()?.join("credentials.json"))
}

pub fn daemon_state_path() -> Result<PathBuf> {
	Ok(base_dir()?.join("daemon.state.json"))
}

pub fn logs_dir() -> Result<PathBuf> {
	let dir = base_dir()?.join("logs");
	fs::create_dir_all(&dir)?;
	Ok(dir)
}

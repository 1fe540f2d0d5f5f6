mod cipher;
mod config;
mod control;
mod coordinator;
mod daemon;
mod daemon_state;
mod http;
mod model;
mod permission;
mod registry;
mod session;
mod spawn;
mod transport;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use http::{ClientError, DaemonClient};
use model::{StartedBy, CLI_VERSION};
use spawn::SpawnRequest;
use std::fs::{self, File};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const START_WAIT: Duration = Duration::from_secs(10);
const STOP_WAIT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "tether")]
#[command(version, about = "Keeps AI coding agent sessions alive and reachable from anywhere")]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Manage the background daemon
	Daemon {
		#[command(subcommand)]
		command: DaemonCommands,
	},
	/// Run an agent session in this terminal (or for the daemon with --remote)
	Session {
		/// Non-interactive startup, used when the daemon spawns the session
		#[arg(long, default_value_t = false)]
		remote: bool,
		/// Who launched this session
		#[arg(long, default_value = "terminal")]
		started_by: StartedBy,
		/// Working directory for the agent (defaults to the current directory)
		#[arg(long)]
		directory: Option<PathBuf>,
		/// Reuse an existing session id
		#[arg(long)]
		resume_session: Option<String>,
	},
}

#[derive(Subcommand)]
enum DaemonCommands {
	/// Start the daemon in the background
	Start,
	/// Run the daemon in the foreground
	StartSync,
	/// Stop the running daemon and every session it supervises
	Stop,
	/// Print the daemon's state record as JSON
	Status,
	/// List supervised sessions
	List,
	/// Stop one session by id
	StopSession { session_id: String },
	/// Ask the daemon to spawn a session in a directory
	Spawn {
		directory: PathBuf,
		/// Resume this session id instead of starting a new one
		#[arg(long)]
		session_id: Option<String>,
	},
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	let cfg = config::load_or_init().context("failed to load config")?;

	match cli.command {
		Commands::Daemon { command } => handle_daemon_command(cfg, command).await,
		Commands::Session {
			remote,
			started_by,
			directory,
			resume_session,
		} => {
			init_stderr_logging();
			session::run(
				cfg,
				session::SessionArgs {
					remote,
					started_by,
					directory,
					resume_session,
				},
			)
			.await
		}
	}
}

fn env_filter() -> EnvFilter {
	EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_stderr_logging() {
	tracing_subscriber::fmt()
		.with_env_filter(env_filter())
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

fn init_file_logging() -> Result<()> {
	let dir = config::logs_dir()?;
	fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;
	let name = format!("{}-daemon.log", chrono::Local::now().format("%Y-%m-%d-%H-%M-%S"));
	let path = dir.join(name);
	let file = File::create(&path).with_context(|| format!("Failed to create log file {:?}", path))?;
	tracing_subscriber::fmt()
		.with_env_filter(env_filter())
		.with_target(false)
		.with_ansi(false)
		.with_writer(Mutex::new(file))
		.init();
	Ok(())
}

async fn handle_daemon_command(cfg: config::Config, command: DaemonCommands) -> Result<()> {
	if let DaemonCommands::StartSync = command {
		init_file_logging()?;
		return daemon::run(cfg).await;
	}
	init_stderr_logging();
	let state_path = config::daemon_state_path()?;
	match command {
		DaemonCommands::Start => start_daemon(&state_path).await,
		DaemonCommands::StartSync => Ok(()),
		DaemonCommands::Stop => {
			let Some(client) = connect(&state_path)? else {
				return Ok(());
			};
			stop_daemon(&client, &state_path).await?;
			println!("Daemon stopped");
			Ok(())
		}
		DaemonCommands::Status => {
			match daemon_state::running_daemon(&state_path)? {
				Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
				None => println!("no daemon running"),
			}
			Ok(())
		}
		DaemonCommands::List => {
			let Some(client) = connect(&state_path)? else {
				return Ok(());
			};
			let children = or_no_daemon(client.list().await)?.unwrap_or_default();
			println!("{}", serde_json::to_string_pretty(&children)?);
			Ok(())
		}
		DaemonCommands::StopSession { session_id } => {
			let Some(client) = connect(&state_path)? else {
				return Ok(());
			};
			match or_no_daemon(client.stop_session(&session_id).await)? {
				Some(true) => println!("Stopped session {session_id}"),
				Some(false) => println!("No session {session_id}"),
				None => {}
			}
			Ok(())
		}
		DaemonCommands::Spawn { directory, session_id } => {
			let Some(client) = connect(&state_path)? else {
				return Ok(());
			};
			let directory = directory
				.canonicalize()
				.with_context(|| format!("Directory {:?} does not exist", directory))?;
			let request = SpawnRequest { directory, session_id };
			if let Some(response) = or_no_daemon(client.spawn_session(&request).await)? {
				println!("{}", serde_json::to_string_pretty(&response)?);
			}
			Ok(())
		}
	}
}

/// `None` (after telling the user) when nothing is listening.
fn connect(state_path: &Path) -> Result<Option<DaemonClient>> {
	match DaemonClient::discover(state_path) {
		Ok(client) => Ok(Some(client)),
		Err(ClientError::NoDaemonRunning) => {
			println!("no daemon running");
			Ok(None)
		}
		Err(e) => Err(e.into()),
	}
}

fn or_no_daemon<T>(result: Result<T, ClientError>) -> Result<Option<T>> {
	match result {
		Ok(value) => Ok(Some(value)),
		Err(ClientError::NoDaemonRunning) => {
			println!("no daemon running");
			Ok(None)
		}
		Err(e) => Err(e.into()),
	}
}

/// True when a daemon started by `running` should make way for `current`.
fn needs_restart(running: &str, current: &str) -> bool {
	match (semver::Version::parse(running), semver::Version::parse(current)) {
		(Ok(running), Ok(current)) => running < current,
		_ => running != current,
	}
}

async fn start_daemon(state_path: &Path) -> Result<()> {
	if let Some(state) = daemon_state::running_daemon(state_path)? {
		if !needs_restart(&state.started_with_cli_version, CLI_VERSION) {
			println!("Daemon already running (pid {}, port {})", state.pid, state.http_port);
			return Ok(());
		}
		println!(
			"Restarting daemon started by v{} (now v{})",
			state.started_with_cli_version, CLI_VERSION
		);
		let client = DaemonClient::for_state(state);
		stop_daemon(&client, state_path).await?;
	}

	let exe = std::env::current_exe().context("Failed to locate the tether executable")?;
	std::process::Command::new(exe)
		.args(["daemon", "start-sync"])
		.stdin(Stdio::null())
		.stdout(Stdio::null())
		.stderr(Stdio::null())
		.process_group(0)
		.spawn()
		.context("Failed to launch daemon")?;

	let deadline = tokio::time::Instant::now() + START_WAIT;
	while tokio::time::Instant::now() < deadline {
		if let Some(state) = daemon_state::running_daemon(state_path)? {
			println!("Daemon started (pid {}, port {})", state.pid, state.http_port);
			return Ok(());
		}
		tokio::time::sleep(POLL).await;
	}
	bail!("Daemon did not start; check the logs in {:?}", config::logs_dir()?)
}

async fn stop_daemon(client: &DaemonClient, state_path: &Path) -> Result<()> {
	let pid = client.state().pid;
	match client.stop().await {
		Ok(()) | Err(ClientError::NoDaemonRunning) => {}
		Err(e) => return Err(e.into()),
	}
	let deadline = tokio::time::Instant::now() + STOP_WAIT;
	while daemon_state::is_process_alive(pid) {
		if tokio::time::Instant::now() >= deadline {
			bail!("Daemon (pid {pid}) is still running after {:?}", STOP_WAIT);
		}
		tokio::time::sleep(POLL).await;
	}
	daemon_state::remove_if_owned(state_path, pid);
	Ok(())
}

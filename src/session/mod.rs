//! `tether session`: one agent session connected to the server.

pub mod backend;
pub mod client;
pub mod hooks;

use crate::cipher::EncodingCipher;
use crate::config::{self, Config};
use crate::coordinator::{CoordinatorOptions, NewTask, TaskCoordinator};
use crate::http::{self, ClientError, DaemonClient, SessionMetadata};
use crate::model::StartedBy;
use crate::permission::{PermissionNegotiator, SessionChannel, SessionEvent};
use crate::spawn::ready_line;
use crate::transport::{self, LinkConfig};
use anyhow::{Context, Result};
use backend::AgentBackend;
use client::{SessionLink, TASKS_METHOD};
use hooks::HookState;
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SessionArgs {
	pub remote: bool,
	pub started_by: StartedBy,
	pub directory: Option<PathBuf>,
	pub resume_session: Option<String>,
}

/// Body of a `<sessionId>:tasks` RPC.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TaskCommand {
	Add {
		prompt: String,
		#[serde(default)]
		label: Option<String>,
	},
	AddMany {
		tasks: Vec<NewTask>,
	},
	Remove {
		id: String,
	},
	Clear,
	Enable,
	Disable,
	SetAutoAdvance {
		enabled: bool,
	},
	Next,
}

/// Apply a remote task command. Newly queued work starts right away if the
/// backend is free.
pub fn apply_task_command(coordinator: &TaskCoordinator, command: TaskCommand) {
	match command {
		TaskCommand::Add { prompt, label } => {
			coordinator.add_task(prompt, label);
			coordinator.advance();
		}
		TaskCommand::AddMany { tasks } => {
			coordinator.add_tasks(tasks);
			coordinator.advance();
		}
		TaskCommand::Remove { id } => {
			if !coordinator.remove_task(&id) {
				warn!(id = %id, "task not removed (running or unknown)");
			}
		}
		TaskCommand::Clear => {
			coordinator.clear_pending();
		}
		TaskCommand::Enable => {
			coordinator.enable();
			coordinator.advance();
		}
		TaskCommand::Disable => coordinator.disable(),
		TaskCommand::SetAutoAdvance { enabled } => {
			coordinator.set_auto_advance(enabled);
			if enabled {
				coordinator.advance();
			}
		}
		TaskCommand::Next => {
			coordinator.dispatch_next();
		}
	}
}

pub async fn run(config: Config, args: SessionArgs) -> Result<()> {
	let credentials = config::load_credentials()?;
	let directory = match args.directory {
		Some(dir) => dir,
		None => std::env::current_dir().context("Failed to read current directory")?,
	};
	let directory = directory
		.canonicalize()
		.with_context(|| format!("Session directory {:?} does not exist", directory))?;
	let session_id = args
		.resume_session
		.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
	info!(session_id = %session_id, directory = %directory.display(), remote = args.remote, "starting session");

	let link = SessionLink::connect(
		LinkConfig {
			url: config.server.url.clone(),
			reconnect_initial: config.daemon.reconnect_initial(),
			reconnect_max: config.daemon.reconnect_max(),
		},
		session_id.clone(),
		credentials.token,
		Arc::new(EncodingCipher),
	);
	tokio::spawn(transport::log_state_changes("session", link.state()));
	let negotiator = PermissionNegotiator::new(link.clone());

	let (prompt_tx, prompt_rx) = mpsc::unbounded_channel::<String>();
	let tasks_link = link.clone();
	let coordinator = Arc::new(TaskCoordinator::new(
		CoordinatorOptions {
			enabled: true,
			auto_advance: config.session.auto_advance,
			prompt_prefix: config.session.prompt_prefix.clone(),
		},
		Box::new(move |_, prompt| {
			if prompt_tx.send(prompt).is_err() {
				warn!("agent backend is gone, prompt dropped");
			}
		}),
		Box::new(move |snapshot| tasks_link.publish_tasks(snapshot)),
	));

	let hook_listener = http::bind(0).await?;
	let hook_port = hook_listener.local_addr().context("Hook server has no local address")?.port();
	let (stop_hooks, stop_hooks_rx) = watch::channel(false);
	let hook_server = tokio::spawn(hooks::serve(
		hook_listener,
		Arc::new(HookState {
			negotiator: negotiator.clone(),
			coordinator: coordinator.clone(),
		}),
		stop_hooks_rx,
	));

	let backend = AgentBackend::new(config.session.agent_command.clone(), &directory, hook_port);
	let backend_task = tokio::spawn(backend::run_loop(backend, prompt_rx, coordinator.clone()));

	// The daemon waits for this line on our stdout.
	println!("{}", ready_line(&session_id));
	std::io::stdout().flush().context("Failed to flush stdout")?;

	report_to_daemon(&session_id, &directory, args.started_by).await;

	if !args.remote {
		tokio::spawn(read_prompts_from_stdin(coordinator.clone()));
	}

	let mut events = link.subscribe();
	let tasks_method = format!("{session_id}:{TASKS_METHOD}");
	let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
	let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

	loop {
		tokio::select! {
			event = events.recv() => match event {
				Ok(SessionEvent::Rpc { method, params }) if method == tasks_method => {
					match serde_json::from_value::<TaskCommand>(params) {
						Ok(command) => apply_task_command(&coordinator, command),
						Err(e) => warn!(error = %e, "malformed task command"),
					}
				}
				Ok(_) => {}
				Err(RecvError::Lagged(skipped)) => warn!(skipped, "session events dropped"),
				Err(RecvError::Closed) => break,
			},
			_ = sigterm.recv() => break,
			_ = sigint.recv() => break,
		}
	}

	info!(session_id = %session_id, "session ending");
	negotiator.reset();
	backend_task.abort();
	let _ = stop_hooks.send(true);
	if let Ok(Err(e)) = hook_server.await {
		warn!(error = %e, "hook server error");
	}
	link.close().await;
	Ok(())
}

/// Tell a running daemon about this session. Best effort.
async fn report_to_daemon(session_id: &str, directory: &std::path::Path, started_by: StartedBy) {
	let client = match config::daemon_state_path().map(|path| DaemonClient::discover(&path)) {
		Ok(Ok(client)) => client,
		Ok(Err(ClientError::NoDaemonRunning)) => {
			debug!("no daemon running, session is unsupervised");
			return;
		}
		Ok(Err(e)) => {
			warn!(error = %e, "could not reach daemon");
			return;
		}
		Err(e) => {
			warn!(error = %e, "could not locate daemon state");
			return;
		}
	};
	let metadata = SessionMetadata {
		pid: std::process::id(),
		directory: directory.to_path_buf(),
		started_by,
	};
	if let Err(e) = client.session_started(session_id, metadata).await {
		warn!(error = %e, "failed to report session to daemon");
	}
}

/// Terminal mode: each stdin line becomes a queued task.
async fn read_prompts_from_stdin(coordinator: Arc<TaskCoordinator>) {
	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	while let Ok(Some(line)) = lines.next_line().await {
		let prompt = line.trim();
		if prompt.is_empty() {
			continue;
		}
		coordinator.add_task(prompt, None);
		coordinator.advance();
	}
}

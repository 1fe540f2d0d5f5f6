//! Foreground daemon: wires the registry, control plane and loopback server
//! together and runs until asked to stop.

use crate::cipher::EncodingCipher;
use crate::config::{self, Config, Credentials};
use crate::control::{ControlEvent, ControlPlane, ControlPlaneConfig};
use crate::daemon_state;
use crate::http::{self, HttpState};
use crate::model::{DaemonState, MachineIdentity};
use crate::registry::ProcessRegistry;
use crate::spawn::SessionLauncher;
use crate::transport::{self, LinkConfig};
use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config: Config) -> Result<()> {
	let credentials = config::load_credentials()?;
	let launcher = SessionLauncher::current_exe(config.daemon.spawn_timeout())
		.context("Failed to locate the tether executable")?;
	let state_path = config::daemon_state_path()?;
	run_with(&config, credentials, launcher, &state_path).await
}

pub async fn run_with(
	config: &Config,
	credentials: Credentials,
	launcher: SessionLauncher,
	state_path: &Path,
) -> Result<()> {
	let pid = std::process::id();
	if let Some(existing) = daemon_state::running_daemon(state_path)? {
		if existing.pid != pid {
			bail!("A daemon is already running (pid {})", existing.pid);
		}
	}

	let registry = ProcessRegistry::new();
	let identity = MachineIdentity::current(credentials.machine_id.clone());
	let control = ControlPlane::new(
		ControlPlaneConfig {
			link: LinkConfig {
				url: config.server.url.clone(),
				reconnect_initial: config.daemon.reconnect_initial(),
				reconnect_max: config.daemon.reconnect_max(),
			},
			heartbeat_interval: config.daemon.heartbeat_interval(),
			kill_grace: config.daemon.kill_grace(),
		},
		credentials,
		identity,
		registry.clone(),
		launcher.clone(),
		Arc::new(EncodingCipher),
	);

	let listener = http::bind(config.daemon.http_port).await?;
	let port = listener.local_addr().context("Control server has no local address")?.port();
	daemon_state::write(state_path, &DaemonState::for_current_process(port))?;
	info!(pid, port, "daemon started");

	let (stop_server, server_stop_rx) = watch::channel(false);
	let server = tokio::spawn(http::serve(
		listener,
		Arc::new(HttpState {
			registry: registry.clone(),
			launcher,
			control: control.clone(),
		}),
		server_stop_rx,
	));

	let mut events = control.subscribe();
	tokio::spawn(transport::log_state_changes("control", control.state()));
	control.connect();

	let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
	let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
	let mut health = tokio::time::interval(config.daemon.health_check_interval().max(Duration::from_millis(10)));
	health.set_missed_tick_behavior(MissedTickBehavior::Delay);
	health.tick().await;

	let reason = loop {
		tokio::select! {
			event = events.recv() => match event {
				Ok(ControlEvent::ShutdownRequested) => break "shutdown requested",
				Ok(ControlEvent::Shutdown) => break "control plane shut down",
				Err(RecvError::Lagged(_)) => continue,
				Err(RecvError::Closed) => break "control plane gone",
			},
			_ = health.tick() => {
				let pruned = registry.prune_dead();
				if !pruned.is_empty() {
					info!(count = pruned.len(), "removed dead sessions");
				}
				if !owns_state_file(state_path, pid) {
					break "daemon state taken over";
				}
			}
			_ = sigterm.recv() => break "SIGTERM",
			_ = sigint.recv() => break "SIGINT",
		}
	};
	info!(reason, "daemon stopping");

	control.shutdown().await;
	let _ = stop_server.send(true);
	match tokio::time::timeout(SERVER_STOP_TIMEOUT, server).await {
		Ok(Ok(Ok(()))) => {}
		Ok(Ok(Err(e))) => error!(error = %e, "control server error"),
		Ok(Err(e)) => error!(error = %e, "control server task failed"),
		Err(_) => warn!("control server did not stop in time"),
	}
	daemon_state::remove_if_owned(state_path, pid);
	info!("daemon stopped");
	Ok(())
}

fn owns_state_file(path: &Path, pid: u32) -> bool {
	match daemon_state::read(path) {
		Ok(Some(state)) => state.pid == pid,
		Ok(None) => false,
		Err(e) => {
			warn!(error = %e, "could not read daemon state");
			true
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::DaemonClient;
	use tempfile::TempDir;

	fn test_config(dir: &TempDir) -> Config {
		let mut cfg = config::load_or_init_in(dir.path()).unwrap();
		cfg.server.url = "ws://127.0.0.1:9".into();
		cfg.daemon.reconnect_initial_ms = 50;
		cfg.daemon.reconnect_max_ms = 100;
		cfg.daemon.kill_grace_ms = 100;
		cfg
	}

	fn credentials() -> Credentials {
		Credentials {
			token: "tok".into(),
			machine_id: "m-daemon".into(),
		}
	}

	fn launcher() -> SessionLauncher {
		SessionLauncher::new("true", Vec::new(), Duration::from_secs(1))
	}

	async fn wait_for_file(path: &Path) {
		for _ in 0..250 {
			if path.exists() {
				return;
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		panic!("{} never appeared", path.display());
	}

	#[tokio::test]
	async fn test_daemon_publishes_state_and_stops_over_http() {
		let dir = TempDir::new().unwrap();
		let state_path = dir.path().join("daemon.state.json");
		let cfg = test_config(&dir);
		let path = state_path.clone();
		let daemon = tokio::spawn(async move { run_with(&cfg, credentials(), launcher(), &path).await });

		wait_for_file(&state_path).await;
		let client = DaemonClient::discover(&state_path).unwrap();
		assert_eq!(client.state().pid, std::process::id());
		assert!(client.list().await.unwrap().is_empty());

		client.stop().await.unwrap();
		tokio::time::timeout(Duration::from_secs(10), daemon)
			.await
			.unwrap()
			.unwrap()
			.unwrap();
		assert!(!state_path.exists());
	}

	#[tokio::test]
	async fn test_daemon_refuses_to_start_twice() {
		let dir = TempDir::new().unwrap();
		let state_path = dir.path().join("daemon.state.json");
		let mut other = std::process::Command::new("sleep").arg("30").spawn().unwrap();
		let mut state = DaemonState::for_current_process(1);
		state.pid = other.id();
		daemon_state::write(&state_path, &state).unwrap();

		let err = run_with(&test_config(&dir), credentials(), launcher(), &state_path)
			.await
			.unwrap_err();
		assert!(err.to_string().contains("already running"));
		assert!(state_path.exists());

		other.kill().unwrap();
		other.wait().unwrap();
	}

	#[tokio::test]
	async fn test_daemon_exits_when_state_file_is_taken_over() {
		let dir = TempDir::new().unwrap();
		let state_path = dir.path().join("daemon.state.json");
		let mut cfg = test_config(&dir);
		cfg.daemon.health_check_interval_ms = 50;
		let path = state_path.clone();
		let daemon = tokio::spawn(async move { run_with(&cfg, credentials(), launcher(), &path).await });

		wait_for_file(&state_path).await;
		let mut other = std::process::Command::new("sleep").arg("30").spawn().unwrap();
		let mut state = DaemonState::for_current_process(1);
		state.pid = other.id();
		daemon_state::write(&state_path, &state).unwrap();

		tokio::time::timeout(Duration::from_secs(10), daemon)
			.await
			.unwrap()
			.unwrap()
			.unwrap();
		assert_eq!(daemon_state::read(&state_path).unwrap().unwrap().pid, other.id());

		other.kill().unwrap();
		other.wait().unwrap();
	}
}

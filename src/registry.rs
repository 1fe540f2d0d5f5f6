//! Process registry: the authoritative set of child processes the daemon owns.
//!
//! Every removal is a single `HashMap::remove` under the lock. The exit path
//! (reaper task) and the kill path race on it, and whoever removes first owns
//! the entry; the loser sees `None` and does nothing.
//!
//! Once `kill_all` starts the registry is closed: new entries are refused so
//! nothing spawned during the grace window escapes the kill.

use crate::daemon_state::is_process_alive;
use crate::model::{StartedBy, TrackedSession};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const KILL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of [`ProcessRegistry::kill_all`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KillReport {
	/// Processes that received SIGTERM.
	pub terminated: usize,
	/// Processes that were still tracked after the grace window and got SIGKILL.
	pub forced: usize,
	/// Entries whose process was already gone.
	pub already_exited: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
	sessions: Arc<Mutex<HashMap<u32, TrackedSession>>>,
	closing: Arc<AtomicBool>,
}

impl ProcessRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	fn sessions(&self) -> MutexGuard<'_, HashMap<u32, TrackedSession>> {
		self.sessions.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// True once `kill_all` has started.
	pub fn is_closing(&self) -> bool {
		self.closing.load(Ordering::SeqCst)
	}

	/// Add an entry. The pid is the handle. `None` once the registry is closing.
	pub fn track(&self, session: TrackedSession) -> Option<u32> {
		let pid = session.pid;
		let mut sessions = self.sessions();
		// Checked under the lock that `kill_all` takes for its snapshot.
		if self.is_closing() {
			warn!(pid, "registry is closing, refusing to track");
			return None;
		}
		if sessions.insert(pid, session).is_some() {
			debug!(pid, "replaced existing registry entry");
		}
		Some(pid)
	}

	/// Track `child` and hand it to a reaper task that untracks it on exit.
	/// The receiver yields the exit code (None if killed by a signal).
	///
	/// A closing registry kills the child instead and returns `None`.
	pub fn supervise(
		&self,
		mut child: Child,
		session: TrackedSession,
	) -> Option<(u32, oneshot::Receiver<Option<i32>>)> {
		let Some(pid) = self.track(session) else {
			if let Err(e) = child.start_kill() {
				warn!(error = %e, "failed to kill refused child");
			}
			tokio::spawn(async move {
				let _ = child.wait().await;
			});
			return None;
		};
		let (tx, rx) = oneshot::channel();
		let registry = self.clone();
		tokio::spawn(async move {
			let code = match child.wait().await {
				Ok(status) => status.code(),
				Err(e) => {
					warn!(pid, error = %e, "failed to wait on child");
					None
				}
			};
			if registry.untrack(pid).is_some() {
				info!(pid, ?code, "session process exited");
			} else {
				debug!(pid, ?code, "process exited after being untracked");
			}
			let _ = tx.send(code);
		});
		Some((pid, rx))
	}

	/// Remove an entry without signalling the process.
	pub fn untrack(&self, pid: u32) -> Option<TrackedSession> {
		self.sessions().remove(&pid)
	}

	pub fn contains(&self, pid: u32) -> bool {
		self.sessions().contains_key(&pid)
	}

	pub fn len(&self) -> usize {
		self.sessions().len()
	}

	#[cfg(test)]
	pub fn is_empty(&self) -> bool {
		self.sessions().is_empty()
	}

	/// All entries, oldest first.
	pub fn list(&self) -> Vec<TrackedSession> {
		let mut out: Vec<TrackedSession> = self.sessions().values().cloned().collect();
		out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.pid.cmp(&b.pid)));
		out
	}

	pub fn find_by_session_id(&self, session_id: &str) -> Option<u32> {
		self.sessions()
			.values()
			.find(|s| s.session_id.as_deref() == Some(session_id))
			.map(|s| s.pid)
	}

	pub fn set_session_id(&self, pid: u32, session_id: &str) -> bool {
		match self.sessions().get_mut(&pid) {
			Some(entry) => {
				entry.session_id = Some(session_id.to_string());
				true
			}
			None => false,
		}
	}

	/// A session process reported in. Updates the entry the daemon spawned, or
	/// starts tracking a session the user launched from a terminal. Unknown
	/// sessions are not tracked once the registry is closing.
	pub fn session_started(
		&self,
		pid: u32,
		session_id: &str,
		directory: PathBuf,
		started_by: StartedBy,
	) -> Option<TrackedSession> {
		let mut sessions = self.sessions();
		if !sessions.contains_key(&pid) {
			if self.is_closing() {
				warn!(pid, session_id, "registry is closing, not tracking session");
				return None;
			}
			info!(pid, session_id, "tracking externally started session");
			sessions.insert(pid, TrackedSession::new(pid, directory, started_by));
		}
		let entry = sessions.get_mut(&pid)?;
		entry.session_id = Some(session_id.to_string());
		Some(entry.clone())
	}

	/// SIGTERM the process behind `session_id` and stop tracking it.
	pub fn stop_session(&self, session_id: &str) -> bool {
		let Some(pid) = self.find_by_session_id(session_id) else {
			return false;
		};
		if self.untrack(pid).is_none() {
			return false;
		}
		match send_signal(pid, Signal::SIGTERM) {
			Ok(_) => {
				info!(pid, session_id, "stopped session");
				true
			}
			Err(e) => {
				warn!(pid, session_id, error = %e, "failed to signal session");
				false
			}
		}
	}

	/// SIGKILL and untrack immediately.
	pub fn kill(&self, pid: u32) -> bool {
		if self.untrack(pid).is_none() {
			return false;
		}
		if let Err(e) = send_signal(pid, Signal::SIGKILL) {
			warn!(pid, error = %e, "failed to kill process");
		}
		true
	}

	/// Drop entries whose process no longer exists. Run once per health-check cycle.
	pub fn prune_dead(&self) -> Vec<TrackedSession> {
		let pids: Vec<u32> = self.sessions().keys().copied().collect();
		let mut pruned = Vec::new();
		for pid in pids {
			if is_process_alive(pid) {
				continue;
			}
			if let Some(session) = self.untrack(pid) {
				info!(pid, session_id = ?session.session_id, "pruned dead session");
				pruned.push(session);
			}
		}
		pruned
	}

	/// Close the registry, SIGTERM everything, wait up to `grace`, then SIGKILL
	/// whatever is still tracked. Entries removed by the exit path meanwhile
	/// are skipped.
	pub async fn kill_all(&self, grace: Duration) -> KillReport {
		let pids: Vec<u32> = {
			let sessions = self.sessions();
			self.closing.store(true, Ordering::SeqCst);
			sessions.keys().copied().collect()
		};
		let mut report = KillReport::default();
		let mut targets = Vec::with_capacity(pids.len());

		for pid in pids {
			match send_signal(pid, Signal::SIGTERM) {
				Ok(true) => {
					report.terminated += 1;
					targets.push(pid);
				}
				Ok(false) => {
					self.untrack(pid);
					report.already_exited += 1;
				}
				Err(e) => {
					warn!(pid, error = %e, "SIGTERM failed");
					targets.push(pid);
				}
			}
		}
		if targets.is_empty() {
			return report;
		}

		let deadline = Instant::now() + grace;
		while Instant::now() < deadline
			&& targets
				.iter()
				.any(|&pid| self.contains(pid) && is_process_alive(pid))
		{
			let remaining = deadline.saturating_duration_since(Instant::now());
			tokio::time::sleep(remaining.min(KILL_POLL_INTERVAL)).await;
		}

		for pid in targets {
			if self.untrack(pid).is_none() {
				continue;
			}
			match send_signal(pid, Signal::SIGKILL) {
				Ok(true) => {
					warn!(pid, "grace period elapsed, sent SIGKILL");
					report.forced += 1;
				}
				Ok(false) => {}
				Err(e) => warn!(pid, error = %e, "SIGKILL failed"),
			}
		}
		report
	}
}

/// Ok(false) means the process was already gone.
fn send_signal(pid: u32, sig: Signal) -> Result<bool, Errno> {
	let Ok(raw_pid) = i32::try_from(pid) else {
		return Ok(false);
	};
	if raw_pid <= 1 {
		return Ok(false);
	}
	match signal::kill(Pid::from_raw(raw_pid), sig) {
		Ok(()) => Ok(true),
		Err(Errno::ESRCH) => Ok(false),
		Err(e) => Err(e),
	}
}

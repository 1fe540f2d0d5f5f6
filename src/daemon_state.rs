//! Persisted daemon record.
//!
//! The daemon writes `daemon.state.json` once at startup. CLI invocations read
//! it to find the loopback port. A record whose pid is dead is stale and gets
//! deleted on sight.

use crate::model::DaemonState;
use anyhow::{Context, Result};
use nix::sys::signal;
use nix::unistd::Pid;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

pub fn write(path: &Path, state: &DaemonState) -> Result<()> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)?;
	}
	let json = serde_json::to_string_pretty(state).context("Failed to serialize daemon state")?;
	// Readers poll for this file; never let them see it half written.
	let tmp = path.with_extension("json.tmp");
	fs::write(&tmp, json).with_context(|| format!("Failed to write daemon state to {:?}", tmp))?;
	fs::rename(&tmp, path).with_context(|| format!("Failed to move daemon state into {:?}", path))
}

pub fn read(path: &Path) -> Result<Option<DaemonState>> {
	if !path.exists() {
		return Ok(None);
	}
	let json =
		fs::read_to_string(path).with_context(|| format!("Failed to read daemon state {:?}", path))?;
	let state = serde_json::from_str(&json).context("Failed to parse daemon state JSON")?;
	Ok(Some(state))
}

pub fn remove(path: &Path) {
	if let Err(e) = fs::remove_file(path) {
		debug!(error = %e, "failed to remove daemon state (may not exist)");
	}
}

/// Probe a pid with signal 0.
pub fn is_process_alive(pid: u32) -> bool {
	// A pid above i32::MAX would wrap negative and address a process group.
	let Ok(raw_pid) = i32::try_from(pid) else {
		return false;
	};
	if raw_pid <= 0 {
		return false;
	}
	signal::kill(Pid::from_raw(raw_pid), None).is_ok()
}

/// Returns the record if its daemon is alive. A stale or unreadable record is
/// deleted and reported as no daemon.
pub fn running_daemon(path: &Path) -> Result<Option<DaemonState>> {
	let state = match read(path) {
		Ok(Some(state)) => state,
		Ok(None) => return Ok(None),
		Err(e) => {
			warn!(error = %e, path = %path.display(), "removing unreadable daemon state");
			remove(path);
			return Ok(None);
		}
	};
	if is_process_alive(state.pid) {
		return Ok(Some(state));
	}
	warn!(pid = state.pid, "daemon state points at a dead process, removing it");
	remove(path);
	Ok(None)
}

/// Remove the record only if it still belongs to `pid`.
pub fn remove_if_owned(path: &Path, pid: u32) {
	match read(path) {
		Ok(Some(state)) if state.pid == pid => remove(path),
		Ok(_) => {}
		Err(e) => debug!(error = %e, "could not read daemon state during cleanup"),
	}
}

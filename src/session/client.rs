//! Session-scoped link to the server.
//!
//! Announces the session, registers its permission and task RPCs, forwards
//! inbound traffic as [`SessionEvent`]s and publishes state snapshots. The
//! newest state and task snapshots are replayed after every reconnect.

use crate::cipher::{open_or_plain, PayloadCipher};
use crate::coordinator::TaskQueueSnapshot;
use crate::permission::{AgentState, SessionChannel, SessionEvent, PERMISSION_METHOD};
use crate::transport::{run_link, Frame, LinkConfig, LinkHandler, LinkState, Outbound};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const TASKS_METHOD: &str = "tasks";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Replay {
	outbound: Option<Outbound>,
	state: Option<Frame>,
	tasks: Option<Frame>,
}

struct Inner {
	session_id: String,
	token: String,
	cipher: Arc<dyn PayloadCipher>,
	events: broadcast::Sender<SessionEvent>,
	replay: Mutex<Replay>,
}

pub struct SessionLink {
	inner: Arc<Inner>,
	state: watch::Receiver<LinkState>,
	close: watch::Sender<bool>,
	task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionLink {
	/// Start the link in the background.
	pub fn connect(
		config: LinkConfig,
		session_id: impl Into<String>,
		token: impl Into<String>,
		cipher: Arc<dyn PayloadCipher>,
	) -> Arc<Self> {
		let (events, _) = broadcast::channel(64);
		let inner = Arc::new(Inner {
			session_id: session_id.into(),
			token: token.into(),
			cipher,
			events,
			replay: Mutex::new(Replay::default()),
		});
		let (state_tx, state) = watch::channel(LinkState::Disconnected);
		let (close, close_rx) = watch::channel(false);
		let task = tokio::spawn(run_link(config, inner.clone(), state_tx, close_rx));
		Arc::new(Self {
			inner,
			state,
			close,
			task: Mutex::new(Some(task)),
		})
	}

	pub fn state(&self) -> watch::Receiver<LinkState> {
		self.state.clone()
	}

	pub fn publish_tasks(&self, snapshot: &TaskQueueSnapshot) {
		let tasks = match serde_json::to_value(snapshot) {
			Ok(tasks) => tasks,
			Err(e) => {
				warn!(error = %e, "failed to serialize task snapshot");
				return;
			}
		};
		let frame = Frame::new(
			"update-tasks",
			json!({ "sessionId": self.inner.session_id, "tasks": tasks }),
		);
		self.inner.publish(frame, |replay, frame| replay.tasks = Some(frame));
	}

	/// Send a Close frame and wait for the link task to finish.
	pub async fn close(&self) {
		self.close.send_replace(true);
		let task = lock(&self.task).take();
		if let Some(task) = task {
			let abort = task.abort_handle();
			if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
				abort.abort();
			}
		}
	}
}

impl Inner {
	fn method(&self, name: &str) -> String {
		format!("{}:{}", self.session_id, name)
	}

	/// Remember `frame` for replay and send it if connected. One lock covers
	/// both so a reconnect never replays an older snapshot than the last send.
	fn publish(&self, frame: Frame, remember: impl FnOnce(&mut Replay, Frame)) {
		let mut replay = lock(&self.replay);
		if let Some(outbound) = &replay.outbound {
			outbound.send(frame.clone());
		}
		remember(&mut replay, frame);
	}

	fn forward(&self, event: SessionEvent) {
		if self.events.send(event).is_err() {
			debug!("no session event subscribers");
		}
	}
}

impl SessionChannel for SessionLink {
	fn session_id(&self) -> &str {
		&self.inner.session_id
	}

	fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
		self.inner.events.subscribe()
	}

	fn publish_state(&self, state: &AgentState) {
		let sealed = serde_json::to_value(state)
			.map_err(anyhow::Error::from)
			.and_then(|v| self.inner.cipher.seal(&v));
		let sealed = match sealed {
			Ok(sealed) => sealed,
			Err(e) => {
				warn!(error = %e, "failed to seal agent state");
				return;
			}
		};
		let frame = Frame::new(
			"update-state",
			json!({ "sessionId": self.inner.session_id, "agentState": sealed }),
		);
		self.inner.publish(frame, |replay, frame| replay.state = Some(frame));
	}
}

impl LinkHandler for Inner {
	fn handshake(&self) -> Vec<Frame> {
		vec![
			Frame::new(
				"session-connect",
				json!({ "token": self.token, "sessionId": self.session_id }),
			),
			Frame::new("rpc-register", json!({ "method": self.method(PERMISSION_METHOD) })),
			Frame::new("rpc-register", json!({ "method": self.method(TASKS_METHOD) })),
		]
	}

	fn on_connected(&self, outbound: &Outbound) {
		let mut replay = lock(&self.replay);
		for frame in [replay.state.clone(), replay.tasks.clone()].into_iter().flatten() {
			outbound.send(frame);
		}
		replay.outbound = Some(outbound.clone());
	}

	fn on_frame(&self, frame: Frame, outbound: &Outbound) {
		match frame.event.as_str() {
			"rpc-request" => {
				let method = frame.data.get("method").and_then(Value::as_str).map(str::to_string);
				let Some(method) = method else {
					debug!("rpc-request without method");
					return;
				};
				let params = frame.data.get("params").cloned().unwrap_or(Value::Null);
				let params = match open_or_plain(self.cipher.as_ref(), params) {
					Ok(params) => params,
					Err(e) => {
						warn!(method = %method, error = %e, "could not open rpc params");
						if let Some(ack) = frame.ack {
							outbound.send(Frame::ack_reply(ack, json!({ "error": e.to_string() })));
						}
						return;
					}
				};
				if let Some(ack) = frame.ack {
					outbound.send(Frame::ack_reply(ack, json!({ "ok": true })));
				}
				self.forward(SessionEvent::Rpc { method, params });
			}
			"message" => match open_or_plain(self.cipher.as_ref(), frame.data) {
				Ok(message) => self.forward(SessionEvent::Message(message)),
				Err(e) => debug!(error = %e, "dropping unreadable message"),
			},
			other => debug!(event = other, "ignoring session event"),
		}
	}

	fn on_disconnected(&self) {
		lock(&self.replay).outbound = None;
	}
}

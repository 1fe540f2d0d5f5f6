//! Machine-scoped control plane.
//!
//! One [`ControlPlane`] per daemon. It keeps a link to the coordination
//! server, announces the machine, registers the spawn RPC on every
//! (re)connect, sends heartbeats while connected, and answers server
//! requests. Shutdown tears everything down exactly once.

use crate::cipher::{open_or_plain, PayloadCipher};
use crate::config::Credentials;
use crate::model::MachineIdentity;
use crate::registry::{KillReport, ProcessRegistry};
use crate::spawn::{SessionLauncher, SpawnOutcome, SpawnRequest};
use crate::transport::{run_link, Frame, LinkConfig, LinkHandler, LinkState, Outbound, ACK_EVENT};
use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const SPAWN_METHOD: &str = "spawn-session";

const LINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
	pub link: LinkConfig,
	pub heartbeat_interval: Duration,
	pub kill_grace: Duration,
}

/// Local notifications for the daemon loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
	/// The server asked the daemon to stop.
	ShutdownRequested,
	/// Teardown finished. Sent once.
	Shutdown,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum DaemonCommand {
	Shutdown,
	Status,
}

#[derive(Debug, Deserialize)]
struct DaemonCommandPayload {
	command: DaemonCommand,
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
	method: String,
	#[serde(default)]
	params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpawnSessionPayload {
	request_id: String,
	payload: Value,
}

/// What a spawn task needs, cloned out of the link handler.
#[derive(Clone)]
struct Spawner {
	registry: ProcessRegistry,
	launcher: SessionLauncher,
	cipher: Arc<dyn PayloadCipher>,
}

impl Spawner {
	async fn spawn_from(&self, params: Value) -> SpawnOutcome {
		let request = open_or_plain(self.cipher.as_ref(), params)
			.and_then(|v| Ok(serde_json::from_value::<SpawnRequest>(v)?));
		let request = match request {
			Ok(request) => request,
			Err(e) => {
				warn!(error = %e, "invalid spawn request");
				return SpawnOutcome::Error {
					error_message: format!("invalid spawn request: {e}"),
				};
			}
		};
		self.launcher.spawn(&self.registry, &request).await.into()
	}

	fn seal(&self, outcome: &SpawnOutcome) -> Result<String> {
		self.cipher.seal(&serde_json::to_value(outcome)?)
	}
}

#[derive(Clone)]
pub struct ControlPlane {
	inner: Arc<Inner>,
}

struct Inner {
	config: ControlPlaneConfig,
	credentials: Credentials,
	identity: MachineIdentity,
	spawner: Spawner,
	state_tx: Mutex<Option<watch::Sender<LinkState>>>,
	state_rx: watch::Receiver<LinkState>,
	events: broadcast::Sender<ControlEvent>,
	close: watch::Sender<bool>,
	heartbeat: Mutex<Option<JoinHandle<()>>>,
	link: Mutex<Option<JoinHandle<()>>>,
	shut_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ControlPlane {
	pub fn new(
		config: ControlPlaneConfig,
		credentials: Credentials,
		identity: MachineIdentity,
		registry: ProcessRegistry,
		launcher: SessionLauncher,
		cipher: Arc<dyn PayloadCipher>,
	) -> Self {
		let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
		let (events, _) = broadcast::channel(16);
		let (close, _) = watch::channel(false);
		Self {
			inner: Arc::new(Inner {
				config,
				credentials,
				identity,
				spawner: Spawner {
					registry,
					launcher,
					cipher,
				},
				state_tx: Mutex::new(Some(state_tx)),
				state_rx,
				events,
				close,
				heartbeat: Mutex::new(None),
				link: Mutex::new(None),
				shut_down: AtomicBool::new(false),
			}),
		}
	}

	/// Start the link. No-op if it is already running or after shutdown.
	pub fn connect(&self) {
		if self.inner.shut_down.load(Ordering::SeqCst) {
			return;
		}
		let mut link = lock(&self.inner.link);
		if link.is_some() {
			debug!("control plane already connecting");
			return;
		}
		let Some(state_tx) = lock(&self.inner.state_tx).take() else {
			return;
		};
		info!(url = %self.inner.config.link.url, machine_id = %self.inner.identity.machine_id, "connecting control plane");
		*link = Some(tokio::spawn(run_link(
			self.inner.config.link.clone(),
			self.inner.clone(),
			state_tx,
			self.inner.close.subscribe(),
		)));
	}

	pub fn state(&self) -> watch::Receiver<LinkState> {
		self.inner.state_rx.clone()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
		self.inner.events.subscribe()
	}

	#[cfg(test)]
	pub fn heartbeat_running(&self) -> bool {
		lock(&self.inner.heartbeat).is_some()
	}

	/// Ask the daemon loop to shut down (used by the local `/stop` endpoint).
	pub fn request_shutdown(&self) {
		let _ = self.inner.events.send(ControlEvent::ShutdownRequested);
	}

	/// Kill tracked sessions, stop the heartbeat, close the socket and emit
	/// [`ControlEvent::Shutdown`]. Only the first call does anything.
	pub async fn shutdown(&self) -> Option<KillReport> {
		if self.inner.shut_down.swap(true, Ordering::SeqCst) {
			return None;
		}
		info!("control plane shutting down");
		let report = self
			.inner
			.spawner
			.registry
			.kill_all(self.inner.config.kill_grace)
			.await;
		info!(
			terminated = report.terminated,
			forced = report.forced,
			already_exited = report.already_exited,
			"session processes stopped"
		);
		self.inner.stop_heartbeat();
		self.inner.close.send_replace(true);

		let link = lock(&self.inner.link).take();
		if let Some(link) = link {
			let abort = link.abort_handle();
			if tokio::time::timeout(LINK_CLOSE_TIMEOUT, link).await.is_err() {
				warn!("link did not close in time, aborting it");
				abort.abort();
			}
		}
		let _ = self.inner.events.send(ControlEvent::Shutdown);
		Some(report)
	}
}

impl Inner {
	fn spawn_method(&self) -> String {
		format!("{}:{}", self.identity.machine_id, SPAWN_METHOD)
	}

	fn heartbeat_frame(machine_id: &str) -> Frame {
		Frame::new(
			"machine-alive",
			json!({ "machineId": machine_id, "time": Utc::now().timestamp_millis() }),
		)
	}

	fn start_heartbeat(&self, outbound: Outbound) {
		let machine_id = self.identity.machine_id.clone();
		let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
		let handle = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				// Delivery failures are the link's problem, not the heartbeat's.
				if !outbound.send(Self::heartbeat_frame(&machine_id)) {
					debug!("heartbeat not delivered");
				}
			}
		});
		if let Some(previous) = lock(&self.heartbeat).replace(handle) {
			previous.abort();
		}
	}

	fn stop_heartbeat(&self) {
		if let Some(handle) = lock(&self.heartbeat).take() {
			handle.abort();
		}
	}

	fn handle_rpc(&self, frame: Frame, outbound: &Outbound) {
		let request: RpcRequest = match serde_json::from_value(frame.data) {
			Ok(request) => request,
			Err(e) => {
				warn!(error = %e, "malformed rpc-request");
				if let Some(ack) = frame.ack {
					outbound.send(Frame::ack_reply(ack, json!({ "error": "malformed request" })));
				}
				return;
			}
		};
		let Some(ack) = frame.ack else {
			warn!(method = %request.method, "rpc-request without ack id, dropping");
			return;
		};
		if request.method != self.spawn_method() {
			warn!(method = %request.method, "unknown rpc method");
			outbound.send(Frame::ack_reply(
				ack,
				json!({ "error": format!("Unknown method: {}", request.method) }),
			));
			return;
		}

		let spawner = self.spawner.clone();
		let outbound = outbound.clone();
		tokio::spawn(async move {
			let outcome = spawner.spawn_from(request.params).await;
			let reply = match spawner.seal(&outcome) {
				Ok(sealed) => json!({ "result": sealed }),
				Err(e) => json!({ "error": e.to_string() }),
			};
			if !outbound.send(Frame::ack_reply(ack, reply)) {
				warn!("connection dropped before the spawn result was delivered");
			}
		});
	}

	fn handle_spawn_session(&self, frame: Frame, outbound: &Outbound) {
		let payload: SpawnSessionPayload = match serde_json::from_value(frame.data) {
			Ok(payload) => payload,
			Err(e) => {
				warn!(error = %e, "malformed spawn-session");
				return;
			}
		};
		let spawner = self.spawner.clone();
		let outbound = outbound.clone();
		let ack = frame.ack;
		tokio::spawn(async move {
			let outcome = spawner.spawn_from(payload.payload).await;
			let result = match spawner.seal(&outcome) {
				Ok(sealed) => Value::String(sealed),
				Err(e) => {
					warn!(error = %e, "failed to seal spawn result");
					return;
				}
			};
			outbound.send(Frame::new(
				"session-spawn-result",
				json!({ "requestId": payload.request_id, "result": result }),
			));
			if let Some(ack) = ack {
				outbound.send(Frame::ack_reply(ack, json!({ "result": result })));
			}
		});
	}

	fn handle_daemon_command(&self, frame: Frame, outbound: &Outbound) {
		let payload: DaemonCommandPayload = match serde_json::from_value(frame.data) {
			Ok(payload) => payload,
			Err(e) => {
				warn!(error = %e, "malformed daemon-command");
				return;
			}
		};
		let reply = match payload.command {
			DaemonCommand::Shutdown => {
				info!("server requested shutdown");
				let _ = self.events.send(ControlEvent::ShutdownRequested);
				json!({ "ok": true })
			}
			DaemonCommand::Status => {
				outbound.send(Self::heartbeat_frame(&self.identity.machine_id));
				json!({
					"machineId": self.identity.machine_id,
					"children": self.spawner.registry.len(),
				})
			}
		};
		if let Some(ack) = frame.ack {
			outbound.send(Frame::ack_reply(ack, reply));
		}
	}
}

impl LinkHandler for Inner {
	fn handshake(&self) -> Vec<Frame> {
		let machine = serde_json::to_value(&self.identity)
			.map_err(anyhow::Error::from)
			.and_then(|v| self.spawner.cipher.seal(&v));
		let machine = match machine {
			Ok(sealed) => Value::String(sealed),
			Err(e) => {
				warn!(error = %e, "failed to seal machine identity");
				Value::Null
			}
		};
		vec![
			Frame::new(
				"machine-connect",
				json!({
					"token": self.credentials.token,
					"machineId": self.identity.machine_id,
					"machine": machine,
				}),
			),
			Frame::new("rpc-register", json!({ "method": self.spawn_method() })),
		]
	}

	fn on_connected(&self, outbound: &Outbound) {
		self.start_heartbeat(outbound.clone());
	}

	fn on_frame(&self, frame: Frame, outbound: &Outbound) {
		match frame.event.as_str() {
			"rpc-request" => self.handle_rpc(frame, outbound),
			"spawn-session" => self.handle_spawn_session(frame, outbound),
			"daemon-command" => self.handle_daemon_command(frame, outbound),
			ACK_EVENT => debug!(ack = ?frame.ack, "server ack"),
			other => debug!(event = other, "ignoring event"),
		}
	}

	fn on_disconnected(&self) {
		self.stop_heartbeat();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cipher::EncodingCipher;
	use crate::model::{StartedBy, TrackedSession};
	use futures_util::{SinkExt, StreamExt};
	use tempfile::TempDir;
	use tokio::net::{TcpListener, TcpStream};
	use tokio_tungstenite::tungstenite::Message;
	use tokio_tungstenite::WebSocketStream;

	type ServerSocket = WebSocketStream<TcpStream>;

	const WAIT: Duration = Duration::from_secs(5);

	async fn listen() -> (TcpListener, String) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let url = format!("ws://{}", listener.local_addr().unwrap());
		(listener, url)
	}

	async fn accept(listener: &TcpListener) -> ServerSocket {
		let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
			.await
			.unwrap()
			.unwrap();
		tokio_tungstenite::accept_async(stream).await.unwrap()
	}

	async fn expect_event(ws: &mut ServerSocket, event: &str) -> Frame {
		tokio::time::timeout(WAIT, async {
			loop {
				match ws.next().await {
					Some(Ok(Message::Text(text))) => {
						let frame = Frame::decode(&text).unwrap();
						if frame.event == event {
							return frame;
						}
					}
					Some(Ok(_)) => continue,
					other => panic!("connection ended while waiting for {event}: {other:?}"),
				}
			}
		})
		.await
		.unwrap()
	}

	async fn send(ws: &mut ServerSocket, frame: Frame) {
		ws.send(Message::Text(frame.encode().unwrap())).await.unwrap();
	}

	fn plane(url: &str, heartbeat: Duration, launcher: SessionLauncher) -> (ControlPlane, ProcessRegistry) {
		let registry = ProcessRegistry::new();
		let plane = ControlPlane::new(
			ControlPlaneConfig {
				link: LinkConfig {
					url: url.to_string(),
					reconnect_initial: Duration::from_millis(10),
					reconnect_max: Duration::from_millis(50),
				},
				heartbeat_interval: heartbeat,
				kill_grace: Duration::from_millis(200),
			},
			Credentials {
				token: "tok".into(),
				machine_id: "m-test".into(),
			},
			MachineIdentity::current("m-test"),
			registry.clone(),
			launcher,
			Arc::new(EncodingCipher),
		);
		(plane, registry)
	}

	fn sh_launcher(script: &str, timeout: Duration) -> SessionLauncher {
		SessionLauncher::new("sh", vec!["-c".into(), script.into()], timeout)
	}

	fn idle_launcher() -> SessionLauncher {
		sh_launcher("true", Duration::from_secs(1))
	}

	const HOUR: Duration = Duration::from_secs(3600);

	#[tokio::test]
	async fn test_handshake_announces_machine_and_registers_spawn() {
		let (listener, url) = listen().await;
		let (plane, _) = plane(&url, HOUR, idle_launcher());
		plane.connect();
		plane.connect();

		let mut ws = accept(&listener).await;
		let hello = expect_event(&mut ws, "machine-connect").await;
		assert_eq!(hello.data["token"], "tok");
		assert_eq!(hello.data["machineId"], "m-test");
		let identity = EncodingCipher
			.open(hello.data["machine"].as_str().unwrap())
			.unwrap();
		assert_eq!(identity["machineId"], "m-test");

		let register = expect_event(&mut ws, "rpc-register").await;
		assert_eq!(register.data["method"], "m-test:spawn-session");

		let mut state = plane.state();
		tokio::time::timeout(WAIT, state.wait_for(|s| *s == LinkState::Connected))
			.await
			.unwrap()
			.unwrap();
		assert!(plane.heartbeat_running());
		plane.shutdown().await;
	}

	#[tokio::test]
	async fn test_unknown_method_gets_error_ack() {
		let (listener, url) = listen().await;
		let (plane, _) = plane(&url, HOUR, idle_launcher());
		plane.connect();
		let mut ws = accept(&listener).await;
		expect_event(&mut ws, "rpc-register").await;

		let mut request = Frame::new("rpc-request", json!({ "method": "m-test:bogus", "params": {} }));
		request.ack = Some(5);
		send(&mut ws, request).await;

		let ack = expect_event(&mut ws, "ack").await;
		assert_eq!(ack.ack, Some(5));
		assert!(ack.data["error"].as_str().unwrap().contains("Unknown method"));
		plane.shutdown().await;
	}

	#[tokio::test]
	async fn test_reconnect_reregisters_rpc() {
		let (listener, url) = listen().await;
		let (plane, _) = plane(&url, HOUR, idle_launcher());
		plane.connect();

		let mut first = accept(&listener).await;
		expect_event(&mut first, "rpc-register").await;
		drop(first);

		let mut second = accept(&listener).await;
		expect_event(&mut second, "machine-connect").await;
		let register = expect_event(&mut second, "rpc-register").await;
		assert_eq!(register.data["method"], "m-test:spawn-session");
		plane.shutdown().await;
	}

	#[tokio::test]
	async fn test_heartbeat_resumes_after_reconnect() {
		let (listener, url) = listen().await;
		let (plane, _) = plane(&url, Duration::from_millis(20), idle_launcher());
		plane.connect();

		let mut first = accept(&listener).await;
		let beat = expect_event(&mut first, "machine-alive").await;
		assert_eq!(beat.data["machineId"], "m-test");
		assert!(beat.data["time"].as_i64().unwrap() > 0);
		drop(first);

		let mut second = accept(&listener).await;
		expect_event(&mut second, "machine-alive").await;
		plane.shutdown().await;
		assert!(!plane.heartbeat_running());
	}

	#[tokio::test]
	async fn test_spawn_rpc_resolves_with_session_id() {
		let dir = TempDir::new().unwrap();
		let (listener, url) = listen().await;
		let launcher = sh_launcher("echo 'tether-session-ready: remote-1'; sleep 30", WAIT);
		let (plane, registry) = plane(&url, HOUR, launcher);
		plane.connect();
		let mut ws = accept(&listener).await;
		expect_event(&mut ws, "rpc-register").await;

		let mut request = Frame::new(
			"rpc-request",
			json!({
				"method": "m-test:spawn-session",
				"params": { "directory": dir.path() },
			}),
		);
		request.ack = Some(9);
		send(&mut ws, request).await;

		let ack = expect_event(&mut ws, "ack").await;
		assert_eq!(ack.ack, Some(9));
		let result = EncodingCipher.open(ack.data["result"].as_str().unwrap()).unwrap();
		assert_eq!(result, json!({ "type": "success", "sessionId": "remote-1" }));
		assert!(registry.find_by_session_id("remote-1").is_some());

		let report = plane.shutdown().await.unwrap();
		assert_eq!(report.terminated, 1);
		assert!(registry.is_empty());
	}

	#[tokio::test]
	async fn test_spawn_rpc_timeout_reports_error_and_untracks() {
		let dir = TempDir::new().unwrap();
		let (listener, url) = listen().await;
		let launcher = sh_launcher("sleep 30", Duration::from_millis(200));
		let (plane, registry) = plane(&url, HOUR, launcher);
		plane.connect();
		let mut ws = accept(&listener).await;
		expect_event(&mut ws, "rpc-register").await;

		let params = EncodingCipher
			.seal(&json!({ "directory": dir.path() }))
			.unwrap();
		let mut request = Frame::new(
			"rpc-request",
			json!({ "method": "m-test:spawn-session", "params": params }),
		);
		request.ack = Some(1);
		send(&mut ws, request).await;

		let ack = expect_event(&mut ws, "ack").await;
		let result = EncodingCipher.open(ack.data["result"].as_str().unwrap()).unwrap();
		assert_eq!(result["type"], "error");
		assert!(registry.is_empty());
		plane.shutdown().await;
	}

	#[tokio::test]
	async fn test_spawn_session_event_emits_result() {
		let dir = TempDir::new().unwrap();
		let (listener, url) = listen().await;
		let launcher = sh_launcher("echo 'tether-session-ready: evt-1'; sleep 30", WAIT);
		let (plane, _) = plane(&url, HOUR, launcher);
		plane.connect();
		let mut ws = accept(&listener).await;
		expect_event(&mut ws, "rpc-register").await;

		let payload = EncodingCipher
			.seal(&json!({ "directory": dir.path() }))
			.unwrap();
		send(
			&mut ws,
			Frame::new("spawn-session", json!({ "requestId": "r-1", "payload": payload })),
		)
		.await;

		let result = expect_event(&mut ws, "session-spawn-result").await;
		assert_eq!(result.data["requestId"], "r-1");
		let outcome = EncodingCipher.open(result.data["result"].as_str().unwrap()).unwrap();
		assert_eq!(outcome["sessionId"], "evt-1");
		plane.shutdown().await;
	}

	#[tokio::test]
	async fn test_daemon_command_shutdown_is_forwarded() {
		let (listener, url) = listen().await;
		let (plane, _) = plane(&url, HOUR, idle_launcher());
		let mut events = plane.subscribe();
		plane.connect();
		let mut ws = accept(&listener).await;
		expect_event(&mut ws, "rpc-register").await;

		send(&mut ws, Frame::new("daemon-command", json!({ "command": "shutdown" }))).await;

		let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
		assert_eq!(event, ControlEvent::ShutdownRequested);
		plane.shutdown().await;
	}

	#[tokio::test]
	async fn test_shutdown_runs_once_and_closes_socket() {
		let (listener, url) = listen().await;
		let (plane, _) = plane(&url, HOUR, idle_launcher());
		let mut events = plane.subscribe();
		plane.connect();
		let mut ws = accept(&listener).await;
		expect_event(&mut ws, "rpc-register").await;

		assert!(plane.shutdown().await.is_some());
		assert!(plane.shutdown().await.is_none());

		assert_eq!(events.recv().await.unwrap(), ControlEvent::Shutdown);
		assert!(events.try_recv().is_err());

		let closed = tokio::time::timeout(WAIT, async {
			loop {
				match ws.next().await {
					Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
					Some(Ok(_)) => continue,
				}
			}
		})
		.await
		.unwrap();
		assert!(closed);
		assert_eq!(*plane.state().borrow(), LinkState::Disconnected);
	}

	#[tokio::test]
	async fn test_spawn_rpc_during_shutdown_is_refused() {
		let dir = TempDir::new().unwrap();
		let (listener, url) = listen().await;
		let launcher = sh_launcher("echo 'tether-session-ready: too-late'; exec sleep 30", WAIT);
		let (plane, registry) = plane(&url, HOUR, launcher);
		plane.connect();
		let mut ws = accept(&listener).await;
		expect_event(&mut ws, "rpc-register").await;

		let stubborn = tokio::process::Command::new("sh")
			.arg("-c")
			.arg("trap '' TERM; exec sleep 30")
			.kill_on_drop(true)
			.spawn()
			.unwrap();
		tokio::time::sleep(Duration::from_millis(100)).await;
		let tracked = TrackedSession::new(stubborn.id().unwrap(), dir.path(), StartedBy::Daemon);
		registry.supervise(stubborn, tracked).unwrap();

		let closing = plane.clone();
		let shutdown = tokio::spawn(async move { closing.shutdown().await });
		tokio::time::sleep(Duration::from_millis(50)).await;

		let mut request = Frame::new(
			"rpc-request",
			json!({
				"method": "m-test:spawn-session",
				"params": { "directory": dir.path() },
			}),
		);
		request.ack = Some(3);
		send(&mut ws, request).await;

		let ack = expect_event(&mut ws, "ack").await;
		let result = EncodingCipher.open(ack.data["result"].as_str().unwrap()).unwrap();
		assert_eq!(result["type"], "error");
		assert!(result["errorMessage"].as_str().unwrap().contains("shutting down"));

		let report = shutdown.await.unwrap().unwrap();
		assert_eq!(report.forced, 1);
		assert_eq!(registry.find_by_session_id("too-late"), None);
		assert!(registry.is_empty());
	}
}

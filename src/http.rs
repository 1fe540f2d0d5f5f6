//! Loopback HTTP control surface between CLI invocations and the daemon.
//!
//! The daemon serves it with axum on `127.0.0.1`. [`DaemonClient`] is the
//! CLI side; a daemon that cannot be reached is reported as
//! [`ClientError::NoDaemonRunning`] rather than as a network error.

use crate::control::ControlPlane;
use crate::daemon_state;
use crate::model::{DaemonState, StartedBy, TrackedSession};
use crate::registry::ProcessRegistry;
use crate::spawn::{SessionLauncher, SpawnOutcome, SpawnRequest};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpState {
	pub registry: ProcessRegistry,
	pub launcher: SessionLauncher,
	pub control: ControlPlane,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
	pub pid: u32,
	pub directory: PathBuf,
	#[serde(default = "terminal")]
	pub started_by: StartedBy,
}

fn terminal() -> StartedBy {
	StartedBy::Terminal
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartedBody {
	pub session_id: String,
	pub metadata: SessionMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSessionBody {
	pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
	pub children: Vec<TrackedSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
	pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpawnSessionResponse {
	pub success: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl From<SpawnOutcome> for SpawnSessionResponse {
	fn from(outcome: SpawnOutcome) -> Self {
		match outcome {
			SpawnOutcome::Success { session_id } => Self {
				success: true,
				session_id: Some(session_id),
				error: None,
			},
			SpawnOutcome::Error { error_message } => Self {
				success: false,
				session_id: None,
				error: Some(error_message),
			},
		}
	}
}

pub fn router(state: Arc<HttpState>) -> Router {
	Router::new()
		.route("/session-started", post(session_started_handler))
		.route("/list", post(list_handler))
		.route("/stop-session", post(stop_session_handler))
		.route("/spawn-session", post(spawn_session_handler))
		.route("/stop", post(stop_handler))
		.with_state(state)
}

/// Bind `127.0.0.1:<port>`. Port 0 picks a free one.
pub async fn bind(port: u16) -> Result<TcpListener> {
	let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
	TcpListener::bind(addr)
		.await
		.with_context(|| format!("failed to bind control server on {addr}"))
}

/// Serve until `shutdown` turns true.
pub async fn serve(
	listener: TcpListener,
	state: Arc<HttpState>,
	mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
	let addr = listener.local_addr().context("control server has no local address")?;
	info!(addr = %addr, "control server listening");
	axum::serve(listener, router(state))
		.with_graceful_shutdown(async move {
			let _ = shutdown.wait_for(|&stop| stop).await;
		})
		.await
		.context("control server failed")
}

async fn session_started_handler(
	State(state): State<Arc<HttpState>>,
	Json(body): Json<SessionStartedBody>,
) -> Json<Value> {
	let meta = body.metadata;
	info!(session_id = %body.session_id, pid = meta.pid, "session reported in");
	match state
		.registry
		.session_started(meta.pid, &body.session_id, meta.directory, meta.started_by)
	{
		Some(_) => Json(json!({ "status": "ok" })),
		None => Json(json!({ "status": "shutting_down" })),
	}
}

async fn list_handler(State(state): State<Arc<HttpState>>) -> Json<ListResponse> {
	Json(ListResponse {
		children: state.registry.list(),
	})
}

async fn stop_session_handler(
	State(state): State<Arc<HttpState>>,
	Json(body): Json<StopSessionBody>,
) -> Json<SuccessResponse> {
	let success = state.registry.stop_session(&body.session_id);
	if !success {
		warn!(session_id = %body.session_id, "stop requested for unknown session");
	}
	Json(SuccessResponse { success })
}

async fn spawn_session_handler(
	State(state): State<Arc<HttpState>>,
	Json(request): Json<SpawnRequest>,
) -> Json<SpawnSessionResponse> {
	let outcome: SpawnOutcome = state.launcher.spawn(&state.registry, &request).await.into();
	Json(outcome.into())
}

async fn stop_handler(State(state): State<Arc<HttpState>>) -> Json<Value> {
	info!("stop requested over http");
	state.control.request_shutdown();
	Json(json!({ "status": "stopping" }))
}

#[derive(Debug, Error)]
pub enum ClientError {
	#[error("no daemon running")]
	NoDaemonRunning,
	#[error("daemon request failed: {0}")]
	Http(#[from] reqwest::Error),
	#[error("daemon returned {0}")]
	Status(reqwest::StatusCode),
	#[error("failed to read daemon state: {0}")]
	State(String),
}

/// CLI-side handle on a running daemon.
#[derive(Debug, Clone)]
pub struct DaemonClient {
	base: String,
	http: reqwest::Client,
	state: DaemonState,
}

impl DaemonClient {
	/// Find the daemon through its state file. Stale files are removed.
	pub fn discover(state_path: &Path) -> Result<Self, ClientError> {
		let state = daemon_state::running_daemon(state_path)
			.map_err(|e| ClientError::State(format!("{e:#}")))?
			.ok_or(ClientError::NoDaemonRunning)?;
		Ok(Self::for_state(state))
	}

	pub fn for_state(state: DaemonState) -> Self {
		Self {
			base: format!("http://127.0.0.1:{}", state.http_port),
			http: reqwest::Client::new(),
			state,
		}
	}

	pub fn state(&self) -> &DaemonState {
		&self.state
	}

	async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R, ClientError> {
		let response = self
			.http
			.post(format!("{}{}", self.base, path))
			.json(body)
			.timeout(REQUEST_TIMEOUT)
			.send()
			.await
			.map_err(|e| {
				if e.is_connect() {
					ClientError::NoDaemonRunning
				} else {
					ClientError::Http(e)
				}
			})?;
		if !response.status().is_success() {
			return Err(ClientError::Status(response.status()));
		}
		Ok(response.json().await?)
	}

	pub async fn session_started(&self, session_id: &str, metadata: SessionMetadata) -> Result<(), ClientError> {
		let body = SessionStartedBody {
			session_id: session_id.to_string(),
			metadata,
		};
		let _: Value = self.post("/session-started", &body).await?;
		Ok(())
	}

	pub async fn list(&self) -> Result<Vec<TrackedSession>, ClientError> {
		let response: ListResponse = self.post("/list", &json!({})).await?;
		Ok(response.children)
	}

	pub async fn stop_session(&self, session_id: &str) -> Result<bool, ClientError> {
		let body = StopSessionBody {
			session_id: session_id.to_string(),
		};
		let response: SuccessResponse = self.post("/stop-session", &body).await?;
		Ok(response.success)
	}

	pub async fn spawn_session(&self, request: &SpawnRequest) -> Result<SpawnSessionResponse, ClientError> {
		self.post("/spawn-session", request).await
	}

	pub async fn stop(&self) -> Result<(), ClientError> {
		let _: Value = self.post("/stop", &json!({})).await?;
		Ok(())
	}
}

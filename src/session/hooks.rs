//! Loopback endpoints the agent's hooks call into.
//!
//! `POST /permission` blocks until the remote operator decides. `POST /idle`
//! lets an interactive agent pull the next queued task.

use crate::coordinator::TaskCoordinator;
use crate::permission::{PermissionDecision, PermissionNegotiator, PermissionResult};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct HookState {
	pub negotiator: PermissionNegotiator,
	pub coordinator: Arc<TaskCoordinator>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionHookBody {
	pub id: String,
	pub tool_name: String,
	#[serde(default)]
	pub input: Value,
}

pub fn router(state: Arc<HookState>) -> Router {
	Router::new()
		.route("/permission", post(permission_handler))
		.route("/idle", post(idle_handler))
		.with_state(state)
}

pub async fn serve(
	listener: TcpListener,
	state: Arc<HookState>,
	mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
	axum::serve(listener, router(state))
		.with_graceful_shutdown(async move {
			let _ = shutdown.wait_for(|&stop| stop).await;
		})
		.await
		.context("hook server failed")
}

async fn permission_handler(
	State(state): State<Arc<HookState>>,
	Json(body): Json<PermissionHookBody>,
) -> Json<PermissionResult> {
	match state.negotiator.request(body.id, body.tool_name, body.input).await {
		Ok(result) => Json(result),
		Err(e) => {
			warn!(error = %e, "permission request ended without a decision");
			Json(PermissionResult {
				decision: PermissionDecision::Abort,
				reason: Some(e.to_string()),
			})
		}
	}
}

async fn idle_handler(State(state): State<Arc<HookState>>) -> Json<Value> {
	let dispatched = state.coordinator.advance();
	info!(dispatched, "agent reported idle");
	Json(json!({ "dispatched": dispatched }))
}

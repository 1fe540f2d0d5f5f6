//! Remote tool-approval negotiation.
//!
//! A backend asks for permission with [`PermissionNegotiator::request`]; the
//! call stays suspended until a matching response arrives over the session
//! channel, or until [`PermissionNegotiator::reset`] cancels it. Responses can
//! arrive as a scoped RPC or as a plain message. Both are normalized by
//! [`PermissionResponse::from_event`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const PERMISSION_METHOD: &str = "permission";
pub const RESET_REASON: &str = "session reset";
/// Closed requests kept in [`AgentState`]; older ones are dropped.
pub const MAX_COMPLETED_REQUESTS: usize = 100;

/// Inbound traffic from a session channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
	Rpc { method: String, params: Value },
	Message(Value),
}

/// The transport a negotiator is bound to. May be swapped after a reconnect.
pub trait SessionChannel: Send + Sync + 'static {
	fn session_id(&self) -> &str;
	fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
	fn publish_state(&self, state: &AgentState);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
	Approved,
	ApprovedForSession,
	Denied,
	Abort,
}

impl PermissionDecision {
	fn parse(s: &str) -> Option<Self> {
		match s {
			"approved" => Some(Self::Approved),
			"approved_for_session" => Some(Self::ApprovedForSession),
			"denied" => Some(Self::Denied),
			"abort" => Some(Self::Abort),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResult {
	pub decision: PermissionDecision,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
	#[error("permission request canceled: session reset")]
	SessionReset,
	#[error("permission request abandoned")]
	Abandoned,
	#[error("permission request {0} is already pending")]
	Duplicate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
	#[error("rpc method {0} is not a permission response")]
	NotPermission(String),
	#[error("permission response has no string `id`")]
	MissingId,
	#[error("permission response has no boolean `approved`")]
	MissingApproved,
}

/// A validated `{id, approved, decision?, reason?}` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionResponse {
	pub id: String,
	pub approved: bool,
	pub decision: Option<PermissionDecision>,
	pub reason: Option<String>,
}

impl PermissionResponse {
	pub fn from_event(event: &SessionEvent) -> Result<Self, ProtocolError> {
		match event {
			SessionEvent::Rpc { method, params } => {
				let scoped = method.rsplit(':').next().unwrap_or(method.as_str());
				if scoped != PERMISSION_METHOD {
					return Err(ProtocolError::NotPermission(method.clone()));
				}
				Self::from_value(params)
			}
			SessionEvent::Message(value) => Self::from_value(value),
		}
	}

	pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
		let id = value
			.get("id")
			.and_then(Value::as_str)
			.ok_or(ProtocolError::MissingId)?;
		let approved = value
			.get("approved")
			.and_then(Value::as_bool)
			.ok_or(ProtocolError::MissingApproved)?;
		Ok(Self {
			id: id.to_string(),
			approved,
			decision: value
				.get("decision")
				.and_then(Value::as_str)
				.and_then(PermissionDecision::parse),
			reason: value.get("reason").and_then(Value::as_str).map(str::to_string),
		})
	}

	pub fn decision(&self) -> PermissionDecision {
		match (self.approved, self.decision) {
			(true, Some(PermissionDecision::ApprovedForSession)) => PermissionDecision::ApprovedForSession,
			(true, _) => PermissionDecision::Approved,
			(false, Some(PermissionDecision::Abort)) => PermissionDecision::Abort,
			(false, _) => PermissionDecision::Denied,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
	Approved,
	ApprovedForSession,
	Denied,
	Abort,
	Canceled,
}

impl From<PermissionDecision> for RequestStatus {
	fn from(decision: PermissionDecision) -> Self {
		match decision {
			PermissionDecision::Approved => Self::Approved,
			PermissionDecision::ApprovedForSession => Self::ApprovedForSession,
			PermissionDecision::Denied => Self::Denied,
			PermissionDecision::Abort => Self::Abort,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRequest {
	pub tool: String,
	pub arguments: Value,
	pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedRequest {
	pub tool: String,
	pub arguments: Value,
	pub created_at: i64,
	pub completed_at: i64,
	pub status: RequestStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
}

/// What the remote side renders for this session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
	#[serde(default)]
	pub requests: BTreeMap<String, OpenRequest>,
	#[serde(default)]
	pub completed_requests: BTreeMap<String, ClosedRequest>,
}

impl AgentState {
	fn close(&mut self, id: &str, tool: &str, status: RequestStatus, reason: Option<String>) {
		let now = now_ms();
		let (tool, arguments, created_at) = match self.requests.remove(id) {
			Some(open) => (open.tool, open.arguments, open.created_at),
			None => (tool.to_string(), Value::Null, now),
		};
		self.completed_requests.insert(
			id.to_string(),
			ClosedRequest {
				tool,
				arguments,
				created_at,
				completed_at: now,
				status,
				reason,
			},
		);
		while self.completed_requests.len() > MAX_COMPLETED_REQUESTS {
			let oldest = self
				.completed_requests
				.iter()
				.min_by_key(|(id, r)| (r.completed_at, id.as_str()))
				.map(|(id, _)| id.clone());
			match oldest {
				Some(id) => self.completed_requests.remove(&id),
				None => break,
			};
		}
	}
}

type Responder = oneshot::Sender<Result<PermissionResult, PermissionError>>;

struct Pending {
	tool_name: String,
	responder: Responder,
}

struct Binding {
	session: Arc<dyn SessionChannel>,
	listener: JoinHandle<()>,
}

struct Inner {
	pending: Mutex<HashMap<String, Pending>>,
	state: Mutex<AgentState>,
	binding: Mutex<Option<Binding>>,
	resetting: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn now_ms() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

/// Suspended permission request. Resolves once.
#[derive(Debug)]
pub struct PermissionTicket {
	rx: oneshot::Receiver<Result<PermissionResult, PermissionError>>,
}

impl PermissionTicket {
	pub async fn wait(self) -> Result<PermissionResult, PermissionError> {
		match self.rx.await {
			Ok(result) => result,
			Err(_) => Err(PermissionError::Abandoned),
		}
	}
}

#[derive(Clone)]
pub struct PermissionNegotiator {
	inner: Arc<Inner>,
}

impl PermissionNegotiator {
	pub fn new(session: Arc<dyn SessionChannel>) -> Self {
		let negotiator = Self {
			inner: Arc::new(Inner {
				pending: Mutex::new(HashMap::new()),
				state: Mutex::new(AgentState::default()),
				binding: Mutex::new(None),
				resetting: AtomicBool::new(false),
			}),
		};
		negotiator.update_session(session);
		negotiator
	}

	/// Open a request and publish it. Await the returned ticket for the answer.
	pub fn register(
		&self,
		id: impl Into<String>,
		tool_name: impl Into<String>,
		input: Value,
	) -> Result<PermissionTicket, PermissionError> {
		let id = id.into();
		let tool_name = tool_name.into();
		let (tx, rx) = oneshot::channel();
		{
			let mut pending = lock(&self.inner.pending);
			if pending.contains_key(&id) {
				return Err(PermissionError::Duplicate(id));
			}
			pending.insert(
				id.clone(),
				Pending {
					tool_name: tool_name.clone(),
					responder: tx,
				},
			);
			// Under the pending lock so a fast response cannot close it first.
			lock(&self.inner.state).requests.insert(
				id.clone(),
				OpenRequest {
					tool: tool_name.clone(),
					arguments: input,
					created_at: now_ms(),
				},
			);
		}
		info!(id = %id, tool = %tool_name, "permission requested");
		self.inner.publish();
		Ok(PermissionTicket { rx })
	}

	pub async fn request(
		&self,
		id: impl Into<String>,
		tool_name: impl Into<String>,
		input: Value,
	) -> Result<PermissionResult, PermissionError> {
		self.register(id, tool_name, input)?.wait().await
	}

	/// Resolve the matching pending request. False if nothing was waiting.
	#[cfg(test)]
	pub fn handle_response(&self, response: PermissionResponse) -> bool {
		self.inner.handle_response(response)
	}

	/// Move to a new session channel, keeping pending requests.
	pub fn update_session(&self, session: Arc<dyn SessionChannel>) {
		let events = session.subscribe();
		{
			let mut binding = lock(&self.inner.binding);
			if let Some(previous) = binding.take() {
				previous.listener.abort();
				debug!(session_id = previous.session.session_id(), "detached permission listener");
			}
			let listener = spawn_listener(Arc::downgrade(&self.inner), events);
			*binding = Some(Binding {
				session: session.clone(),
				listener,
			});
		}
		debug!(session_id = session.session_id(), "attached permission listener");
		let state = lock(&self.inner.state).clone();
		session.publish_state(&state);
	}

	/// Reject every pending request with [`PermissionError::SessionReset`] and
	/// mark them canceled. Returns how many were pending.
	pub fn reset(&self) -> usize {
		if self.inner.resetting.swap(true, Ordering::SeqCst) {
			debug!("permission reset already running");
			return 0;
		}
		let _guard = ResetGuard(&self.inner.resetting);

		let snapshot = std::mem::take(&mut *lock(&self.inner.pending));
		let count = self.inner.cancel(snapshot);
		if count > 0 {
			info!(count, "canceled pending permission requests");
		}
		self.inner.publish();
		count
	}

	#[cfg(test)]
	pub fn pending_count(&self) -> usize {
		lock(&self.inner.pending).len()
	}

	#[cfg(test)]
	pub fn state(&self) -> AgentState {
		lock(&self.inner.state).clone()
	}
}

struct ResetGuard<'a>(&'a AtomicBool);

impl Drop for ResetGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::SeqCst);
	}
}

impl Inner {
	/// Reject and close exactly the requests in `taken`. Anything registered
	/// after they were taken stays open.
	fn cancel(&self, taken: HashMap<String, Pending>) -> usize {
		let count = taken.len();
		let mut state = lock(&self.state);
		for (id, pending) in taken {
			let _ = pending.responder.send(Err(PermissionError::SessionReset));
			state.close(
				&id,
				&pending.tool_name,
				RequestStatus::Canceled,
				Some(RESET_REASON.to_string()),
			);
		}
		count
	}

	fn handle_event(&self, event: &SessionEvent) -> bool {
		match PermissionResponse::from_event(event) {
			Ok(response) => self.handle_response(response),
			Err(e) => {
				debug!(error = %e, "ignoring session event");
				false
			}
		}
	}

	fn handle_response(&self, response: PermissionResponse) -> bool {
		let Some(pending) = lock(&self.pending).remove(&response.id) else {
			warn!(id = %response.id, "permission response without a pending request");
			return false;
		};
		let decision = response.decision();
		lock(&self.state).close(
			&response.id,
			&pending.tool_name,
			decision.into(),
			response.reason.clone(),
		);
		info!(id = %response.id, ?decision, "permission resolved");
		self.publish();
		let _ = pending.responder.send(Ok(PermissionResult {
			decision,
			reason: response.reason,
		}));
		true
	}

	fn publish(&self) {
		let state = lock(&self.state).clone();
		let session = lock(&self.binding).as_ref().map(|b| b.session.clone());
		if let Some(session) = session {
			session.publish_state(&state);
		}
	}
}

impl Drop for Inner {
	fn drop(&mut self) {
		let binding = self.binding.get_mut().unwrap_or_else(|e| e.into_inner());
		if let Some(binding) = binding.take() {
			binding.listener.abort();
		}
	}
}

fn spawn_listener(
	inner: Weak<Inner>,
	mut events: broadcast::Receiver<SessionEvent>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			match events.recv().await {
				Ok(event) => {
					let Some(inner) = inner.upgrade() else {
						break;
					};
					inner.handle_event(&event);
				}
				Err(RecvError::Lagged(skipped)) => {
					warn!(skipped, "permission listener fell behind");
				}
				Err(RecvError::Closed) => break,
			}
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use std::time::Duration;

	struct MockSession {
		id: String,
		events: broadcast::Sender<SessionEvent>,
		published: Mutex<Vec<AgentState>>,
	}

	impl MockSession {
		fn new(id: &str) -> Arc<Self> {
			let (events, _) = broadcast::channel(16);
			Arc::new(Self {
				id: id.to_string(),
				events,
				published: Mutex::new(Vec::new()),
			})
		}

		fn emit(&self, event: SessionEvent) {
			let _ = self.events.send(event);
		}

		fn last_state(&self) -> Option<AgentState> {
			self.published.lock().unwrap().last().cloned()
		}
	}

	impl SessionChannel for MockSession {
		fn session_id(&self) -> &str {
			&self.id
		}

		fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
			self.events.subscribe()
		}

		fn publish_state(&self, state: &AgentState) {
			self.published.lock().unwrap().push(state.clone());
		}
	}

	fn message(value: Value) -> SessionEvent {
		SessionEvent::Message(value)
	}

	async fn resolved(ticket: PermissionTicket) -> Result<PermissionResult, PermissionError> {
		tokio::time::timeout(Duration::from_secs(5), ticket.wait())
			.await
			.unwrap()
	}

	#[test]
	fn test_decision_mapping() {
		let cases = [
			(json!({"id": "a", "approved": true}), PermissionDecision::Approved),
			(
				json!({"id": "a", "approved": true, "decision": "approved_for_session"}),
				PermissionDecision::ApprovedForSession,
			),
			(json!({"id": "a", "approved": false}), PermissionDecision::Denied),
			(
				json!({"id": "a", "approved": false, "decision": "denied"}),
				PermissionDecision::Denied,
			),
			(
				json!({"id": "a", "approved": false, "decision": "abort"}),
				PermissionDecision::Abort,
			),
			(
				json!({"id": "a", "approved": false, "decision": "whatever"}),
				PermissionDecision::Denied,
			),
		];
		for (payload, expected) in cases {
			let response = PermissionResponse::from_value(&payload).unwrap();
			assert_eq!(response.decision(), expected, "{payload}");
		}
	}

	#[test]
	fn test_from_event_validates_both_paths() {
		let rpc = SessionEvent::Rpc {
			method: "s1:permission".into(),
			params: json!({"id": "r1", "approved": true, "reason": "ok"}),
		};
		let response = PermissionResponse::from_event(&rpc).unwrap();
		assert_eq!(response.id, "r1");
		assert_eq!(response.reason.as_deref(), Some("ok"));

		let other = SessionEvent::Rpc {
			method: "s1:tasks".into(),
			params: json!({"id": "r1", "approved": true}),
		};
		assert!(matches!(
			PermissionResponse::from_event(&other),
			Err(ProtocolError::NotPermission(_))
		));
		assert_eq!(
			PermissionResponse::from_event(&message(json!({"approved": true}))),
			Err(ProtocolError::MissingId)
		);
		assert_eq!(
			PermissionResponse::from_event(&message(json!({"id": "r1", "approved": "yes"}))),
			Err(ProtocolError::MissingApproved)
		);
	}

	#[tokio::test]
	async fn test_request_approved_round_trip() {
		let session = MockSession::new("s1");
		let negotiator = PermissionNegotiator::new(session.clone());

		let ticket = negotiator.register("r1", "Bash", json!({"command": "ls"})).unwrap();
		let published = session.last_state().unwrap();
		assert_eq!(published.requests["r1"].tool, "Bash");

		session.emit(message(json!({"id": "r1", "approved": true})));
		let result = resolved(ticket).await.unwrap();
		assert_eq!(result.decision, PermissionDecision::Approved);

		let state = negotiator.state();
		assert!(state.requests.is_empty());
		assert_eq!(state.completed_requests["r1"].status, RequestStatus::Approved);
		assert_eq!(state.completed_requests["r1"].arguments["command"], "ls");
		assert_eq!(session.last_state().unwrap(), state);
	}

	#[tokio::test]
	async fn test_request_denied_through_rpc() {
		let session = MockSession::new("s1");
		let negotiator = PermissionNegotiator::new(session.clone());

		let ticket = negotiator.register("r2", "Write", json!({})).unwrap();
		session.emit(SessionEvent::Rpc {
			method: "s1:permission".into(),
			params: json!({"id": "r2", "approved": false, "decision": "denied"}),
		});
		let result = resolved(ticket).await.unwrap();
		assert_eq!(result.decision, PermissionDecision::Denied);
		assert_eq!(negotiator.pending_count(), 0);
	}

	#[tokio::test]
	async fn test_unmatched_response_is_discarded() {
		let session = MockSession::new("s1");
		let negotiator = PermissionNegotiator::new(session);
		let response = PermissionResponse::from_value(&json!({"id": "ghost", "approved": true})).unwrap();
		assert!(!negotiator.handle_response(response));
		assert!(negotiator.state().completed_requests.is_empty());
	}

	#[tokio::test]
	async fn test_duplicate_id_is_rejected() {
		let negotiator = PermissionNegotiator::new(MockSession::new("s1"));
		let _ticket = negotiator.register("r1", "Bash", json!({})).unwrap();
		assert_eq!(
			negotiator.register("r1", "Bash", json!({})).unwrap_err(),
			PermissionError::Duplicate("r1".into())
		);
	}

	#[tokio::test]
	async fn test_reset_cancels_pending_and_is_idempotent() {
		let session = MockSession::new("s1");
		let negotiator = PermissionNegotiator::new(session.clone());
		let first = negotiator.register("a", "Bash", json!({})).unwrap();
		let second = negotiator.register("b", "Edit", json!({})).unwrap();

		assert_eq!(negotiator.reset(), 2);
		assert_eq!(resolved(first).await, Err(PermissionError::SessionReset));
		assert_eq!(resolved(second).await, Err(PermissionError::SessionReset));

		let after_one = negotiator.state();
		assert!(after_one.requests.is_empty());
		for id in ["a", "b"] {
			let closed = &after_one.completed_requests[id];
			assert_eq!(closed.status, RequestStatus::Canceled);
			assert_eq!(closed.reason.as_deref(), Some(RESET_REASON));
		}

		assert_eq!(negotiator.reset(), 0);
		assert_eq!(negotiator.reset(), 0);
		assert_eq!(negotiator.pending_count(), 0);
		assert_eq!(negotiator.state(), after_one);
	}

	#[tokio::test]
	async fn test_request_registered_after_take_stays_open() {
		let session = MockSession::new("s1");
		let negotiator = PermissionNegotiator::new(session.clone());
		let early = negotiator.register("early", "Bash", json!({})).unwrap();

		let taken = std::mem::take(&mut *lock(&negotiator.inner.pending));
		let late = negotiator.register("late", "Edit", json!({})).unwrap();
		assert_eq!(negotiator.inner.cancel(taken), 1);
		assert_eq!(resolved(early).await, Err(PermissionError::SessionReset));

		let state = negotiator.state();
		assert_eq!(state.completed_requests["early"].status, RequestStatus::Canceled);
		assert!(state.requests.contains_key("late"));
		assert!(!state.completed_requests.contains_key("late"));
		assert_eq!(negotiator.pending_count(), 1);

		session.emit(message(json!({"id": "late", "approved": true})));
		assert_eq!(resolved(late).await.unwrap().decision, PermissionDecision::Approved);
	}

	#[test]
	fn test_completed_requests_keep_the_newest() {
		let mut state = AgentState::default();
		for i in 0..MAX_COMPLETED_REQUESTS {
			state.completed_requests.insert(
				format!("old-{i}"),
				ClosedRequest {
					tool: "Bash".into(),
					arguments: Value::Null,
					created_at: i as i64,
					completed_at: i as i64,
					status: RequestStatus::Approved,
					reason: None,
				},
			);
		}
		state.requests.insert(
			"fresh".into(),
			OpenRequest {
				tool: "Edit".into(),
				arguments: json!({}),
				created_at: now_ms(),
			},
		);

		state.close("fresh", "Edit", RequestStatus::Denied, None);
		assert_eq!(state.completed_requests.len(), MAX_COMPLETED_REQUESTS);
		assert!(!state.completed_requests.contains_key("old-0"));
		assert!(state.completed_requests.contains_key("old-1"));
		assert_eq!(state.completed_requests["fresh"].status, RequestStatus::Denied);
	}

	#[tokio::test]
	async fn test_concurrent_resets_reject_each_request_once() {
		let negotiator = PermissionNegotiator::new(MockSession::new("s1"));
		let tickets: Vec<_> = (0..20)
			.map(|i| negotiator.register(format!("r{i}"), "Bash", json!({})).unwrap())
			.collect();

		let handles: Vec<_> = (0..4)
			.map(|_| {
				let negotiator = negotiator.clone();
				tokio::task::spawn_blocking(move || negotiator.reset())
			})
			.collect();
		let mut total = 0;
		for handle in handles {
			total += handle.await.unwrap();
		}
		assert_eq!(total, 20);
		for ticket in tickets {
			assert_eq!(resolved(ticket).await, Err(PermissionError::SessionReset));
		}
	}

	#[tokio::test]
	async fn test_session_swap_keeps_pending_request() {
		let old = MockSession::new("s1");
		let negotiator = PermissionNegotiator::new(old.clone());
		let ticket = negotiator.register("r1", "Bash", json!({})).unwrap();

		let new = MockSession::new("s1");
		negotiator.update_session(new.clone());
		assert!(new.last_state().unwrap().requests.contains_key("r1"));

		old.emit(message(json!({"id": "r1", "approved": true})));
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(negotiator.pending_count(), 1);

		new.emit(message(json!({"id": "r1", "approved": true, "decision": "approved_for_session"})));
		new.emit(message(json!({"id": "r1", "approved": false})));
		let result = resolved(ticket).await.unwrap();
		assert_eq!(result.decision, PermissionDecision::ApprovedForSession);

		tokio::time::sleep(Duration::from_millis(50)).await;
		let state = negotiator.state();
		assert_eq!(state.completed_requests.len(), 1);
		assert_eq!(state.completed_requests["r1"].status, RequestStatus::ApprovedForSession);
	}

	#[tokio::test]
	async fn test_dropped_negotiator_abandons_pending_requests() {
		let negotiator = PermissionNegotiator::new(MockSession::new("s1"));
		let ticket = negotiator.register("r1", "Bash", json!({})).unwrap();
		drop(negotiator);
		assert_eq!(resolved(ticket).await, Err(PermissionError::Abandoned));
	}
}

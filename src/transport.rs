//! Reconnecting websocket link shared by the machine control plane and the
//! per-session link.
//!
//! Frames are JSON text messages `{event, data, ack?}`. A [`LinkHandler`]
//! supplies the handshake for each fresh connection and reacts to inbound
//! frames; [`run_link`] owns the socket and the retry loop.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub const ACK_EVENT: &str = "ack";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
	pub event: String,
	#[serde(default)]
	pub data: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ack: Option<u64>,
}

impl Frame {
	pub fn new(event: impl Into<String>, data: Value) -> Self {
		Self {
			event: event.into(),
			data,
			ack: None,
		}
	}

	/// Reply to an inbound frame that carried an ack id.
	pub fn ack_reply(ack: u64, data: Value) -> Self {
		Self {
			event: ACK_EVENT.to_string(),
			data,
			ack: Some(ack),
		}
	}

	pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
		serde_json::from_str(text)
	}

	pub fn encode(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(self)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
	Disconnected,
	Connecting,
	Connected,
}

/// Log every link state change until the link is dropped.
pub async fn log_state_changes(link: &'static str, mut state: watch::Receiver<LinkState>) {
	while state.changed().await.is_ok() {
		let current = *state.borrow_and_update();
		match current {
			LinkState::Connected => info!(link, "link connected"),
			LinkState::Connecting => debug!(link, "link connecting"),
			LinkState::Disconnected => debug!(link, "link disconnected"),
		}
	}
}

/// Doubling retry delay, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
	initial: Duration,
	max: Duration,
	current: Duration,
}

impl Backoff {
	pub fn new(initial: Duration, max: Duration) -> Self {
		let initial = initial.min(max);
		Self {
			initial,
			max,
			current: initial,
		}
	}

	pub fn next(&mut self) -> Duration {
		let delay = self.current;
		self.current = (self.current * 2).min(self.max);
		delay
	}

	pub fn reset(&mut self) {
		self.current = self.initial;
	}
}

/// Sending half of the live connection. Dead once the connection drops.
#[derive(Debug, Clone)]
pub struct Outbound(mpsc::UnboundedSender<Frame>);

impl Outbound {
	pub fn send(&self, frame: Frame) -> bool {
		self.0.send(frame).is_ok()
	}
}

pub trait LinkHandler: Send + Sync + 'static {
	/// Frames sent first on every new connection: auth, registrations, replays.
	fn handshake(&self) -> Vec<Frame>;

	fn on_connected(&self, _outbound: &Outbound) {}

	fn on_frame(&self, frame: Frame, outbound: &Outbound);

	fn on_disconnected(&self) {}
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
	pub url: String,
	pub reconnect_initial: Duration,
	pub reconnect_max: Duration,
}

#[derive(Debug, PartialEq, Eq)]
enum LinkEnd {
	Lost,
	Closed,
}

/// Keep a connection to `config.url` open, retrying forever, until `close`
/// turns true (or its sender is dropped).
pub async fn run_link<H: LinkHandler>(
	config: LinkConfig,
	handler: Arc<H>,
	state: watch::Sender<LinkState>,
	mut close: watch::Receiver<bool>,
) {
	let mut backoff = Backoff::new(config.reconnect_initial, config.reconnect_max);
	loop {
		if *close.borrow() {
			break;
		}
		state.send_replace(LinkState::Connecting);
		let connected = tokio::select! {
			result = connect_async(config.url.as_str()) => result,
			_ = close.changed() => break,
		};
		let socket = match connected {
			Ok((socket, _response)) => socket,
			Err(e) => {
				let delay = backoff.next();
				warn!(url = %config.url, error = %e, retry_in = ?delay, "connect failed");
				state.send_replace(LinkState::Disconnected);
				if wait_or_close(delay, &mut close).await {
					break;
				}
				continue;
			}
		};
		backoff.reset();

		let end = drive(socket, handler.as_ref(), &state, &mut close).await;
		handler.on_disconnected();
		state.send_replace(LinkState::Disconnected);
		if end == LinkEnd::Closed {
			break;
		}
		let delay = backoff.next();
		info!(retry_in = ?delay, "link lost, reconnecting");
		if wait_or_close(delay, &mut close).await {
			break;
		}
	}
	state.send_replace(LinkState::Disconnected);
	debug!(url = %config.url, "link stopped");
}

/// Sleep for `delay`; true if the link was closed meanwhile.
async fn wait_or_close(delay: Duration, close: &mut watch::Receiver<bool>) -> bool {
	tokio::select! {
		_ = tokio::time::sleep(delay) => *close.borrow(),
		_ = close.changed() => true,
	}
}

async fn drive<H: LinkHandler>(
	socket: Socket,
	handler: &H,
	state: &watch::Sender<LinkState>,
	close: &mut watch::Receiver<bool>,
) -> LinkEnd {
	let (mut writer, mut reader) = socket.split();
	let (tx, mut rx) = mpsc::unbounded_channel();
	let outbound = Outbound(tx);

	for frame in handler.handshake() {
		outbound.send(frame);
	}
	state.send_replace(LinkState::Connected);
	handler.on_connected(&outbound);

	loop {
		tokio::select! {
			Some(frame) = rx.recv() => {
				let text = match frame.encode() {
					Ok(text) => text,
					Err(e) => {
						warn!(event = %frame.event, error = %e, "failed to encode frame");
						continue;
					}
				};
				if let Err(e) = writer.send(Message::Text(text)).await {
					warn!(error = %e, "link write failed");
					return LinkEnd::Lost;
				}
			}
			message = reader.next() => match message {
				Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
					Ok(frame) => handler.on_frame(frame, &outbound),
					Err(e) => debug!(error = %e, "dropping malformed frame"),
				},
				Some(Ok(Message::Close(_))) | None => return LinkEnd::Lost,
				Some(Ok(_)) => {}
				Some(Err(e)) => {
					warn!(error = %e, "link read failed");
					return LinkEnd::Lost;
				}
			},
			_ = close.changed() => {
				let _ = writer.send(Message::Close(None)).await;
				let _ = writer.close().await;
				return LinkEnd::Closed;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_backoff_doubles_up_to_ceiling() {
		let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
		let delays: Vec<u64> = (0..5).map(|_| backoff.next().as_secs()).collect();
		assert_eq!(delays, vec![1, 2, 4, 5, 5]);

		backoff.reset();
		assert_eq!(backoff.next(), Duration::from_secs(1));
	}

	#[test]
	fn test_backoff_initial_above_ceiling_is_clamped() {
		let mut backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(5));
		assert_eq!(backoff.next(), Duration::from_secs(5));
	}

	#[test]
	fn test_frame_without_data_or_ack() {
		let frame = Frame::decode(r#"{"event":"daemon-command"}"#).unwrap();
		assert_eq!(frame.event, "daemon-command");
		assert!(frame.data.is_null());
		assert_eq!(frame.ack, None);
	}

	#[test]
	fn test_ack_reply_shape() {
		let text = Frame::ack_reply(7, json!({"ok": true})).encode().unwrap();
		let value: Value = serde_json::from_str(&text).unwrap();
		assert_eq!(value, json!({"event": "ack", "data": {"ok": true}, "ack": 7}));

		let plain = Frame::new("machine-alive", json!({})).encode().unwrap();
		assert!(!plain.contains("\"ack\""));
	}
}

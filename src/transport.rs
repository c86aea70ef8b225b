//! Broker transport abstraction.
//!
//! The connection manager drives a session through three small traits:
//! [`Transport`] opens a session and returns a request handle plus an event
//! source, [`BrokerClient`] issues subscribe/publish/disconnect requests and
//! [`EventSource`] is polled for inbound traffic. Like `rumqttc`, an event
//! source reconnects on its own when polled again after an error.
//!
//! [`RumqttTransport`] talks to a real broker. [`MemoryBroker`] is an
//! in-process broker with retained messages and fault injection.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use rumqttc::QoS;
use thiserror::Error;

use crate::client::config::Credentials;

pub mod memory;
pub mod rumqtt;

pub use memory::{MemoryBroker, PublishedMessage};
pub use rumqtt::RumqttTransport;

/// Everything needed to open one broker session.
#[derive(Clone)]
pub struct SessionOptions {
	/// Unique per connection attempt
	pub client_id: String,
	pub host: String,
	pub port: u16,
	pub credentials: Option<Credentials>,
	pub keep_alive: Duration,
	pub clean_session: bool,
	/// Capacity of the outgoing request channel
	pub request_capacity: usize,
}

impl fmt::Debug for SessionOptions {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SessionOptions")
			.field("client_id", &self.client_id)
			.field("host", &self.host)
			.field("port", &self.port)
			.field("credentials", &self.credentials)
			.field("keep_alive", &self.keep_alive)
			.field("clean_session", &self.clean_session)
			.finish()
	}
}

/// Who ended a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Initiator {
	Client,
	Broker,
}

/// Notification produced by polling an [`EventSource`].
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
	/// Broker accepted the (re)connection
	ConnAck { session_present: bool },
	/// Broker refused the connection
	Rejected { reason: String },
	/// Inbound publish
	Message { topic: String, payload: Bytes },
	/// Session closed by one side
	Disconnected { initiated_by: Initiator },
	/// Keep-alive or acknowledgement traffic
	Activity,
}

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
	/// Network connection failed or was lost
	#[error("Connection error: {0}")]
	Connection(String),

	/// Broker refused the connection
	#[error("Connection refused by broker: {0}")]
	Refused(String),

	/// Request issued while the session is offline
	#[error("Session is not connected")]
	NotConnected,

	/// Request could not be handed to the session
	#[error("Request failed: {0}")]
	Request(String),

	/// Session event stream has ended
	#[error("Session closed")]
	Closed,
}

/// Opens broker sessions.
pub trait Transport: Send + Sync + 'static {
	type Client: BrokerClient;
	type Events: EventSource;

	/// Creates the session handles. No network traffic happens until the
	/// event source is polled.
	fn open(&self, options: &SessionOptions) -> (Self::Client, Self::Events);
}

/// Request side of a session.
pub trait BrokerClient: Clone + Send + Sync + 'static {
	fn subscribe(
		&self,
		topic: &str,
		qos: QoS,
	) -> impl Future<Output = Result<(), TransportError>> + Send;

	fn publish(
		&self,
		topic: &str,
		qos: QoS,
		retain: bool,
		payload: Bytes,
	) -> impl Future<Output = Result<(), TransportError>> + Send;

	fn disconnect(
		&self,
	) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Event side of a session.
pub trait EventSource: Send + 'static {
	fn poll(
		&mut self,
	) -> impl Future<Output = Result<SessionEvent, TransportError>> + Send;
}

use arcstr::ArcStr;
use thiserror::Error;

use crate::client::config::ConfigError;
use crate::codec::{DecodeError, EncodeError};
use crate::routing::RouterError;
use crate::transport::TransportError;

/// Failures while establishing a broker session.
///
/// None of these are fatal: the manager is left Disconnected and a later
/// `connect` may succeed.
#[derive(Debug, Error)]
pub enum ConnectError {
	/// Network connection failed
	#[error("Network connection failed: {0}")]
	Network(#[source] TransportError),

	/// Broker refused the session, typically bad credentials
	#[error("Broker rejected connection: {reason}")]
	Rejected { reason: String },

	/// No ConnAck within the configured timeout
	#[error("Connection establishment timed out after {timeout_millis}ms")]
	Timeout { timeout_millis: u64 },

	/// Subscribing to a topic failed after the session was established
	#[error("Failed to subscribe to '{topic}': {source}")]
	Subscribe {
		topic: ArcStr,
		#[source]
		source: TransportError,
	},

	/// `disconnect` was called while the attempt was in flight
	#[error("Connection attempt cancelled by disconnect")]
	Cancelled,

	/// `reconnect` was called before any `connect`
	#[error("No broker configuration; connect has never been called")]
	NotConfigured,
}

impl From<TransportError> for ConnectError {
	fn from(err: TransportError) -> Self {
		match err {
			| TransportError::Refused(reason) => ConnectError::Rejected { reason },
			| other => ConnectError::Network(other),
		}
	}
}

/// Reasons an outbound message was dropped.
#[derive(Debug, Error)]
pub enum PublishError {
	/// Still not connected once the reconnect grace interval elapsed
	#[error("Not connected after {grace_millis}ms grace interval, message to '{topic}' dropped")]
	NotConnected { topic: ArcStr, grace_millis: u64 },

	/// Outbound queue is full
	#[error("Publish queue full, message to '{topic}' dropped")]
	QueueFull { topic: ArcStr },

	/// Publisher worker has stopped
	#[error("Publisher is shut down, message to '{topic}' dropped")]
	Closed { topic: ArcStr },

	/// Payload could not be encoded
	#[error(transparent)]
	Encode(#[from] EncodeError),

	/// Transport refused the request
	#[error("Publish failed: {0}")]
	Transport(#[from] TransportError),
}

/// Top-level error for the crate.
#[derive(Debug, Error)]
pub enum SyncError {
	#[error("Configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("Routing error: {0}")]
	Router(#[from] RouterError),

	#[error("Connection error: {0}")]
	Connect(#[from] ConnectError),

	#[error("Decode error: {0}")]
	Decode(#[from] DecodeError),

	#[error("Publish error: {0}")]
	Publish(#[from] PublishError),
}

//! Outbound publishing.
//!
//! [`Publisher::send`] only enqueues. A single background worker drains the
//! queue; for each request it makes sure a session is live, triggering at
//! most one reconnect and waiting up to the grace interval, then publishes
//! at-least-once and retained. Requests that cannot be delivered are logged
//! and dropped.

use std::time::Duration;

use arcstr::ArcStr;
use bytes::Bytes;
use rumqttc::QoS;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::PublishError;
use crate::connection::ConnectionManager;
use crate::transport::Transport;

/// One message waiting to be published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundRequest {
	topic: ArcStr,
	payload: Bytes,
}

impl OutboundRequest {
	pub fn new(topic: ArcStr, payload: impl Into<Bytes>) -> Self {
		Self {
			topic,
			payload: payload.into(),
		}
	}

	pub fn topic(&self) -> &str {
		&self.topic
	}

	pub fn payload(&self) -> &Bytes {
		&self.payload
	}

	/// Every request is delivered at least once.
	pub fn qos(&self) -> QoS {
		QoS::AtLeastOnce
	}

	/// Every request is retained by the broker.
	pub fn retain(&self) -> bool {
		true
	}
}

/// Fire-and-forget publisher backed by a bounded queue.
pub struct Publisher {
	queue: mpsc::Sender<OutboundRequest>,
	cancel: CancellationToken,
	worker: Option<JoinHandle<()>>,
}

impl Publisher {
	/// Spawns the publishing worker. Must be called inside a tokio runtime.
	pub fn new<T: Transport>(
		connection: ConnectionManager<T>,
		capacity: usize,
		grace: Duration,
	) -> Self {
		let (queue, requests) = mpsc::channel(capacity.max(1));
		let cancel = CancellationToken::new();
		let worker = tokio::spawn(run(connection, requests, grace, cancel.clone()));
		Self {
			queue,
			cancel,
			worker: Some(worker),
		}
	}

	/// Queues `payload` for `topic` and returns immediately.
	///
	/// The only errors reported here are a full queue and a stopped worker;
	/// delivery failures are logged by the worker.
	pub fn send(
		&self,
		topic: ArcStr,
		payload: impl Into<Bytes>,
	) -> Result<(), PublishError> {
		let request = OutboundRequest::new(topic, payload);
		let result = match self.queue.try_send(request) {
			| Ok(()) => Ok(()),
			| Err(TrySendError::Full(request)) => Err(PublishError::QueueFull {
				topic: request.topic,
			}),
			| Err(TrySendError::Closed(request)) => Err(PublishError::Closed {
				topic: request.topic,
			}),
		};
		if let Err(err) = &result {
			error!(error = %err, "Outbound message dropped");
		}
		result
	}

	/// Stops the worker after the request it is handling, if any.
	pub async fn shutdown(mut self) {
		self.cancel.cancel();
		if let Some(worker) = self.worker.take() {
			if let Err(err) = worker.await {
				warn!(error = %err, "Publisher task failed");
			}
		}
		debug!("Publisher stopped");
	}
}

impl Drop for Publisher {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

async fn run<T: Transport>(
	connection: ConnectionManager<T>,
	mut requests: mpsc::Receiver<OutboundRequest>,
	grace: Duration,
	cancel: CancellationToken,
) {
	loop {
		let request = tokio::select! {
			biased;
			_ = cancel.cancelled() => break,
			request = requests.recv() => match request {
				| Some(request) => request,
				| None => break,
			},
		};

		let delivered = tokio::select! {
			biased;
			_ = cancel.cancelled() => break,
			res = deliver(&connection, &request, grace) => res,
		};
		match delivered {
			| Ok(()) => {
				debug!(topic = %request.topic, payload_size = request.payload.len(), "Published");
			}
			| Err(err) => {
				error!(topic = %request.topic, error = %err, "Failed to publish, message dropped");
			}
		}
	}
	debug!("Publisher worker terminated");
}

/// Publishes one request, reconnecting once first if needed.
async fn deliver<T: Transport>(
	connection: &ConnectionManager<T>,
	request: &OutboundRequest,
	grace: Duration,
) -> Result<(), PublishError> {
	if !connection.is_connected() {
		let mut status = connection.watch_status();
		info!(topic = %request.topic, "Not connected, reconnecting before publish");
		let reconnecting = connection.clone();
		tokio::spawn(async move {
			if let Err(err) = reconnecting.reconnect().await {
				warn!(error = %err, "Reconnect before publish failed");
			}
		});

		let connected = matches!(
			time::timeout(grace, status.wait_for(|s| s.is_connected())).await,
			Ok(Ok(_))
		);
		if !connected {
			return Err(PublishError::NotConnected {
				topic: request.topic.clone(),
				grace_millis: grace.as_millis() as u64,
			});
		}
	}
	connection.publish(request).await
}

//! Broker session lifecycle.
//!
//! [`ConnectionManager`] owns at most one broker session. It opens the
//! session, subscribes every routed topic, runs the session event loop on a
//! background task and forwards inbound messages to the [`TopicRouter`].
//! The observable [`ConnectionStatus`] doubles as the mutual-exclusion flag
//! that keeps a single connect sequence in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rumqttc::QoS;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::config::{BrokerConfig, ClientSettings};
use crate::client::error::{ConnectError, PublishError};
use crate::client::publisher::OutboundRequest;
use crate::routing::TopicRouter;
use crate::transport::{
	BrokerClient, EventSource, Initiator, SessionEvent, SessionOptions,
	Transport, TransportError,
};

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
/// How long `disconnect` lets the event loop drain before cancelling it.
const DISCONNECT_DRAIN: Duration = Duration::from_millis(500);

/// Connection state observable by consumers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
	#[default]
	Disconnected,
	Connecting,
	Connected,
	/// Session lost; the transport is reconnecting on its own
	Reconnecting,
}

impl ConnectionStatus {
	pub fn is_connected(self) -> bool {
		self == ConnectionStatus::Connected
	}

	/// A connect or reconnect sequence is in flight.
	pub fn is_in_progress(self) -> bool {
		matches!(
			self,
			ConnectionStatus::Connecting | ConnectionStatus::Reconnecting
		)
	}
}

struct SessionSlot<C> {
	attempt: u64,
	cancel: CancellationToken,
	client: Option<C>,
	worker: Option<JoinHandle<()>>,
}

struct Shared<T: Transport> {
	transport: T,
	router: TopicRouter,
	settings: ClientSettings,
	status: watch::Sender<ConnectionStatus>,
	session: Mutex<Option<SessionSlot<T::Client>>>,
	last_config: Mutex<Option<BrokerConfig>>,
	attempts: AtomicU64,
	shutdown: CancellationToken,
}

impl<T: Transport> Shared<T> {
	/// Disconnected -> Connecting, atomically. Returns false if another
	/// sequence already owns the connection.
	fn claim(&self) -> bool {
		self.status.send_if_modified(|status| {
			if *status == ConnectionStatus::Disconnected {
				*status = ConnectionStatus::Connecting;
				true
			} else {
				false
			}
		})
	}

	fn transition(&self, from: ConnectionStatus, to: ConnectionStatus) -> bool {
		self.status.send_if_modified(|status| {
			if *status == from {
				*status = to;
				true
			} else {
				false
			}
		})
	}

	/// Drops the session slot if it still belongs to `attempt`.
	async fn release(&self, attempt: u64) -> bool {
		let mut slot = self.session.lock().await;
		if slot.as_ref().is_some_and(|s| s.attempt == attempt) {
			*slot = None;
			self.status.send_replace(ConnectionStatus::Disconnected);
			true
		} else {
			false
		}
	}
}

/// Owns the broker session and its event loop.
///
/// Cheap to clone; clones share the same session.
pub struct ConnectionManager<T: Transport> {
	shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for ConnectionManager<T> {
	fn clone(&self) -> Self {
		Self {
			shared: Arc::clone(&self.shared),
		}
	}
}

impl<T: Transport> ConnectionManager<T> {
	/// Creates a disconnected manager. Nothing happens until
	/// [`connect`](Self::connect).
	pub fn new(transport: T, router: TopicRouter, settings: ClientSettings) -> Self {
		let (status, _) = watch::channel(ConnectionStatus::Disconnected);
		Self {
			shared: Arc::new(Shared {
				transport,
				router,
				settings,
				status,
				session: Mutex::new(None),
				last_config: Mutex::new(None),
				attempts: AtomicU64::new(0),
				shutdown: CancellationToken::new(),
			}),
		}
	}

	pub fn status(&self) -> ConnectionStatus {
		*self.shared.status.borrow()
	}

	/// Status change notifications.
	pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
		self.shared.status.subscribe()
	}

	pub fn is_connected(&self) -> bool {
		self.status().is_connected()
	}

	pub fn router(&self) -> &TopicRouter {
		&self.shared.router
	}

	/// Opens a session and subscribes every routed topic.
	///
	/// Returns `Ok(())` immediately, without side effects, when a session is
	/// already connected or a connect sequence is in flight. On failure the
	/// status goes back to Disconnected and the call can be retried.
	pub async fn connect(&self, config: &BrokerConfig) -> Result<(), ConnectError> {
		let (attempt, cancel) = {
			let mut slot = self.shared.session.lock().await;
			if !self.shared.claim() {
				debug!(status = ?self.status(), "Connect ignored, session already active");
				return Ok(());
			}
			*self.shared.last_config.lock().await = Some(config.clone());
			let attempt = self.shared.attempts.fetch_add(1, Ordering::Relaxed);
			let cancel = self.shared.shutdown.child_token();
			*slot = Some(SessionSlot {
				attempt,
				cancel: cancel.clone(),
				client: None,
				worker: None,
			});
			(attempt, cancel)
		};

		let opened = tokio::select! {
			biased;
			_ = cancel.cancelled() => Err(ConnectError::Cancelled),
			res = self.open_session(config) => res,
		};

		let result = match opened {
			| Ok((client, events)) => self.install(attempt, client, events).await,
			| Err(err) => Err(err),
		};
		if let Err(err) = &result {
			self.shared.release(attempt).await;
			error!(host = %config.host, port = config.port, error = %err, "Failed to connect to MQTT broker");
		}
		result
	}

	/// Runs [`connect`](Self::connect) again with the last configuration.
	pub async fn reconnect(&self) -> Result<(), ConnectError> {
		let config = self
			.shared
			.last_config
			.lock()
			.await
			.clone()
			.ok_or(ConnectError::NotConfigured)?;
		self.connect(&config).await
	}

	/// Closes the session and waits for its event loop to finish.
	///
	/// Safe at any time: a no-op when there is no session, and an in-flight
	/// connect is cancelled.
	pub async fn disconnect(&self) {
		let slot = {
			let mut slot = self.shared.session.lock().await;
			let taken = slot.take();
			if taken.is_some() {
				self.shared
					.status
					.send_replace(ConnectionStatus::Disconnected);
			}
			taken
		};
		let Some(slot) = slot else {
			debug!("Disconnect ignored, no active session");
			return;
		};

		if let Some(client) = slot.client {
			if let Err(err) = client.disconnect().await {
				warn!(error = %err, "Failed to send MQTT disconnect");
			}
		}
		if let Some(mut worker) = slot.worker {
			let drained = time::timeout(DISCONNECT_DRAIN, &mut worker).await;
			slot.cancel.cancel();
			let joined = match drained {
				| Ok(joined) => joined,
				| Err(_) => worker.await,
			};
			if let Err(err) = joined {
				warn!(error = %err, "Session event loop task failed");
			}
		} else {
			slot.cancel.cancel();
		}
		info!("Disconnected from MQTT broker");
	}

	/// Publishes one request on the live session.
	pub(crate) async fn publish(
		&self,
		request: &OutboundRequest,
	) -> Result<(), PublishError> {
		let client = {
			let slot = self.shared.session.lock().await;
			slot.as_ref().and_then(|s| s.client.clone())
		};
		let client = client
			.filter(|_| self.is_connected())
			.ok_or(TransportError::NotConnected)?;
		client
			.publish(
				request.topic(),
				request.qos(),
				request.retain(),
				request.payload().clone(),
			)
			.await?;
		Ok(())
	}

	/// Stops any session task; used when the owning client goes away.
	pub(crate) fn shutdown_now(&self) {
		self.shared.shutdown.cancel();
	}

	async fn open_session(
		&self,
		config: &BrokerConfig,
	) -> Result<(T::Client, T::Events), ConnectError> {
		let settings = &self.shared.settings;
		let options = SessionOptions {
			client_id: config.next_client_id(),
			host: config.host.clone(),
			port: config.port,
			credentials: config.credentials.clone(),
			keep_alive: config.keep_alive,
			clean_session: true,
			request_capacity: settings.event_loop_capacity,
		};
		info!(
			client_id = %options.client_id,
			host = %options.host,
			port = options.port,
			"Connecting to MQTT broker"
		);
		let (client, events) = self.shared.transport.open(&options);

		let timeout_millis = settings.connection_timeout_millis;
		let events =
			time::timeout(settings.connection_timeout(), establish(events))
				.await
				.map_err(|_| ConnectError::Timeout { timeout_millis })??;

		if let Err(err) = subscribe_all(&client, &self.shared.router).await {
			let _ = client.disconnect().await;
			return Err(err);
		}
		Ok((client, events))
	}

	/// Starts the event loop for an established session, unless the attempt
	/// was cancelled meanwhile.
	async fn install(
		&self,
		attempt: u64,
		client: T::Client,
		events: T::Events,
	) -> Result<(), ConnectError> {
		let mut slot = self.shared.session.lock().await;
		match slot.as_mut() {
			| Some(s) if s.attempt == attempt && !s.cancel.is_cancelled() => {
				self.shared.status.send_replace(ConnectionStatus::Connected);
				let worker = tokio::spawn(run(
					Arc::clone(&self.shared),
					client.clone(),
					events,
					s.cancel.clone(),
					attempt,
				));
				s.client = Some(client);
				s.worker = Some(worker);
				info!(topics = self.shared.router.len(), "Connected to MQTT broker");
				Ok(())
			}
			| _ => {
				drop(slot);
				let _ = client.disconnect().await;
				Err(ConnectError::Cancelled)
			}
		}
	}
}

/// Polls until the broker acknowledges the session.
async fn establish<E: EventSource>(mut events: E) -> Result<E, ConnectError> {
	loop {
		match events.poll().await {
			| Ok(SessionEvent::ConnAck { .. }) => {
				debug!("MQTT connection established successfully");
				return Ok(events);
			}
			| Ok(SessionEvent::Rejected { reason }) => {
				debug!(reason = %reason, "MQTT connection rejected by broker");
				return Err(ConnectError::Rejected { reason });
			}
			| Ok(SessionEvent::Disconnected { .. }) => {
				return Err(ConnectError::Network(TransportError::Closed));
			}
			| Ok(notification) => {
				debug!(notification = ?notification, "Bootstrap phase notification");
			}
			| Err(err) => {
				debug!(error = %err, "MQTT connection error during bootstrap phase");
				return Err(err.into());
			}
		}
	}
}

async fn subscribe_all<C: BrokerClient>(
	client: &C,
	router: &TopicRouter,
) -> Result<(), ConnectError> {
	for topic in router.topics() {
		client
			.subscribe(topic, QoS::AtLeastOnce)
			.await
			.map_err(|source| ConnectError::Subscribe {
				topic: topic.clone(),
				source,
			})?;
		debug!(topic = %topic, "Subscribed");
	}
	Ok(())
}

fn retry_delay(error_count: u32) -> Duration {
	let delay = INITIAL_RETRY_DELAY * 2_u32.pow(error_count.saturating_sub(1).min(10));
	delay.min(MAX_RETRY_DELAY)
}

/// Resubscribes after a reconnect without a session, then reports
/// Connected unless the session was lost again meanwhile.
///
/// Runs beside the event loop: subscribe requests go through the
/// transport's bounded request channel, which only the event loop drains.
async fn resubscribe<T: Transport>(
	shared: Arc<Shared<T>>,
	client: T::Client,
	losses: Arc<AtomicU64>,
	expected_losses: u64,
	cancel: CancellationToken,
) {
	let subscribed = tokio::select! {
		biased;
		_ = cancel.cancelled() => return,
		res = subscribe_all(&client, &shared.router) => res,
	};
	if let Err(err) = subscribed {
		error!(error = %err, "Failed to resubscribe to topics");
		return;
	}
	shared.status.send_if_modified(|status| {
		let current = losses.load(Ordering::Acquire) == expected_losses;
		if current && *status == ConnectionStatus::Reconnecting {
			*status = ConnectionStatus::Connected;
			true
		} else {
			false
		}
	});
}

/// Session event loop. Ends on cancellation or a client-initiated
/// disconnect. Transport errors are retried with capped backoff, forever
/// unless `max_consecutive_errors` is set.
async fn run<T: Transport>(
	shared: Arc<Shared<T>>,
	client: T::Client,
	mut events: T::Events,
	cancel: CancellationToken,
	attempt: u64,
) {
	let max_errors = shared.settings.max_consecutive_errors;
	let mut error_count: u32 = 0;
	let losses = Arc::new(AtomicU64::new(0));

	loop {
		let event = tokio::select! {
			biased;
			_ = cancel.cancelled() => {
				debug!("Session event loop cancelled");
				return;
			}
			event = events.poll() => event,
		};

		let failure = match event {
			| Ok(SessionEvent::ConnAck { session_present }) => {
				error_count = 0;
				if session_present {
					info!("MQTT reconnected with session preserved");
					shared.transition(
						ConnectionStatus::Reconnecting,
						ConnectionStatus::Connected,
					);
				} else {
					info!("MQTT reconnected without session, resubscribing to all topics");
					tokio::spawn(resubscribe(
						Arc::clone(&shared),
						client.clone(),
						Arc::clone(&losses),
						losses.load(Ordering::Acquire),
						cancel.clone(),
					));
				}
				continue;
			}
			| Ok(SessionEvent::Message { topic, payload }) => {
				error_count = 0;
				debug!(topic = %topic, payload_size = payload.len(), "Received MQTT message");
				shared.router.dispatch(&topic, &payload);
				continue;
			}
			| Ok(SessionEvent::Activity) => {
				error_count = 0;
				continue;
			}
			| Ok(SessionEvent::Disconnected {
				initiated_by: Initiator::Client,
			}) => {
				info!("Sent MQTT Disconnect packet to server");
				break;
			}
			| Ok(SessionEvent::Disconnected {
				initiated_by: Initiator::Broker,
			}) => {
				warn!("Broker closed the session, waiting for reconnect");
				losses.fetch_add(1, Ordering::AcqRel);
				shared.transition(
					ConnectionStatus::Connected,
					ConnectionStatus::Reconnecting,
				);
				continue;
			}
			| Ok(SessionEvent::Rejected { reason }) => {
				TransportError::Refused(reason)
			}
			| Err(TransportError::Closed) => {
				info!("MQTT event stream closed");
				break;
			}
			| Err(err) => err,
		};

		error_count = error_count.saturating_add(1);
		losses.fetch_add(1, Ordering::AcqRel);
		shared.transition(
			ConnectionStatus::Connected,
			ConnectionStatus::Reconnecting,
		);
		error!(error_count = error_count, error = %failure, "MQTT event loop error");
		if let Some(max_errors) = max_errors.filter(|max| error_count >= *max) {
			error!(
				error_count = error_count,
				max_errors = max_errors,
				"Too many consecutive errors, abandoning session"
			);
			break;
		}

		let delay = retry_delay(error_count);
		warn!(delay = ?delay, error_count = error_count, "Retrying MQTT connection");
		tokio::select! {
			_ = cancel.cancelled() => return,
			_ = time::sleep(delay) => {}
		}
	}

	if shared.release(attempt).await {
		warn!("MQTT session ended, status is now Disconnected");
	}
	info!("MQTT event loop terminated");
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_retry_delay_backoff() {
		assert_eq!(retry_delay(1), Duration::from_millis(100));
		assert_eq!(retry_delay(2), Duration::from_millis(200));
		assert_eq!(retry_delay(4), Duration::from_millis(800));
		assert_eq!(retry_delay(20), MAX_RETRY_DELAY);
	}

	#[test]
	fn test_status_predicates() {
		assert!(ConnectionStatus::Connected.is_connected());
		assert!(!ConnectionStatus::Reconnecting.is_connected());
		assert!(ConnectionStatus::Connecting.is_in_progress());
		assert!(ConnectionStatus::Reconnecting.is_in_progress());
		assert!(!ConnectionStatus::Disconnected.is_in_progress());
	}
}

//! Synchronization client facade.

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::config::SyncConfig;
use super::error::{ConnectError, PublishError, SyncError};
use super::publisher::Publisher;
use crate::codec::{
	ConfigUpdate, JsonCodec, LiteralCodec, PayloadCodec, RelayCommand,
	SensorReport, decode_relay_status, encode_config,
};
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::routing::{RouterError, TopicRouter};
use crate::state::{DeviceConfig, DeviceState};
use crate::topic::{Topic, TopicSet};
use crate::transport::{RumqttTransport, Transport};

/// Keeps a [`DeviceState`] in sync with the plug's topics and publishes
/// control and configuration writes.
///
/// # Example
///
/// ```rust,no_run
/// use smartplug_sync::{RelayCommand, SyncClient, SyncConfig};
///
/// #[tokio::main]
/// async fn main() -> smartplug_sync::Result<()> {
/// 	let client = SyncClient::new(SyncConfig::from_url("mqtt://localhost")?)?;
/// 	client.connect().await?;
/// 	client.send_control(RelayCommand::On)?;
/// 	println!("relay is {}", client.state().relay());
/// 	client.shutdown().await;
/// 	Ok(())
/// }
/// ```
pub struct SyncClient<T: Transport = RumqttTransport> {
	config: SyncConfig,
	state: DeviceState,
	connection: ConnectionManager<T>,
	publisher: Option<Publisher>,
}

impl SyncClient<RumqttTransport> {
	/// Client for a real broker. Must be called inside a tokio runtime.
	pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
		Self::with_transport(config, RumqttTransport)
	}
}

impl<T: Transport> SyncClient<T> {
	/// Client over an arbitrary transport. Must be called inside a tokio
	/// runtime.
	pub fn with_transport(
		config: SyncConfig,
		transport: T,
	) -> Result<Self, SyncError> {
		config.validate()?;
		let state = DeviceState::new();
		let router = bind_router(&config.topics, &state)?;
		let connection =
			ConnectionManager::new(transport, router, config.settings.clone());
		let publisher = Publisher::new(
			connection.clone(),
			config.settings.publish_queue_capacity,
			config.settings.publish_grace(),
		);
		Ok(Self {
			config,
			state,
			connection,
			publisher: Some(publisher),
		})
	}

	/// Connects and subscribes to the status, sensors and config topics.
	/// Retained messages rebuild the local state shortly after.
	pub async fn connect(&self) -> Result<(), ConnectError> {
		self.connection.connect(&self.config.broker).await
	}

	pub async fn disconnect(&self) {
		self.connection.disconnect().await;
	}

	pub fn is_connected(&self) -> bool {
		self.connection.is_connected()
	}

	pub fn status(&self) -> ConnectionStatus {
		self.connection.status()
	}

	pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
		self.connection.watch_status()
	}

	/// Mirrored device state. Clones share the same underlying record.
	pub fn state(&self) -> &DeviceState {
		&self.state
	}

	pub fn topics(&self) -> &TopicSet {
		&self.config.topics
	}

	pub fn connection(&self) -> &ConnectionManager<T> {
		&self.connection
	}

	/// Queues a raw payload for `topic`. Returns once queued; delivery
	/// happens in the background.
	pub fn send(
		&self,
		payload: impl Into<Bytes>,
		topic: Topic,
	) -> Result<(), PublishError> {
		let topic = self.config.topics.name(topic).clone();
		match &self.publisher {
			| Some(publisher) => publisher.send(topic, payload),
			| None => Err(PublishError::Closed { topic }),
		}
	}

	/// Switches the relay.
	pub fn send_control(&self, command: RelayCommand) -> Result<(), PublishError> {
		debug!(command = %command, "Sending relay command");
		self.send(LiteralCodec.encode(&command)?, Topic::Control)
	}

	/// Writes the full automation configuration.
	pub fn send_config(&self, config: &DeviceConfig) -> Result<(), PublishError> {
		self.send(encode_config(config)?, Topic::Config)
	}

	/// Disconnects and stops the background publisher.
	pub async fn shutdown(mut self) {
		if let Some(publisher) = self.publisher.take() {
			publisher.shutdown().await;
		}
		self.connection.disconnect().await;
		info!("Sync client shut down");
	}
}

impl<T: Transport> Drop for SyncClient<T> {
	fn drop(&mut self) {
		if self.publisher.is_some() {
			warn!("SyncClient dropped without shutdown, cancelling background tasks");
		}
		self.connection.shutdown_now();
	}
}

/// Router with one handler per subscribed topic, each writing into `state`.
/// Empty payloads (retained-message deletions) are ignored.
pub fn bind_router(
	topics: &TopicSet,
	state: &DeviceState,
) -> Result<TopicRouter, RouterError> {
	let mut router = TopicRouter::new();

	let device = state.clone();
	router.register_handler(topics.status.clone(), move |payload| {
		if payload.is_empty() {
			return Ok(());
		}
		match decode_relay_status(payload)? {
			| Some(command) => device.apply_relay(command.into()),
			| None => {
				debug!(payload = %String::from_utf8_lossy(payload), "Unknown relay status ignored");
			}
		}
		Ok(())
	})?;

	let device = state.clone();
	router.register_handler(topics.sensors.clone(), move |payload| {
		if payload.is_empty() {
			return Ok(());
		}
		let report: SensorReport = JsonCodec.decode(payload)?;
		device.apply_sensors(&report);
		Ok(())
	})?;

	let device = state.clone();
	router.register_handler(topics.config.clone(), move |payload| {
		if payload.is_empty() {
			return Ok(());
		}
		let update: ConfigUpdate = JsonCodec.decode(payload)?;
		device.apply_config(&update);
		Ok(())
	})?;

	Ok(router)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::routing::DispatchOutcome;
	use crate::state::{Celsius, RelayStatus};

	fn bound() -> (TopicSet, DeviceState, TopicRouter) {
		let topics = TopicSet::under("plug");
		let state = DeviceState::new();
		let router = bind_router(&topics, &state).unwrap();
		(topics, state, router)
	}

	#[test]
	fn test_control_topic_is_not_subscribed() {
		let (topics, _, router) = bound();
		assert_eq!(router.len(), 3);
		assert!(router.topics().all(|t| *t != topics.control));
	}

	#[test]
	fn test_status_updates_relay() {
		let (topics, state, router) = bound();
		let outcome = router.dispatch(&topics.status, b"ON");
		assert_eq!(outcome, DispatchOutcome::Applied);
		assert_eq!(state.relay(), RelayStatus::On);

		router.dispatch(&topics.status, b"TOGGLE");
		assert_eq!(state.relay(), RelayStatus::On);
	}

	#[test]
	fn test_malformed_sensors_leave_state_unchanged() {
		let (topics, state, router) = bound();
		router.dispatch(&topics.sensors, br#"{"temperatura": 21.0}"#);
		let outcome = router.dispatch(&topics.sensors, b"{temp:}");
		assert_eq!(outcome, DispatchOutcome::Discarded);
		assert_eq!(state.temperature(), Some(Celsius(21.0)));

		router.dispatch(&topics.status, b"OFF");
		assert_eq!(state.relay(), RelayStatus::Off);
	}

	#[test]
	fn test_empty_payload_ignored() {
		let (topics, state, router) = bound();
		router.dispatch(&topics.config, br#"{"timer": 15}"#);
		assert_eq!(router.dispatch(&topics.config, b""), DispatchOutcome::Applied);
		assert_eq!(state.config().timer_minutes, 15);
	}
}

//! # Smart Plug Sync
//!
//! Keeps a local mirror of a smart plug's state in sync with an MQTT broker
//! and publishes relay and configuration writes back to it.
//!
//! ## Features
//!
//! - **Mirrored state**: relay position, sensor readings and automation
//!   settings, rebuilt from retained messages on every connect
//! - **Partial updates**: sensor and config reports only overwrite the keys
//!   they carry
//! - **Single connection sequence**: concurrent `connect` calls collapse into
//!   one attempt, and lost sessions are re-established with resubscription
//! - **Fire-and-forget publishing**: sends are queued, retained and
//!   delivered at least once, reconnecting first when needed
//! - **Pluggable transport**: `rumqttc` for real brokers, an in-process
//!   broker for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smartplug_sync::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> smartplug_sync::Result<()> {
//!     let config = SyncConfig::from_url("mqtt://broker.local:1883")?;
//!     let client = SyncClient::new(config)?;
//!     client.connect().await?;
//!
//!     let mut changes = client.state().subscribe();
//!     while changes.changed().await.is_ok() {
//!         let snapshot = *changes.borrow_and_update();
//!         println!("relay {}", snapshot.relay);
//!         if let Some(celsius) = snapshot.sensors.temperature {
//!             println!("temperature {celsius}");
//!         }
//!     }
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod alerts;
pub mod client;
pub mod codec;
pub mod connection;
pub mod routing;
pub mod state;
pub mod topic;
pub mod transport;

pub use alerts::{AlertPolicy, SensorAlert};
pub use client::{
	BrokerConfig, ClientSettings, ConnectError, Credentials, PublishError,
	SyncClient, SyncConfig, SyncError,
};
pub use codec::{
	ConfigUpdate, DecodeError, EncodeError, JsonCodec, LiteralCodec,
	PayloadCodec, RelayCommand, SensorReport,
};
pub use connection::{ConnectionManager, ConnectionStatus};
pub use routing::{DispatchOutcome, RouterError, TopicRouter};
pub use state::{
	Celsius, DeviceConfig, DeviceSnapshot, DeviceState, Lux, Percent,
	RelayStatus, SensorReadings,
};
pub use topic::{Topic, TopicSet};
pub use transport::{MemoryBroker, RumqttTransport, Transport, TransportError};

pub use rumqttc::QoS;

/// Result type alias for operations that may fail with [`SyncError`]
pub type Result<T> = std::result::Result<T, SyncError>;

/// Prelude module for convenient imports
///
/// ```rust
/// use smartplug_sync::prelude::*;
/// ```
pub mod prelude {
	//! Essential types for most applications

	pub use crate::{
		AlertPolicy, ConnectionStatus, DeviceConfig, DeviceState,
		RelayCommand, RelayStatus, SyncClient, SyncConfig, SyncError, Topic,
	};
}

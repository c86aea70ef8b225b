//! Synchronization client
//!
//! Configuration, error types, the background publisher and the
//! [`SyncClient`] facade tying them to a connection and a device state.

/// Broker, topic and timing configuration
pub mod config;
/// Client error types
pub mod error;
/// Fire-and-forget outbound publishing
pub mod publisher;
pub mod sync_client;

pub use config::{BrokerConfig, ClientSettings, Credentials, SyncConfig};
pub use error::{ConnectError, PublishError, SyncError};
pub use publisher::{OutboundRequest, Publisher};
pub use sync_client::{SyncClient, bind_router};

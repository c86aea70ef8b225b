//! End-to-end tests of the sync client against the in-process broker.
//!
//! All tests run on a paused clock, so timeouts, the publish grace interval
//! and reconnect backoff elapse instantly once every task is idle.

use std::time::Duration;

use rumqttc::QoS;
use smartplug_sync::transport::PublishedMessage;
use smartplug_sync::{
	BrokerConfig, Celsius, ConnectError, ConnectionStatus, DeviceConfig,
	Lux, MemoryBroker, Percent, RelayCommand, RelayStatus, SyncClient,
	SyncConfig, Topic, TopicSet,
};
use tokio::sync::watch;
use tokio::time;

fn broker_config() -> BrokerConfig {
	BrokerConfig::new("memory.local", 1883)
}

fn sync_config() -> SyncConfig {
	SyncConfig::new(broker_config(), TopicSet::under("plug"))
}

fn client_for(broker: &MemoryBroker) -> SyncClient<MemoryBroker> {
	SyncClient::with_transport(sync_config(), broker.clone()).unwrap()
}

/// Lets background tasks run until they are idle.
async fn settle() {
	time::sleep(Duration::from_millis(50)).await;
}

async fn wait_for_status(
	status: &mut watch::Receiver<ConnectionStatus>,
	expected: ConnectionStatus,
) {
	time::timeout(Duration::from_secs(300), status.wait_for(|s| *s == expected))
		.await
		.expect("status not reached in time")
		.expect("status channel closed");
}

#[tokio::test(start_paused = true)]
async fn test_retained_messages_rebuild_state() {
	let broker = MemoryBroker::new();
	broker.retain("plug/status", "ON");
	broker.retain(
		"plug/sensors",
		r#"{"temperatura": 22.5, "humedad": 40, "luz": 300}"#,
	);
	broker.retain(
		"plug/config",
		r#"{"auto_luz": true, "auto_temp": false, "luz_umbral": 400, "temp_min": 20, "temp_max": 28, "timer": 10}"#,
	);

	let client = client_for(&broker);
	client.connect().await.unwrap();
	assert!(client.is_connected());
	settle().await;

	let state = client.state();
	assert_eq!(state.relay(), RelayStatus::On);
	assert_eq!(state.temperature(), Some(Celsius(22.5)));
	assert_eq!(state.humidity(), Some(Percent(40.0)));
	assert_eq!(state.light(), Some(Lux(300)));
	assert_eq!(state.config(), DeviceConfig {
		auto_light: true,
		auto_temp: false,
		light_threshold: 400,
		temp_min: 20,
		temp_max: 28,
		timer_minutes: 10,
	});

	assert!(broker.is_subscribed("plug/status"));
	assert!(broker.is_subscribed("plug/sensors"));
	assert!(broker.is_subscribed("plug/config"));
	assert!(!broker.is_subscribed("plug/control"));
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_make_one_attempt() {
	let broker = MemoryBroker::new();
	broker.set_connect_delay(Duration::from_millis(200));
	let client = client_for(&broker);

	let (first, second) = tokio::join!(client.connect(), client.connect());
	assert!(first.is_ok());
	assert!(second.is_ok());
	assert!(client.is_connected());
	assert_eq!(broker.connect_attempts(), 1);

	client.connect().await.unwrap();
	assert_eq!(broker.connect_attempts(), 1);
	assert_eq!(broker.online_sessions(), 1);
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_without_connect_is_noop() {
	let broker = MemoryBroker::new();
	let client = client_for(&broker);

	client.disconnect().await;
	client.disconnect().await;
	assert_eq!(client.status(), ConnectionStatus::Disconnected);
	assert_eq!(broker.connect_attempts(), 0);
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_closes_session() {
	let broker = MemoryBroker::new();
	let client = client_for(&broker);
	client.connect().await.unwrap();
	assert_eq!(broker.online_sessions(), 1);

	client.disconnect().await;
	assert_eq!(client.status(), ConnectionStatus::Disconnected);
	assert_eq!(broker.online_sessions(), 0);

	broker.inject("plug/status", "ON");
	settle().await;
	assert_eq!(client.state().relay(), RelayStatus::Unknown);
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_each_attempt_uses_fresh_client_id() {
	let broker = MemoryBroker::new();
	let client = client_for(&broker);
	client.connect().await.unwrap();
	client.disconnect().await;
	client.connect().await.unwrap();

	let ids = broker.client_ids();
	assert_eq!(ids.len(), 2);
	assert_ne!(ids[0], ids[1]);
	assert!(ids.iter().all(|id| id.starts_with("smartplug-")));
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_can_be_retried() {
	let broker = MemoryBroker::new();
	broker.set_reachable(false);
	let client = client_for(&broker);

	let err = client.connect().await.unwrap_err();
	assert!(matches!(err, ConnectError::Network(_)), "got {err:?}");
	assert_eq!(client.status(), ConnectionStatus::Disconnected);

	broker.set_reachable(true);
	client.connect().await.unwrap();
	assert!(client.is_connected());
	assert_eq!(broker.connect_attempts(), 2);
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credentials() {
	let broker = MemoryBroker::new();
	broker.require_credentials("alice", "s3cret");

	let client = client_for(&broker);
	let err = client.connect().await.unwrap_err();
	assert!(matches!(err, ConnectError::Rejected { .. }), "got {err:?}");
	assert_eq!(client.status(), ConnectionStatus::Disconnected);
	client.shutdown().await;

	let config = SyncConfig::new(
		broker_config().with_credentials("alice", "s3cret"),
		TopicSet::under("plug"),
	);
	let client = SyncClient::with_transport(config, broker.clone()).unwrap();
	client.connect().await.unwrap();
	assert!(client.is_connected());
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_times_out() {
	let broker = MemoryBroker::new();
	broker.set_connect_delay(Duration::from_secs(10));
	let client = client_for(&broker);

	let err = client.connect().await.unwrap_err();
	assert!(
		matches!(err, ConnectError::Timeout { timeout_millis: 5000 }),
		"got {err:?}"
	);
	assert_eq!(client.status(), ConnectionStatus::Disconnected);
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_connect() {
	let broker = MemoryBroker::new();
	broker.set_connect_delay(Duration::from_secs(1));
	let client = client_for(&broker);

	let manager = client.connection().clone();
	let config = broker_config();
	let pending = tokio::spawn(async move { manager.connect(&config).await });
	time::sleep(Duration::from_millis(100)).await;
	assert_eq!(client.status(), ConnectionStatus::Connecting);

	client.disconnect().await;
	let res = pending.await.unwrap();
	assert!(matches!(res, Err(ConnectError::Cancelled)), "got {res:?}");
	assert_eq!(client.status(), ConnectionStatus::Disconnected);
	assert_eq!(broker.online_sessions(), 0);
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lost_session_resubscribes() {
	let broker = MemoryBroker::new();
	let client = client_for(&broker);
	client.connect().await.unwrap();
	let mut status = client.watch_status();

	broker.drop_connections();
	wait_for_status(&mut status, ConnectionStatus::Reconnecting).await;
	assert!(!client.is_connected());

	broker.retain("plug/status", "ON");
	wait_for_status(&mut status, ConnectionStatus::Connected).await;
	settle().await;
	assert!(broker.is_subscribed("plug/sensors"));
	assert_eq!(broker.connect_attempts(), 2);
	assert_eq!(client.state().relay(), RelayStatus::On);

	broker.inject("plug/status", "OFF");
	settle().await;
	assert_eq!(client.state().relay(), RelayStatus::Off);
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_long_outage_recovers_without_intervention() {
	let broker = MemoryBroker::new();
	let client = client_for(&broker);
	client.connect().await.unwrap();
	let mut status = client.watch_status();

	broker.set_reachable(false);
	broker.drop_connections();
	wait_for_status(&mut status, ConnectionStatus::Reconnecting).await;
	time::sleep(Duration::from_secs(90)).await;
	assert_eq!(client.status(), ConnectionStatus::Reconnecting);
	assert!(broker.connect_attempts() > 10);

	broker.set_reachable(true);
	wait_for_status(&mut status, ConnectionStatus::Connected).await;
	settle().await;
	broker.inject("plug/status", "ON");
	settle().await;
	assert_eq!(client.state().relay(), RelayStatus::On);
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ignored_connect_keeps_previous_config() {
	let broker = MemoryBroker::new();
	broker.require_credentials("alice", "s3cret");
	let config = SyncConfig::new(
		broker_config().with_credentials("alice", "s3cret"),
		TopicSet::under("plug"),
	);
	let client = SyncClient::with_transport(config, broker.clone()).unwrap();
	client.connect().await.unwrap();

	let manager = client.connection();
	let wrong = broker_config().with_credentials("alice", "wrong");
	manager.connect(&wrong).await.unwrap();
	assert_eq!(broker.connect_attempts(), 1);

	manager.disconnect().await;
	manager.reconnect().await.unwrap();
	assert!(client.is_connected());
	assert_eq!(broker.connect_attempts(), 2);
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_pending_send() {
	let broker = MemoryBroker::new();
	let client = client_for(&broker);
	client.connect().await.unwrap();
	client.disconnect().await;
	broker.set_connect_delay(Duration::from_secs(1));

	client.send_control(RelayCommand::On).unwrap();
	time::sleep(Duration::from_millis(500)).await;
	assert_eq!(client.status(), ConnectionStatus::Connecting);

	client.disconnect().await;
	assert_eq!(client.status(), ConnectionStatus::Disconnected);
	time::sleep(Duration::from_secs(3)).await;

	assert_eq!(client.status(), ConnectionStatus::Disconnected);
	assert!(broker.published().is_empty());
	assert_eq!(broker.online_sessions(), 0);
	assert_eq!(broker.connect_attempts(), 2);
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_session_abandoned_after_configured_error_limit() {
	let broker = MemoryBroker::new();
	let mut config = sync_config();
	config.settings.max_consecutive_errors = Some(3);
	let client = SyncClient::with_transport(config, broker.clone()).unwrap();
	client.connect().await.unwrap();
	let mut status = client.watch_status();

	broker.set_reachable(false);
	broker.drop_connections();
	wait_for_status(&mut status, ConnectionStatus::Disconnected).await;

	broker.set_reachable(true);
	client.connect().await.unwrap();
	assert!(client.is_connected());
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_send_is_retained_at_least_once() {
	let broker = MemoryBroker::new();
	let client = client_for(&broker);
	client.connect().await.unwrap();

	client.send_control(RelayCommand::On).unwrap();
	settle().await;

	assert_eq!(broker.published(), vec![PublishedMessage {
		topic: "plug/control".to_owned(),
		qos: QoS::AtLeastOnce,
		retain: true,
		payload: "ON".into(),
	}]);
	assert_eq!(broker.retained("plug/control").as_deref(), Some(&b"ON"[..]));
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_config_write_is_echoed_into_state() {
	let broker = MemoryBroker::new();
	let client = client_for(&broker);
	client.connect().await.unwrap();

	let config = DeviceConfig {
		auto_light: true,
		timer_minutes: 45,
		..DeviceConfig::default()
	};
	client.send_config(&config).unwrap();
	settle().await;

	let published = broker.published();
	assert_eq!(published.len(), 1);
	let json: serde_json::Value =
		serde_json::from_slice(&published[0].payload).unwrap();
	let keys: Vec<&str> =
		json.as_object().unwrap().keys().map(String::as_str).collect();
	assert_eq!(keys.len(), 6);
	for key in ["auto_luz", "auto_temp", "luz_umbral", "temp_min", "temp_max", "timer"] {
		assert!(keys.contains(&key), "missing {key}");
	}
	assert_eq!(client.state().config(), config);
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_send_while_disconnected_reconnects_first() {
	let broker = MemoryBroker::new();
	let client = client_for(&broker);
	client.connect().await.unwrap();
	client.disconnect().await;

	client.send(&b"OFF"[..], Topic::Control).unwrap();
	settle().await;

	assert!(client.is_connected());
	assert_eq!(broker.connect_attempts(), 2);
	let published = broker.published();
	assert_eq!(published.len(), 1);
	assert_eq!(published[0].payload.as_ref(), b"OFF");
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_send_dropped_when_reconnect_fails() {
	let broker = MemoryBroker::new();
	let client = client_for(&broker);
	client.connect().await.unwrap();
	client.disconnect().await;
	broker.set_reachable(false);

	client.send_control(RelayCommand::On).unwrap();
	time::sleep(Duration::from_secs(2)).await;
	assert_eq!(broker.connect_attempts(), 2);
	assert!(broker.published().is_empty());
	assert_eq!(client.status(), ConnectionStatus::Disconnected);

	// No retries once the message is dropped.
	broker.set_reachable(true);
	time::sleep(Duration::from_secs(30)).await;
	assert_eq!(broker.connect_attempts(), 2);
	assert!(broker.published().is_empty());
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_send_before_any_connect_is_dropped() {
	let broker = MemoryBroker::new();
	let client = client_for(&broker);

	client.send_control(RelayCommand::On).unwrap();
	time::sleep(Duration::from_secs(2)).await;
	assert_eq!(broker.connect_attempts(), 0);
	assert!(broker.published().is_empty());
	client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_does_not_stop_dispatch() {
	let broker = MemoryBroker::new();
	let client = client_for(&broker);
	client.connect().await.unwrap();

	broker.inject("plug/sensors", r#"{"temperatura": 36.5}"#);
	broker.inject("plug/sensors", "{temp:}");
	broker.inject("plug/sensors", r#"{"humedad": "wet"}"#);
	broker.inject("plug/status", "ON");
	settle().await;

	let state = client.state();
	assert_eq!(state.temperature(), Some(Celsius(36.5)));
	assert_eq!(state.humidity(), None);
	assert_eq!(state.relay(), RelayStatus::On);
	assert!(client.is_connected());
	client.shutdown().await;
}

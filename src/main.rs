//! Console front end: mirrors the plug state to the log and reads commands
//! from stdin.
//!
//! ```bash
//! MQTT_BROKER=mqtt://broker.local:1883 RUST_LOG=info cargo run
//! ```
//!
//! Commands: `on`, `off`, `status`, `config key=value ...`, `connect`,
//! `disconnect`, `quit`.

use smartplug_sync::prelude::*;
use smartplug_sync::{DeviceSnapshot, SensorAlert};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Logs to stderr. `RUST_LOG` wins; otherwise `info`.
fn setup_tracing() {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| "info".into());
	tracing_subscriber::registry()
		.with(filter)
		.with(
			tracing_subscriber::fmt::layer()
				.with_target(true)
				.with_thread_ids(false)
				.with_file(false)
				.with_line_number(false)
				.with_writer(std::io::stderr)
				.compact(),
		)
		.init();
}

fn describe(snapshot: &DeviceSnapshot) -> String {
	let sensors = &snapshot.sensors;
	let or_dash = |value: Option<String>| value.unwrap_or_else(|| "-".to_owned());
	format!(
		"relay={} temperature={} humidity={} light={} config={:?}",
		snapshot.relay,
		or_dash(sensors.temperature.map(|c| c.to_string())),
		or_dash(sensors.humidity.map(|p| p.to_string())),
		or_dash(sensors.light.map(|l| l.to_string())),
		snapshot.config,
	)
}

/// Applies `key=value` pairs to `config`. Keys use the wire names.
fn edit_config(mut config: DeviceConfig, args: &[&str]) -> Result<DeviceConfig, String> {
	for arg in args {
		let (key, value) = arg
			.split_once('=')
			.ok_or_else(|| format!("expected key=value, got '{arg}'"))?;
		let invalid = || format!("invalid value for {key}: '{value}'");
		match key {
			| "auto_luz" => config.auto_light = value.parse().map_err(|_| invalid())?,
			| "auto_temp" => config.auto_temp = value.parse().map_err(|_| invalid())?,
			| "luz_umbral" => {
				config.light_threshold = value.parse().map_err(|_| invalid())?
			}
			| "temp_min" => config.temp_min = value.parse().map_err(|_| invalid())?,
			| "temp_max" => config.temp_max = value.parse().map_err(|_| invalid())?,
			| "timer" => config.timer_minutes = value.parse().map_err(|_| invalid())?,
			| other => return Err(format!("unknown config key '{other}'")),
		}
	}
	Ok(config)
}

async fn handle_command(client: &SyncClient, line: &str) -> bool {
	let words: Vec<&str> = line.split_whitespace().collect();
	let Some((command, args)) = words.split_first() else {
		return true;
	};
	let sent = match *command {
		| "on" => client.send_control(RelayCommand::On),
		| "off" => client.send_control(RelayCommand::Off),
		| "config" => match edit_config(client.state().config(), args) {
			| Ok(config) => client.send_config(&config),
			| Err(message) => {
				warn!("{message}");
				Ok(())
			}
		},
		| "status" => {
			info!(connection = ?client.status(), "{}", describe(&client.state().snapshot()));
			Ok(())
		}
		| "connect" => {
			if let Err(err) = client.connect().await {
				error!(error = %err, "Connect failed");
			}
			Ok(())
		}
		| "disconnect" => {
			client.disconnect().await;
			Ok(())
		}
		| "quit" | "exit" => return false,
		| other => {
			warn!(command = %other, "Unknown command");
			Ok(())
		}
	};
	if let Err(err) = sent {
		error!(error = %err, "Send failed");
	}
	true
}

#[tokio::main]
async fn main() -> smartplug_sync::Result<()> {
	let config = SyncConfig::from_env()?;
	setup_tracing();

	let client = SyncClient::new(config)?;
	if let Err(err) = client.connect().await {
		error!(error = %err, "Initial connection failed, use 'connect' to retry");
	}

	let mut changes = client.state().subscribe();
	let watcher = tokio::spawn(async move {
		let policy = AlertPolicy::default();
		let mut active: Vec<SensorAlert> = Vec::new();
		while changes.changed().await.is_ok() {
			let snapshot = *changes.borrow_and_update();
			info!("{}", describe(&snapshot));
			let alerts = policy.check(&snapshot);
			for alert in alerts
				.iter()
				.filter(|a| !active.iter().any(|b| b.is_same_kind(a)))
			{
				warn!(alert = %alert, "Sensor alert");
			}
			active = alerts;
		}
	});

	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	loop {
		match lines.next_line().await {
			| Ok(Some(line)) => {
				if !handle_command(&client, line.trim()).await {
					break;
				}
			}
			| Ok(None) => break,
			| Err(err) => {
				error!(error = %err, "Failed to read stdin");
				break;
			}
		}
	}

	client.shutdown().await;
	watcher.abort();
	Ok(())
}

//! Mirrored device state.
//!
//! [`DeviceState`] is the local reconstruction of the plug's relay, sensor
//! readings and configuration. It is rebuilt from retained messages after
//! every connection and only ever changed by decoded inbound payloads.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::codec::{ConfigUpdate, RelayCommand, SensorReport};

/// Last known relay position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RelayStatus {
	On,
	Off,
	/// No status message received yet
	#[default]
	Unknown,
}

impl RelayStatus {
	pub fn is_on(self) -> bool {
		self == RelayStatus::On
	}
}

impl From<RelayCommand> for RelayStatus {
	fn from(command: RelayCommand) -> Self {
		match command {
			| RelayCommand::On => RelayStatus::On,
			| RelayCommand::Off => RelayStatus::Off,
		}
	}
}

impl Display for RelayStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			| RelayStatus::On => "ON",
			| RelayStatus::Off => "OFF",
			| RelayStatus::Unknown => "UNKNOWN",
		})
	}
}

/// Rounds to `decimals` places with ties away from zero. `{:.N}` alone
/// rounds ties to even.
fn round_half_up(value: f64, decimals: i32) -> f64 {
	let scale = 10_f64.powi(decimals);
	(value * scale).round() / scale
}

/// Temperature in degrees Celsius. Displays with one decimal.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct Celsius(pub f64);

impl Display for Celsius {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:.1}°C", round_half_up(self.0, 1))
	}
}

/// Relative humidity in percent. Displays without decimals.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct Percent(pub f64);

impl Display for Percent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:.0}%", round_half_up(self.0, 0))
	}
}

/// Illuminance in lux.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lux(pub u32);

impl Display for Lux {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} lx", self.0)
	}
}

/// Sensor readings; `None` until the first report carrying the key.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SensorReadings {
	pub temperature: Option<Celsius>,
	pub humidity: Option<Percent>,
	pub light: Option<Lux>,
}

/// Automation settings shared with the device over the config topic.
///
/// Serializes with the wire key names, always emitting all six keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
	#[serde(rename = "auto_luz")]
	pub auto_light: bool,
	#[serde(rename = "auto_temp")]
	pub auto_temp: bool,
	#[serde(rename = "luz_umbral")]
	pub light_threshold: i32,
	pub temp_min: i32,
	pub temp_max: i32,
	#[serde(rename = "timer")]
	pub timer_minutes: i32,
}

impl Default for DeviceConfig {
	fn default() -> Self {
		Self {
			auto_light: false,
			auto_temp: false,
			light_threshold: 500,
			temp_min: 25,
			temp_max: 30,
			timer_minutes: 0,
		}
	}
}

/// Point-in-time copy of the whole mirrored state.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DeviceSnapshot {
	pub relay: RelayStatus,
	pub sensors: SensorReadings,
	pub config: DeviceConfig,
}

/// Shared, observable handle to the mirrored state.
///
/// Cloning is cheap; all clones observe the same state. Each inbound
/// message is applied in a single atomic step, so readers never see a
/// half-applied update. Mutation is reserved to the synchronization core.
#[derive(Clone, Debug)]
pub struct DeviceState {
	inner: std::sync::Arc<watch::Sender<DeviceSnapshot>>,
}

impl Default for DeviceState {
	fn default() -> Self {
		Self::new()
	}
}

impl DeviceState {
	pub fn new() -> Self {
		Self::with_snapshot(DeviceSnapshot::default())
	}

	/// Starts from a known snapshot instead of the defaults.
	pub fn with_snapshot(snapshot: DeviceSnapshot) -> Self {
		let (tx, _) = watch::channel(snapshot);
		Self {
			inner: std::sync::Arc::new(tx),
		}
	}

	pub fn snapshot(&self) -> DeviceSnapshot {
		*self.inner.borrow()
	}

	/// Change notifications; the receiver always holds the latest snapshot.
	pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
		self.inner.subscribe()
	}

	pub fn relay(&self) -> RelayStatus {
		self.inner.borrow().relay
	}

	pub fn temperature(&self) -> Option<Celsius> {
		self.inner.borrow().sensors.temperature
	}

	pub fn humidity(&self) -> Option<Percent> {
		self.inner.borrow().sensors.humidity
	}

	pub fn light(&self) -> Option<Lux> {
		self.inner.borrow().sensors.light
	}

	pub fn config(&self) -> DeviceConfig {
		self.inner.borrow().config
	}

	pub(crate) fn apply_relay(&self, status: RelayStatus) {
		self.inner.send_if_modified(|snapshot| {
			let changed = snapshot.relay != status;
			snapshot.relay = status;
			changed
		});
	}

	pub(crate) fn apply_sensors(&self, report: &SensorReport) {
		self.inner.send_if_modified(|snapshot| {
			let before = snapshot.sensors;
			report.apply_to(&mut snapshot.sensors);
			before != snapshot.sensors
		});
	}

	pub(crate) fn apply_config(&self, update: &ConfigUpdate) {
		self.inner.send_if_modified(|snapshot| {
			let merged = update.merged_with(&snapshot.config);
			let changed = merged != snapshot.config;
			snapshot.config = merged;
			changed
		});
	}
}

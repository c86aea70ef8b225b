//! Payload codecs for the three wire shapes.
//!
//! Control and status topics carry the bare literals `ON` / `OFF`. Sensor
//! reports and configuration travel as JSON objects whose keys are all
//! optional on the way in; decoding never invents values for missing keys.

use std::fmt::{self, Display};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::state::{Celsius, DeviceConfig, Lux, Percent, SensorReadings};

/// Errors raised while decoding an inbound payload.
#[derive(Debug, Error)]
pub enum DecodeError {
	/// Payload is not valid JSON or does not fit the expected shape
	#[error("Malformed JSON payload: {0}")]
	Json(#[from] serde_json::Error),

	/// Literal payload is not valid UTF-8
	#[error("Payload is not valid UTF-8: {0}")]
	Utf8(#[from] std::str::Utf8Error),

	/// Literal payload is neither `ON` nor `OFF`
	#[error("Unrecognized literal '{0}'")]
	UnrecognizedLiteral(String),
}

/// Errors raised while encoding an outbound payload.
#[derive(Debug, Error)]
#[error("Failed to encode payload: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Converts between typed payloads and wire bytes.
///
/// Implemented by [`LiteralCodec`] for relay commands and by [`JsonCodec`]
/// for every serde-compatible shape.
pub trait PayloadCodec<T>: Default + Clone + Send + Sync + 'static {
	/// Convert a value to bytes for publishing
	fn encode(&self, value: &T) -> Result<Vec<u8>, EncodeError>;
	/// Convert received bytes into a value
	fn decode(&self, bytes: &[u8]) -> Result<T, DecodeError>;
}

/// JSON codec backed by `serde_json`. Only JSON objects decode; arrays
/// and scalars are rejected even where serde would accept them.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl<T> PayloadCodec<T> for JsonCodec
where T: Serialize + DeserializeOwned + 'static
{
	fn encode(&self, value: &T) -> Result<Vec<u8>, EncodeError> {
		Ok(serde_json::to_vec(value)?)
	}

	fn decode(&self, bytes: &[u8]) -> Result<T, DecodeError> {
		let object: Map<String, Value> = serde_json::from_slice(bytes)?;
		Ok(T::deserialize(Value::Object(object))?)
	}
}

/// Plain-text codec for the `ON` / `OFF` relay literals.
#[derive(Clone, Copy, Debug, Default)]
pub struct LiteralCodec;

impl PayloadCodec<RelayCommand> for LiteralCodec {
	fn encode(&self, value: &RelayCommand) -> Result<Vec<u8>, EncodeError> {
		Ok(value.as_literal().as_bytes().to_vec())
	}

	fn decode(&self, bytes: &[u8]) -> Result<RelayCommand, DecodeError> {
		let text = std::str::from_utf8(bytes)?.trim();
		match text {
			| "ON" => Ok(RelayCommand::On),
			| "OFF" => Ok(RelayCommand::Off),
			| other => Err(DecodeError::UnrecognizedLiteral(other.to_owned())),
		}
	}
}

/// Relay switch position as carried on the control and status topics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelayCommand {
	/// Relay closed, outlet powered
	On,
	/// Relay open
	Off,
}

impl RelayCommand {
	/// Wire literal for this command.
	pub fn as_literal(self) -> &'static str {
		match self {
			| RelayCommand::On => "ON",
			| RelayCommand::Off => "OFF",
		}
	}
}

impl From<bool> for RelayCommand {
	fn from(on: bool) -> Self {
		if on { RelayCommand::On } else { RelayCommand::Off }
	}
}

impl Display for RelayCommand {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_literal())
	}
}

/// Decodes a status payload.
///
/// Unknown literals are not an error: they yield `Ok(None)` and the caller
/// leaves its state alone.
pub fn decode_relay_status(
	bytes: &[u8],
) -> Result<Option<RelayCommand>, DecodeError> {
	match LiteralCodec.decode(bytes) {
		| Ok(command) => Ok(Some(command)),
		| Err(DecodeError::UnrecognizedLiteral(_)) => Ok(None),
		| Err(err) => Err(err),
	}
}

/// Sensor report as published by the device. Every key is optional.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReport {
	#[serde(rename = "temperatura", default, skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(rename = "humedad", default, skip_serializing_if = "Option::is_none")]
	pub humidity: Option<f64>,
	#[serde(rename = "luz", default, skip_serializing_if = "Option::is_none")]
	pub light: Option<f64>,
}

impl SensorReport {
	/// Light level in lux, or `None` when absent, negative or not finite.
	pub fn light_lux(&self) -> Option<Lux> {
		self.light
			.filter(|lux| lux.is_finite() && *lux >= 0.0)
			.map(|lux| Lux(lux.trunc().min(f64::from(u32::MAX)) as u32))
	}

	/// Writes the present readings into `readings`, leaving the rest as they
	/// were.
	pub fn apply_to(&self, readings: &mut SensorReadings) {
		if let Some(celsius) = self.temperature.filter(|v| v.is_finite()) {
			readings.temperature = Some(Celsius(celsius));
		}
		if let Some(percent) = self.humidity.filter(|v| v.is_finite()) {
			readings.humidity = Some(Percent(percent));
		}
		if let Some(lux) = self.light_lux() {
			readings.light = Some(lux);
		}
	}
}

/// Partial configuration update as received on the config topic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
	#[serde(rename = "auto_luz", default, skip_serializing_if = "Option::is_none")]
	pub auto_light: Option<bool>,
	#[serde(rename = "auto_temp", default, skip_serializing_if = "Option::is_none")]
	pub auto_temp: Option<bool>,
	#[serde(rename = "luz_umbral", default, skip_serializing_if = "Option::is_none")]
	pub light_threshold: Option<i32>,
	#[serde(rename = "temp_min", default, skip_serializing_if = "Option::is_none")]
	pub temp_min: Option<i32>,
	#[serde(rename = "temp_max", default, skip_serializing_if = "Option::is_none")]
	pub temp_max: Option<i32>,
	#[serde(rename = "timer", default, skip_serializing_if = "Option::is_none")]
	pub timer_minutes: Option<i32>,
}

impl ConfigUpdate {
	/// Returns `current` with every key present in this update replaced.
	pub fn merged_with(&self, current: &DeviceConfig) -> DeviceConfig {
		DeviceConfig {
			auto_light: self.auto_light.unwrap_or(current.auto_light),
			auto_temp: self.auto_temp.unwrap_or(current.auto_temp),
			light_threshold: self
				.light_threshold
				.unwrap_or(current.light_threshold),
			temp_min: self.temp_min.unwrap_or(current.temp_min),
			temp_max: self.temp_max.unwrap_or(current.temp_max),
			timer_minutes: self.timer_minutes.unwrap_or(current.timer_minutes),
		}
	}
}

impl From<&DeviceConfig> for ConfigUpdate {
	fn from(config: &DeviceConfig) -> Self {
		Self {
			auto_light: Some(config.auto_light),
			auto_temp: Some(config.auto_temp),
			light_threshold: Some(config.light_threshold),
			temp_min: Some(config.temp_min),
			temp_max: Some(config.temp_max),
			timer_minutes: Some(config.timer_minutes),
		}
	}
}

/// Encodes a full configuration; all six keys are always present.
pub fn encode_config(config: &DeviceConfig) -> Result<Vec<u8>, EncodeError> {
	JsonCodec.encode(config)
}

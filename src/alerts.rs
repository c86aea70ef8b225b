//! Threshold alerts over a state snapshot.

use std::fmt::{self, Display};

use crate::state::{Celsius, DeviceSnapshot, Percent};

/// Alert raised by [`AlertPolicy::check`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SensorAlert {
	HighTemperature(Celsius),
	LowHumidity(Percent),
}

impl SensorAlert {
	/// Same condition, regardless of the reading that raised it.
	pub fn is_same_kind(&self, other: &SensorAlert) -> bool {
		std::mem::discriminant(self) == std::mem::discriminant(other)
	}
}

impl Display for SensorAlert {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			| SensorAlert::HighTemperature(celsius) => {
				write!(f, "High temperature: {celsius}")
			}
			| SensorAlert::LowHumidity(percent) => {
				write!(f, "Low humidity: {percent}")
			}
		}
	}
}

/// Alert thresholds. Both bounds are exclusive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlertPolicy {
	pub max_temperature: f64,
	pub min_humidity: f64,
}

impl Default for AlertPolicy {
	fn default() -> Self {
		Self {
			max_temperature: 35.0,
			min_humidity: 30.0,
		}
	}
}

impl AlertPolicy {
	/// Alerts for `snapshot`. Readings not yet received never alert.
	pub fn check(&self, snapshot: &DeviceSnapshot) -> Vec<SensorAlert> {
		let mut alerts = Vec::new();
		if let Some(celsius) = snapshot
			.sensors
			.temperature
			.filter(|c| c.0 > self.max_temperature)
		{
			alerts.push(SensorAlert::HighTemperature(celsius));
		}
		if let Some(percent) = snapshot
			.sensors
			.humidity
			.filter(|p| p.0 < self.min_humidity)
		{
			alerts.push(SensorAlert::LowHumidity(percent));
		}
		alerts
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::state::SensorReadings;

	fn snapshot(temperature: Option<f64>, humidity: Option<f64>) -> DeviceSnapshot {
		DeviceSnapshot {
			sensors: SensorReadings {
				temperature: temperature.map(Celsius),
				humidity: humidity.map(Percent),
				light: None,
			},
			..DeviceSnapshot::default()
		}
	}

	#[test]
	fn test_no_readings_no_alerts() {
		assert!(AlertPolicy::default().check(&DeviceSnapshot::default()).is_empty());
	}

	#[test]
	fn test_thresholds_are_exclusive() {
		let policy = AlertPolicy::default();
		assert!(policy.check(&snapshot(Some(35.0), Some(30.0))).is_empty());
		assert_eq!(policy.check(&snapshot(Some(36.5), Some(40.0))), vec![
			SensorAlert::HighTemperature(Celsius(36.5))
		]);
	}

	#[test]
	fn test_alert_kind_ignores_reading() {
		let hot = SensorAlert::HighTemperature(Celsius(36.5));
		assert!(hot.is_same_kind(&SensorAlert::HighTemperature(Celsius(36.6))));
		assert!(!hot.is_same_kind(&SensorAlert::LowHumidity(Percent(20.0))));
	}

	#[test]
	fn test_both_alerts() {
		let alerts = AlertPolicy::default().check(&snapshot(Some(40.0), Some(12.0)));
		assert_eq!(alerts.len(), 2);
		assert_eq!(alerts[1].to_string(), "Low humidity: 12%");
		assert_eq!(alerts[0].to_string(), "High temperature: 40.0°C");
	}
}

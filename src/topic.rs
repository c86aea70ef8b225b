//! Topic names used by the plug.
//!
//! The device speaks on four fixed topics. [`TopicSet`] maps the logical
//! [`Topic`] to the concrete, namespaced name on the broker.

use std::fmt::{self, Display};

use arcstr::ArcStr;

use crate::routing::RouterError;

/// Maximum topic length allowed by MQTT.
pub const MAX_TOPIC_LENGTH: usize = 65535;

/// Logical topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
	/// Relay commands sent to the device
	Control,
	/// Relay position reported by the device
	Status,
	/// Sensor reports
	Sensors,
	/// Automation settings, written by us and echoed back retained
	Config,
}

impl Topic {
	pub const ALL: [Topic; 4] =
		[Topic::Control, Topic::Status, Topic::Sensors, Topic::Config];
}

impl Display for Topic {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			| Topic::Control => "control",
			| Topic::Status => "status",
			| Topic::Sensors => "sensors",
			| Topic::Config => "config",
		})
	}
}

/// Concrete topic names for one device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicSet {
	pub control: ArcStr,
	pub status: ArcStr,
	pub sensors: ArcStr,
	pub config: ArcStr,
}

impl TopicSet {
	/// Topics `<prefix>/control`, `<prefix>/status`, `<prefix>/sensors` and
	/// `<prefix>/config`.
	pub fn under(prefix: &str) -> Self {
		let prefix = prefix.trim_end_matches('/');
		let name = |topic: Topic| -> ArcStr {
			if prefix.is_empty() {
				arcstr::format!("{topic}")
			} else {
				arcstr::format!("{prefix}/{topic}")
			}
		};
		Self {
			control: name(Topic::Control),
			status: name(Topic::Status),
			sensors: name(Topic::Sensors),
			config: name(Topic::Config),
		}
	}

	/// Hosted feed naming: `<user>/feeds/<group>-dot-<feed>`.
	pub fn feeds(user: &str, group: &str) -> Self {
		let feed = |name: &str| arcstr::format!("{user}/feeds/{group}-dot-{name}");
		Self {
			control: feed("control"),
			status: feed("status"),
			sensors: feed("sensores"),
			config: feed("config"),
		}
	}

	pub fn name(&self, topic: Topic) -> &ArcStr {
		match topic {
			| Topic::Control => &self.control,
			| Topic::Status => &self.status,
			| Topic::Sensors => &self.sensors,
			| Topic::Config => &self.config,
		}
	}

	/// Checks every name with [`validate_topic`].
	pub fn validate(&self) -> Result<(), RouterError> {
		Topic::ALL
			.iter()
			.try_for_each(|topic| validate_topic(self.name(*topic)))
	}
}

impl Default for TopicSet {
	fn default() -> Self {
		Self::under("smartplug")
	}
}

/// Rejects names that cannot be used as an exact publish/subscribe topic.
pub fn validate_topic(topic: &str) -> Result<(), RouterError> {
	if topic.is_empty() || topic.len() > MAX_TOPIC_LENGTH {
		return Err(RouterError::invalid_topic(
			topic,
			"Topic is empty or too long",
		));
	}
	if topic.chars().any(|c| matches!(c, '\0' | '#' | '+')) {
		return Err(RouterError::invalid_topic(
			topic,
			"Topic contains illegal characters ('#', '+', or null byte)",
		));
	}
	Ok(())
}

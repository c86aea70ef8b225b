use arcstr::ArcStr;
use thiserror::Error;

/// Errors raised while building the routing table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
	/// Topic cannot be used as an exact topic name
	#[error("Topic '{topic}' is invalid for routing: {reason}")]
	InvalidTopic { topic: String, reason: String },

	/// A handler is already registered for this topic
	#[error("A handler is already registered for topic '{topic}'")]
	DuplicateHandler { topic: ArcStr },
}

impl RouterError {
	/// Creates a new InvalidTopic error
	pub fn invalid_topic(
		topic: impl Into<String>,
		reason: impl Into<String>,
	) -> Self {
		Self::InvalidTopic {
			topic: topic.into(),
			reason: reason.into(),
		}
	}
}

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use arcstr::ArcStr;
use tracing::{debug, error, warn};

use super::error::RouterError;
use crate::codec::DecodeError;
use crate::topic::validate_topic;

/// Decodes a raw payload and applies it to local state.
pub type MessageHandler =
	Box<dyn Fn(&[u8]) -> Result<(), DecodeError> + Send + Sync>;

/// What happened to a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
	/// Handler decoded and applied the payload
	Applied,
	/// Handler rejected the payload; nothing was applied
	Discarded,
	/// No handler registered for the topic
	Unrouted,
}

/// Exact-match topic table with one handler per topic.
#[derive(Default)]
pub struct TopicRouter {
	handlers: HashMap<ArcStr, MessageHandler>,
}

impl fmt::Debug for TopicRouter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TopicRouter")
			.field("topics", &self.handlers.keys().collect::<Vec<_>>())
			.finish()
	}
}

impl TopicRouter {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers `handler` for the exact topic `topic`.
	///
	/// Wildcard topics and second registrations for the same topic are
	/// rejected.
	pub fn register_handler<F>(
		&mut self,
		topic: impl Into<ArcStr>,
		handler: F,
	) -> Result<(), RouterError>
	where
		F: Fn(&[u8]) -> Result<(), DecodeError> + Send + Sync + 'static,
	{
		let topic = topic.into();
		validate_topic(&topic)?;
		if self.handlers.contains_key(&topic) {
			return Err(RouterError::DuplicateHandler { topic });
		}
		debug!(topic = %topic, "Registered topic handler");
		self.handlers.insert(topic, Box::new(handler));
		Ok(())
	}

	/// Hands `payload` to the handler registered for `topic`.
	///
	/// Decode errors and handler panics are logged here and reported as
	/// [`DispatchOutcome::Discarded`]; they never reach the caller.
	pub fn dispatch(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
		let Some(handler) = self.handlers.get(topic) else {
			debug!(topic = %topic, "No handler for topic, message ignored");
			return DispatchOutcome::Unrouted;
		};
		match panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
			| Ok(Ok(())) => DispatchOutcome::Applied,
			| Ok(Err(err)) => {
				warn!(
					topic = %topic,
					payload_size = payload.len(),
					error = %err,
					"Failed to decode payload, message discarded"
				);
				DispatchOutcome::Discarded
			}
			| Err(_) => {
				error!(topic = %topic, "Topic handler panicked, message discarded");
				DispatchOutcome::Discarded
			}
		}
	}

	/// Topics with a registered handler.
	pub fn topics(&self) -> impl Iterator<Item = &ArcStr> {
		self.handlers.keys()
	}

	pub fn len(&self) -> usize {
		self.handlers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.handlers.is_empty()
	}
}

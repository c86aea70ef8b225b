//! Inbound message routing.
//!
//! A registration table from exact topic names to decode-and-apply
//! handlers, with a single dispatch entry point that contains handler
//! failures so one corrupt feed never disturbs the others.

/// Routing error types
pub mod error;
pub mod topic_router;

pub use error::RouterError;
pub use topic_router::{DispatchOutcome, MessageHandler, TopicRouter};

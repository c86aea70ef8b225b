//! In-process broker.
//!
//! Exact-match topics, retained messages, clean sessions only. Faults can
//! be injected: make the broker unreachable, slow down handshakes, demand
//! credentials or drop every live session at once. Counters expose how many
//! connection attempts were made and what was published.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use rumqttc::QoS;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use super::{
	BrokerClient, EventSource, Initiator, SessionEvent, SessionOptions,
	Transport, TransportError,
};

type EventTx = UnboundedSender<Result<SessionEvent, TransportError>>;
type EventRx = UnboundedReceiver<Result<SessionEvent, TransportError>>;

/// A message accepted by the broker, as published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedMessage {
	pub topic: String,
	pub qos: QoS,
	pub retain: bool,
	pub payload: Bytes,
}

struct SessionLink {
	events: EventTx,
	subscriptions: HashSet<String>,
	online: bool,
}

struct BrokerInner {
	reachable: bool,
	connect_delay: Duration,
	credentials: Option<(String, String)>,
	retained: HashMap<String, Bytes>,
	sessions: HashMap<u64, SessionLink>,
	next_session: u64,
	client_ids: Vec<String>,
	published: Vec<PublishedMessage>,
}

impl Default for BrokerInner {
	fn default() -> Self {
		Self {
			reachable: true,
			connect_delay: Duration::ZERO,
			credentials: None,
			retained: HashMap::new(),
			sessions: HashMap::new(),
			next_session: 0,
			client_ids: Vec::new(),
			published: Vec::new(),
		}
	}
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
	inner: Arc<Mutex<BrokerInner>>,
}

impl MemoryBroker {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, BrokerInner> {
		self.inner
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// Only connections presenting these credentials are accepted.
	pub fn require_credentials(
		&self,
		username: impl Into<String>,
		password: impl Into<String>,
	) {
		self.lock().credentials = Some((username.into(), password.into()));
	}

	/// Unreachable brokers fail new connection attempts. Live sessions are
	/// not affected; see [`MemoryBroker::drop_connections`].
	pub fn set_reachable(&self, reachable: bool) {
		self.lock().reachable = reachable;
	}

	/// Delay applied to every connection handshake.
	pub fn set_connect_delay(&self, delay: Duration) {
		self.lock().connect_delay = delay;
	}

	/// Severs every live session as if the network went down.
	pub fn drop_connections(&self) {
		let mut inner = self.lock();
		for link in inner.sessions.values_mut().filter(|link| link.online) {
			link.online = false;
			link.subscriptions.clear();
			let _ = link.events.send(Err(TransportError::Connection(
				"connection reset by broker".to_owned(),
			)));
		}
	}

	/// Stores a retained message as if another client had published it.
	pub fn retain(&self, topic: impl Into<String>, payload: impl Into<Bytes>) {
		let mut inner = self.lock();
		inner.accept(PublishedMessage {
			topic: topic.into(),
			qos: QoS::AtLeastOnce,
			retain: true,
			payload: payload.into(),
		});
	}

	/// Publishes to current subscribers without retaining, as another client.
	pub fn inject(&self, topic: impl Into<String>, payload: impl Into<Bytes>) {
		let mut inner = self.lock();
		inner.route(&topic.into(), &payload.into());
	}

	pub fn retained(&self, topic: &str) -> Option<Bytes> {
		self.lock().retained.get(topic).cloned()
	}

	/// Number of connection handshakes attempted so far.
	pub fn connect_attempts(&self) -> usize {
		self.lock().client_ids.len()
	}

	/// Client ids presented by each attempt, oldest first.
	pub fn client_ids(&self) -> Vec<String> {
		self.lock().client_ids.clone()
	}

	/// Messages published through client sessions, oldest first.
	pub fn published(&self) -> Vec<PublishedMessage> {
		self.lock().published.clone()
	}

	pub fn online_sessions(&self) -> usize {
		self.lock().sessions.values().filter(|link| link.online).count()
	}

	pub fn is_subscribed(&self, topic: &str) -> bool {
		self.lock()
			.sessions
			.values()
			.any(|link| link.online && link.subscriptions.contains(topic))
	}
}

impl BrokerInner {
	fn accept(&mut self, message: PublishedMessage) {
		if message.retain {
			if message.payload.is_empty() {
				self.retained.remove(&message.topic);
			} else {
				self.retained
					.insert(message.topic.clone(), message.payload.clone());
			}
		}
		self.route(&message.topic, &message.payload);
	}

	fn route(&mut self, topic: &str, payload: &Bytes) {
		for link in self.sessions.values() {
			if link.online && link.subscriptions.contains(topic) {
				let _ = link.events.send(Ok(SessionEvent::Message {
					topic: topic.to_owned(),
					payload: payload.clone(),
				}));
			}
		}
	}

	fn online_link(
		&mut self,
		session: u64,
	) -> Result<&mut SessionLink, TransportError> {
		self.sessions
			.get_mut(&session)
			.filter(|link| link.online)
			.ok_or(TransportError::NotConnected)
	}
}

impl Transport for MemoryBroker {
	type Client = MemoryClient;
	type Events = MemoryEvents;

	fn open(&self, options: &SessionOptions) -> (Self::Client, Self::Events) {
		let (tx, rx) = mpsc::unbounded_channel();
		let mut inner = self.lock();
		let session = inner.next_session;
		inner.next_session += 1;
		inner.sessions.insert(session, SessionLink {
			events: tx,
			subscriptions: HashSet::new(),
			online: false,
		});
		drop(inner);

		let client = MemoryClient {
			broker: self.clone(),
			session,
		};
		let events = MemoryEvents {
			broker: self.clone(),
			session,
			options: options.clone(),
			events: rx,
			online: false,
		};
		(client, events)
	}
}

/// Request handle for one in-process session.
#[derive(Clone)]
pub struct MemoryClient {
	broker: MemoryBroker,
	session: u64,
}

impl BrokerClient for MemoryClient {
	async fn subscribe(
		&self,
		topic: &str,
		_qos: QoS,
	) -> Result<(), TransportError> {
		let mut inner = self.broker.lock();
		let retained = inner.retained.get(topic).cloned();
		let link = inner.online_link(self.session)?;
		link.subscriptions.insert(topic.to_owned());
		if let Some(payload) = retained {
			let _ = link.events.send(Ok(SessionEvent::Message {
				topic: topic.to_owned(),
				payload,
			}));
		}
		Ok(())
	}

	async fn publish(
		&self,
		topic: &str,
		qos: QoS,
		retain: bool,
		payload: Bytes,
	) -> Result<(), TransportError> {
		let mut inner = self.broker.lock();
		inner.online_link(self.session)?;
		let message = PublishedMessage {
			topic: topic.to_owned(),
			qos,
			retain,
			payload,
		};
		inner.published.push(message.clone());
		inner.accept(message);
		Ok(())
	}

	async fn disconnect(&self) -> Result<(), TransportError> {
		let mut inner = self.broker.lock();
		match inner.sessions.remove(&self.session) {
			| Some(link) => {
				let _ = link.events.send(Ok(SessionEvent::Disconnected {
					initiated_by: Initiator::Client,
				}));
				Ok(())
			}
			| None => Err(TransportError::NotConnected),
		}
	}
}

/// Event source for one in-process session.
pub struct MemoryEvents {
	broker: MemoryBroker,
	session: u64,
	options: SessionOptions,
	events: EventRx,
	online: bool,
}

impl MemoryEvents {
	async fn handshake(&mut self) -> Result<SessionEvent, TransportError> {
		let delay = {
			let mut inner = self.broker.lock();
			inner.client_ids.push(self.options.client_id.clone());
			inner.connect_delay
		};
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}

		let mut inner = self.broker.lock();
		if !inner.reachable {
			return Err(TransportError::Connection(
				"broker unreachable".to_owned(),
			));
		}
		if let Some((username, password)) = &inner.credentials {
			let accepted = self.options.credentials.as_ref().is_some_and(|c| {
				&c.username == username && c.password() == password
			});
			if !accepted {
				return Ok(SessionEvent::Rejected {
					reason: "bad user name or password".to_owned(),
				});
			}
		}
		let link = inner
			.sessions
			.get_mut(&self.session)
			.ok_or(TransportError::Closed)?;
		link.online = true;
		link.subscriptions.clear();
		self.online = true;
		debug!(client_id = %self.options.client_id, "Memory broker accepted session");
		Ok(SessionEvent::ConnAck {
			session_present: false,
		})
	}
}

impl EventSource for MemoryEvents {
	async fn poll(&mut self) -> Result<SessionEvent, TransportError> {
		if !self.online {
			return self.handshake().await;
		}
		match self.events.recv().await {
			| Some(Err(err)) => {
				self.online = false;
				Err(err)
			}
			| Some(Ok(event)) => Ok(event),
			| None => Err(TransportError::Closed),
		}
	}
}

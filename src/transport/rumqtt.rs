use bytes::Bytes;
use rumqttc::Packet::{ConnAck, Disconnect, Publish};
use rumqttc::{
	AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event,
	EventLoop, MqttOptions, Outgoing, QoS,
};

use super::{
	BrokerClient, EventSource, Initiator, SessionEvent, SessionOptions,
	Transport, TransportError,
};

/// Transport backed by `rumqttc`.
///
/// The event loop reconnects automatically when polled after an error.
#[derive(Clone, Copy, Debug, Default)]
pub struct RumqttTransport;

impl Transport for RumqttTransport {
	type Client = RumqttClient;
	type Events = RumqttEvents;

	fn open(&self, options: &SessionOptions) -> (Self::Client, Self::Events) {
		let mut mqtt_options =
			MqttOptions::new(&options.client_id, &options.host, options.port);
		mqtt_options
			.set_keep_alive(options.keep_alive)
			.set_clean_session(options.clean_session);
		if let Some(credentials) = &options.credentials {
			mqtt_options.set_credentials(
				credentials.username.clone(),
				credentials.password().to_owned(),
			);
		}
		let (client, event_loop) =
			AsyncClient::new(mqtt_options, options.request_capacity);
		(RumqttClient(client), RumqttEvents(event_loop))
	}
}

/// Request handle wrapping [`rumqttc::AsyncClient`].
#[derive(Clone, Debug)]
pub struct RumqttClient(AsyncClient);

impl BrokerClient for RumqttClient {
	async fn subscribe(
		&self,
		topic: &str,
		qos: QoS,
	) -> Result<(), TransportError> {
		self.0.subscribe(topic, qos).await.map_err(request_error)
	}

	async fn publish(
		&self,
		topic: &str,
		qos: QoS,
		retain: bool,
		payload: Bytes,
	) -> Result<(), TransportError> {
		self.0
			.publish_bytes(topic, qos, retain, payload)
			.await
			.map_err(request_error)
	}

	async fn disconnect(&self) -> Result<(), TransportError> {
		self.0.disconnect().await.map_err(request_error)
	}
}

/// Event source wrapping [`rumqttc::EventLoop`].
pub struct RumqttEvents(EventLoop);

impl EventSource for RumqttEvents {
	async fn poll(&mut self) -> Result<SessionEvent, TransportError> {
		match self.0.poll().await {
			| Ok(Event::Incoming(ConnAck(ack))) => {
				if ack.code == ConnectReturnCode::Success {
					Ok(SessionEvent::ConnAck {
						session_present: ack.session_present,
					})
				} else {
					Ok(SessionEvent::Rejected {
						reason: format!("{:?}", ack.code),
					})
				}
			}
			| Ok(Event::Incoming(Publish(publish))) => Ok(SessionEvent::Message {
				topic: publish.topic,
				payload: publish.payload,
			}),
			| Ok(Event::Incoming(Disconnect)) => Ok(SessionEvent::Disconnected {
				initiated_by: Initiator::Broker,
			}),
			| Ok(Event::Outgoing(Outgoing::Disconnect)) => {
				Ok(SessionEvent::Disconnected {
					initiated_by: Initiator::Client,
				})
			}
			| Ok(_) => Ok(SessionEvent::Activity),
			| Err(ConnectionError::ConnectionRefused(code)) => {
				Err(TransportError::Refused(format!("{code:?}")))
			}
			| Err(ConnectionError::RequestsDone) => Err(TransportError::Closed),
			| Err(err) => Err(TransportError::Connection(err.to_string())),
		}
	}
}

fn request_error(err: ClientError) -> TransportError {
	TransportError::Request(err.to_string())
}

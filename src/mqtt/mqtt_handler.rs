use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeFilter, SubscribeReasonCode,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::{MqttConfig, ReconnectPolicy, TopicSubscription};
use super::error::MqttError;
use super::message_manager::InboundMessage;
use crate::bridge::Subscription;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
}

/// Connected MQTT session
///
/// Network I/O runs on a separate task which polls the rumqttc event loop and pushes
/// every received publish into a bounded delivery queue. The queue exists before the
/// first CONNECT goes out, so nothing delivered right after subscribing is lost.
pub struct MqttHandler {
    client: AsyncClient,
    deliveries: mpsc::Receiver<InboundMessage>,
    state: watch::Receiver<ConnectionState>,
    pump: Option<JoinHandle<Result<(), MqttError>>>,
}

impl MqttHandler {
    /// Connects and waits for the first CONNACK
    ///
    /// Topics are subscribed once the broker reports that it holds no session for this
    /// client. A failed first attempt is returned as an error rather than retried.
    pub async fn connect(config: &MqttConfig) -> Result<Self, MqttError> {
        let mut mqtt_options =
            MqttOptions::new(&config.client_id, &config.server.host, config.server.port);
        mqtt_options
            .set_clean_session(config.clean_session)
            .set_keep_alive(config.keep_alive);

        let (client, eventloop) = AsyncClient::new(mqtt_options, config.queue_capacity);
        let (delivery_tx, deliveries) = mpsc::channel(config.queue_capacity);
        let (state_tx, mut state) = watch::channel(ConnectionState::Connecting);

        let pump = EventPump {
            client: client.clone(),
            eventloop,
            deliveries: delivery_tx,
            subscriptions: config.subscriptions.clone(),
            reconnect: config.reconnect.clone(),
            state: state_tx,
        };
        let mut pump = tokio::spawn(pump.run());

        let reached = state
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map(|s| *s)
            .unwrap_or(ConnectionState::Failed);

        if reached != ConnectionState::Connected {
            // The pump has finished or is about to; its result carries the cause.
            return match (&mut pump).await? {
                Err(e) => Err(e),
                Ok(()) => Err(MqttError::NotConnected),
            };
        }

        Ok(MqttHandler {
            client,
            deliveries,
            state,
            pump: Some(pump),
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Waits for the next delivered message, `None` once the session is over
    pub async fn next_message(&mut self) -> Option<InboundMessage> {
        self.deliveries.recv().await
    }

    /// Sends DISCONNECT if still connected, then collects the event loop task's result
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        // Unblocks the pump if it is waiting on a full queue.
        self.deliveries.close();

        let Some(mut pump) = self.pump.take() else {
            return Ok(());
        };
        if pump.is_finished() {
            return pump.await?;
        }

        match self.connection_state() {
            ConnectionState::Connected => {
                info!("Shutting down and disconnecting from the MQTT server");
                self.client.disconnect().await?;
                match tokio::time::timeout(DISCONNECT_TIMEOUT, &mut pump).await {
                    Ok(result) => return result?,
                    Err(_) => warn!("Broker did not acknowledge disconnect in time"),
                }
            }
            // The pump has published its final state and is about to return.
            ConnectionState::Disconnected | ConnectionState::Failed => return pump.await?,
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                info!("Client was not connected, stopping event loop");
            }
        }

        pump.abort();
        Ok(())
    }
}

impl Subscription for MqttHandler {
    type Error = MqttError;

    async fn next_message(&mut self) -> Option<InboundMessage> {
        MqttHandler::next_message(self).await
    }

    async fn disconnect(&mut self) -> Result<(), MqttError> {
        MqttHandler::disconnect(self).await
    }
}

/// Owns the rumqttc event loop for the lifetime of the session
struct EventPump {
    client: AsyncClient,
    eventloop: EventLoop,
    deliveries: mpsc::Sender<InboundMessage>,
    subscriptions: Vec<TopicSubscription>,
    reconnect: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
}

impl EventPump {
    async fn run(mut self) -> Result<(), MqttError> {
        let result = self.pump().await;
        let final_state = match result {
            Ok(()) => ConnectionState::Disconnected,
            Err(ref e) => {
                error!("MQTT event loop stopped: {}", e);
                ConnectionState::Failed
            }
        };
        self.state.send_replace(final_state);
        // Dropping self closes the delivery queue.
        result
    }

    async fn pump(&mut self) -> Result<(), MqttError> {
        let mut connected_once = false;
        let mut attempts = 0u32;
        let mut delay = self.reconnect.initial;

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(
                        "Connected to broker (session present: {})",
                        ack.session_present
                    );
                    connected_once = true;
                    attempts = 0;
                    delay = self.reconnect.initial;
                    if !ack.session_present {
                        self.subscribe()?;
                    }
                    self.state.send_replace(ConnectionState::Connected);
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let rejected = rejected_topics(&self.subscriptions, &ack.return_codes);
                    if rejected.is_empty() {
                        debug!("Subscription acknowledged: {:?}", ack.return_codes);
                    } else {
                        warn!("Broker rejected subscription to {}", rejected.join(", "));
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage::from(publish);
                    if self.deliveries.send(message).await.is_err() {
                        debug!("Delivery queue closed, dropping message");
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("Disconnect sent");
                    return Ok(());
                }
                Ok(_) => {}
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(MqttError::Refused(code));
                }
                Err(ConnectionError::RequestsDone) => {
                    debug!("All client handles dropped");
                    return Ok(());
                }
                Err(e) if !connected_once => return Err(MqttError::Connect(e)),
                Err(e) => {
                    attempts += 1;
                    if matches!(self.reconnect.max_attempts, Some(max) if attempts > max) {
                        return Err(MqttError::ConnectionLost {
                            attempts: attempts - 1,
                            source: e,
                        });
                    }
                    warn!(
                        "Connection lost ({}), reconnect attempt {} in {:?}",
                        e, attempts, delay
                    );
                    self.state.send_replace(ConnectionState::Reconnecting);
                    tokio::time::sleep(delay).await;
                    delay = self.reconnect.next_delay(delay);
                }
            }
        }
    }

    fn subscribe(&self) -> Result<(), MqttError> {
        if self.subscriptions.is_empty() {
            return Ok(());
        }
        let filters: Vec<SubscribeFilter> = self
            .subscriptions
            .iter()
            .map(|s| SubscribeFilter::new(s.topic.clone(), s.qos))
            .collect();
        for s in &self.subscriptions {
            info!("Subscribing to {} at {:?}", s.topic, s.qos);
        }
        self.client.try_subscribe_many(filters)?;
        Ok(())
    }
}

/// Topics whose SUBACK return code is a failure
///
/// Return codes come back in the order the filters were sent in one SUBSCRIBE.
fn rejected_topics<'a>(
    subscriptions: &'a [TopicSubscription],
    codes: &[SubscribeReasonCode],
) -> Vec<&'a str> {
    subscriptions
        .iter()
        .zip(codes)
        .filter(|(_, code)| matches!(code, SubscribeReasonCode::Failure))
        .map(|(s, _)| s.topic.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::BrokerAddress;
    use rumqttc::{ConnectReturnCode, QoS};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNECT: u8 = 0x10;
    const SUBSCRIBE: u8 = 0x82;
    const DISCONNECT: u8 = 0xE0;
    const CONNACK_NO_SESSION: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    const CONNACK_SESSION_PRESENT: [u8; 4] = [0x20, 0x02, 0x01, 0x00];
    const CONNACK_NOT_AUTHORIZED: [u8; 4] = [0x20, 0x02, 0x00, 0x05];

    fn test_config(port: u16) -> MqttConfig {
        MqttConfig {
            server: BrokerAddress {
                host: "127.0.0.1".to_string(),
                port,
            },
            client_id: "bridge-test".to_string(),
            subscriptions: vec![TopicSubscription {
                topic: "general".to_string(),
                qos: QoS::AtLeastOnce,
            }],
            clean_session: true,
            keep_alive: Duration::from_secs(30),
            reconnect: ReconnectPolicy {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(50),
                max_attempts: Some(1),
            },
            queue_capacity: 10,
        }
    }

    /// Reads one MQTT packet, returning its first header byte and its body
    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= ((byte & 0x7F) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Accepts one client, answers its CONNECT with `connack` and hands back the stream
    async fn accept_with(listener: &TcpListener, connack: [u8; 4]) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (header, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(header, CONNECT);
        stream.write_all(&connack).await.unwrap();
        stream
    }

    async fn listen() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn subscribes_when_broker_holds_no_session() {
        let (listener, port) = listen().await;
        let broker = tokio::spawn(async move {
            let mut stream = accept_with(&listener, CONNACK_NO_SESSION).await;
            let (header, body) = read_packet(&mut stream).await.unwrap();
            stream
                .write_all(&[0x90, 0x03, body[0], body[1], 0x01])
                .await
                .unwrap();
            let (next, _) = read_packet(&mut stream).await.unwrap();
            (header, body, next)
        });

        let mut handler = MqttHandler::connect(&test_config(port)).await.unwrap();
        assert_eq!(handler.connection_state(), ConnectionState::Connected);
        handler.disconnect().await.unwrap();

        let (header, body, next) = broker.await.unwrap();
        assert_eq!(header, SUBSCRIBE);
        assert!(body.windows(7).any(|w| w == b"general"));
        assert_eq!(next, DISCONNECT);
    }

    #[tokio::test]
    async fn keeps_existing_session_subscriptions() {
        let (listener, port) = listen().await;
        let broker = tokio::spawn(async move {
            let mut stream = accept_with(&listener, CONNACK_SESSION_PRESENT).await;
            read_packet(&mut stream).await.unwrap().0
        });

        let mut handler = MqttHandler::connect(&test_config(port)).await.unwrap();
        handler.disconnect().await.unwrap();

        // A SUBSCRIBE would have been queued ahead of the DISCONNECT.
        assert_eq!(broker.await.unwrap(), DISCONNECT);
    }

    #[tokio::test]
    async fn refused_connection_is_fatal() {
        let (listener, port) = listen().await;
        let broker = tokio::spawn(async move {
            let _stream = accept_with(&listener, CONNACK_NOT_AUTHORIZED).await;
        });

        let err = MqttHandler::connect(&test_config(port)).await.err().unwrap();
        assert!(matches!(
            err,
            MqttError::Refused(ConnectReturnCode::NotAuthorized)
        ));
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn gives_up_after_reconnect_limit() {
        let (listener, port) = listen().await;
        let broker = tokio::spawn(async move {
            // Dropping both the stream and the listener makes every reconnect fail.
            let _stream = accept_with(&listener, CONNACK_SESSION_PRESENT).await;
        });

        let mut handler = MqttHandler::connect(&test_config(port)).await.unwrap();
        broker.await.unwrap();

        assert!(handler.next_message().await.is_none());
        let err = handler.disconnect().await.unwrap_err();
        assert!(matches!(err, MqttError::ConnectionLost { attempts: 1, .. }));
        assert_eq!(handler.connection_state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn rejected_subscription_keeps_session_open() {
        let (listener, port) = listen().await;
        let broker = tokio::spawn(async move {
            let mut stream = accept_with(&listener, CONNACK_NO_SESSION).await;
            let (_, body) = read_packet(&mut stream).await.unwrap();
            stream
                .write_all(&[0x90, 0x03, body[0], body[1], 0x80])
                .await
                .unwrap();
            read_packet(&mut stream).await.unwrap().0
        });

        let mut handler = MqttHandler::connect(&test_config(port)).await.unwrap();
        handler.disconnect().await.unwrap();
        assert_eq!(broker.await.unwrap(), DISCONNECT);
    }

    #[test]
    fn reports_topics_of_failed_return_codes() {
        let subscriptions: Vec<TopicSubscription> = ["a", "b", "c"]
            .into_iter()
            .map(|topic| TopicSubscription {
                topic: topic.to_string(),
                qos: QoS::AtLeastOnce,
            })
            .collect();
        let codes = [
            SubscribeReasonCode::Success(QoS::AtLeastOnce),
            SubscribeReasonCode::Failure,
            SubscribeReasonCode::Failure,
        ];
        assert_eq!(rejected_topics(&subscriptions, &codes), vec!["b", "c"]);
        assert!(rejected_topics(&subscriptions, &codes[..1]).is_empty());
    }
}

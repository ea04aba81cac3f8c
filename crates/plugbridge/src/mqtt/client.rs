use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::Event;
use rumqttc::EventLoop;
use rumqttc::MqttOptions;
use rumqttc::Outgoing;
use rumqttc::Packet;
use rumqttc::QoS;
use rumqttc::SubscribeFilter;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::BrokerConfig;

/// Time allowed for the broker to acknowledge the initial connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the broker to acknowledge a QoS 1 publish.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before retrying a publish while the request channel is full.
const PUBLISH_RETRY: Duration = Duration::from_millis(20);

/// Request channel capacity between `AsyncClient` and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// Filters per SUBSCRIBE packet when restoring subscriptions.
const RESUBSCRIBE_BATCH: usize = 32;

/// Stream of messages delivered on subscribed topics.
pub type Inbox = mpsc::UnboundedReceiver<MqttMessage>;

/// MQTT message received from a subscription
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl MqttMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("MQTT client not connected")]
    NotConnected,

    #[error(transparent)]
    Client(#[from] rumqttc::ClientError),

    #[error(transparent)]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("timed out waiting for broker acknowledgement")]
    Timeout,

    #[error("broker rejected request: {0}")]
    Rejected(String),
}

/// Broker operations the bridge relies on.
///
/// Inbound messages are handed out once by `connect`; subscribe and publish
/// take `&self` so many handlers can use the client concurrently.
#[async_trait]
pub trait MqttClient: Send + Sync {
    /// Connect to the broker and return the stream of inbound messages
    async fn connect(&mut self) -> Result<Inbox, MqttError>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, topic: &str) -> Result<(), MqttError>;

    /// Publish a payload to a topic
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), MqttError>;
}

/// Matches QoS 1 publishes to their PUBACKs.
///
/// Publishes leave the request channel in the order they were queued, so
/// each `Outgoing::Publish` claims the oldest queued waiter and files it
/// under the packet id the event loop assigned.
#[derive(Debug, Default)]
struct AckTracker {
    queued: VecDeque<oneshot::Sender<()>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
}

impl AckTracker {
    fn sent(&mut self, pkid: u16) {
        // Retransmissions after a reconnect reuse the packet id
        if self.inflight.contains_key(&pkid) {
            return;
        }
        if let Some(waiter) = self.queued.pop_front() {
            self.inflight.insert(pkid, waiter);
        }
    }

    fn acked(&mut self, pkid: u16) {
        if let Some(waiter) = self.inflight.remove(&pkid) {
            let _ = waiter.send(());
        }
    }
}

/// Real MQTT client implementation using rumqttc
pub struct RumqttcClient {
    mqtt_options: MqttOptions,

    /// AsyncClient (created in connect())
    client: Option<AsyncClient>,

    /// Topic filters to restore after the broker drops the session
    subscriptions: Arc<Mutex<Vec<String>>>,

    acks: Arc<Mutex<AckTracker>>,

    publish_timeout: Duration,

    event_loop_task: Option<JoinHandle<()>>,
}

impl RumqttcClient {
    pub fn new(config: &BrokerConfig) -> Self {
        let mut mqtt_options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);

        mqtt_options.set_keep_alive(Duration::from_secs(30));

        match (config.username.as_deref(), config.password.as_deref()) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                mqtt_options.set_credentials(username, password);
            }
            _ => {}
        }

        Self {
            mqtt_options,
            client: None,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            acks: Arc::new(Mutex::new(AckTracker::default())),
            publish_timeout: PUBLISH_TIMEOUT,
            event_loop_task: None,
        }
    }

    fn client(&self) -> Result<&AsyncClient, MqttError> {
        self.client.as_ref().ok_or(MqttError::NotConnected)
    }

    /// Drive the event loop until the broker acknowledges the connection.
    async fn await_connack(event_loop: &mut EventLoop) -> Result<(), MqttError> {
        loop {
            match event_loop.poll().await? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    debug!("Broker acknowledged connection: {:?}", ack.code);
                    return Ok(());
                }
                _ => continue,
            }
        }
    }

    /// Queue SUBSCRIBE packets for every remembered filter.
    ///
    /// The requests go through the same bounded channel this event loop
    /// drains, so they are sent from a separate task.
    fn restore_subscriptions(client: &AsyncClient, topics: Vec<String>) {
        let client = client.clone();
        tokio::spawn(async move {
            for batch in topics.chunks(RESUBSCRIBE_BATCH) {
                let filters = batch
                    .iter()
                    .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce));
                if let Err(e) = client.subscribe_many(filters).await {
                    warn!("Failed to restore subscriptions {:?}: {}", batch, e);
                }
            }
        });
    }

    async fn run_event_loop(
        mut event_loop: EventLoop,
        client: AsyncClient,
        subscriptions: Arc<Mutex<Vec<String>>>,
        acks: Arc<Mutex<AckTracker>>,
        message_tx: mpsc::UnboundedSender<MqttMessage>,
    ) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let msg = MqttMessage::new(publish.topic.to_string(), publish.payload.to_vec());

                    // Receiver dropped means the bridge is shutting down
                    if message_tx.send(msg).is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    acks.lock().unwrap_or_else(PoisonError::into_inner).acked(ack.pkid);
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    acks.lock().unwrap_or_else(PoisonError::into_inner).sent(pkid);
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    let topics = subscriptions
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    info!("Reconnected to MQTT broker, restoring {} subscriptions", topics.len());
                    if !topics.is_empty() {
                        Self::restore_subscriptions(&client, topics);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT event loop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!("MQTT event loop task exiting");
    }
}

#[async_trait]
impl MqttClient for RumqttcClient {
    async fn connect(&mut self) -> Result<Inbox, MqttError> {
        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options.clone(), REQUEST_CAPACITY);

        tokio::time::timeout(CONNECT_TIMEOUT, Self::await_connack(&mut event_loop))
            .await
            .map_err(|_| MqttError::Timeout)??;

        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Self::run_event_loop(
            event_loop,
            client.clone(),
            self.subscriptions.clone(),
            self.acks.clone(),
            message_tx,
        ));

        self.client = Some(client);
        self.event_loop_task = Some(task);

        Ok(message_rx)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client()?.subscribe(topic, QoS::AtMostOnce).await?;

        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(topic.to_string());

        Ok(())
    }

    /// Publish at QoS 1 and wait for the broker's PUBACK.
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), MqttError> {
        let client = self.client()?;
        let deadline = tokio::time::Instant::now() + self.publish_timeout;

        let ack_rx = loop {
            {
                // The event loop cannot see the request before its waiter is queued
                let mut acks = self.acks.lock().unwrap_or_else(PoisonError::into_inner);
                if client
                    .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
                    .is_ok()
                {
                    let (ack_tx, ack_rx) = oneshot::channel();
                    acks.queued.push_back(ack_tx);
                    break ack_rx;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MqttError::Timeout);
            }
            tokio::time::sleep(PUBLISH_RETRY).await;
        };

        match tokio::time::timeout_at(deadline, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MqttError::Rejected(format!("publish to {} was dropped", topic))),
            Err(_) => Err(MqttError::Timeout),
        }
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop_task.take() {
            task.abort();
        }
    }
}

/// Mock MQTT client for testing
///
/// Clones share state, so a test can keep a handle after moving the client
/// into the bridge.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MockMqttClient {
    inner: Arc<Mutex<MockState>>,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct MockState {
    inbox: Option<mpsc::UnboundedSender<MqttMessage>>,
    subscriptions: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
    fail_publish: bool,
    fail_connect: bool,
}

#[cfg(test)]
impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_connect() -> Self {
        let client = Self::default();
        client.state().fail_connect = true;
        client
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.inner.lock().unwrap()
    }

    /// Deliver a message as if the broker had sent it
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        let state = self.state();
        let tx = state.inbox.as_ref().expect("mock client not connected");
        tx.send(MqttMessage::new(topic, payload)).unwrap();
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.state().fail_publish = fail;
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state().subscriptions.clone()
    }

    /// Published payloads as (topic, utf8 payload) pairs
    pub fn published(&self) -> Vec<(String, String)> {
        self.state()
            .published
            .iter()
            .map(|(topic, payload)| (topic.clone(), String::from_utf8_lossy(payload).into_owned()))
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl MqttClient for MockMqttClient {
    async fn connect(&mut self) -> Result<Inbox, MqttError> {
        let mut state = self.state();
        if state.fail_connect {
            return Err(MqttError::Rejected("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.inbox = Some(tx);
        Ok(rx)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.state().subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], _retain: bool) -> Result<(), MqttError> {
        let mut state = self.state();
        if state.fail_publish {
            return Err(MqttError::Rejected(format!("publish to {}", topic)));
        }
        state.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::net::TcpStream;

    use super::*;

    const SUBSCRIBE: u8 = 0x82;
    const PUBLISH_QOS1: u8 = 0x32;

    fn broker_config() -> BrokerConfig {
        BrokerConfig {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "test".to_string(),
            username: None,
            password: None,
            discovery_prefix: "homeassistant".to_string(),
        }
    }

    async fn listen() -> (TcpListener, BrokerConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
            ..broker_config()
        };
        (listener, config)
    }

    /// Read one control packet as (first header byte, body)
    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Accept a client, read its CONNECT and accept the session
    async fn accept_session(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (header, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(header >> 4, 1);
        stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        stream
    }

    /// Acknowledge a SUBSCRIBE and return its topic filters
    async fn ack_subscribe(stream: &mut TcpStream, body: &[u8]) -> Vec<String> {
        let mut filters = Vec::new();
        let mut rest = &body[2..];
        while rest.len() >= 2 {
            let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
            filters.push(String::from_utf8_lossy(&rest[2..2 + len]).into_owned());
            rest = &rest[2 + len + 1..];
        }

        let mut suback = vec![0x90, (2 + filters.len()) as u8, body[0], body[1]];
        suback.extend(std::iter::repeat(0x00).take(filters.len()));
        stream.write_all(&suback).await.unwrap();
        filters
    }

    fn publish_pkid(body: &[u8]) -> [u8; 2] {
        let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
        [body[2 + topic_len], body[3 + topic_len]]
    }

    #[tokio::test]
    async fn test_reconnect_restores_every_subscription() {
        const TOPICS: usize = 100;
        let (listener, config) = listen().await;

        let broker = tokio::spawn(async move {
            let mut stream = accept_session(&listener).await;
            let mut seen = 0;
            while seen < TOPICS {
                let (header, body) = read_packet(&mut stream).await.unwrap();
                if header == SUBSCRIBE {
                    seen += ack_subscribe(&mut stream, &body).await.len();
                }
            }
            // Drop the session once the client has subscribed to everything
            drop(stream);

            let mut stream = accept_session(&listener).await;
            let mut restored = HashSet::new();
            while restored.len() < TOPICS {
                let (header, body) = read_packet(&mut stream).await.unwrap();
                if header == SUBSCRIBE {
                    restored.extend(ack_subscribe(&mut stream, &body).await);
                }
            }
            restored
        });

        let mut client = RumqttcClient::new(&config);
        let _inbox = client.connect().await.unwrap();
        for i in 0..TOPICS {
            client.subscribe(&format!("stat/device-{}", i)).await.unwrap();
        }

        let restored = tokio::time::timeout(Duration::from_secs(10), broker)
            .await
            .expect("subscriptions were not restored")
            .unwrap();
        assert_eq!(restored.len(), TOPICS);
        assert!(restored.contains("stat/device-0"));
        assert!(restored.contains("stat/device-99"));
    }

    #[tokio::test]
    async fn test_publish_waits_for_puback() {
        let (listener, config) = listen().await;

        let broker = tokio::spawn(async move {
            let mut stream = accept_session(&listener).await;
            let mut topics = Vec::new();
            while topics.len() < 3 {
                let (header, body) = read_packet(&mut stream).await.unwrap();
                if header == PUBLISH_QOS1 {
                    let pkid = publish_pkid(&body);
                    stream.write_all(&[0x40, 0x02, pkid[0], pkid[1]]).await.unwrap();
                    let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
                    topics.push(String::from_utf8_lossy(&body[2..2 + topic_len]).into_owned());
                }
            }
            topics
        });

        let mut client = RumqttcClient::new(&config);
        let _inbox = client.connect().await.unwrap();
        for topic in ["cmnd/hallway", "cmnd/den", "cmnd/attic"] {
            client.publish(topic, b"ON", false).await.unwrap();
        }

        let topics = broker.await.unwrap();
        assert_eq!(topics, vec!["cmnd/hallway", "cmnd/den", "cmnd/attic"]);
    }

    #[tokio::test]
    async fn test_publish_times_out_without_puback() {
        let (listener, config) = listen().await;

        let broker = tokio::spawn(async move {
            let mut stream = accept_session(&listener).await;
            // Read everything, acknowledge nothing
            while read_packet(&mut stream).await.is_ok() {}
        });

        let mut client = RumqttcClient::new(&config);
        client.publish_timeout = Duration::from_millis(200);
        let _inbox = client.connect().await.unwrap();

        for _ in 0..3 {
            let started = tokio::time::Instant::now();
            let result = client.publish("cmnd/hallway", b"ON", false).await;
            assert!(matches!(result, Err(MqttError::Timeout)), "got {:?}", result);
            assert!(started.elapsed() >= Duration::from_millis(200));
        }

        drop(client);
        broker.abort();
    }

    #[tokio::test]
    async fn test_rumqttc_client_requires_connect() {
        let client = RumqttcClient::new(&broker_config());
        let result = client.publish("cmnd/hallway", b"ON", false).await;
        assert!(matches!(result, Err(MqttError::NotConnected)));
        let result = client.subscribe("stat/#").await;
        assert!(matches!(result, Err(MqttError::NotConnected)));
    }

    #[tokio::test]
    async fn test_mock_records_traffic() {
        let mut client = MockMqttClient::new();
        let handle = client.clone();
        let mut inbox = client.connect().await.unwrap();

        client.subscribe("homeassistant/light/+/+/config").await.unwrap();
        client.publish("cmnd/hallway", b"ON", false).await.unwrap();
        handle.inject("stat/hallway", b"OFF");

        assert_eq!(handle.subscriptions(), vec!["homeassistant/light/+/+/config"]);
        assert_eq!(
            handle.published(),
            vec![("cmnd/hallway".to_string(), "ON".to_string())]
        );
        let msg = inbox.recv().await.unwrap();
        assert_eq!(msg.topic, "stat/hallway");
        assert_eq!(msg.payload, b"OFF");
    }

    #[tokio::test]
    async fn test_mock_publish_failure() {
        let mut client = MockMqttClient::new();
        let _inbox = client.connect().await.unwrap();
        client.set_fail_publish(true);
        assert!(client.publish("cmnd/hallway", b"ON", false).await.is_err());
        assert!(client.published().is_empty());
    }
}

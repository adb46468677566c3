//! Broker transport seam.
//!
//! The connection manager only talks to the broker through [`Transport`] and
//! learns about the connection through a stream of [`TransportEvent`]s. The
//! production implementation wraps `rumqttc`; tests plug in a recording mock.
//!
//! `rumqttc::AsyncClient` returns as soon as a request is queued, so the
//! rumqttc transport tracks acknowledgements itself: requests are matched to
//! packet ids through the `Outgoing` events (which the event loop emits in the
//! order the requests were queued) and resolved on SUBACK, UNSUBACK, PUBACK
//! or PUBCOMP. QoS 0 publishes resolve once they are written.

use crate::config::{BrokerAddress, BrokerConfig};
use crate::models::InboundMessage;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, NetworkOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { session_resumed: bool },
    Message(InboundMessage),
    Error(String),
    Closed,
    Reconnecting,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("MQTT client error: {0}")]
    Client(String),
    #[error("broker rejected the request: {0}")]
    Rejected(String),
    #[error("invalid transport options: {0}")]
    InvalidOptions(String),
}

/// Message the broker publishes on our behalf if the connection drops uncleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Closes the session and stops reconnecting. Pending requests are
    /// rejected with [`TransportError::NotConnected`].
    async fn end(&self) -> Result<(), TransportError>;
}

pub type TransportSession = (Arc<dyn Transport>, mpsc::Receiver<TransportEvent>);

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Starts one session. Connecting (and reconnecting every
    /// `reconnect_interval_ms`) happens in the background and is reported
    /// through the returned event stream.
    async fn connect(
        &self,
        config: &BrokerConfig,
        last_will: Option<LastWill>,
    ) -> Result<TransportSession, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AckKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

type AckSender = oneshot::Sender<Result<(), TransportError>>;
type AckReceiver = oneshot::Receiver<Result<(), TransportError>>;

struct Queued {
    id: u64,
    qos: QoS,
    // None once the waiter was rejected; the slot stays to keep the
    // queue aligned with the requests still sitting in the client channel.
    tx: Option<AckSender>,
}

#[derive(Default)]
struct AckState {
    connected: bool,
    next_id: u64,
    queued: HashMap<AckKind, VecDeque<Queued>>,
    awaiting: HashMap<(AckKind, u16), AckSender>,
    // QoS 1/2 publishes rumqttc will resend after a reconnect; their
    // Outgoing events must not consume a queued slot.
    replayed: HashSet<(AckKind, u16)>,
}

#[derive(Default)]
struct AckTracker {
    state: Mutex<AckState>,
}

impl AckTracker {
    fn lock(&self) -> std::sync::MutexGuard<'_, AckState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn register(&self, kind: AckKind, qos: QoS) -> Result<(u64, AckReceiver), TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.next_id += 1;
        let id = state.next_id;
        let (tx, rx) = oneshot::channel();
        state
            .queued
            .entry(kind)
            .or_default()
            .push_back(Queued { id, qos, tx: Some(tx) });
        Ok((id, rx))
    }

    /// Drops a registration whose request never reached the client.
    fn cancel(&self, kind: AckKind, id: u64) {
        let mut state = self.lock();
        if let Some(queue) = state.queued.get_mut(&kind) {
            queue.retain(|q| q.id != id);
        }
    }

    fn on_outgoing(&self, kind: AckKind, pkid: u16) {
        let mut state = self.lock();
        if state.replayed.remove(&(kind, pkid)) {
            return;
        }
        let Some(entry) = state.queued.get_mut(&kind).and_then(VecDeque::pop_front) else {
            return;
        };
        let Some(tx) = entry.tx else {
            return;
        };
        if kind == AckKind::Publish && (entry.qos == QoS::AtMostOnce || pkid == 0) {
            let _ = tx.send(Ok(()));
        } else {
            state.awaiting.insert((kind, pkid), tx);
        }
    }

    fn on_ack(&self, kind: AckKind, pkid: u16, result: Result<(), TransportError>) {
        if let Some(tx) = self.lock().awaiting.remove(&(kind, pkid)) {
            let _ = tx.send(result);
        }
    }

    fn set_connected(&self, connected: bool) {
        let mut state = self.lock();
        let was_connected = state.connected;
        state.connected = connected;
        if connected || !was_connected {
            return;
        }

        for queue in state.queued.values_mut() {
            for entry in queue.iter_mut() {
                if let Some(tx) = entry.tx.take() {
                    let _ = tx.send(Err(TransportError::NotConnected));
                }
            }
        }
        let awaiting: Vec<_> = state.awaiting.drain().collect();
        state.replayed.clear();
        for (key, tx) in awaiting {
            // rumqttc only resends unacknowledged publishes; SUBSCRIBE and
            // UNSUBSCRIBE packets are dropped with the connection.
            if key.0 == AckKind::Publish {
                state.replayed.insert(key);
            }
            let _ = tx.send(Err(TransportError::NotConnected));
        }
    }

    /// Final teardown: nothing will be sent anymore.
    fn close(&self) {
        self.set_connected(false);
        let mut state = self.lock();
        state.queued.clear();
        state.replayed.clear();
    }
}

async fn wait_for_ack(rx: AckReceiver) -> Result<(), TransportError> {
    rx.await.unwrap_or(Err(TransportError::NotConnected))
}

/// `rumqttc` backed transport.
pub struct RumqttTransportFactory {
    pub request_capacity: usize,
    pub event_capacity: usize,
}

impl Default for RumqttTransportFactory {
    fn default() -> Self {
        Self {
            request_capacity: 10,
            event_capacity: 256,
        }
    }
}

pub fn mqtt_options(
    config: &BrokerConfig,
    last_will: Option<LastWill>,
) -> Result<MqttOptions, TransportError> {
    let address = BrokerAddress::from_str(&config.address)
        .map_err(|e| TransportError::InvalidOptions(e.to_string()))?;
    if config.client_id.is_empty() {
        return Err(TransportError::InvalidOptions(
            "client id must not be empty".to_string(),
        ));
    }

    let mut mqtt_options = MqttOptions::new(&config.client_id, &address.host, address.port);
    mqtt_options.set_keep_alive(Duration::from_secs(config.keepalive_secs.max(5)));
    mqtt_options.set_clean_session(config.clean_session);

    if let Some((username, password)) = config.credentials() {
        mqtt_options.set_credentials(username, password);
    }
    if address.tls {
        mqtt_options.set_transport(rumqttc::Transport::tls_with_default_config());
    }
    if let Some(will) = last_will {
        mqtt_options.set_last_will(rumqttc::LastWill::new(
            will.topic,
            will.payload,
            will.qos,
            will.retain,
        ));
    }
    Ok(mqtt_options)
}

#[async_trait]
impl TransportFactory for RumqttTransportFactory {
    async fn connect(
        &self,
        config: &BrokerConfig,
        last_will: Option<LastWill>,
    ) -> Result<TransportSession, TransportError> {
        let mqtt_options = mqtt_options(config, last_will)?;
        debug!("Configuring MQTT broker at {}...", config.address);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, self.request_capacity);

        let mut network_options = NetworkOptions::new();
        network_options.set_connection_timeout(config.connect_timeout_ms.div_ceil(1000).max(1));
        eventloop.set_network_options(network_options);

        let acks = Arc::new(AckTracker::default());
        let (events_tx, events_rx) = mpsc::channel(self.event_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_event_loop(
            eventloop,
            acks.clone(),
            events_tx,
            shutdown_rx,
            config.reconnect_interval(),
        ));

        let transport = RumqttTransport {
            client,
            acks,
            issue: tokio::sync::Mutex::new(()),
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        };
        Ok((Arc::new(transport), events_rx))
    }
}

pub struct RumqttTransport {
    client: AsyncClient,
    acks: Arc<AckTracker>,
    // Registration and enqueueing must happen in the same order.
    issue: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttTransport {
    async fn request<F, Fut>(&self, kind: AckKind, qos: QoS, send: F) -> Result<(), TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), rumqttc::ClientError>>,
    {
        let rx = {
            let _issue = self.issue.lock().await;
            let (id, rx) = self.acks.register(kind, qos)?;
            if let Err(e) = send().await {
                self.acks.cancel(kind, id);
                return Err(TransportError::Client(e.to_string()));
            }
            rx
        };
        wait_for_ack(rx).await
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.request(AckKind::Subscribe, qos, || self.client.subscribe(topic, qos))
            .await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.request(AckKind::Unsubscribe, QoS::AtLeastOnce, || {
            self.client.unsubscribe(topic)
        })
        .await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.request(AckKind::Publish, qos, || {
            self.client.publish(topic, qos, retain, payload)
        })
        .await
    }

    async fn end(&self) -> Result<(), TransportError> {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut task) = task else {
            return Ok(());
        };

        let mut result = Ok(());
        if self.acks.is_connected() {
            // The event loop exits once the DISCONNECT packet is written.
            result = self
                .client
                .disconnect()
                .await
                .map_err(|e| TransportError::Client(e.to_string()));
            if result.is_ok() && timeout(Duration::from_secs(2), &mut task).await.is_ok() {
                self.acks.close();
                return Ok(());
            }
        }

        let _ = self.shutdown.send(true);
        if timeout(Duration::from_millis(500), &mut task).await.is_err() {
            task.abort();
        }
        self.acks.close();
        result
    }
}

async fn emit(events: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
    // The receiver is gone once the manager tore the session down.
    let _ = events.send(event).await;
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    acks: Arc<AckTracker>,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
    reconnect_interval: Duration,
) {
    loop {
        let polled = tokio::select! {
            _ = shutdown.changed() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                info!("Connected to MQTT broker.");
                acks.set_connected(true);
                emit(
                    &events,
                    TransportEvent::Connected {
                        session_resumed: connack.session_present,
                    },
                )
                .await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::new(
                    publish.topic,
                    publish.payload.to_vec(),
                    publish.qos,
                    publish.retain,
                );
                emit(&events, TransportEvent::Message(message)).await;
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                let result = if suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    Err(TransportError::Rejected(
                        "subscription refused by broker".to_string(),
                    ))
                } else {
                    Ok(())
                };
                acks.on_ack(AckKind::Subscribe, suback.pkid, result);
            }
            Ok(Event::Incoming(Packet::UnsubAck(unsuback))) => {
                acks.on_ack(AckKind::Unsubscribe, unsuback.pkid, Ok(()));
            }
            Ok(Event::Incoming(Packet::PubAck(puback))) => {
                acks.on_ack(AckKind::Publish, puback.pkid, Ok(()));
            }
            Ok(Event::Incoming(Packet::PubComp(pubcomp))) => {
                acks.on_ack(AckKind::Publish, pubcomp.pkid, Ok(()));
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the MQTT session.");
                acks.set_connected(false);
                emit(&events, TransportEvent::Closed).await;
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                acks.on_outgoing(AckKind::Subscribe, pkid)
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                acks.on_outgoing(AckKind::Unsubscribe, pkid)
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                acks.on_outgoing(AckKind::Publish, pkid)
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent.");
                acks.set_connected(false);
                emit(&events, TransportEvent::Closed).await;
                break;
            }
            Ok(event) => {
                debug!("Unhandled event: {:?}", event);
            }
            Err(e) => {
                acks.set_connected(false);
                if *shutdown.borrow() {
                    break;
                }
                error!("Error in MQTT event loop: {:?}", e);
                emit(&events, TransportEvent::Error(e.to_string())).await;
                emit(&events, TransportEvent::Reconnecting).await;

                warn!(
                    "Lost connection to MQTT broker. Retrying in {:?}...",
                    reconnect_interval
                );
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(reconnect_interval) => {}
                }
            }
        }
    }

    acks.close();
    debug!("MQTT event loop stopped.");
}

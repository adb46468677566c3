use crate::config::BrokerConfig;
use crate::models::{ConnectionStatus, InboundMessage, LivenessAnnouncement};
use crate::storage::{Storage, StorageError};
use crate::transport::{LastWill, Transport, TransportError, TransportEvent, TransportFactory};
use futures::future::join_all;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("MQTT client is not connected")]
    NotConnected,
    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for ManagerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected => ManagerError::NotConnected,
            other => ManagerError::Transport(other),
        }
    }
}

/// Things that happen in the background and would otherwise only be logged.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    StateChanged(ConnectionStatus),
    MessageReceived(InboundMessage),
    TransportFailed(String),
    StorageFailed(String),
    ResubscribeFailed { topic: String, error: String },
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub status_topic: String,
    /// Pause between the broker accepting the connection and re-asserting
    /// the stored subscriptions.
    pub resubscribe_delay: Duration,
    pub offline_publish_timeout: Duration,
    /// Inbound messages waiting for storage. Messages arriving while the
    /// buffer is full are dropped and counted as storage failures.
    pub message_buffer: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            status_topic: crate::config::DEFAULT_STATUS_TOPIC.to_string(),
            resubscribe_delay: Duration::from_secs(1),
            offline_publish_timeout: Duration::from_secs(2),
            message_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }
}

struct Session {
    generation: u64,
    config: BrokerConfig,
    transport: Arc<dyn Transport>,
    pump: Option<JoinHandle<()>>,
}

/// A live transport session exists in every state but `Disconnected`.
enum ConnectionState {
    Disconnected,
    Connecting(Session),
    Connected(Session),
    Reconnecting(Session),
}

impl ConnectionState {
    fn session(&self) -> Option<&Session> {
        match self {
            ConnectionState::Disconnected => None,
            ConnectionState::Connecting(s)
            | ConnectionState::Connected(s)
            | ConnectionState::Reconnecting(s) => Some(s),
        }
    }

    fn session_mut(&mut self) -> Option<&mut Session> {
        match self {
            ConnectionState::Disconnected => None,
            ConnectionState::Connecting(s)
            | ConnectionState::Connected(s)
            | ConnectionState::Reconnecting(s) => Some(s),
        }
    }

    fn into_session(self) -> Option<Session> {
        match self {
            ConnectionState::Disconnected => None,
            ConnectionState::Connecting(s)
            | ConnectionState::Connected(s)
            | ConnectionState::Reconnecting(s) => Some(s),
        }
    }

    fn generation(&self) -> Option<u64> {
        self.session().map(|s| s.generation)
    }

    fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting(_) => "connecting",
            ConnectionState::Connected(_) => "connected",
            ConnectionState::Reconnecting(_) => "reconnecting",
        }
    }

    fn snapshot(&self) -> ConnectionStatus {
        match self.session() {
            None => ConnectionStatus::default(),
            Some(session) => ConnectionStatus {
                connected: matches!(self, ConnectionState::Connected(_)),
                broker: session.config.address.clone(),
                client_id: session.config.client_id.clone(),
                reconnecting: matches!(self, ConnectionState::Reconnecting(_)),
                state: self.name(),
            },
        }
    }
}

/// Clears the in-flight flag when the connect attempt finishes.
struct ConnectGuard<'a>(&'a AtomicBool);

impl<'a> ConnectGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ConnectGuard(flag))
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the one broker connection of the process.
pub struct ConnectionManager {
    storage: Arc<dyn Storage>,
    factory: Arc<dyn TransportFactory>,
    options: ManagerOptions,
    state: Mutex<ConnectionState>,
    connecting: AtomicBool,
    generation: AtomicU64,
    // Bumped by every disconnect() so a connect still in flight can tell.
    disconnects: AtomicU64,
    storage_failures: AtomicU64,
    status_tx: watch::Sender<ConnectionStatus>,
    events_tx: broadcast::Sender<ManagerEvent>,
}

impl ConnectionManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        factory: Arc<dyn TransportFactory>,
        options: ManagerOptions,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            storage,
            factory,
            options,
            state: Mutex::new(ConnectionState::Disconnected),
            connecting: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            storage_failures: AtomicU64::new(0),
            status_tx,
            events_tx,
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events_tx.subscribe()
    }

    pub fn storage_failures(&self) -> u64 {
        self.storage_failures.load(Ordering::Relaxed)
    }

    pub fn status_topic(&self) -> &str {
        &self.options.status_topic
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ManagerEvent) {
        // No receivers is fine; observing is optional.
        let _ = self.events_tx.send(event);
    }

    fn publish_snapshot(&self, snapshot: ConnectionStatus) {
        self.status_tx.send_replace(snapshot.clone());
        self.emit(ManagerEvent::StateChanged(snapshot));
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_state().generation() == Some(generation)
    }

    /// Applies `next` if `generation` still owns the state.
    fn transition(
        &self,
        generation: u64,
        next: impl FnOnce(ConnectionState) -> ConnectionState,
    ) {
        let snapshot = {
            let mut state = self.lock_state();
            if state.generation() != Some(generation) {
                return;
            }
            let previous = std::mem::replace(&mut *state, ConnectionState::Disconnected);
            let before = previous.name();
            *state = next(previous);
            if state.name() == before {
                return;
            }
            debug!("MQTT state {} -> {}", before, state.name());
            state.snapshot()
        };
        self.publish_snapshot(snapshot);
    }

    fn connected_transport(&self) -> Result<Arc<dyn Transport>, ManagerError> {
        match &*self.lock_state() {
            ConnectionState::Connected(session) => Ok(session.transport.clone()),
            _ => Err(ManagerError::NotConnected),
        }
    }

    fn connected_session(&self, generation: u64) -> Option<(Arc<dyn Transport>, String)> {
        match &*self.lock_state() {
            ConnectionState::Connected(session) if session.generation == generation => {
                Some((session.transport.clone(), session.config.client_id.clone()))
            }
            _ => None,
        }
    }

    /// Opens a new broker session, replacing any existing one.
    ///
    /// Returns once the broker accepted the connection or the connect timeout
    /// elapsed; in the latter case the transport keeps retrying in the
    /// background. A call made while another `connect` is still in flight is
    /// ignored.
    pub async fn connect(self: &Arc<Self>, config: BrokerConfig) -> Result<(), ManagerError> {
        let Some(_guard) = ConnectGuard::acquire(&self.connecting) else {
            warn!(
                "Connect to {} ignored: another connection attempt is in progress.",
                config.address
            );
            return Ok(());
        };

        let disconnects = self.disconnects.load(Ordering::Acquire);
        self.teardown().await;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let last_will = LastWill {
            topic: self.options.status_topic.clone(),
            payload: LivenessAnnouncement::offline(&config.client_id).to_payload(),
            qos: QoS::AtLeastOnce,
            retain: true,
        };

        info!(
            "Connecting to MQTT broker {} as '{}'...",
            config.address, config.client_id
        );
        let (transport, events) = match self.factory.connect(&config, Some(last_will)).await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to start MQTT transport for {}: {}", config.address, e);
                self.emit(ManagerEvent::TransportFailed(e.to_string()));
                return Err(e.into());
            }
        };

        let snapshot = {
            let mut state = self.lock_state();
            if self.disconnects.load(Ordering::Acquire) != disconnects {
                None
            } else {
                *state = ConnectionState::Connecting(Session {
                    generation,
                    config: config.clone(),
                    transport: transport.clone(),
                    pump: None,
                });
                Some(state.snapshot())
            }
        };
        let Some(snapshot) = snapshot else {
            info!(
                "Disconnect requested while connecting to {}; closing the new session.",
                config.address
            );
            if let Err(e) = transport.end().await {
                warn!("Error while closing MQTT transport: {}", e);
            }
            return Ok(());
        };
        self.publish_snapshot(snapshot);
        let mut status_rx = self.status_tx.subscribe();

        let pump = tokio::spawn(self.clone().run_session(generation, events));
        {
            let mut state = self.lock_state();
            match state.session_mut() {
                Some(session) if session.generation == generation => session.pump = Some(pump),
                _ => pump.abort(),
            }
        }

        let established = async {
            loop {
                {
                    let status = status_rx.borrow_and_update();
                    if status.connected {
                        return true;
                    }
                    if status.state == "disconnected" {
                        return false;
                    }
                }
                if status_rx.changed().await.is_err() {
                    return false;
                }
            }
        };

        match timeout(config.connect_timeout(), established).await {
            Ok(true) => info!("Connected to MQTT broker {}.", config.address),
            Ok(false) => debug!("Connection to {} was torn down while connecting.", config.address),
            Err(_) => warn!(
                "No connection to {} within {:?}; the transport keeps retrying.",
                config.address,
                config.connect_timeout()
            ),
        }
        Ok(())
    }

    /// Publishes the offline announcement (best-effort) and closes the
    /// session. Does nothing when already disconnected, apart from cancelling
    /// a `connect` that has not installed its session yet.
    pub async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::AcqRel);
        self.teardown().await;
    }

    async fn teardown(&self) {
        let previous = {
            let mut state = self.lock_state();
            std::mem::replace(&mut *state, ConnectionState::Disconnected)
        };
        let was_connected = matches!(previous, ConnectionState::Connected(_));
        let Some(session) = previous.into_session() else {
            debug!("Disconnect requested while already disconnected.");
            return;
        };
        self.publish_snapshot(ConnectionStatus::default());

        if let Some(pump) = &session.pump {
            pump.abort();
        }

        if was_connected {
            let announcement = LivenessAnnouncement::offline(&session.config.client_id);
            let publish = session.transport.publish(
                &self.options.status_topic,
                announcement.to_payload(),
                QoS::AtLeastOnce,
                true,
            );
            match timeout(self.options.offline_publish_timeout, publish).await {
                Ok(Ok(())) => debug!("Published offline status."),
                Ok(Err(e)) => warn!("Failed to publish offline status: {}", e),
                Err(_) => warn!("Timed out publishing offline status."),
            }
        }

        if let Err(e) = session.transport.end().await {
            warn!("Error while closing MQTT transport: {}", e);
        }
        info!("Disconnected from MQTT broker {}.", session.config.address);
    }

    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ManagerError> {
        let transport = self.connected_transport()?;
        transport.subscribe(topic, qos).await.map_err(|e| {
            warn!("Failed to subscribe to topic '{}': {}", topic, e);
            ManagerError::from(e)
        })?;
        info!("Successfully subscribed to topic '{}'.", topic);
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), ManagerError> {
        let transport = self.connected_transport()?;
        transport.unsubscribe(topic).await.map_err(|e| {
            warn!("Failed to unsubscribe from topic '{}': {}", topic, e);
            ManagerError::from(e)
        })?;
        info!("Unsubscribed from topic '{}'.", topic);
        Ok(())
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> Result<(), ManagerError> {
        let transport = self.connected_transport()?;
        transport
            .publish(topic, payload.into(), options.qos, options.retain)
            .await
            .map_err(|e| {
                error!("Failed to publish message to '{}': {}", topic, e);
                ManagerError::from(e)
            })?;
        debug!("Message published to '{}'.", topic);
        Ok(())
    }

    async fn run_session(
        self: Arc<Self>,
        generation: u64,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let (store_tx, store_rx) = mpsc::channel(self.options.message_buffer.max(1));
        let writer = tokio::spawn(self.clone().write_messages(store_rx));

        while let Some(event) = events.recv().await {
            if !self.is_current(generation) {
                break;
            }
            match event {
                TransportEvent::Connected { session_resumed } => {
                    info!("Connected to MQTT broker (session resumed: {}).", session_resumed);
                    self.transition(generation, |state| match state {
                        ConnectionState::Connecting(s)
                        | ConnectionState::Reconnecting(s)
                        | ConnectionState::Connected(s) => ConnectionState::Connected(s),
                        other => other,
                    });
                    tokio::spawn(self.clone().after_connect(generation, session_resumed));
                }
                TransportEvent::Message(message) => {
                    debug!("Incoming message on '{}'.", message.topic);
                    self.emit(ManagerEvent::MessageReceived(message.clone()));
                    match store_tx.try_send(message) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(message)) => {
                            self.storage_failures.fetch_add(1, Ordering::Relaxed);
                            error!(
                                "Message buffer full; dropping message from '{}'.",
                                message.topic
                            );
                            self.emit(ManagerEvent::StorageFailed(
                                "message buffer full".to_string(),
                            ));
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            warn!("Message writer stopped; dropping inbound message.");
                        }
                    }
                }
                TransportEvent::Error(reason) => {
                    error!("MQTT transport error: {}", reason);
                    self.emit(ManagerEvent::TransportFailed(reason));
                    self.transition(generation, |state| match state {
                        ConnectionState::Connecting(s) | ConnectionState::Connected(s) => {
                            ConnectionState::Reconnecting(s)
                        }
                        other => other,
                    });
                }
                TransportEvent::Closed => {
                    warn!("MQTT connection closed.");
                    self.transition(generation, |state| match state {
                        ConnectionState::Connecting(s) | ConnectionState::Connected(s) => {
                            ConnectionState::Reconnecting(s)
                        }
                        other => other,
                    });
                }
                TransportEvent::Reconnecting => {
                    info!("Reconnecting to MQTT broker...");
                    self.transition(generation, |state| match state {
                        ConnectionState::Connecting(s) | ConnectionState::Connected(s) => {
                            ConnectionState::Reconnecting(s)
                        }
                        other => other,
                    });
                }
            }
        }

        drop(store_tx);
        let _ = writer.await;
    }

    /// Appends inbound messages one at a time, in arrival order.
    async fn write_messages(self: Arc<Self>, mut messages: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = messages.recv().await {
            let storage = self.storage.clone();
            let topic = message.topic.clone();
            let result = tokio::task::spawn_blocking(move || storage.append_message(&message))
                .await
                .unwrap_or_else(|e| Err(StorageError::Task(e.to_string())));
            if let Err(e) = result {
                self.storage_failures.fetch_add(1, Ordering::Relaxed);
                error!("Failed to store message from '{}': {}", topic, e);
                self.emit(ManagerEvent::StorageFailed(e.to_string()));
            }
        }
    }

    async fn after_connect(self: Arc<Self>, generation: u64, session_resumed: bool) {
        if !self.options.resubscribe_delay.is_zero() {
            sleep(self.options.resubscribe_delay).await;
        }
        let Some((transport, client_id)) = self.connected_session(generation) else {
            debug!("Session changed before resubscribing; skipping.");
            return;
        };

        if session_resumed {
            info!("Broker resumed the previous session; keeping its subscriptions.");
        } else {
            self.resubscribe(transport.as_ref()).await;
        }

        let announcement = LivenessAnnouncement::online(&client_id);
        if let Err(e) = transport
            .publish(
                &self.options.status_topic,
                announcement.to_payload(),
                QoS::AtLeastOnce,
                true,
            )
            .await
        {
            warn!("Failed to publish online status: {}", e);
        }
    }

    async fn resubscribe(&self, transport: &dyn Transport) {
        let storage = self.storage.clone();
        let subscriptions =
            match tokio::task::spawn_blocking(move || storage.list_active_subscriptions()).await {
                Ok(Ok(subscriptions)) => subscriptions,
                Ok(Err(e)) => {
                    error!("Failed to load stored subscriptions: {}", e);
                    self.emit(ManagerEvent::StorageFailed(e.to_string()));
                    return;
                }
                Err(e) => {
                    error!("Failed to load stored subscriptions: {}", e);
                    self.emit(ManagerEvent::StorageFailed(e.to_string()));
                    return;
                }
            };

        info!("Resubscribing to {} stored topic(s).", subscriptions.len());
        let results = join_all(
            subscriptions
                .iter()
                .map(|sub| async move { (sub, transport.subscribe(&sub.topic, sub.qos()).await) }),
        )
        .await;

        for (sub, result) in results {
            match result {
                Ok(()) => debug!("Resubscribed to '{}'.", sub.topic),
                Err(e) => {
                    warn!("Failed to resubscribe to '{}': {}", sub.topic, e);
                    self.emit(ManagerEvent::ResubscribeFailed {
                        topic: sub.topic.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }
}

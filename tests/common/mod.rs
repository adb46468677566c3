#![allow(dead_code)]

use async_trait::async_trait;
use galgo_mqtt::config::BrokerConfig;
use galgo_mqtt::models::{InboundMessage, StoredMessage, Subscription};
use galgo_mqtt::mqtt_service::{ConnectionManager, ManagerOptions};
use galgo_mqtt::storage::{Storage, StorageError};
use galgo_mqtt::transport::{
    LastWill, Transport, TransportError, TransportEvent, TransportFactory, TransportSession,
};
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Subscribe(String, QoS),
    Unsubscribe(String),
    Publish {
        topic: String,
        payload: String,
        qos: QoS,
        retain: bool,
    },
    End,
}

#[derive(Default)]
pub struct MockTransport {
    pub calls: Mutex<Vec<Call>>,
    pub fail_publish: AtomicBool,
}

impl MockTransport {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Subscribe(topic, qos) => Some((topic, qos)),
                _ => None,
            })
            .collect()
    }

    pub fn status_publishes(&self, status_topic: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Publish { topic, .. } if topic == status_topic))
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Subscribe(topic.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Unsubscribe(topic.to_string()));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(Call::Publish {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(&payload).into_owned(),
            qos,
            retain,
        });
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    async fn end(&self) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(Call::End);
        Ok(())
    }
}

/// Hands out mock sessions and keeps the event senders so tests can play
/// the broker.
#[derive(Default)]
pub struct MockFactory {
    pub attempts: AtomicUsize,
    pub fail_connect: AtomicBool,
    /// Simulates a slow transport start.
    pub connect_delay_ms: AtomicU64,
    sessions: Mutex<Vec<(Arc<MockTransport>, mpsc::Sender<TransportEvent>)>>,
    pub last_wills: Mutex<Vec<Option<LastWill>>>,
}

impl MockFactory {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        self.sessions.lock().unwrap()[index].0.clone()
    }

    pub fn latest(&self) -> Arc<MockTransport> {
        self.sessions.lock().unwrap().last().unwrap().0.clone()
    }

    pub async fn emit(&self, event: TransportEvent) {
        let sender = self.sessions.lock().unwrap().last().unwrap().1.clone();
        sender.send(event).await.unwrap();
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn connect(
        &self,
        _config: &BrokerConfig,
        last_will: Option<LastWill>,
    ) -> Result<TransportSession, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidOptions("refused by test".to_string()));
        }
        let transport = Arc::new(MockTransport::default());
        let (tx, rx) = mpsc::channel(64);
        self.sessions.lock().unwrap().push((transport.clone(), tx));
        self.last_wills.lock().unwrap().push(last_will);
        Ok((transport, rx))
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    pub subscriptions: Mutex<Vec<Subscription>>,
    pub messages: Mutex<Vec<InboundMessage>>,
    pub fail_appends: AtomicBool,
    pub append_delay_ms: AtomicU64,
}

impl MemoryStorage {
    pub fn with_topics(topics: &[(&str, u8, bool)]) -> Self {
        let storage = Self::default();
        for (topic, qos, active) in topics {
            let sub = storage.upsert_subscription(topic, *qos, false, None).unwrap();
            if !active {
                storage.set_subscription_active(sub.id, false).unwrap();
            }
        }
        storage
    }

    pub fn messages(&self) -> Vec<InboundMessage> {
        self.messages.lock().unwrap().clone()
    }
}

impl Storage for MemoryStorage {
    fn list_active_subscriptions(&self) -> Result<Vec<Subscription>, StorageError> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    fn append_message(&self, message: &InboundMessage) -> Result<(), StorageError> {
        let delay = self.append_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StorageError::Task("disk full".to_string()));
        }
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn list_subscriptions(&self) -> Result<Vec<Subscription>, StorageError> {
        Ok(self.subscriptions.lock().unwrap().clone())
    }

    fn upsert_subscription(
        &self,
        topic: &str,
        qos: u8,
        retain: bool,
        description: Option<&str>,
    ) -> Result<Subscription, StorageError> {
        let mut subs = self.subscriptions.lock().unwrap();
        if let Some(sub) = subs.iter_mut().find(|s| s.topic == topic) {
            sub.qos = qos;
            sub.retain = retain;
            sub.active = true;
            if description.is_some() {
                sub.description = description.map(str::to_string);
            }
            return Ok(sub.clone());
        }
        let sub = Subscription {
            id: subs.len() as i64 + 1,
            topic: topic.to_string(),
            qos,
            retain,
            active: true,
            description: description.map(str::to_string),
        };
        subs.push(sub.clone());
        Ok(sub)
    }

    fn set_subscription_active(&self, id: i64, active: bool) -> Result<Subscription, StorageError> {
        let mut subs = self.subscriptions.lock().unwrap();
        let sub = subs
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StorageError::NotFound(id))?;
        sub.active = active;
        Ok(sub.clone())
    }

    fn remove_subscription(&self, id: i64) -> Result<Option<Subscription>, StorageError> {
        let mut subs = self.subscriptions.lock().unwrap();
        let index = subs.iter().position(|s| s.id == id);
        Ok(index.map(|i| subs.remove(i)))
    }

    fn recent_messages(
        &self,
        topic: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, m)| topic.map_or(true, |t| m.topic == t))
            .take(limit)
            .map(|(i, m)| StoredMessage {
                id: i as i64 + 1,
                topic: m.topic.clone(),
                payload: m.payload_text(),
                qos: galgo_mqtt::models::qos_to_u8(m.qos),
                retain: m.retain,
                timestamp: galgo_mqtt::models::format_timestamp(m.received_at),
            })
            .collect())
    }
}

pub const STATUS_TOPIC: &str = "galgo/status";

pub fn options() -> ManagerOptions {
    ManagerOptions {
        status_topic: STATUS_TOPIC.to_string(),
        resubscribe_delay: Duration::ZERO,
        offline_publish_timeout: Duration::from_millis(200),
        message_buffer: 1024,
    }
}

pub fn broker_config() -> BrokerConfig {
    let mut config = BrokerConfig::new("mqtt://broker:1883", "fixed-1");
    config.connect_timeout_ms = 2_000;
    config
}

pub fn setup(storage: MemoryStorage) -> (Arc<ConnectionManager>, Arc<MockFactory>, Arc<MemoryStorage>) {
    setup_with(storage, options())
}

pub fn setup_with(
    storage: MemoryStorage,
    options: ManagerOptions,
) -> (Arc<ConnectionManager>, Arc<MockFactory>, Arc<MemoryStorage>) {
    let storage = Arc::new(storage);
    let factory = Arc::new(MockFactory::default());
    let manager = ConnectionManager::new(storage.clone(), factory.clone(), options);
    (manager, factory, storage)
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Runs `connect` and plays a successful CONNACK.
pub async fn connect_and_ack(manager: &Arc<ConnectionManager>, factory: &Arc<MockFactory>) {
    let attempts_before = factory.attempts();
    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(broker_config()).await })
    };
    assert!(eventually(|| factory.attempts() > attempts_before).await);
    // Give connect() a moment to publish the Connecting state.
    assert!(eventually(|| manager.status().state == "connecting").await);
    factory
        .emit(TransportEvent::Connected {
            session_resumed: false,
        })
        .await;
    task.await.unwrap().unwrap();
    assert!(manager.status().connected);
}

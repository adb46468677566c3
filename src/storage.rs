//! Persistence collaborator consumed by the connection manager.
//!
//! The manager never keeps a durable copy of subscriptions or messages; it
//! reads and writes through this trait only. Every call is expected to be
//! atomic on its own.

use crate::models::{InboundMessage, StoredMessage, Subscription};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("Storage task failed: {0}")]
    Task(String),
    #[error("Subscription {0} not found")]
    NotFound(i64),
}

pub trait Storage: Send + Sync {
    /// Subscriptions to re-assert against the broker after a connect.
    fn list_active_subscriptions(&self) -> Result<Vec<Subscription>, StorageError>;

    fn append_message(&self, message: &InboundMessage) -> Result<(), StorageError>;

    fn list_subscriptions(&self) -> Result<Vec<Subscription>, StorageError>;

    /// Inserts the topic or updates qos/retain/description of an existing one.
    /// Upserted subscriptions are active.
    fn upsert_subscription(
        &self,
        topic: &str,
        qos: u8,
        retain: bool,
        description: Option<&str>,
    ) -> Result<Subscription, StorageError>;

    fn set_subscription_active(&self, id: i64, active: bool) -> Result<Subscription, StorageError>;

    fn remove_subscription(&self, id: i64) -> Result<Option<Subscription>, StorageError>;

    /// Newest first.
    fn recent_messages(
        &self,
        topic: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StorageError>;
}

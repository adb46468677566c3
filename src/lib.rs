pub mod config;
pub mod db;
pub mod models;
pub mod mqtt_service;
pub mod rest_server;
pub mod service_utils;
pub mod storage;
pub mod transport;

pub use config::{BrokerConfig, Config};
pub use mqtt_service::{ConnectionManager, ManagerError, ManagerEvent, ManagerOptions, PublishOptions};
pub use storage::{Storage, StorageError};
pub use transport::{Transport, TransportError, TransportEvent, TransportFactory};

use crate::config::BrokerConfig;
use crate::mqtt_service::{ConnectionManager, ManagerEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Start the MQTT connection in the background.
pub fn start_mqtt_service(manager: Arc<ConnectionManager>, config: BrokerConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = manager.connect(config).await {
            error!("Failed to start MQTT connection: {}", e);
        }
    })
}

/// Log background connection events until the manager goes away.
pub fn log_manager_events(manager: &ConnectionManager) -> JoinHandle<()> {
    let mut events = manager.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ManagerEvent::StateChanged(status)) => info!(
                    "MQTT status: {} (broker: '{}', client id: '{}')",
                    status.state, status.broker, status.client_id
                ),
                Ok(ManagerEvent::MessageReceived(message)) => {
                    debug!("Message on '{}' ({} bytes)", message.topic, message.payload.len())
                }
                Ok(ManagerEvent::TransportFailed(reason)) => warn!("MQTT transport failure: {}", reason),
                Ok(ManagerEvent::StorageFailed(reason)) => warn!("Message storage failure: {}", reason),
                Ok(ManagerEvent::ResubscribeFailed { topic, error }) => {
                    warn!("Resubscribe to '{}' failed: {}", topic, error)
                }
                Err(RecvError::Lagged(skipped)) => warn!("Event logger skipped {} events.", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Handle graceful shutdown: wait for Ctrl-C, then announce offline and disconnect.
pub async fn handle_shutdown(manager: Arc<ConnectionManager>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    } else {
        info!("Shutting down...");
    }
    manager.disconnect().await;
}

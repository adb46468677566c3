use galgo_mqtt::config::Config;
use galgo_mqtt::db::DatabaseService;
use galgo_mqtt::mqtt_service::{ConnectionManager, ManagerOptions};
use galgo_mqtt::rest_server::run_rest_server;
use galgo_mqtt::service_utils::{handle_shutdown, log_manager_events, start_mqtt_service};
use galgo_mqtt::storage::Storage;
use galgo_mqtt::transport::RumqttTransportFactory;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const CLIENT_ID_PREFIX: &str = "galgo_dashboard";

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let mut config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let db_service = match DatabaseService::new(&config.database_path) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to create database service: {:?}", e);
            return;
        }
    };

    if let Err(e) = db_service.initialize_db() {
        error!("Database initialization failed: {:?}", e);
        return;
    }
    info!("Database initialized successfully.");

    if config.broker.client_id.is_empty() {
        match db_service.load_or_create_client_id(CLIENT_ID_PREFIX) {
            Ok(client_id) => config.broker.client_id = client_id,
            Err(e) => {
                error!("Failed to load persistent client id: {:?}", e);
                return;
            }
        }
    }

    if let Err(e) = config.broker.validate() {
        error!("Invalid broker configuration: {}", e);
        return;
    }

    let storage: Arc<dyn Storage> = db_service;
    let manager = ConnectionManager::new(
        storage.clone(),
        Arc::new(RumqttTransportFactory::default()),
        ManagerOptions {
            status_topic: config.status_topic.clone(),
            resubscribe_delay: config.resubscribe_delay(),
            ..ManagerOptions::default()
        },
    );

    log_manager_events(&manager);

    if config.auto_connect {
        start_mqtt_service(manager.clone(), config.broker.clone());
    } else {
        info!("MQTT_AUTO_CONNECT is off; waiting for a connect request.");
    }

    // Start REST API server
    let rest_api_task = tokio::spawn(run_rest_server(
        manager.clone(),
        storage,
        config.broker.clone(),
    ));

    handle_shutdown(manager).await;

    // Rocket stops on Ctrl-C as well; don't hang if it does not.
    let _ = tokio::time::timeout(Duration::from_secs(5), rest_api_task).await;
    info!("All services shut down successfully.");
}

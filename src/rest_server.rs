use crate::config::BrokerConfig;
use crate::models::{qos_from_u8, ConnectionStatus, StoredMessage, Subscription};
use crate::mqtt_service::{ConnectionManager, ManagerError, PublishOptions};
use crate::storage::{Storage, StorageError};
use crate::transport::TransportError;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Status;
use rocket::serde::{json::Json, Deserialize, Serialize};
use rocket::{delete, get, options, post, put, routes, Build, Rocket, State};
use std::sync::Arc;
use tracing::{error, warn};

/// API Response
#[derive(Serialize, Deserialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct ApiResponse {
    pub status: String,
    pub message: String,
}

impl ApiResponse {
    fn success(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: "success".to_string(),
            message: message.into(),
        })
    }
}

type ApiError = (Status, Json<ApiResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(status: Status, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ApiResponse {
            status: "error".to_string(),
            message: message.into(),
        }),
    )
}

fn manager_error(err: ManagerError) -> ApiError {
    match err {
        ManagerError::NotConnected => api_error(Status::Conflict, err.to_string()),
        ManagerError::Transport(TransportError::InvalidOptions(_)) => {
            api_error(Status::BadRequest, err.to_string())
        }
        ManagerError::Transport(_) => api_error(Status::BadGateway, err.to_string()),
    }
}

fn storage_error(err: StorageError) -> ApiError {
    match err {
        StorageError::NotFound(_) => api_error(Status::NotFound, err.to_string()),
        _ => {
            error!("Storage error: {}", err);
            api_error(Status::InternalServerError, "storage error")
        }
    }
}

/// Broker settings used when a connect request leaves fields out.
pub struct BrokerDefaults(pub BrokerConfig);

#[derive(Deserialize, Default)]
#[serde(crate = "rocket::serde")]
struct ConnectRequest {
    address: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
struct PublishRequest {
    topic: String,
    payload: String,
    #[serde(default)]
    qos: u8,
    #[serde(default)]
    retain: bool,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
struct TopicRequest {
    topic: String,
    #[serde(default)]
    qos: u8,
    #[serde(default)]
    retain: bool,
    description: Option<String>,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
struct ActiveRequest {
    active: bool,
}

/// CORS Fairing for Rocket
pub struct Cors;

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "CORS",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r rocket::Request<'_>, res: &mut rocket::Response<'r>) {
        res.set_header(rocket::http::Header::new("Access-Control-Allow-Origin", "*"));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Methods",
            "GET, POST, PUT, DELETE, OPTIONS",
        ));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Headers",
            "Content-Type",
        ));
    }
}

#[options("/<_..>")]
fn preflight() -> Status {
    Status::NoContent
}

/// Root handler
#[get("/")]
fn root_handler() -> Json<ApiResponse> {
    ApiResponse::success("Galgo MQTT service")
}

#[get("/mqtt/status")]
fn status(manager: &State<Arc<ConnectionManager>>) -> Json<ConnectionStatus> {
    Json(manager.status())
}

#[post("/mqtt/connect", data = "<request>")]
async fn connect(
    request: Option<Json<ConnectRequest>>,
    manager: &State<Arc<ConnectionManager>>,
    defaults: &State<BrokerDefaults>,
) -> ApiResult<ConnectionStatus> {
    let request = request.map(Json::into_inner).unwrap_or_default();
    let mut config = defaults.0.clone();
    if let Some(address) = request.address {
        config.address = address;
    }
    if request.username.is_some() {
        config.username = request.username;
        config.password = request.password;
    }
    config
        .validate()
        .map_err(|e| api_error(Status::BadRequest, e.to_string()))?;

    manager.connect(config).await.map_err(manager_error)?;
    Ok(Json(manager.status()))
}

#[post("/mqtt/disconnect")]
async fn disconnect(manager: &State<Arc<ConnectionManager>>) -> Json<ConnectionStatus> {
    manager.disconnect().await;
    Json(manager.status())
}

#[post("/mqtt/publish", data = "<request>")]
async fn publish(
    request: Json<PublishRequest>,
    manager: &State<Arc<ConnectionManager>>,
) -> ApiResult<ApiResponse> {
    let request = request.into_inner();
    let options = PublishOptions {
        qos: qos_from_u8(request.qos),
        retain: request.retain,
    };
    manager
        .publish(&request.topic, request.payload, options)
        .await
        .map_err(manager_error)?;
    Ok(ApiResponse::success(format!("published to '{}'", request.topic)))
}

#[get("/mqtt/topics")]
fn list_topics(storage: &State<Arc<dyn Storage>>) -> ApiResult<Vec<Subscription>> {
    storage.list_subscriptions().map(Json).map_err(storage_error)
}

/// Stores the topic and subscribes right away when connected; otherwise the
/// subscription is picked up on the next connect.
#[post("/mqtt/topics", data = "<request>")]
async fn add_topic(
    request: Json<TopicRequest>,
    manager: &State<Arc<ConnectionManager>>,
    storage: &State<Arc<dyn Storage>>,
) -> ApiResult<Subscription> {
    let request = request.into_inner();
    if request.topic.trim().is_empty() {
        return Err(api_error(Status::BadRequest, "topic must not be empty"));
    }
    let sub = storage
        .upsert_subscription(
            &request.topic,
            request.qos,
            request.retain,
            request.description.as_deref(),
        )
        .map_err(storage_error)?;

    match manager.subscribe(&sub.topic, sub.qos()).await {
        Ok(()) | Err(ManagerError::NotConnected) => Ok(Json(sub)),
        Err(e) => Err(manager_error(e)),
    }
}

#[put("/mqtt/topics/<id>/active", data = "<request>")]
async fn set_topic_active(
    id: i64,
    request: Json<ActiveRequest>,
    manager: &State<Arc<ConnectionManager>>,
    storage: &State<Arc<dyn Storage>>,
) -> ApiResult<Subscription> {
    let sub = storage
        .set_subscription_active(id, request.active)
        .map_err(storage_error)?;

    let result = if sub.active {
        manager.subscribe(&sub.topic, sub.qos()).await
    } else {
        manager.unsubscribe(&sub.topic).await
    };
    match result {
        Ok(()) | Err(ManagerError::NotConnected) => Ok(Json(sub)),
        Err(e) => Err(manager_error(e)),
    }
}

#[delete("/mqtt/topics/<id>")]
async fn delete_topic(
    id: i64,
    manager: &State<Arc<ConnectionManager>>,
    storage: &State<Arc<dyn Storage>>,
) -> ApiResult<Subscription> {
    let sub = storage
        .remove_subscription(id)
        .map_err(storage_error)?
        .ok_or_else(|| api_error(Status::NotFound, format!("subscription {} not found", id)))?;

    if let Err(e) = manager.unsubscribe(&sub.topic).await {
        // The row is gone either way; the broker side follows on reconnect.
        warn!("Unsubscribe from '{}' after delete failed: {}", sub.topic, e);
    }
    Ok(Json(sub))
}

/// Get the last `limit` logged messages, optionally for one topic.
#[get("/mqtt/messages?<topic>&<limit>")]
fn messages(
    topic: Option<String>,
    limit: Option<usize>,
    storage: &State<Arc<dyn Storage>>,
) -> ApiResult<Vec<StoredMessage>> {
    let limit = limit.unwrap_or(50).min(1000);
    storage
        .recent_messages(topic.as_deref(), limit)
        .map(Json)
        .map_err(storage_error)
}

pub fn build_rocket(
    manager: Arc<ConnectionManager>,
    storage: Arc<dyn Storage>,
    defaults: BrokerConfig,
) -> Rocket<Build> {
    rocket::build()
        .manage(manager)
        .manage(storage)
        .manage(BrokerDefaults(defaults))
        .mount(
            "/",
            routes![
                root_handler,
                preflight,
                status,
                connect,
                disconnect,
                publish,
                list_topics,
                add_topic,
                set_topic_active,
                delete_topic,
                messages
            ],
        )
        .attach(Cors)
}

/// Run the Rocket server until it shuts down.
pub async fn run_rest_server(
    manager: Arc<ConnectionManager>,
    storage: Arc<dyn Storage>,
    defaults: BrokerConfig,
) {
    if let Err(e) = build_rocket(manager, storage, defaults).launch().await {
        error!("REST server failed: {}", e);
    }
}

//! REST control surface tests using Rocket's local client.

mod common;

use common::{broker_config, connect_and_ack, setup, Call, MemoryStorage};
use galgo_mqtt::models::InboundMessage;
use galgo_mqtt::rest_server::build_rocket;
use galgo_mqtt::storage::Storage;
use rocket::http::{ContentType, Status};
use rocket::local::asynchronous::Client;
use rumqttc::QoS;
use serde_json::{json, Value};
use std::sync::Arc;

async fn client_for(
    manager: Arc<galgo_mqtt::ConnectionManager>,
    storage: Arc<MemoryStorage>,
) -> Client {
    let storage: Arc<dyn Storage> = storage;
    Client::tracked(build_rocket(manager, storage, broker_config()))
        .await
        .expect("valid rocket instance")
}

#[tokio::test]
async fn status_starts_disconnected() {
    let (manager, _, storage) = setup(MemoryStorage::default());
    let client = client_for(manager, storage).await;

    let response = client.get("/mqtt/status").dispatch().await;
    assert_eq!(response.status(), Status::Ok);
    let body: Value = response.into_json().await.unwrap();
    assert_eq!(body["connected"], false);
    assert_eq!(body["state"], "disconnected");
}

#[tokio::test]
async fn publish_while_disconnected_is_conflict() {
    let (manager, factory, storage) = setup(MemoryStorage::default());
    let client = client_for(manager, storage).await;

    let response = client
        .post("/mqtt/publish")
        .header(ContentType::JSON)
        .body(json!({"topic": "x", "payload": "y"}).to_string())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Conflict);
    assert_eq!(factory.attempts(), 0);
}

#[tokio::test]
async fn connect_rejects_invalid_address() {
    let (manager, factory, storage) = setup(MemoryStorage::default());
    let client = client_for(manager, storage).await;

    let response = client
        .post("/mqtt/connect")
        .header(ContentType::JSON)
        .body(json!({"address": "ws://broker:9001"}).to_string())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::BadRequest);
    assert_eq!(factory.attempts(), 0);
}

#[tokio::test]
async fn topics_added_offline_are_only_stored() {
    let (manager, factory, storage) = setup(MemoryStorage::default());
    let client = client_for(manager, storage.clone()).await;

    let response = client
        .post("/mqtt/topics")
        .header(ContentType::JSON)
        .body(json!({"topic": "sensors/+/+", "qos": 1}).to_string())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let body: Value = response.into_json().await.unwrap();
    assert_eq!(body["topic"], "sensors/+/+");
    assert_eq!(body["active"], true);

    assert_eq!(storage.list_active_subscriptions().unwrap().len(), 1);
    assert_eq!(factory.attempts(), 0);

    let listed: Value = client
        .get("/mqtt/topics")
        .dispatch()
        .await
        .into_json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn topic_changes_follow_through_to_the_broker() {
    let (manager, factory, storage) = setup(MemoryStorage::default());
    connect_and_ack(&manager, &factory).await;
    let transport = factory.latest();
    let client = client_for(manager, storage.clone()).await;

    let created: Value = client
        .post("/mqtt/topics")
        .header(ContentType::JSON)
        .body(json!({"topic": "sensors/+/+", "qos": 0}).to_string())
        .dispatch()
        .await
        .into_json()
        .await
        .unwrap();
    let id = created["id"].as_i64().unwrap();
    assert!(transport
        .calls()
        .contains(&Call::Subscribe("sensors/+/+".to_string(), QoS::AtMostOnce)));

    let response = client
        .put(format!("/mqtt/topics/{}/active", id))
        .header(ContentType::JSON)
        .body(json!({"active": false}).to_string())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    assert!(storage.list_active_subscriptions().unwrap().is_empty());
    assert!(transport
        .calls()
        .contains(&Call::Unsubscribe("sensors/+/+".to_string())));

    let response = client.delete(format!("/mqtt/topics/{}", id)).dispatch().await;
    assert_eq!(response.status(), Status::Ok);
    assert!(storage.list_subscriptions().unwrap().is_empty());

    let response = client.delete(format!("/mqtt/topics/{}", id)).dispatch().await;
    assert_eq!(response.status(), Status::NotFound);
}

#[tokio::test]
async fn publish_reaches_transport_when_connected() {
    let (manager, factory, storage) = setup(MemoryStorage::default());
    connect_and_ack(&manager, &factory).await;
    let transport = factory.latest();
    let client = client_for(manager, storage).await;

    let response = client
        .post("/mqtt/publish")
        .header(ContentType::JSON)
        .body(json!({"topic": "actuators/fan", "payload": "on", "qos": 1, "retain": true}).to_string())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    assert!(transport.calls().contains(&Call::Publish {
        topic: "actuators/fan".to_string(),
        payload: "on".to_string(),
        qos: QoS::AtLeastOnce,
        retain: true,
    }));
}

#[tokio::test]
async fn messages_endpoint_filters_by_topic() {
    let (manager, _, storage) = setup(MemoryStorage::default());
    storage
        .append_message(&InboundMessage::new("sensors/temperature/ambient", "23.5", QoS::AtMostOnce, false))
        .unwrap();
    storage
        .append_message(&InboundMessage::new("sensors/humidity/ambient", "41", QoS::AtMostOnce, false))
        .unwrap();
    let client = client_for(manager, storage).await;

    let all: Value = client
        .get("/mqtt/messages")
        .dispatch()
        .await
        .into_json()
        .await
        .unwrap();
    assert_eq!(all.as_array().unwrap().len(), 2);
    assert_eq!(all[0]["topic"], "sensors/humidity/ambient");

    let filtered: Value = client
        .get("/mqtt/messages?topic=sensors%2Ftemperature%2Fambient&limit=5")
        .dispatch()
        .await
        .into_json()
        .await
        .unwrap();
    assert_eq!(filtered.as_array().unwrap().len(), 1);
    assert_eq!(filtered[0]["payload"], "23.5");
}

#[tokio::test]
async fn disconnect_endpoint_is_idempotent() {
    let (manager, factory, storage) = setup(MemoryStorage::default());
    connect_and_ack(&manager, &factory).await;
    let client = client_for(manager, storage).await;

    for _ in 0..2 {
        let body: Value = client
            .post("/mqtt/disconnect")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(body["connected"], false);
    }
}

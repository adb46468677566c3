use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// A persisted topic filter the dashboard wants to receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub topic: String,
    pub qos: u8,
    pub retain: bool,
    pub active: bool,
    pub description: Option<String>,
}

impl Subscription {
    pub fn qos(&self) -> QoS {
        qos_from_u8(self.qos)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub received_at: OffsetDateTime,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            received_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// A row of the message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
    pub timestamp: String,
}

/// Read-only snapshot of the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub broker: String,
    pub client_id: String,
    pub reconnecting: bool,
    pub state: &'static str,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            connected: false,
            broker: String::new(),
            client_id: String::new(),
            reconnecting: false,
            state: "disconnected",
        }
    }
}

/// Retained payload published on the status topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LivenessAnnouncement {
    pub status: String,
    pub timestamp: String,
    pub client_id: String,
}

impl LivenessAnnouncement {
    pub fn online(client_id: &str) -> Self {
        Self::with_status("online", client_id)
    }

    pub fn offline(client_id: &str) -> Self {
        Self::with_status("offline", client_id)
    }

    fn with_status(status: &str, client_id: &str) -> Self {
        Self {
            status: status.to_string(),
            timestamp: format_timestamp(OffsetDateTime::now_utc()),
            client_id: client_id.to_string(),
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        // Serializing a struct of plain strings cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

pub fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// Anything above 2 is clamped to exactly-once.
pub fn qos_from_u8(value: u8) -> QoS {
    match value {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

pub fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

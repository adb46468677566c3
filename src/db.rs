use crate::models::{format_timestamp, qos_to_u8, InboundMessage, StoredMessage, Subscription};
use crate::storage::{Storage, StorageError};
use log::{error, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

type SqlitePool = Pool<SqliteConnectionManager>;

const CLIENT_ID_KEY: &str = "mqtt_client_id";

pub struct DatabaseService {
    pool: SqlitePool,
}

impl DatabaseService {
    /// Creates a new `DatabaseService` and ensures the database connection is valid.
    pub fn new(db_path: &str) -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.execute_batch("PRAGMA journal_mode = WAL;"));
        let pool = Pool::builder().max_size(4).build(manager)?;
        Ok(Self { pool })
    }

    /// A private in-memory database. The pool holds a single connection so
    /// every caller sees the same data.
    pub fn in_memory() -> Result<Self, StorageError> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        Ok(self.pool.get()?)
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS mqtt_topics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic TEXT NOT NULL UNIQUE,
            qos INTEGER NOT NULL DEFAULT 0,
            retain BOOLEAN NOT NULL DEFAULT 0,
            active BOOLEAN NOT NULL DEFAULT 1,
            description TEXT
        );

        CREATE TABLE IF NOT EXISTS mqtt_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic TEXT NOT NULL,
            payload TEXT NOT NULL,
            qos INTEGER NOT NULL DEFAULT 0,
            retain BOOLEAN NOT NULL DEFAULT 0,
            timestamp TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_mqtt_messages_topic ON mqtt_messages(topic);
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    /// Returns the persisted MQTT client id, generating and storing one on
    /// first use so restarts reuse the same broker session.
    pub fn load_or_create_client_id(&self, prefix: &str) -> Result<String, StorageError> {
        let conn = self.conn()?;

        let existing: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![CLIENT_ID_KEY],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(client_id) = existing {
            return Ok(client_id);
        }

        let client_id = format!("{}_{}", prefix, Uuid::new_v4().simple());
        // INSERT OR IGNORE keeps the first writer's id if two processes race.
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
            params![CLIENT_ID_KEY, client_id],
        )?;
        let stored: String = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![CLIENT_ID_KEY],
            |row| row.get(0),
        )?;
        info!("Generated persistent MQTT client id '{}'.", stored);
        Ok(stored)
    }

    fn subscription_by_id(&self, id: i64) -> Result<Option<Subscription>, StorageError> {
        let conn = self.conn()?;
        let sub = conn
            .query_row(
                "SELECT id, topic, qos, retain, active, description FROM mqtt_topics WHERE id = ?1",
                params![id],
                subscription_from_row,
            )
            .optional()?;
        Ok(sub)
    }
}

fn subscription_from_row(row: &Row<'_>) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        id: row.get(0)?,
        topic: row.get(1)?,
        qos: row.get(2)?,
        retain: row.get(3)?,
        active: row.get(4)?,
        description: row.get(5)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        topic: row.get(1)?,
        payload: row.get(2)?,
        qos: row.get(3)?,
        retain: row.get(4)?,
        timestamp: row.get(5)?,
    })
}

impl Storage for DatabaseService {
    fn list_active_subscriptions(&self) -> Result<Vec<Subscription>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, topic, qos, retain, active, description
             FROM mqtt_topics WHERE active = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], subscription_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn append_message(&self, message: &InboundMessage) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO mqtt_messages (topic, payload, qos, retain, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.topic,
                message.payload_text(),
                qos_to_u8(message.qos),
                message.retain,
                format_timestamp(message.received_at),
            ],
        )?;
        Ok(())
    }

    fn list_subscriptions(&self) -> Result<Vec<Subscription>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, topic, qos, retain, active, description FROM mqtt_topics ORDER BY id",
        )?;
        let rows = stmt.query_map([], subscription_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn upsert_subscription(
        &self,
        topic: &str,
        qos: u8,
        retain: bool,
        description: Option<&str>,
    ) -> Result<Subscription, StorageError> {
        let conn = self.conn()?;
        let sub = conn.query_row(
            r#"
            INSERT INTO mqtt_topics (topic, qos, retain, active, description)
            VALUES (?1, ?2, ?3, 1, ?4)
            ON CONFLICT(topic) DO UPDATE SET
                qos = excluded.qos,
                retain = excluded.retain,
                active = 1,
                description = COALESCE(excluded.description, mqtt_topics.description)
            RETURNING id, topic, qos, retain, active, description
            "#,
            params![topic, qos.min(2), retain, description],
            subscription_from_row,
        )?;
        Ok(sub)
    }

    fn set_subscription_active(&self, id: i64, active: bool) -> Result<Subscription, StorageError> {
        let changed = {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE mqtt_topics SET active = ?1 WHERE id = ?2",
                params![active, id],
            )?
        };
        if changed == 0 {
            return Err(StorageError::NotFound(id));
        }
        self.subscription_by_id(id)?.ok_or(StorageError::NotFound(id))
    }

    fn remove_subscription(&self, id: i64) -> Result<Option<Subscription>, StorageError> {
        let existing = self.subscription_by_id(id)?;
        if existing.is_some() {
            let conn = self.conn()?;
            conn.execute("DELETE FROM mqtt_topics WHERE id = ?1", params![id])?;
        }
        Ok(existing)
    }

    fn recent_messages(
        &self,
        topic: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let conn = self.conn()?;
        let limit = limit as i64;
        let messages = match topic {
            Some(topic) => {
                let mut stmt = conn.prepare(
                    "SELECT id, topic, payload, qos, retain, timestamp FROM mqtt_messages
                     WHERE topic = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![topic, limit], message_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, topic, payload, qos, retain, timestamp FROM mqtt_messages
                     ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], message_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::QoS;

    fn db() -> DatabaseService {
        let db = DatabaseService::in_memory().unwrap();
        db.initialize_db().unwrap();
        db
    }

    #[test]
    fn upsert_reactivates_and_updates_qos() {
        let db = db();
        let sub = db.upsert_subscription("sensors/+/+", 0, false, Some("all sensors")).unwrap();
        assert!(sub.active);

        db.set_subscription_active(sub.id, false).unwrap();
        assert!(db.list_active_subscriptions().unwrap().is_empty());

        let again = db.upsert_subscription("sensors/+/+", 1, false, None).unwrap();
        assert_eq!(again.id, sub.id);
        assert_eq!(again.qos, 1);
        assert!(again.active);
        assert_eq!(again.description.as_deref(), Some("all sensors"));
    }

    #[test]
    fn only_active_subscriptions_are_listed_for_resubscribe() {
        let db = db();
        db.upsert_subscription("sensors/+/+", 0, false, None).unwrap();
        let status = db.upsert_subscription("galgo/status", 1, false, None).unwrap();
        let cams = db.upsert_subscription("cameras/#", 0, false, None).unwrap();
        db.set_subscription_active(cams.id, false).unwrap();

        let active = db.list_active_subscriptions().unwrap();
        let topics: Vec<_> = active.iter().map(|s| s.topic.as_str()).collect();
        assert_eq!(topics, vec!["sensors/+/+", "galgo/status"]);
        assert_eq!(active[1].id, status.id);
        assert_eq!(db.list_subscriptions().unwrap().len(), 3);
    }

    #[test]
    fn set_active_on_missing_row_is_not_found() {
        let db = db();
        assert!(matches!(
            db.set_subscription_active(42, true),
            Err(StorageError::NotFound(42))
        ));
    }

    #[test]
    fn remove_returns_the_deleted_row() {
        let db = db();
        let sub = db.upsert_subscription("sensors/+/+", 0, false, None).unwrap();
        assert_eq!(db.remove_subscription(sub.id).unwrap().unwrap().topic, "sensors/+/+");
        assert!(db.remove_subscription(sub.id).unwrap().is_none());
    }

    #[test]
    fn messages_are_logged_in_order() {
        let db = db();
        db.append_message(&InboundMessage::new("sensors/temperature/ambient", "23.5", QoS::AtMostOnce, false))
            .unwrap();
        db.append_message(&InboundMessage::new("sensors/humidity/ambient", "41", QoS::AtLeastOnce, true))
            .unwrap();

        let all = db.recent_messages(None, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].topic, "sensors/humidity/ambient");
        assert!(all[0].retain);
        assert_eq!(all[1].payload, "23.5");

        let temp = db.recent_messages(Some("sensors/temperature/ambient"), 10).unwrap();
        assert_eq!(temp.len(), 1);
        assert_eq!(temp[0].qos, 0);
    }

    #[test]
    fn client_id_is_stable_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("galgo.db");
        let path = path.to_str().unwrap();

        let first = {
            let db = DatabaseService::new(path).unwrap();
            db.initialize_db().unwrap();
            db.load_or_create_client_id("galgo_dashboard").unwrap()
        };
        assert!(first.starts_with("galgo_dashboard_"));

        let db = DatabaseService::new(path).unwrap();
        db.initialize_db().unwrap();
        assert_eq!(db.load_or_create_client_id("galgo_dashboard").unwrap(), first);
    }
}

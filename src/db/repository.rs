//! Database repository for devices, topics and notifications.
//!
//! Every public operation is atomic on its own. Topic deduplication relies on
//! the `UNIQUE` constraint on `topic_name` rather than on any in-process lock,
//! so several relay processes may share one database file. A closed store
//! rejects every call with `StoreError::Closed` before looking at the input.

use chrono::Utc;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::errors::StoreError;
use crate::models::{
    Device, Notification, NotificationStatus, StoredNotification, Topic, MAX_TOPIC_NAME_LENGTH,
};

const NOTIFICATION_COLUMNS: &str = "n.notification_id, n.topic_id, t.topic_name, n.timestamp, \
     n.message, n.metadata, n.status FROM notifications n \
     JOIN topics t ON t.topic_id = n.topic_id";

/// Result of recording a failed delivery against a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Counter incremented, device kept.
    Counted(i64),
    /// Counter reached the threshold and the device was removed.
    Deregistered,
    /// The device no longer exists.
    UnknownDevice,
}

/// Database repository for all relay data.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.pool.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Close the underlying pool. Every later call fails with `StoreError::Closed`.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ==================== DEVICE OPERATIONS ====================

    /// Register a device. Fails on blank input or an already known id.
    pub async fn register_device(
        &self,
        device_id: &str,
        public_key: &str,
    ) -> Result<Device, StoreError> {
        self.ensure_open()?;
        validate_device(device_id, public_key)?;

        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO devices (device_id, public_key, registration_date) VALUES (?, ?, ?)",
        )
        .bind(device_id)
        .bind(public_key)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(Device {
                device_id: device_id.to_string(),
                public_key: public_key.to_string(),
                registration_date: now,
                consecutive_failures: 0,
            }),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateDevice(device_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a device. Returns whether a row was deleted.
    pub async fn delete_device(&self, device_id: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let result = sqlx::query("DELETE FROM devices WHERE device_id = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Get a device by ID.
    pub async fn get_device(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        self.ensure_open()?;
        let row = sqlx::query(
            "SELECT device_id, public_key, registration_date, consecutive_failures FROM devices WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(device_from_row))
    }

    /// List all registered devices.
    pub async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        self.ensure_open()?;
        let rows = sqlx::query(
            "SELECT device_id, public_key, registration_date, consecutive_failures FROM devices ORDER BY registration_date",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(device_from_row).collect())
    }

    /// Reset the consecutive-failure counter after a successful delivery.
    pub async fn record_delivery_success(&self, device_id: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        sqlx::query(
            "UPDATE devices SET consecutive_failures = 0 WHERE device_id = ? AND consecutive_failures <> 0",
        )
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count a failed delivery and deregister the device once the counter
    /// reaches `threshold`.
    pub async fn record_delivery_failure(
        &self,
        device_id: &str,
        threshold: i64,
    ) -> Result<FailureOutcome, StoreError> {
        self.ensure_open()?;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "UPDATE devices SET consecutive_failures = consecutive_failures + 1 WHERE device_id = ? RETURNING consecutive_failures",
        )
        .bind(device_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(FailureOutcome::UnknownDevice);
        };
        let failures: i64 = row.get("consecutive_failures");

        let outcome = if failures >= threshold {
            sqlx::query("DELETE FROM devices WHERE device_id = ?")
                .bind(device_id)
                .execute(&mut *tx)
                .await?;
            FailureOutcome::Deregistered
        } else {
            FailureOutcome::Counted(failures)
        };

        tx.commit().await?;
        Ok(outcome)
    }

    // ==================== TOPIC OPERATIONS ====================

    /// Return the id of the topic named `name`, creating it if needed.
    ///
    /// The description is only written by the call that creates the row;
    /// later calls never update it.
    pub async fn get_or_create_topic(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<i64, StoreError> {
        self.ensure_open()?;
        validate_topic(name)?;

        let mut tx = self.pool.begin().await?;
        let topic_id = upsert_topic(&mut *tx, name, description).await?;
        tx.commit().await?;
        Ok(topic_id)
    }

    /// List all topics.
    pub async fn list_topics(&self) -> Result<Vec<Topic>, StoreError> {
        self.ensure_open()?;
        let rows = sqlx::query(
            "SELECT topic_id, topic_name, description, creation_date FROM topics ORDER BY topic_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(topic_from_row).collect())
    }

    // ==================== NOTIFICATION OPERATIONS ====================

    /// Persist a parsed notification in status INPUT and return its id.
    pub async fn insert_notification(&self, notif: &Notification) -> Result<i64, StoreError> {
        self.ensure_open()?;
        validate_notification(notif)?;
        let metadata_json = serde_json::to_string(&notif.metadata)?;

        // Topic and notification commit together or not at all
        let mut tx = self.pool.begin().await?;
        let topic_id = upsert_topic(&mut *tx, &notif.topic, None).await?;

        let result = sqlx::query(
            "INSERT INTO notifications (topic_id, timestamp, message, metadata, status) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(topic_id)
        .bind(Utc::now().to_rfc3339())
        .bind(&notif.message)
        .bind(&metadata_json)
        .bind(NotificationStatus::Input.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    /// Move a notification from INPUT to SENT. Returns whether it moved.
    pub async fn mark_sent(&self, notification_id: i64) -> Result<bool, StoreError> {
        self.finish(notification_id, NotificationStatus::Sent).await
    }

    /// Move a notification from INPUT to ERROR. Returns whether it moved.
    pub async fn mark_error(&self, notification_id: i64) -> Result<bool, StoreError> {
        self.finish(notification_id, NotificationStatus::Error).await
    }

    /// Conditional transition out of INPUT. Unknown or already terminal ids
    /// affect zero rows, which is not an error.
    async fn finish(
        &self,
        notification_id: i64,
        status: NotificationStatus,
    ) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let result = sqlx::query(
            "UPDATE notifications SET status = ? WHERE notification_id = ? AND status = ?",
        )
        .bind(status.as_str())
        .bind(notification_id)
        .bind(NotificationStatus::Input.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Get a notification by ID.
    pub async fn get_notification(
        &self,
        notification_id: i64,
    ) -> Result<Option<StoredNotification>, StoreError> {
        self.ensure_open()?;
        let row = sqlx::query(&format!(
            "SELECT {NOTIFICATION_COLUMNS} WHERE n.notification_id = ?"
        ))
        .bind(notification_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(notification_from_row))
    }

    /// List notifications with an id greater than `after_id`, oldest first.
    pub async fn list_notifications(
        &self,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<StoredNotification>, StoreError> {
        self.ensure_open()?;
        let rows = sqlx::query(&format!(
            "SELECT {NOTIFICATION_COLUMNS} WHERE n.notification_id > ? ORDER BY n.notification_id LIMIT ?"
        ))
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(notification_from_row).collect())
    }

    /// List notifications still in INPUT, oldest first.
    pub async fn list_pending(&self, limit: i64) -> Result<Vec<StoredNotification>, StoreError> {
        self.ensure_open()?;
        let rows = sqlx::query(&format!(
            "SELECT {NOTIFICATION_COLUMNS} WHERE n.status = ? ORDER BY n.notification_id LIMIT ?"
        ))
        .bind(NotificationStatus::Input.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(notification_from_row).collect())
    }
}

/// Insert the topic, falling back to the existing row when the `UNIQUE`
/// constraint reports that another caller created it first.
///
/// The insert comes first so the transaction holds the write lock before it
/// reads; a concurrent creator either committed already or waits for us.
async fn upsert_topic(
    conn: &mut SqliteConnection,
    name: &str,
    description: Option<&str>,
) -> Result<i64, sqlx::Error> {
    let inserted = sqlx::query(
        "INSERT INTO topics (topic_name, description, creation_date) VALUES (?, ?, ?)",
    )
    .bind(name)
    .bind(description)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await;

    match inserted {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            tracing::debug!(topic = name, "Topic already exists");
            let row = sqlx::query("SELECT topic_id FROM topics WHERE topic_name = ?")
                .bind(name)
                .fetch_one(&mut *conn)
                .await?;
            Ok(row.get("topic_id"))
        }
        Err(e) => Err(e),
    }
}

// Validation

fn validate_device(device_id: &str, public_key: &str) -> Result<(), StoreError> {
    if device_id.trim().is_empty() {
        return Err(StoreError::EmptyDeviceId);
    }
    if public_key.trim().is_empty() {
        return Err(StoreError::EmptyPublicKey);
    }
    Ok(())
}

fn validate_topic(name: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::EmptyTopic);
    }
    if name.chars().count() > MAX_TOPIC_NAME_LENGTH {
        return Err(StoreError::TopicTooLong);
    }
    Ok(())
}

fn validate_notification(notif: &Notification) -> Result<(), StoreError> {
    validate_topic(&notif.topic)?;
    if notif.message.trim().is_empty() {
        return Err(StoreError::EmptyMessage);
    }
    Ok(())
}

// Helper functions for row conversion

fn device_from_row(row: &sqlx::sqlite::SqliteRow) -> Device {
    Device {
        device_id: row.get("device_id"),
        public_key: row.get("public_key"),
        registration_date: row.get("registration_date"),
        consecutive_failures: row.get("consecutive_failures"),
    }
}

fn topic_from_row(row: &sqlx::sqlite::SqliteRow) -> Topic {
    Topic {
        topic_id: row.get("topic_id"),
        topic_name: row.get("topic_name"),
        description: row.get("description"),
        creation_date: row.get("creation_date"),
    }
}

fn notification_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredNotification {
    let metadata_str: Option<String> = row.get("metadata");
    let status_str: String = row.get("status");
    StoredNotification {
        notification_id: row.get("notification_id"),
        topic_id: row.get("topic_id"),
        topic_name: row.get("topic_name"),
        timestamp: row.get("timestamp"),
        message: row.get("message"),
        metadata: metadata_str
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        // An unreadable status must not look pending to the sweep
        status: NotificationStatus::from_str(&status_str).unwrap_or(NotificationStatus::Error),
    }
}

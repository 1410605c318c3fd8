//! Operational logs: handled call events, deleted provider resources and
//! sent messages

use chrono::{DateTime, Utc};

use super::{id_from_db, id_to_db, Database};
use crate::error::Result;
use crate::types::{CallEvent, SentMessage, SentMessageType};

#[derive(sqlx::FromRow)]
struct SentMessageRow {
    id: i64,
    uuid: String,
    kind: SentMessageType,
    destination: String,
    sent: DateTime<Utc>,
    provider_id: Option<String>,
    data: String,
}

impl TryFrom<SentMessageRow> for SentMessage {
    type Error = crate::error::ExcommsError;

    fn try_from(row: SentMessageRow) -> Result<Self> {
        Ok(SentMessage {
            id: id_from_db(row.id),
            uuid: row.uuid,
            kind: row.kind,
            destination: row.destination,
            sent: row.sent,
            provider_id: row.provider_id,
            data: serde_json::from_str(&row.data)?,
        })
    }
}

impl Database {
    pub async fn log_call_event(&self, event: &CallEvent, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO excomms_event (source, destination, event, data, created)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.source)
        .bind(&event.destination)
        .bind(&event.event)
        .bind(serde_json::to_string(&event.data)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of logged events of the given name
    pub async fn call_event_count(&self, event: &str) -> Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM excomms_event WHERE event = ?")
            .bind(event)
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn create_deleted_resource(
        &self,
        resource: &str,
        resource_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("INSERT INTO deleted_resource (resource, resource_id, created) VALUES (?, ?, ?)")
            .bind(resource)
            .bind(resource_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn deleted_resources(&self, resource: &str) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT resource_id FROM deleted_resource WHERE resource = ? ORDER BY id",
        )
        .bind(resource)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Persist a sent message. A second record for the same
    /// (uuid, destination) is ignored and reported as `false`.
    pub async fn create_sent_message(&self, message: &SentMessage) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO sent_message (id, uuid, kind, destination, sent, provider_id, data)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (uuid, destination) DO NOTHING",
        )
        .bind(id_to_db(message.id))
        .bind(&message.uuid)
        .bind(message.kind)
        .bind(&message.destination)
        .bind(message.sent)
        .bind(&message.provider_id)
        .bind(serde_json::to_string(&message.data)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn lookup_sent_message(&self, uuid: &str, destination: &str) -> Result<Option<SentMessage>> {
        let row = sqlx::query_as::<_, SentMessageRow>(
            "SELECT id, uuid, kind, destination, sent, provider_id, data
             FROM sent_message WHERE uuid = ? AND destination = ?",
        )
        .bind(uuid)
        .bind(destination)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SentMessage::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::temp_db;
    use chrono::TimeZone;
    use serde_json::json;

    #[tokio::test]
    async fn sent_messages_are_unique_per_uuid_and_destination() {
        let (db, _dir) = temp_db().await;
        let message = SentMessage {
            id: 42,
            uuid: "abc".into(),
            kind: SentMessageType::Sms,
            destination: "+14155550100".into(),
            sent: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            provider_id: Some("SM1".into()),
            data: json!({"text": "hello"}),
        };
        assert!(db.create_sent_message(&message).await.unwrap());
        assert!(!db.create_sent_message(&SentMessage { id: 43, ..message.clone() }).await.unwrap());

        let stored = db.lookup_sent_message("abc", "+14155550100").await.unwrap().unwrap();
        assert_eq!(stored, message);
        assert!(db.lookup_sent_message("abc", "+14155550101").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn events_and_deleted_resources_are_appended() {
        let (db, _dir) = temp_db().await;
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let event = CallEvent {
            source: "+14155550100".into(),
            destination: "+12065550100".into(),
            event: "process_incoming_call".into(),
            data: json!({"CallSid": "CA1"}),
        };
        db.log_call_event(&event, now).await.unwrap();
        db.log_call_event(&event, now).await.unwrap();
        assert_eq!(db.call_event_count("process_incoming_call").await.unwrap(), 2);

        db.create_deleted_resource("call", "CA1", now).await.unwrap();
        assert_eq!(db.deleted_resources("call").await.unwrap(), vec!["CA1".to_string()]);
    }
}

//! Append-only store of verbatim inbound payloads

use chrono::{DateTime, Utc};

use super::{id_to_db, Database};
use crate::error::Result;
use crate::rawmsg::{RawIncoming, RawMessageKind};

impl Database {
    /// Persist a raw payload under its pre-assigned id. Storing the same id
    /// again replaces the payload, so a retried webhook stays a single row.
    pub async fn store_incoming_raw_message(&self, raw: &RawIncoming, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO incoming_raw_message (id, kind, data, created)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET data = excluded.data",
        )
        .bind(id_to_db(raw.id))
        .bind(raw.kind)
        .bind(serde_json::to_string(raw)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn incoming_raw_message(&self, id: u64) -> Result<Option<RawIncoming>> {
        let data = sqlx::query_scalar::<_, String>("SELECT data FROM incoming_raw_message WHERE id = ?")
            .bind(id_to_db(id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(data.map(|d| serde_json::from_str(&d)).transpose()?)
    }

    pub async fn count_raw_messages(&self, kind: RawMessageKind) -> Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM incoming_raw_message WHERE kind = ?")
            .bind(kind)
            .fetch_one(&self.pool)
            .await?)
    }
}

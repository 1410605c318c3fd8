//! Persisted worker queue rows

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{id_from_db, id_to_db, Database};
use crate::error::Result;

/// A claimed queue row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedWork {
    pub receipt: u64,
    pub body: Vec<u8>,
    pub receive_count: u32,
}

impl Database {
    pub async fn enqueue_work(&self, queue: &str, body: &[u8], visible_at: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT INTO work_queue (queue, body, visible_at, created) VALUES (?, ?, ?, ?)")
            .bind(queue)
            .bind(body)
            .bind(visible_at)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Claim the oldest visible row of `queue`, hiding it until `hide_until`.
    /// The select and the update are one statement, so two consumers never
    /// claim the same row.
    pub async fn claim_work(&self, queue: &str, now_ms: i64, hide_until: i64) -> Result<Option<ClaimedWork>> {
        let row = sqlx::query(
            "UPDATE work_queue
             SET visible_at = ?, receive_count = receive_count + 1
             WHERE receipt = (
                 SELECT receipt FROM work_queue
                 WHERE queue = ? AND visible_at <= ?
                 ORDER BY visible_at ASC, receipt ASC
                 LIMIT 1
             )
             RETURNING receipt, body, receive_count",
        )
        .bind(hide_until)
        .bind(queue)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<ClaimedWork> {
            Ok(ClaimedWork {
                receipt: id_from_db(row.try_get("receipt")?),
                body: row.try_get("body")?,
                receive_count: row.try_get::<i64, _>("receive_count")? as u32,
            })
        })
        .transpose()
    }

    pub async fn delete_work(&self, queue: &str, receipt: u64) -> Result<u64> {
        Ok(sqlx::query("DELETE FROM work_queue WHERE queue = ? AND receipt = ?")
            .bind(queue)
            .bind(id_to_db(receipt))
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    pub async fn delay_work(&self, queue: &str, receipt: u64, visible_at: i64) -> Result<u64> {
        Ok(sqlx::query("UPDATE work_queue SET visible_at = ? WHERE queue = ? AND receipt = ?")
            .bind(visible_at)
            .bind(queue)
            .bind(id_to_db(receipt))
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    /// Rows of `queue`, visible or not
    pub async fn count_work(&self, queue: &str) -> Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM work_queue WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?)
    }
}

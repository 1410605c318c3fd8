//! Voicemail transcription job rows

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::Database;
use crate::error::Result;
use crate::types::{TranscriptionJob, TranscriptionJobUpdate};

/// No-op write over one job row; see [`Database::begin_locked`].
pub const LOCK_TRANSCRIPTION_JOB: &str =
    "UPDATE transcription_job SET media_id = media_id WHERE media_id = ?";

const JOB_COLUMNS: &str = "media_id, raw_message_id, job_id, created, available_after, \
     completed, timed_out, errored, completed_timestamp";

impl Database {
    pub async fn insert_transcription_job(&self, job: &TranscriptionJob) -> Result<()> {
        sqlx::query(
            "INSERT INTO transcription_job
                (media_id, raw_message_id, job_id, created, available_after, completed,
                 timed_out, errored, completed_timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.media_id)
        .bind(job.raw_message_id)
        .bind(&job.job_id)
        .bind(job.created)
        .bind(job.available_after)
        .bind(job.completed)
        .bind(job.timed_out)
        .bind(job.errored)
        .bind(job.completed_timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn lookup_transcription_job(&self, media_id: &str) -> Result<Option<TranscriptionJob>> {
        let mut conn = self.pool.acquire().await?;
        lookup_transcription_job_tx(&mut conn, media_id).await
    }

    pub async fn update_transcription_job(&self, media_id: &str, update: &TranscriptionJobUpdate) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        update_transcription_job_tx(&mut conn, media_id, update).await
    }
}

pub async fn lookup_transcription_job_tx(
    conn: &mut SqliteConnection,
    media_id: &str,
) -> Result<Option<TranscriptionJob>> {
    let sql = format!("SELECT {} FROM transcription_job WHERE media_id = ?", JOB_COLUMNS);
    Ok(sqlx::query_as::<_, TranscriptionJob>(&sql)
        .bind(media_id)
        .fetch_optional(&mut *conn)
        .await?)
}

pub async fn update_transcription_job_tx(
    conn: &mut SqliteConnection,
    media_id: &str,
    update: &TranscriptionJobUpdate,
) -> Result<u64> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE transcription_job SET ");
    let mut set = qb.separated(", ");
    let mut any = false;

    macro_rules! push_column {
        ($field:ident) => {
            if let Some(value) = update.$field {
                set.push(concat!(stringify!($field), " = "));
                set.push_bind_unseparated(value);
                any = true;
            }
        };
    }

    push_column!(available_after);
    push_column!(completed);
    push_column!(timed_out);
    push_column!(errored);
    push_column!(completed_timestamp);

    if !any {
        return Ok(0);
    }

    qb.push(" WHERE media_id = ");
    qb.push_bind(media_id);
    let result = qb.build().execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::temp_db;
    use chrono::{TimeZone, Utc};

    fn job(media_id: &str) -> TranscriptionJob {
        let created = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        TranscriptionJob {
            media_id: media_id.into(),
            raw_message_id: 11,
            job_id: "job-1".into(),
            created,
            available_after: created,
            completed: false,
            timed_out: false,
            errored: false,
            completed_timestamp: None,
        }
    }

    #[tokio::test]
    async fn one_job_per_media() {
        let (db, _dir) = temp_db().await;
        db.insert_transcription_job(&job("m1")).await.unwrap();
        assert!(db.insert_transcription_job(&job("m1")).await.is_err());
    }

    #[tokio::test]
    async fn locked_update_is_visible_after_commit() {
        let (db, _dir) = temp_db().await;
        db.insert_transcription_job(&job("m1")).await.unwrap();
        let done = Utc.timestamp_opt(1_700_000_600, 0).unwrap();

        let mut tx = db.begin_locked(LOCK_TRANSCRIPTION_JOB, "m1").await.unwrap();
        let current = lookup_transcription_job_tx(&mut tx, "m1").await.unwrap().unwrap();
        assert!(!current.completed);
        let rows = update_transcription_job_tx(
            &mut tx,
            "m1",
            &TranscriptionJobUpdate {
                completed: Some(true),
                completed_timestamp: Some(done),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(rows, 1);
        tx.commit().await.unwrap();

        let stored = db.lookup_transcription_job("m1").await.unwrap().unwrap();
        assert!(stored.completed);
        assert_eq!(stored.completed_timestamp, Some(done));
        assert!(!stored.timed_out);
    }
}

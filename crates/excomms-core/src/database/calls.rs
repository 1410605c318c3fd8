//! Incoming call rows and outgoing call requests

use sqlx::{QueryBuilder, Sqlite};
use tracing::debug;

use super::Database;
use crate::error::Result;
use crate::types::{CallRequest, IncomingCall, IncomingCallUpdate};

const INCOMING_CALL_COLUMNS: &str = "call_sid, source, destination, organization_id, created, \
     afterhours, urgent, answered, answered_time, sent_to_voicemail, left_voicemail, \
     left_voicemail_time, completed, completed_time";

impl Database {
    /// Record the first webhook of an inbound call. A retried webhook for the
    /// same call sid replaces the row.
    pub async fn create_incoming_call(&self, call: &IncomingCall) -> Result<()> {
        debug!(call_sid = %call.call_sid, org_id = %call.organization_id, "Recording incoming call");
        sqlx::query(
            "INSERT OR REPLACE INTO incoming_call
                (call_sid, source, destination, organization_id, created, afterhours, urgent,
                 answered, answered_time, sent_to_voicemail, left_voicemail, left_voicemail_time,
                 completed, completed_time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&call.call_sid)
        .bind(&call.source)
        .bind(&call.destination)
        .bind(&call.organization_id)
        .bind(call.created)
        .bind(call.afterhours)
        .bind(call.urgent)
        .bind(call.answered)
        .bind(call.answered_time)
        .bind(call.sent_to_voicemail)
        .bind(call.left_voicemail)
        .bind(call.left_voicemail_time)
        .bind(call.completed)
        .bind(call.completed_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn lookup_incoming_call(&self, call_sid: &str) -> Result<Option<IncomingCall>> {
        let sql = format!("SELECT {} FROM incoming_call WHERE call_sid = ?", INCOMING_CALL_COLUMNS);
        Ok(sqlx::query_as::<_, IncomingCall>(&sql)
            .bind(call_sid)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Apply the set fields of `update` and return the number of rows changed.
    pub async fn update_incoming_call(&self, call_sid: &str, update: &IncomingCallUpdate) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE incoming_call SET ");
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

        push_column!(afterhours);
        push_column!(urgent);
        push_column!(answered);
        push_column!(answered_time);
        push_column!(sent_to_voicemail);
        push_column!(left_voicemail);
        push_column!(left_voicemail_time);
        push_column!(completed);
        push_column!(completed_time);

        if !any {
            return Ok(0);
        }

        qb.push(" WHERE call_sid = ");
        qb.push_bind(call_sid);
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Set the urgent flag only when it differs, so a repeated keypress
    /// changes no rows.
    pub async fn set_urgent_if_changed(&self, call_sid: &str, urgent: bool) -> Result<u64> {
        let result = sqlx::query("UPDATE incoming_call SET urgent = ? WHERE call_sid = ? AND urgent IS NOT ?")
            .bind(urgent)
            .bind(call_sid)
            .bind(urgent)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn create_call_request(&self, request: &CallRequest) -> Result<()> {
        debug!(call_sid = %request.call_sid, proxy = %request.proxy, "Recording outgoing call request");
        sqlx::query(
            "INSERT INTO outgoing_call_request
                (call_sid, source, destination, proxy, organization_id, requested,
                 caller_entity_id, callee_entity_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.call_sid)
        .bind(&request.source)
        .bind(&request.destination)
        .bind(&request.proxy)
        .bind(&request.organization_id)
        .bind(request.requested)
        .bind(&request.caller_entity_id)
        .bind(&request.callee_entity_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn lookup_call_request(&self, call_sid: &str) -> Result<Option<CallRequest>> {
        Ok(sqlx::query_as::<_, CallRequest>(
            "SELECT source, destination, proxy, organization_id, requested, call_sid,
                    caller_entity_id, callee_entity_id
             FROM outgoing_call_request WHERE call_sid = ?",
        )
        .bind(call_sid)
        .fetch_optional(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::temp_db;
    use crate::phone::PhoneNumber;
    use chrono::{TimeZone, Utc};

    fn call(sid: &str) -> IncomingCall {
        IncomingCall::new(
            sid,
            PhoneNumber::parse("+14155550100").unwrap(),
            PhoneNumber::parse("+12065550100").unwrap(),
            "org-1",
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn partial_updates_touch_only_set_columns() {
        let (db, _dir) = temp_db().await;
        db.create_incoming_call(&call("CA1")).await.unwrap();

        let when = Utc.timestamp_opt(1_700_000_030, 0).unwrap();
        let rows = db
            .update_incoming_call(
                "CA1",
                &IncomingCallUpdate {
                    answered: Some(true),
                    answered_time: Some(when),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(rows, 1);

        let stored = db.lookup_incoming_call("CA1").await.unwrap().unwrap();
        assert!(stored.answered);
        assert_eq!(stored.answered_time, Some(when));
        assert!(!stored.completed);
        assert!(!stored.urgent);

        assert_eq!(db.update_incoming_call("CA1", &IncomingCallUpdate::default()).await.unwrap(), 0);
        assert_eq!(
            db.update_incoming_call("missing", &IncomingCallUpdate { completed: Some(true), ..Default::default() })
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn urgent_changes_once() {
        let (db, _dir) = temp_db().await;
        db.create_incoming_call(&call("CA2")).await.unwrap();
        assert_eq!(db.set_urgent_if_changed("CA2", true).await.unwrap(), 1);
        assert_eq!(db.set_urgent_if_changed("CA2", true).await.unwrap(), 0);
        assert_eq!(db.set_urgent_if_changed("CA2", false).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn call_requests_are_keyed_by_sid() {
        let (db, _dir) = temp_db().await;
        let request = CallRequest {
            source: PhoneNumber::parse("+17348465522").unwrap(),
            destination: PhoneNumber::parse("+14152222222").unwrap(),
            proxy: PhoneNumber::parse("+12060000001").unwrap(),
            organization_id: "org-1".into(),
            requested: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            call_sid: "CA9".into(),
            caller_entity_id: "e-prov".into(),
            callee_entity_id: "e-pat".into(),
        };
        db.create_call_request(&request).await.unwrap();
        assert!(db.create_call_request(&request).await.is_err());
        assert_eq!(db.lookup_call_request("CA9").await.unwrap(), Some(request));
    }
}

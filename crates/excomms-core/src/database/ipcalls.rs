//! IP (app-to-app) calls and their participants

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::{id_from_db, id_to_db, Database};
use crate::error::Result;
use crate::types::{IPCall, IPCallParticipant, IPCallState, IPCallType, NetworkType};

/// No-op write over one call row; see [`Database::begin_locked`].
pub const LOCK_IPCALL: &str = "UPDATE ipcall SET pending = pending WHERE id = ?";

#[derive(sqlx::FromRow)]
struct IPCallRow {
    id: i64,
    call_type: IPCallType,
    pending: bool,
    initiated: DateTime<Utc>,
    connected: Option<DateTime<Utc>>,
}

impl Database {
    /// Insert a call together with its participants.
    pub async fn create_ipcall(&self, call: &IPCall) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO ipcall (id, call_type, pending, initiated, connected) VALUES (?, ?, ?, ?, ?)")
            .bind(id_to_db(call.id))
            .bind(call.call_type)
            .bind(call.pending)
            .bind(call.initiated)
            .bind(call.connected)
            .execute(&mut *tx)
            .await?;
        for p in &call.participants {
            sqlx::query(
                "INSERT INTO ipcall_participant
                    (ipcall_id, account_id, entity_id, identity, role, state, network_type)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id_to_db(call.id))
            .bind(&p.account_id)
            .bind(&p.entity_id)
            .bind(&p.identity)
            .bind(p.role)
            .bind(p.state)
            .bind(p.network_type)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn ipcall(&self, id: u64) -> Result<Option<IPCall>> {
        let mut conn = self.pool.acquire().await?;
        ipcall_tx(&mut conn, id).await
    }

    /// Pending calls the account takes part in, oldest first
    pub async fn pending_ipcalls_for_account(&self, account_id: &str) -> Result<Vec<IPCall>> {
        let mut conn = self.pool.acquire().await?;
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT c.id FROM ipcall c
             JOIN ipcall_participant p ON p.ipcall_id = c.id
             WHERE p.account_id = ? AND c.pending = 1
             ORDER BY c.initiated, c.id",
        )
        .bind(account_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut calls = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(call) = ipcall_tx(&mut conn, id_from_db(id)).await? {
                calls.push(call);
            }
        }
        Ok(calls)
    }
}

/// Call and participants, read inside a transaction
pub async fn ipcall_tx(conn: &mut SqliteConnection, id: u64) -> Result<Option<IPCall>> {
    let row = sqlx::query_as::<_, IPCallRow>(
        "SELECT id, call_type, pending, initiated, connected FROM ipcall WHERE id = ?",
    )
    .bind(id_to_db(id))
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let participants = sqlx::query_as::<_, IPCallParticipant>(
        "SELECT account_id, entity_id, identity, role, state, network_type
         FROM ipcall_participant WHERE ipcall_id = ? ORDER BY role, account_id",
    )
    .bind(row.id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some(IPCall {
        id: id_from_db(row.id),
        call_type: row.call_type,
        pending: row.pending,
        initiated: row.initiated,
        connected: row.connected,
        participants,
    }))
}

pub async fn update_ipcall_tx(
    conn: &mut SqliteConnection,
    id: u64,
    pending: bool,
    connected: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query("UPDATE ipcall SET pending = ?, connected = ? WHERE id = ?")
        .bind(pending)
        .bind(connected)
        .bind(id_to_db(id))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn update_participant_tx(
    conn: &mut SqliteConnection,
    id: u64,
    account_id: &str,
    state: IPCallState,
    network_type: NetworkType,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE ipcall_participant SET state = ?, network_type = ? WHERE ipcall_id = ? AND account_id = ?",
    )
    .bind(state)
    .bind(network_type)
    .bind(id_to_db(id))
    .bind(account_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

//! Table definitions
//!
//! Timestamps are stored as RFC 3339 text in UTC and always bound from the
//! injected clock, so lexical comparison in SQL matches time order.

use sqlx::SqliteConnection;
use tracing::debug;

use crate::error::Result;

/// Create every table and index if missing.
pub async fn create_all(conn: &mut SqliteConnection) -> Result<()> {
    create_provisioned_endpoint_table(conn).await?;
    create_proxy_phone_number_table(conn).await?;
    create_proxy_phone_number_reservation_table(conn).await?;
    create_incoming_call_table(conn).await?;
    create_outgoing_call_request_table(conn).await?;
    create_incoming_raw_message_table(conn).await?;
    create_transcription_job_table(conn).await?;
    create_media_table(conn).await?;
    create_sent_message_table(conn).await?;
    create_excomms_event_table(conn).await?;
    create_deleted_resource_table(conn).await?;
    create_originating_phone_number_table(conn).await?;
    create_blocked_number_table(conn).await?;
    create_ipcall_tables(conn).await?;
    create_work_queue_table(conn).await?;
    create_indexes(conn).await?;
    Ok(())
}

async fn create_provisioned_endpoint_table(conn: &mut SqliteConnection) -> Result<()> {
    debug!("📋 Creating provisioned_endpoint table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS provisioned_endpoint (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            endpoint TEXT NOT NULL,
            endpoint_type TEXT NOT NULL,
            provisioned_for TEXT NOT NULL,
            uuid TEXT,
            created TEXT NOT NULL,
            deprovisioned INTEGER NOT NULL DEFAULT 0,
            deprovisioned_timestamp TEXT,
            deprovisioned_reason TEXT
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_proxy_phone_number_table(conn: &mut SqliteConnection) -> Result<()> {
    debug!("📋 Creating proxy_phone_number table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS proxy_phone_number (
            phone_number TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            pool_expiration TEXT,
            last_reserved TEXT
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_proxy_phone_number_reservation_table(conn: &mut SqliteConnection) -> Result<()> {
    debug!("📋 Creating proxy_phone_number_reservation table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS proxy_phone_number_reservation (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            proxy_phone_number TEXT NOT NULL,
            originating_phone_number TEXT NOT NULL,
            destination_phone_number TEXT NOT NULL,
            destination_entity_id TEXT NOT NULL,
            owner_entity_id TEXT NOT NULL,
            organization_id TEXT NOT NULL,
            created TEXT NOT NULL,
            expires TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_incoming_call_table(conn: &mut SqliteConnection) -> Result<()> {
    debug!("📋 Creating incoming_call table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS incoming_call (
            call_sid TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            destination TEXT NOT NULL,
            organization_id TEXT NOT NULL,
            created TEXT NOT NULL,
            afterhours INTEGER NOT NULL DEFAULT 0,
            urgent INTEGER NOT NULL DEFAULT 0,
            answered INTEGER NOT NULL DEFAULT 0,
            answered_time TEXT,
            sent_to_voicemail INTEGER NOT NULL DEFAULT 0,
            left_voicemail INTEGER NOT NULL DEFAULT 0,
            left_voicemail_time TEXT,
            completed INTEGER NOT NULL DEFAULT 0,
            completed_time TEXT
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_outgoing_call_request_table(conn: &mut SqliteConnection) -> Result<()> {
    debug!("📋 Creating outgoing_call_request table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outgoing_call_request (
            call_sid TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            destination TEXT NOT NULL,
            proxy TEXT NOT NULL,
            organization_id TEXT NOT NULL,
            requested TEXT NOT NULL,
            caller_entity_id TEXT NOT NULL,
            callee_entity_id TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_incoming_raw_message_table(conn: &mut SqliteConnection) -> Result<()> {
    debug!("📋 Creating incoming_raw_message table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS incoming_raw_message (
            id INTEGER PRIMARY KEY,
            kind TEXT NOT NULL,
            data TEXT NOT NULL,
            created TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_transcription_job_table(conn: &mut SqliteConnection) -> Result<()> {
    debug!("📋 Creating transcription_job table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transcription_job (
            media_id TEXT PRIMARY KEY,
            raw_message_id INTEGER NOT NULL,
            job_id TEXT NOT NULL,
            created TEXT NOT NULL,
            available_after TEXT NOT NULL,
            completed INTEGER NOT NULL DEFAULT 0,
            timed_out INTEGER NOT NULL DEFAULT 0,
            errored INTEGER NOT NULL DEFAULT 0,
            completed_timestamp TEXT
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_media_table(conn: &mut SqliteConnection) -> Result<()> {
    debug!("📋 Creating media table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS media (
            id TEXT PRIMARY KEY,
            mime_type TEXT NOT NULL,
            name TEXT,
            url TEXT,
            resource_id TEXT,
            duration_ns INTEGER
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_sent_message_table(conn: &mut SqliteConnection) -> Result<()> {
    debug!("📋 Creating sent_message table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sent_message (
            id INTEGER PRIMARY KEY,
            uuid TEXT NOT NULL,
            kind TEXT NOT NULL,
            destination TEXT NOT NULL,
            sent TEXT NOT NULL,
            provider_id TEXT,
            data TEXT NOT NULL,
            UNIQUE (uuid, destination)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_excomms_event_table(conn: &mut SqliteConnection) -> Result<()> {
    debug!("📋 Creating excomms_event table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS excomms_event (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            destination TEXT NOT NULL,
            event TEXT NOT NULL,
            data TEXT NOT NULL,
            created TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_deleted_resource_table(conn: &mut SqliteConnection) -> Result<()> {
    debug!("📋 Creating deleted_resource table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deleted_resource (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            created TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_originating_phone_number_table(conn: &mut SqliteConnection) -> Result<()> {
    debug!("📋 Creating originating_phone_number table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS originating_phone_number (
            entity_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            phone_number TEXT NOT NULL,
            PRIMARY KEY (entity_id, device_id)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_blocked_number_table(conn: &mut SqliteConnection) -> Result<()> {
    debug!("📋 Creating blocked_number table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS blocked_number (
            provisioned_phone_number TEXT NOT NULL,
            number TEXT NOT NULL,
            created TEXT NOT NULL,
            PRIMARY KEY (provisioned_phone_number, number)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_ipcall_tables(conn: &mut SqliteConnection) -> Result<()> {
    debug!("📋 Creating ipcall tables");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ipcall (
            id INTEGER PRIMARY KEY,
            call_type TEXT NOT NULL,
            pending INTEGER NOT NULL,
            initiated TEXT NOT NULL,
            connected TEXT
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ipcall_participant (
            ipcall_id INTEGER NOT NULL REFERENCES ipcall(id),
            account_id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            identity TEXT NOT NULL,
            role TEXT NOT NULL,
            state TEXT NOT NULL,
            network_type TEXT NOT NULL,
            PRIMARY KEY (ipcall_id, account_id)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// Visibility is kept as epoch milliseconds so claims compare integers.
async fn create_work_queue_table(conn: &mut SqliteConnection) -> Result<()> {
    debug!("📋 Creating work_queue table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_queue (
            receipt INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            body BLOB NOT NULL,
            visible_at INTEGER NOT NULL,
            receive_count INTEGER NOT NULL DEFAULT 0,
            created TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_indexes(conn: &mut SqliteConnection) -> Result<()> {
    debug!("📋 Creating indexes");
    let indexes = [
        // One active endpoint per purpose key and kind, one lease per endpoint
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_endpoint_active_owner
             ON provisioned_endpoint(provisioned_for, endpoint_type) WHERE deprovisioned = 0",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_endpoint_active_value
             ON provisioned_endpoint(endpoint, endpoint_type) WHERE deprovisioned = 0",
        "CREATE INDEX IF NOT EXISTS idx_endpoint_uuid ON provisioned_endpoint(uuid)",
        "CREATE INDEX IF NOT EXISTS idx_proxy_org ON proxy_phone_number(organization_id)",
        "CREATE INDEX IF NOT EXISTS idx_reservation_orig_dest
             ON proxy_phone_number_reservation(originating_phone_number, destination_phone_number, expires)",
        "CREATE INDEX IF NOT EXISTS idx_reservation_orig_proxy
             ON proxy_phone_number_reservation(originating_phone_number, proxy_phone_number, expires)",
        "CREATE INDEX IF NOT EXISTS idx_reservation_proxy
             ON proxy_phone_number_reservation(proxy_phone_number, expires)",
        "CREATE INDEX IF NOT EXISTS idx_ipcall_participant_account
             ON ipcall_participant(account_id)",
        "CREATE INDEX IF NOT EXISTS idx_work_queue_visible ON work_queue(queue, visible_at)",
    ];
    for sql in indexes {
        sqlx::query(sql).execute(&mut *conn).await?;
    }
    Ok(())
}

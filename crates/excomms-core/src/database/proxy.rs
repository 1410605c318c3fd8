//! Proxy-number pool and reservations
//!
//! Reservation reads and writes that must be serialized take the
//! connection of a transaction opened with [`LOCK_ORG_POOL`].

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::Database;
use crate::error::Result;
use crate::phone::PhoneNumber;
use crate::types::{ProxyPhoneNumber, ProxyPhoneNumberReservation};

/// No-op write over an organization's pool slice; see [`Database::begin_locked`].
pub const LOCK_ORG_POOL: &str =
    "UPDATE proxy_phone_number SET organization_id = organization_id WHERE organization_id = ?";

const RESERVATION_COLUMNS: &str = "proxy_phone_number, originating_phone_number, \
     destination_phone_number, destination_entity_id, owner_entity_id, organization_id, created, expires";

impl Database {
    /// Seed a number into an organization's pool. Returns false when the
    /// number is already pooled.
    pub async fn add_proxy_phone_number(&self, number: &PhoneNumber, organization_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO proxy_phone_number (phone_number, organization_id)
             VALUES (?, ?)
             ON CONFLICT (phone_number) DO NOTHING",
        )
        .bind(number)
        .bind(organization_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn proxy_phone_number(&self, number: &PhoneNumber) -> Result<Option<ProxyPhoneNumber>> {
        Ok(sqlx::query_as::<_, ProxyPhoneNumber>(
            "SELECT phone_number, organization_id, pool_expiration, last_reserved
             FROM proxy_phone_number WHERE phone_number = ?",
        )
        .bind(number)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Reservations ever made for an originating number, newest first
    pub async fn reservations_for(
        &self,
        originating: &PhoneNumber,
    ) -> Result<Vec<ProxyPhoneNumberReservation>> {
        let sql = format!(
            "SELECT {} FROM proxy_phone_number_reservation
             WHERE originating_phone_number = ? ORDER BY id DESC",
            RESERVATION_COLUMNS
        );
        Ok(sqlx::query_as::<_, ProxyPhoneNumberReservation>(&sql)
            .bind(originating)
            .fetch_all(&self.pool)
            .await?)
    }
}

/// Unexpired reservation for (originating, destination)
pub async fn active_reservation_for_destination(
    conn: &mut SqliteConnection,
    originating: &PhoneNumber,
    destination: &PhoneNumber,
    now: DateTime<Utc>,
) -> Result<Option<ProxyPhoneNumberReservation>> {
    let sql = format!(
        "SELECT {} FROM proxy_phone_number_reservation
         WHERE originating_phone_number = ? AND destination_phone_number = ? AND expires > ?
         ORDER BY expires DESC LIMIT 1",
        RESERVATION_COLUMNS
    );
    Ok(sqlx::query_as::<_, ProxyPhoneNumberReservation>(&sql)
        .bind(originating)
        .bind(destination)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?)
}

/// Unexpired reservation for (originating, proxy)
pub async fn active_reservation_for_proxy(
    conn: &mut SqliteConnection,
    originating: &PhoneNumber,
    proxy: &PhoneNumber,
    now: DateTime<Utc>,
) -> Result<Option<ProxyPhoneNumberReservation>> {
    let sql = format!(
        "SELECT {} FROM proxy_phone_number_reservation
         WHERE originating_phone_number = ? AND proxy_phone_number = ? AND expires > ?
         ORDER BY expires DESC LIMIT 1",
        RESERVATION_COLUMNS
    );
    Ok(sqlx::query_as::<_, ProxyPhoneNumberReservation>(&sql)
        .bind(originating)
        .bind(proxy)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?)
}

/// Pool numbers of an organization that are past their grace period and
/// not held by any unexpired reservation, best candidate first.
pub async fn available_proxy_numbers(
    conn: &mut SqliteConnection,
    organization_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<ProxyPhoneNumber>> {
    // NULLs sort first in ascending order.
    Ok(sqlx::query_as::<_, ProxyPhoneNumber>(
        "SELECT p.phone_number, p.organization_id, p.pool_expiration, p.last_reserved
         FROM proxy_phone_number p
         WHERE p.organization_id = ?
           AND (p.pool_expiration IS NULL OR p.pool_expiration < ?)
           AND NOT EXISTS (
               SELECT 1 FROM proxy_phone_number_reservation r
               WHERE r.proxy_phone_number = p.phone_number AND r.expires > ?
           )
         ORDER BY p.pool_expiration ASC, p.last_reserved ASC, p.phone_number ASC",
    )
    .bind(organization_id)
    .bind(now)
    .bind(now)
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn insert_reservation(
    conn: &mut SqliteConnection,
    reservation: &ProxyPhoneNumberReservation,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO proxy_phone_number_reservation
            (proxy_phone_number, originating_phone_number, destination_phone_number,
             destination_entity_id, owner_entity_id, organization_id, created, expires)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&reservation.proxy_phone_number)
    .bind(&reservation.originating_phone_number)
    .bind(&reservation.destination_phone_number)
    .bind(&reservation.destination_entity_id)
    .bind(&reservation.owner_entity_id)
    .bind(&reservation.organization_id)
    .bind(reservation.created)
    .bind(reservation.expires)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Move the expiration of the active (originating, destination) reservation.
pub async fn set_expiration_for_destination(
    conn: &mut SqliteConnection,
    originating: &PhoneNumber,
    destination: &PhoneNumber,
    expires: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE proxy_phone_number_reservation SET expires = ?
         WHERE originating_phone_number = ? AND destination_phone_number = ? AND expires > ?",
    )
    .bind(expires)
    .bind(originating)
    .bind(destination)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Move the expiration of the active (originating, proxy) reservation.
pub async fn set_expiration_for_proxy(
    conn: &mut SqliteConnection,
    originating: &PhoneNumber,
    proxy: &PhoneNumber,
    expires: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE proxy_phone_number_reservation SET expires = ?
         WHERE originating_phone_number = ? AND proxy_phone_number = ? AND expires > ?",
    )
    .bind(expires)
    .bind(originating)
    .bind(proxy)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Start the cool-down of a pool number.
pub async fn release_pool_number(
    conn: &mut SqliteConnection,
    proxy: &PhoneNumber,
    pool_expiration: DateTime<Utc>,
    last_reserved: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE proxy_phone_number SET pool_expiration = ?, last_reserved = ?
         WHERE phone_number = ?",
    )
    .bind(pool_expiration)
    .bind(last_reserved)
    .bind(proxy)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

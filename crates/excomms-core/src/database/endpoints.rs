//! Provisioned endpoints and per-device originating numbers

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::debug;

use super::Database;
use crate::error::Result;
use crate::phone::PhoneNumber;
use crate::types::{EndpointType, ProvisionedEndpoint};

const ENDPOINT_COLUMNS: &str = "endpoint, endpoint_type, provisioned_for, uuid, created, \
     deprovisioned, deprovisioned_timestamp, deprovisioned_reason";

impl Database {
    /// Active endpoint of the given kind leased to `provisioned_for`
    pub async fn lookup_endpoint_for(
        &self,
        provisioned_for: &str,
        endpoint_type: EndpointType,
    ) -> Result<Option<ProvisionedEndpoint>> {
        let sql = format!(
            "SELECT {} FROM provisioned_endpoint
             WHERE provisioned_for = ? AND endpoint_type = ? AND deprovisioned = 0",
            ENDPOINT_COLUMNS
        );
        Ok(sqlx::query_as::<_, ProvisionedEndpoint>(&sql)
            .bind(provisioned_for)
            .bind(endpoint_type)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Active lease of an endpoint value
    pub async fn lookup_endpoint(
        &self,
        endpoint: &str,
        endpoint_type: EndpointType,
    ) -> Result<Option<ProvisionedEndpoint>> {
        let sql = format!(
            "SELECT {} FROM provisioned_endpoint
             WHERE endpoint = ? AND endpoint_type = ? AND deprovisioned = 0",
            ENDPOINT_COLUMNS
        );
        Ok(sqlx::query_as::<_, ProvisionedEndpoint>(&sql)
            .bind(endpoint)
            .bind(endpoint_type)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Endpoint created by the provisioning request carrying `uuid`
    pub async fn lookup_endpoint_by_uuid(&self, uuid: &str) -> Result<Option<ProvisionedEndpoint>> {
        let sql = format!(
            "SELECT {} FROM provisioned_endpoint WHERE uuid = ? ORDER BY id DESC LIMIT 1",
            ENDPOINT_COLUMNS
        );
        Ok(sqlx::query_as::<_, ProvisionedEndpoint>(&sql)
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn provision_endpoint(&self, endpoint: &ProvisionedEndpoint) -> Result<()> {
        debug!(
            endpoint = %endpoint.endpoint,
            provisioned_for = %endpoint.provisioned_for,
            "Recording provisioned endpoint"
        );
        sqlx::query(
            "INSERT INTO provisioned_endpoint (endpoint, endpoint_type, provisioned_for, uuid, created)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&endpoint.endpoint)
        .bind(endpoint.endpoint_type)
        .bind(&endpoint.provisioned_for)
        .bind(&endpoint.uuid)
        .bind(endpoint.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn deprovision_endpoint(
        &self,
        endpoint: &str,
        endpoint_type: EndpointType,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        deprovision_endpoint_tx(&mut conn, endpoint, endpoint_type, reason, now).await
    }

    /// Remember the number a device last called out from
    pub async fn set_current_originating_number(
        &self,
        number: &PhoneNumber,
        entity_id: &str,
        device_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO originating_phone_number (entity_id, device_id, phone_number)
             VALUES (?, ?, ?)
             ON CONFLICT (entity_id, device_id) DO UPDATE SET phone_number = excluded.phone_number",
        )
        .bind(entity_id)
        .bind(device_id)
        .bind(number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn current_originating_number(
        &self,
        entity_id: &str,
        device_id: &str,
    ) -> Result<Option<PhoneNumber>> {
        Ok(sqlx::query_scalar::<_, PhoneNumber>(
            "SELECT phone_number FROM originating_phone_number WHERE entity_id = ? AND device_id = ?",
        )
        .bind(entity_id)
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}

/// Soft-deprovision the active lease of `endpoint`
pub async fn deprovision_endpoint_tx(
    conn: &mut SqliteConnection,
    endpoint: &str,
    endpoint_type: EndpointType,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE provisioned_endpoint
         SET deprovisioned = 1, deprovisioned_reason = ?, deprovisioned_timestamp = ?
         WHERE endpoint = ? AND endpoint_type = ? AND deprovisioned = 0",
    )
    .bind(reason)
    .bind(now)
    .bind(endpoint)
    .bind(endpoint_type)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Active lease of `endpoint`, read inside a transaction
pub async fn lookup_endpoint_tx(
    conn: &mut SqliteConnection,
    endpoint: &str,
    endpoint_type: EndpointType,
) -> Result<Option<ProvisionedEndpoint>> {
    let sql = format!(
        "SELECT {} FROM provisioned_endpoint
         WHERE endpoint = ? AND endpoint_type = ? AND deprovisioned = 0",
        ENDPOINT_COLUMNS
    );
    Ok(sqlx::query_as::<_, ProvisionedEndpoint>(&sql)
        .bind(endpoint)
        .bind(endpoint_type)
        .fetch_optional(&mut *conn)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::temp_db;
    use chrono::TimeZone;

    fn endpoint(value: &str, owner: &str) -> ProvisionedEndpoint {
        ProvisionedEndpoint {
            endpoint: value.to_string(),
            endpoint_type: EndpointType::Phone,
            provisioned_for: owner.to_string(),
            uuid: Some("u-1".to_string()),
            created: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            deprovisioned: false,
            deprovisioned_timestamp: None,
            deprovisioned_reason: None,
        }
    }

    #[tokio::test]
    async fn one_active_endpoint_per_owner() {
        let (db, _dir) = temp_db().await;
        db.provision_endpoint(&endpoint("+12065550100", "org-1")).await.unwrap();
        assert!(db.provision_endpoint(&endpoint("+12065550101", "org-1")).await.is_err());

        let found = db.lookup_endpoint_for("org-1", EndpointType::Phone).await.unwrap().unwrap();
        assert_eq!(found.endpoint, "+12065550100");
        assert_eq!(db.lookup_endpoint_by_uuid("u-1").await.unwrap().unwrap().provisioned_for, "org-1");
    }

    #[tokio::test]
    async fn deprovision_frees_the_owner_slot() {
        let (db, _dir) = temp_db().await;
        let now = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        db.provision_endpoint(&endpoint("+12065550100", "org-1")).await.unwrap();

        let rows = db
            .deprovision_endpoint("+12065550100", EndpointType::Phone, "closed", now)
            .await
            .unwrap();
        assert_eq!(rows, 1);
        assert!(db.lookup_endpoint_for("org-1", EndpointType::Phone).await.unwrap().is_none());

        db.provision_endpoint(&endpoint("+12065550101", "org-1")).await.unwrap();
    }

    #[tokio::test]
    async fn originating_number_is_replaced() {
        let (db, _dir) = temp_db().await;
        let first = PhoneNumber::parse("+14155550100").unwrap();
        let second = PhoneNumber::parse("+14155550101").unwrap();
        db.set_current_originating_number(&first, "e-1", "d-1").await.unwrap();
        db.set_current_originating_number(&second, "e-1", "d-1").await.unwrap();
        assert_eq!(db.current_originating_number("e-1", "d-1").await.unwrap(), Some(second));
        assert_eq!(db.current_originating_number("e-1", "d-2").await.unwrap(), None);
    }
}

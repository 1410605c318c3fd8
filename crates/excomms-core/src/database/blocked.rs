//! Caller numbers blocked per provisioned number

use chrono::{DateTime, Utc};

use super::Database;
use crate::error::Result;
use crate::phone::PhoneNumber;
use crate::types::{BlockedNumber, BlockedNumbers};

impl Database {
    /// Block `number` on `provisioned`. Blocking twice is a no-op.
    pub async fn block_number(
        &self,
        provisioned: &PhoneNumber,
        number: &PhoneNumber,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO blocked_number (provisioned_phone_number, number, created)
             VALUES (?, ?, ?)
             ON CONFLICT (provisioned_phone_number, number) DO NOTHING",
        )
        .bind(provisioned)
        .bind(number)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unblock_number(&self, provisioned: &PhoneNumber, number: &PhoneNumber) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM blocked_number WHERE provisioned_phone_number = ? AND number = ?",
        )
        .bind(provisioned)
        .bind(number)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_blocked_numbers(&self, provisioned: &PhoneNumber) -> Result<Vec<BlockedNumber>> {
        Ok(sqlx::query_as::<_, BlockedNumber>(
            "SELECT provisioned_phone_number, number, created FROM blocked_number
             WHERE provisioned_phone_number = ? ORDER BY created, number",
        )
        .bind(provisioned)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Blocked set used on the inbound paths
    pub async fn blocked_numbers(&self, provisioned: &PhoneNumber) -> Result<BlockedNumbers> {
        let numbers = sqlx::query_scalar::<_, PhoneNumber>(
            "SELECT number FROM blocked_number WHERE provisioned_phone_number = ?",
        )
        .bind(provisioned)
        .fetch_all(&self.pool)
        .await?;
        Ok(BlockedNumbers(numbers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::temp_db;
    use chrono::TimeZone;

    #[tokio::test]
    async fn block_is_idempotent_and_scoped_to_the_provisioned_number() {
        let (db, _dir) = temp_db().await;
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let practice = PhoneNumber::parse("+12065550100").unwrap();
        let other = PhoneNumber::parse("+12065550199").unwrap();
        let caller = PhoneNumber::parse("+14155550123").unwrap();

        db.block_number(&practice, &caller, now).await.unwrap();
        db.block_number(&practice, &caller, now).await.unwrap();

        assert_eq!(db.list_blocked_numbers(&practice).await.unwrap().len(), 1);
        assert!(db.blocked_numbers(&practice).await.unwrap().includes(&caller));
        assert!(!db.blocked_numbers(&other).await.unwrap().includes(&caller));

        assert_eq!(db.unblock_number(&practice, &caller).await.unwrap(), 1);
        assert_eq!(db.unblock_number(&practice, &caller).await.unwrap(), 0);
    }
}

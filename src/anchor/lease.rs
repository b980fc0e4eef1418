//! Leader leases
//!
//! Only the lease holder runs anchoring cycles, so at most one worker
//! writes anchors at a time even when several processes are deployed.

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::debug;

use crate::database::Database;
use crate::error::LedgerResult;

#[async_trait]
pub trait LeaderLease: Send + Sync {
    /// Acquire or renew the lease. `false` means another holder owns it.
    async fn try_acquire(&self) -> LedgerResult<bool>;

    async fn release(&self) -> LedgerResult<()>;
}

/// Lease for deployments that already guarantee a single worker
#[derive(Debug, Clone, Default)]
pub struct LocalLease;

#[async_trait]
impl LeaderLease for LocalLease {
    async fn try_acquire(&self) -> LedgerResult<bool> {
        Ok(true)
    }

    async fn release(&self) -> LedgerResult<()> {
        Ok(())
    }
}

/// Lease row in the ledger database with a holder and an expiry
#[derive(Clone)]
pub struct DatabaseLease {
    database: Database,
    name: String,
    holder: String,
    ttl: Duration,
}

impl DatabaseLease {
    pub fn new(database: Database, name: impl Into<String>, holder: impl Into<String>, ttl: Duration) -> Self {
        Self {
            database,
            name: name.into(),
            holder: holder.into(),
            ttl,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

#[async_trait]
impl LeaderLease for DatabaseLease {
    async fn try_acquire(&self) -> LedgerResult<bool> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + self.ttl.as_millis() as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO anchor_leases (name, holder, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE
                SET holder = excluded.holder, expires_at = excluded.expires_at
                WHERE anchor_leases.holder = excluded.holder
                   OR anchor_leases.expires_at < ?
            "#,
        )
        .bind(&self.name)
        .bind(&self.holder)
        .bind(expires_at)
        .bind(now)
        .execute(self.database.pool())
        .await?;

        let acquired = result.rows_affected() == 1;
        debug!(lease = %self.name, holder = %self.holder, acquired, "Lease attempt");
        Ok(acquired)
    }

    async fn release(&self) -> LedgerResult<()> {
        sqlx::query("DELETE FROM anchor_leases WHERE name = ? AND holder = ?")
            .bind(&self.name)
            .bind(&self.holder)
            .execute(self.database.pool())
            .await?;
        Ok(())
    }
}

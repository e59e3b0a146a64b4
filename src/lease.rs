//! Named, expiring leases used as cluster-wide advisory locks.
//!
//! A lease is one row in the `leases` table. Acquisition is a single upsert that only takes
//! over a row whose `expires_at` has passed, so at most one holder exists per name at any time
//! and a crashed holder stops blocking others once its expiry elapses.

use sqlx::{sqlite::Sqlite, Pool};
use std::time::Duration;
use uuid::Uuid;

use crate::{db::now_millis, error::SyncError};

pub const PROCESS_EVENTS_LEASE: &str = "process_document_events_task";
pub const SNAPSHOT_LEASE: &str = "snapshot_documents_task";

#[derive(Debug)]
pub struct Lease {
    pool: Pool<Sqlite>,
    name: String,
    owner: String,
    expires_at: i64,
}

impl Lease {
    /// Returns `Ok(None)` when another holder owns an unexpired lease for `name`.
    pub async fn try_acquire(
        pool: &Pool<Sqlite>,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, SyncError> {
        let owner = Uuid::new_v4().to_string();
        let now = now_millis();
        let expires_at = now + ttl.as_millis() as i64;
        let acquired = sqlx::query(
            "INSERT INTO leases (name, owner, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at \
             WHERE leases.expires_at <= ?",
        )
        .bind(name)
        .bind(&owner)
        .bind(expires_at)
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected()
            == 1;

        if !acquired {
            tracing::debug!("[Lease] '{}' is held by another owner", name);
            return Ok(None);
        }
        tracing::debug!("[Lease] '{}' acquired by {} until {}", name, owner, expires_at);
        Ok(Some(Lease {
            pool: pool.clone(),
            name: name.to_string(),
            owner,
            expires_at,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// Whether the lease row still belongs to this holder and has not expired.
    pub async fn is_held(&self) -> Result<bool, SyncError> {
        let held: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM leases WHERE name = ? AND owner = ? AND expires_at > ?",
        )
        .bind(&self.name)
        .bind(&self.owner)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;
        Ok(held.is_some())
    }

    /// Give the lease up. A lease that already expired and was taken over is left alone.
    pub async fn release(self) -> Result<(), SyncError> {
        let released = sqlx::query("DELETE FROM leases WHERE name = ? AND owner = ?")
            .bind(&self.name)
            .bind(&self.owner)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if released == 0 {
            tracing::warn!(
                "[Lease] '{}' expired before release by {}; another holder may have run concurrently",
                self.name,
                self.owner
            );
        }
        Ok(())
    }
}

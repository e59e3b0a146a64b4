//! Periodic, content-hash-deduplicated versioning of documents.
//!
//! A pass looks at two populations:
//!
//! - documents whose latest version is older than `now - interval` and whose `updated_at`
//!   falls inside `(now - interval - lookback, now - interval)`. A version is written only
//!   when the current JSON hashes differently from the latest version.
//! - documents that have no version at all, which always receive an initial one.
//!
//! Documents last updated before the lookback window are not revisited; they were versioned
//! by an earlier pass.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::{sqlite::SqliteRow, FromRow, Row, SqliteConnection};
use std::time::Duration;

use crate::{
    db::{now_millis, DbConnection},
    error::SyncError,
    lease::{Lease, SNAPSHOT_LEASE},
    properties::parse_json_text,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotOptions {
    /// Minimum age of the latest version before a document is reconsidered.
    pub interval: Duration,
    /// How far behind the interval threshold document updates are still picked up.
    pub lookback: Duration,
    pub lease_ttl: Duration,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        SnapshotOptions {
            interval: Duration::from_secs(300),
            lookback: Duration::from_secs(24 * 60 * 60),
            lease_ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStats {
    /// New versions of already-versioned documents.
    pub created: usize,
    /// Windowed documents whose content matched their latest version.
    pub unchanged: usize,
    /// First versions of never-versioned documents.
    pub initial: usize,
    /// Documents skipped because their JSON could not be decoded.
    pub invalid: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotOutcome {
    Contended,
    Completed(SnapshotStats),
}

impl SnapshotOutcome {
    pub fn stats(&self) -> Option<&SnapshotStats> {
        match self {
            SnapshotOutcome::Contended => None,
            SnapshotOutcome::Completed(stats) => Some(stats),
        }
    }
}

/// Rebuild `value` with every object's keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Hex SHA-256 of the canonical JSON text. A missing payload hashes as `null`.
pub fn json_hash(json: Option<&Value>) -> String {
    let text = match json {
        Some(value) => canonicalize(value).to_string(),
        None => Value::Null.to_string(),
    };
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// The document columns a version copies. `json` stays undecoded so that one malformed
/// document only skips itself.
struct VersionSource {
    id: i64,
    public_id: String,
    document_type: String,
    data: Vec<u8>,
    json: Option<String>,
}

impl FromRow<'_, SqliteRow> for VersionSource {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(VersionSource {
            id: row.try_get("id")?,
            public_id: row.try_get("public_id")?,
            document_type: row.try_get("document_type")?,
            data: row.try_get("data")?,
            json: row.try_get("json")?,
        })
    }
}

impl VersionSource {
    fn hash(&self) -> Option<String> {
        match parse_json_text(self.json.as_deref()) {
            Ok(json) => Some(json_hash(json.as_ref())),
            Err(e) => {
                tracing::warn!(
                    "[SnapshotWorker] skipping {} {} (document {}): {}",
                    self.document_type,
                    self.public_id,
                    self.id,
                    e
                );
                None
            }
        }
    }
}

async fn insert_version(
    conn: &mut SqliteConnection,
    source: &VersionSource,
    hash: &str,
    created_at: i64,
) -> Result<(), SyncError> {
    sqlx::query(
        "INSERT INTO document_versions \
         (public_id, document_type, document_id, json_hash, data, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&source.public_id)
    .bind(&source.document_type)
    .bind(source.id)
    .bind(hash)
    .bind(&source.data)
    .bind(created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SnapshotWorker {
    db: DbConnection,
    options: SnapshotOptions,
}

impl SnapshotWorker {
    pub fn new(db: DbConnection, options: SnapshotOptions) -> Self {
        SnapshotWorker { db, options }
    }

    pub async fn run(&self) -> Result<SnapshotOutcome, SyncError> {
        self.run_at(now_millis()).await
    }

    /// Run one pass as if the current time were `now_ms`.
    #[tracing::instrument(skip(self))]
    pub async fn run_at(&self, now_ms: i64) -> Result<SnapshotOutcome, SyncError> {
        let Some(lease) =
            Lease::try_acquire(self.db.pool(), SNAPSHOT_LEASE, self.options.lease_ttl).await?
        else {
            tracing::info!("[SnapshotWorker] another pass holds the lease, nothing to do");
            return Ok(SnapshotOutcome::Contended);
        };
        let result = self.snapshot(now_ms).await;
        let released = lease.release().await;
        let stats = result?;
        released?;

        tracing::info!(
            "[SnapshotWorker] pass complete: {} new versions, {} unchanged, {} initial, {} invalid",
            stats.created,
            stats.unchanged,
            stats.initial,
            stats.invalid
        );
        Ok(SnapshotOutcome::Completed(stats))
    }

    async fn snapshot(&self, now_ms: i64) -> Result<SnapshotStats, SyncError> {
        let threshold = now_ms - self.options.interval.as_millis() as i64;
        let lower_threshold = threshold - self.options.lookback.as_millis() as i64;
        let mut stats = SnapshotStats::default();
        let mut tx = self.db.begin_write().await?;

        let windowed = sqlx::query(
            "SELECT d.id, d.public_id, d.document_type, d.data, d.json, \
                 v.json_hash AS latest_hash FROM documents d \
             JOIN document_versions v ON v.id = (\
                 SELECT id FROM document_versions \
                 WHERE document_id = d.id ORDER BY created_at DESC, id DESC LIMIT 1) \
             WHERE v.created_at < ? AND d.updated_at > ? AND d.updated_at < ? \
             ORDER BY d.id",
        )
        .bind(threshold)
        .bind(lower_threshold)
        .bind(threshold)
        .fetch_all(&mut *tx)
        .await?;

        for row in windowed.iter() {
            let source = <VersionSource as FromRow<'_, SqliteRow>>::from_row(row)?;
            let latest_hash: String = row.try_get("latest_hash")?;
            let Some(hash) = source.hash() else {
                stats.invalid += 1;
                continue;
            };
            if hash == latest_hash {
                stats.unchanged += 1;
                continue;
            }
            tracing::debug!(
                "[SnapshotWorker] {} {} changed, writing version {}",
                source.document_type,
                source.public_id,
                hash
            );
            insert_version(&mut tx, &source, &hash, now_ms).await?;
            stats.created += 1;
        }

        let unversioned = sqlx::query_as::<_, VersionSource>(
            "SELECT d.id, d.public_id, d.document_type, d.data, d.json FROM documents d \
             WHERE NOT EXISTS (\
                 SELECT 1 FROM document_versions v WHERE v.document_id = d.id) \
             ORDER BY d.id",
        )
        .fetch_all(&mut *tx)
        .await?;

        for source in unversioned.iter() {
            let Some(hash) = source.hash() else {
                stats.invalid += 1;
                continue;
            };
            insert_version(&mut tx, source, &hash, now_ms).await?;
            stats.initial += 1;
        }

        tx.commit().await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{db_init, DOCGRAPH_DB},
        properties::DocumentType,
    };
    use serde_json::json;
    use tempfile::{tempdir, TempDir};
    use test_log::test;

    async fn insert_document(db: &DbConnection, public_id: &str, json: &Value, at: i64) {
        sqlx::query(
            "INSERT INTO documents (public_id, document_type, data, json, created_at, updated_at) \
             VALUES (?, 'EDITOR', x'01', ?, ?, ?)",
        )
        .bind(public_id)
        .bind(json.to_string())
        .bind(at)
        .bind(at)
        .execute(db.pool())
        .await
        .unwrap();
    }

    async fn update_document(db: &DbConnection, public_id: &str, json: &Value, at: i64) {
        sqlx::query("UPDATE documents SET json = ?, updated_at = ? WHERE public_id = ?")
            .bind(json.to_string())
            .bind(at)
            .bind(public_id)
            .execute(db.pool())
            .await
            .unwrap();
    }

    async fn worker() -> (TempDir, DbConnection, SnapshotWorker) {
        let dir = tempdir().unwrap();
        let db = DbConnection(db_init(dir.path().join(DOCGRAPH_DB)).await.unwrap());
        let worker = SnapshotWorker::new(db.clone(), SnapshotOptions::default());
        (dir, db, worker)
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let b = json!({"a": {"x": null, "y": [1, 2]}, "b": 1});
        assert_eq!(json_hash(Some(&a)), json_hash(Some(&b)));
        assert_ne!(json_hash(Some(&a)), json_hash(Some(&json!({"b": 2}))));
        assert_eq!(json_hash(None).len(), 64);
    }

    #[test(tokio::test)]
    async fn test_repeated_runs_create_one_version() {
        let (_dir, db, worker) = worker().await;
        let t0 = 1_000_000_000;
        insert_document(&db, "n1", &json!({"v": 1}), t0).await;

        let first = worker.run_at(t0 + 10).await.unwrap();
        assert_eq!(first.stats().unwrap().initial, 1);
        let second = worker.run_at(t0 + 20).await.unwrap();
        assert_eq!(second.stats().unwrap(), &SnapshotStats::default());

        let versions = db.document_versions("n1", DocumentType::Editor).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].json_hash, json_hash(Some(&json!({"v": 1}))));
        assert_eq!(versions[0].data, vec![1u8]);
    }

    #[test(tokio::test)]
    async fn test_changed_document_gets_new_version_after_interval() {
        let (_dir, db, worker) = worker().await;
        let interval = SnapshotOptions::default().interval.as_millis() as i64;
        let t0 = 1_000_000_000;
        insert_document(&db, "n1", &json!({"v": 1}), t0).await;
        worker.run_at(t0).await.unwrap();

        let t1 = t0 + 1_000;
        update_document(&db, "n1", &json!({"v": 2}), t1).await;

        // Too soon: the update is newer than the threshold.
        let early = worker.run_at(t1 + 1).await.unwrap();
        assert_eq!(early.stats().unwrap().created, 0);

        let later = worker.run_at(t1 + interval + 1).await.unwrap();
        assert_eq!(later.stats().unwrap().created, 1);

        // Identical content again yields nothing new.
        let again = worker.run_at(t1 + 2 * interval).await.unwrap();
        assert_eq!(again.stats().unwrap().created, 0);

        let versions = db.document_versions("n1", DocumentType::Editor).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].json_hash, json_hash(Some(&json!({"v": 2}))));
    }

    #[test(tokio::test)]
    async fn test_same_content_in_window_is_unchanged() {
        let (_dir, db, worker) = worker().await;
        let interval = SnapshotOptions::default().interval.as_millis() as i64;
        let t0 = 1_000_000_000;
        insert_document(&db, "n1", &json!({"v": 1}), t0).await;
        worker.run_at(t0).await.unwrap();

        update_document(&db, "n1", &json!({"v": 1}), t0 + 1_000).await;
        let outcome = worker.run_at(t0 + 1_000 + interval + 1).await.unwrap();
        assert_eq!(outcome.stats().unwrap().unchanged, 1);
        assert_eq!(outcome.stats().unwrap().created, 0);
    }

    #[test(tokio::test)]
    async fn test_updates_older_than_lookback_are_skipped() {
        let (_dir, db, worker) = worker().await;
        let options = SnapshotOptions::default();
        let span = (options.interval + options.lookback).as_millis() as i64;
        let t0 = 1_000_000_000;
        insert_document(&db, "n1", &json!({"v": 1}), t0).await;
        worker.run_at(t0).await.unwrap();
        update_document(&db, "n1", &json!({"v": 2}), t0 + 1_000).await;

        let outcome = worker.run_at(t0 + 1_000 + span + 1).await.unwrap();
        assert_eq!(outcome.stats().unwrap().created, 0);
    }

    #[test(tokio::test)]
    async fn test_undecodable_document_is_skipped() {
        let (_dir, db, worker) = worker().await;
        insert_document(&db, "n1", &json!({"v": 1}), 0).await;
        sqlx::query(
            "INSERT INTO documents (public_id, document_type, data, json, created_at, updated_at) \
             VALUES ('bad', 'EDITOR', x'01', '{broken', 0, 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let stats = *worker.run_at(10).await.unwrap().stats().unwrap();
        assert_eq!(stats.initial, 1);
        assert_eq!(stats.invalid, 1);
        assert_eq!(
            db.document_versions("n1", DocumentType::Editor)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[test(tokio::test)]
    async fn test_held_lease_is_a_no_op() {
        let (_dir, db, worker) = worker().await;
        insert_document(&db, "n1", &json!({}), 0).await;
        let lease = Lease::try_acquire(db.pool(), SNAPSHOT_LEASE, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(worker.run().await.unwrap(), SnapshotOutcome::Contended);
        lease.release().await.unwrap();
        assert!(db
            .document_versions("n1", DocumentType::Editor)
            .await
            .unwrap()
            .is_empty());
    }
}

use futures_core::future::BoxFuture;
use sqlx::{
    error::BoxDynError,
    migrate::{Migration as SqlxMigration, MigrationSource, MigrationType, Migrator},
    pool::PoolOptions,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode},
    Pool, Row, Transaction,
};
use std::{
    path::Path,
    result::Result,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
    error::SyncError,
    properties::{Document, DocumentType, DocumentVersion, FailedEvent, StoredEvent},
};

pub const DOCGRAPH_DB: &str = "docgraph.db";

/// SQL expression producing the current time in epoch milliseconds, matching [`now_millis`].
const SQL_NOW_MILLIS: &str = "CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)";

/// Milliseconds since the UNIX epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct DbConnection(pub Pool<Sqlite>);

impl DbConnection {
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.0
    }

    /// Open a transaction that holds the write lock from its first statement.
    ///
    /// A deferred transaction that reads before writing cannot be upgraded once another
    /// connection has committed, and fails with `SQLITE_BUSY` regardless of the busy timeout.
    /// Every read-then-write transaction goes through here instead.
    pub async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, SyncError> {
        Ok(self.0.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Queued events in processing order.
    pub async fn pending_events(&self) -> Result<Vec<StoredEvent>, SyncError> {
        let events = sqlx::query_as::<_, StoredEvent>(
            "SELECT * FROM document_events ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.0)
        .await
        .map_err(|e| {
            tracing::error!("[DbConnection.pending_events] Failed to read event queue: {}", e);
            e
        })?;
        Ok(events)
    }

    pub async fn pending_event_count(&self) -> Result<i64, SyncError> {
        let row = sqlx::query("SELECT COUNT(*) FROM document_events")
            .fetch_one(&self.0)
            .await?;
        Ok(row.try_get::<i64, usize>(0)?)
    }

    /// Append an event directly, bypassing the document triggers. Used by tooling that replays
    /// or synthesizes events.
    pub async fn enqueue_event(
        &self,
        public_id: &str,
        document_type: &str,
        action: &str,
        old_data: Option<&serde_json::Value>,
        new_data: Option<&serde_json::Value>,
    ) -> Result<i64, SyncError> {
        let row = sqlx::query(
            "INSERT INTO document_events \
             (public_id, document_type, action, old_data, new_data, created_at) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(public_id)
        .bind(document_type)
        .bind(action)
        .bind(old_data.map(|v| v.to_string()))
        .bind(new_data.map(|v| v.to_string()))
        .bind(now_millis())
        .fetch_one(&self.0)
        .await?;
        Ok(row.try_get("id")?)
    }

    pub async fn failed_events(&self) -> Result<Vec<FailedEvent>, SyncError> {
        Ok(sqlx::query_as::<_, FailedEvent>(
            "SELECT * FROM document_event_failures ORDER BY failed_at ASC, id ASC",
        )
        .fetch_all(&self.0)
        .await?)
    }

    /// Move dead-lettered events back onto the queue. Requeued events keep their original
    /// creation time so they sort ahead of anything queued since.
    ///
    /// Only the latest failure per `(public_id, document_type)` is replayed. When the document
    /// still exists its current JSON replaces the failed payload, so a replay never rolls the
    /// graph back past a newer write.
    pub async fn requeue_failed_events(&self) -> Result<u64, SyncError> {
        let mut tx = self.begin_write().await?;
        let moved = sqlx::query(
            "INSERT INTO document_events \
             (public_id, document_type, action, old_data, new_data, created_at) \
             SELECT f.public_id, f.document_type, \
                 CASE WHEN d.id IS NOT NULL AND f.action = 'DELETE' THEN 'UPDATE' \
                      ELSE f.action END, \
                 f.old_data, \
                 CASE WHEN d.id IS NULL THEN f.new_data ELSE d.json END, \
                 f.event_created_at \
             FROM document_event_failures f \
             LEFT JOIN documents d \
                 ON d.public_id = f.public_id AND d.document_type = f.document_type \
             WHERE NOT EXISTS (\
                 SELECT 1 FROM document_event_failures g \
                 WHERE g.public_id = f.public_id AND g.document_type = f.document_type \
                 AND (g.event_created_at > f.event_created_at \
                      OR (g.event_created_at = f.event_created_at AND g.id > f.id))) \
             ORDER BY f.event_created_at ASC, f.id ASC",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let total = sqlx::query("DELETE FROM document_event_failures")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        tracing::info!(
            "[DbConnection] Requeued {} failed events, {} superseded",
            moved,
            total - moved
        );
        Ok(moved)
    }

    pub async fn get_document(
        &self,
        public_id: &str,
        document_type: DocumentType,
    ) -> Result<Option<Document>, SyncError> {
        Ok(sqlx::query_as::<_, Document>(
            "SELECT * FROM documents WHERE public_id = ? AND document_type = ?",
        )
        .bind(public_id)
        .bind(document_type.as_str())
        .fetch_optional(&self.0)
        .await?)
    }

    /// Versions of one document, oldest first.
    pub async fn document_versions(
        &self,
        public_id: &str,
        document_type: DocumentType,
    ) -> Result<Vec<DocumentVersion>, SyncError> {
        Ok(sqlx::query_as::<_, DocumentVersion>(
            "SELECT * FROM document_versions WHERE public_id = ? AND document_type = ? \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(public_id)
        .bind(document_type.as_str())
        .fetch_all(&self.0)
        .await?)
    }
}

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: String,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for migration in self.0 {
                if matches!(migration.kind, MigrationType::ReversibleUp) {
                    migrations.push(SqlxMigration::new(
                        migration.version,
                        migration.description.into(),
                        migration.kind,
                        migration.sql.into(),
                        false,
                    ));
                }
            }
            Ok(migrations)
        })
    }
}

fn migrations() -> MigrationList {
    MigrationList(vec![
        Migration {
            version: 1,
            description: "create_document_tables",
            sql: "\
            CREATE TABLE documents (\
                id INTEGER PRIMARY KEY AUTOINCREMENT, \
                public_id TEXT NOT NULL, \
                document_type TEXT NOT NULL, \
                data BLOB NOT NULL, \
                json TEXT, \
                created_at INTEGER NOT NULL, \
                updated_at INTEGER NOT NULL, \
                UNIQUE(public_id, document_type)); \
            CREATE INDEX documents_updated_at ON documents(updated_at); \
            CREATE TABLE document_events (\
                id INTEGER PRIMARY KEY AUTOINCREMENT, \
                public_id TEXT NOT NULL, \
                document_type TEXT NOT NULL, \
                action TEXT NOT NULL, \
                old_data TEXT, \
                new_data TEXT, \
                created_at INTEGER NOT NULL); \
            CREATE INDEX document_events_created_at ON document_events(created_at, id); \
            CREATE TABLE document_event_failures (\
                id INTEGER PRIMARY KEY AUTOINCREMENT, \
                event_id INTEGER NOT NULL, \
                public_id TEXT NOT NULL, \
                document_type TEXT NOT NULL, \
                action TEXT NOT NULL, \
                old_data TEXT, \
                new_data TEXT, \
                event_created_at INTEGER NOT NULL, \
                error TEXT NOT NULL, \
                failed_at INTEGER NOT NULL); \
            CREATE TABLE document_versions (\
                id INTEGER PRIMARY KEY AUTOINCREMENT, \
                public_id TEXT NOT NULL, \
                document_type TEXT NOT NULL, \
                document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE, \
                json_hash TEXT NOT NULL, \
                data BLOB NOT NULL, \
                created_at INTEGER NOT NULL); \
            CREATE INDEX document_versions_document ON document_versions(document_id, created_at);"
                .to_string(),
            kind: MigrationType::ReversibleUp,
        },
        Migration {
            version: 2,
            description: "create_document_event_triggers",
            sql: format!(
                "\
            CREATE TRIGGER documents_after_insert AFTER INSERT ON documents BEGIN \
                INSERT INTO document_events (public_id, document_type, action, old_data, new_data, created_at) \
                VALUES (NEW.public_id, NEW.document_type, 'INSERT', NULL, NEW.json, {now}); \
            END; \
            CREATE TRIGGER documents_after_update AFTER UPDATE ON documents BEGIN \
                INSERT INTO document_events (public_id, document_type, action, old_data, new_data, created_at) \
                VALUES (NEW.public_id, NEW.document_type, 'UPDATE', OLD.json, NEW.json, {now}); \
            END; \
            CREATE TRIGGER documents_after_delete AFTER DELETE ON documents BEGIN \
                INSERT INTO document_events (public_id, document_type, action, old_data, new_data, created_at) \
                VALUES (OLD.public_id, OLD.document_type, 'DELETE', OLD.json, NULL, {now}); \
            END;",
                now = SQL_NOW_MILLIS
            ),
            kind: MigrationType::ReversibleUp,
        },
        Migration {
            version: 3,
            description: "create_graph_tables",
            sql: "\
            CREATE TABLE nodes (\
                id INTEGER PRIMARY KEY AUTOINCREMENT, \
                public_id TEXT NOT NULL UNIQUE, \
                kind TEXT NOT NULL DEFAULT 'default', \
                title TEXT NOT NULL DEFAULT '', \
                title_token_count INTEGER, \
                content TEXT, \
                text TEXT NOT NULL DEFAULT '', \
                text_token_count INTEGER, \
                removed INTEGER NOT NULL DEFAULT 0, \
                editor_document_id INTEGER REFERENCES documents(id) ON DELETE SET NULL, \
                graph_document_id INTEGER REFERENCES documents(id) ON DELETE SET NULL, \
                created_at INTEGER NOT NULL, \
                updated_at INTEGER NOT NULL); \
            CREATE TABLE node_subnodes (\
                parent_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE, \
                child_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE, \
                PRIMARY KEY (parent_id, child_id)); \
            CREATE INDEX node_subnodes_child ON node_subnodes(child_id); \
            CREATE TABLE spaces (\
                id INTEGER PRIMARY KEY AUTOINCREMENT, \
                public_id TEXT NOT NULL UNIQUE, \
                title TEXT NOT NULL, \
                title_slug TEXT NOT NULL UNIQUE, \
                document_id INTEGER REFERENCES documents(id) ON DELETE SET NULL, \
                created_at INTEGER NOT NULL, \
                updated_at INTEGER NOT NULL); \
            CREATE TABLE space_nodes (\
                space_id INTEGER NOT NULL REFERENCES spaces(id) ON DELETE CASCADE, \
                node_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE, \
                PRIMARY KEY (space_id, node_id)); \
            CREATE TABLE space_deleted_nodes (\
                space_id INTEGER NOT NULL REFERENCES spaces(id) ON DELETE CASCADE, \
                node_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE, \
                PRIMARY KEY (space_id, node_id)); \
            CREATE TABLE space_members (\
                space_id INTEGER NOT NULL REFERENCES spaces(id) ON DELETE CASCADE, \
                principal TEXT NOT NULL, \
                role TEXT NOT NULL, \
                PRIMARY KEY (space_id, principal)); \
            CREATE TABLE leases (\
                name TEXT PRIMARY KEY, \
                owner TEXT NOT NULL, \
                expires_at INTEGER NOT NULL);"
                .to_string(),
            kind: MigrationType::ReversibleUp,
        },
    ])
}

pub async fn db_init<P: AsRef<Path>>(db_path: P) -> Result<Pool<Sqlite>, SyncError> {
    let db_path = db_path.as_ref();
    tracing::debug!("Initializing docgraph db from file: {:?}", db_path);
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .read_only(false)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30))
        .foreign_keys(true);

    let pool = PoolOptions::<Sqlite>::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    let migrator = Migrator::new(migrations()).await?;
    migrator.run(&pool).await?;

    let doc_res = sqlx::query("SELECT COUNT(*) FROM documents;")
        .fetch_one(&pool)
        .await?;
    let event_res = sqlx::query("SELECT COUNT(*) FROM document_events;")
        .fetch_one(&pool)
        .await?;
    let node_res = sqlx::query("SELECT COUNT(*) FROM nodes;")
        .fetch_one(&pool)
        .await?;
    tracing::info!(
        "DB Connection initialized.\n \
         \tDocument count:\t{:?} \n \
         \tQueued events:\t{:?} \n \
         \tNode count:\t{:?}",
        doc_res.get::<i64, usize>(0),
        event_res.get::<i64, usize>(0),
        node_res.get::<i64, usize>(0)
    );

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::DocumentEvent;
    use serde_json::json;
    use tempfile::tempdir;
    use test_log::test;

    #[test(tokio::test)]
    async fn test_db_init_is_reentrant() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DOCGRAPH_DB);
        let first = db_init(&path).await.unwrap();
        first.close().await;
        let db = DbConnection(db_init(&path).await.unwrap());
        assert_eq!(db.pending_event_count().await.unwrap(), 0);
    }

    #[test(tokio::test)]
    async fn test_document_triggers_append_events() {
        let dir = tempdir().unwrap();
        let db = DbConnection(db_init(dir.path().join(DOCGRAPH_DB)).await.unwrap());

        sqlx::query(
            "INSERT INTO documents (public_id, document_type, data, json, created_at, updated_at) \
             VALUES ('n1', 'EDITOR', x'00', '{\"v\":1}', 0, 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();
        sqlx::query("UPDATE documents SET json = '{\"v\":2}' WHERE public_id = 'n1'")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("DELETE FROM documents WHERE public_id = 'n1'")
            .execute(db.pool())
            .await
            .unwrap();

        let events = db.pending_events().await.unwrap();
        let actions: Vec<&str> = events.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["INSERT", "UPDATE", "DELETE"]);
        assert!(events.iter().all(|e| e.document_type == "EDITOR"));
        let events: Vec<DocumentEvent> = events
            .into_iter()
            .map(|e| DocumentEvent::try_from(e).unwrap())
            .collect();
        assert_eq!(events[0].old_data, None);
        assert_eq!(events[0].new_data, Some(json!({"v": 1})));
        assert_eq!(events[1].old_data, Some(json!({"v": 1})));
        assert_eq!(events[1].new_data, Some(json!({"v": 2})));
        assert_eq!(events[2].old_data, Some(json!({"v": 2})));
        assert_eq!(events[2].new_data, None);
    }
}

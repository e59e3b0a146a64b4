//! Writes CRDT document rows. The `documents` triggers append the matching queue events;
//! this store additionally publishes a [`Notification`](crate::notify::Notification) once a
//! write has committed.

use serde_json::Value;

use crate::{
    db::{now_millis, DbConnection},
    error::SyncError,
    notify::NotificationHub,
    properties::{Document, DocumentType},
};

#[derive(Debug, Clone)]
pub struct DocumentStore {
    db: DbConnection,
    hub: NotificationHub,
    channel: String,
}

impl DocumentStore {
    pub fn new(db: DbConnection, hub: NotificationHub, channel: impl Into<String>) -> Self {
        DocumentStore {
            db,
            hub,
            channel: channel.into(),
        }
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn get(
        &self,
        public_id: &str,
        document_type: DocumentType,
    ) -> Result<Option<Document>, SyncError> {
        self.db.get_document(public_id, document_type).await
    }

    /// Insert the document, or replace its payload if `(public_id, document_type)` exists.
    pub async fn upsert(
        &self,
        public_id: &str,
        document_type: DocumentType,
        data: &[u8],
        json: Option<&Value>,
    ) -> Result<Document, SyncError> {
        let now = now_millis();
        let json_text = json.map(|v| v.to_string());
        // The conflict branch fires the UPDATE trigger rather than the INSERT one.
        let document = sqlx::query_as::<_, Document>(
            "INSERT INTO documents \
             (public_id, document_type, data, json, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(public_id, document_type) DO UPDATE SET \
                 data = excluded.data, json = excluded.json, updated_at = excluded.updated_at \
             RETURNING *",
        )
        .bind(public_id)
        .bind(document_type.as_str())
        .bind(data)
        .bind(&json_text)
        .bind(now)
        .bind(now)
        .fetch_one(self.db.pool())
        .await?;

        self.hub
            .publish(&self.channel, format!("{document_type} {public_id}"));
        tracing::debug!("[DocumentStore] wrote {} {}", document_type, public_id);
        Ok(document)
    }

    /// Returns false when no such document existed.
    pub async fn delete(
        &self,
        public_id: &str,
        document_type: DocumentType,
    ) -> Result<bool, SyncError> {
        let deleted = sqlx::query("DELETE FROM documents WHERE public_id = ? AND document_type = ?")
            .bind(public_id)
            .bind(document_type.as_str())
            .execute(self.db.pool())
            .await?
            .rows_affected();
        if deleted == 0 {
            return Ok(false);
        }
        self.hub
            .publish(&self.channel, format!("{document_type} {public_id}"));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{db_init, DOCGRAPH_DB},
        notify::DEFAULT_NOTIFICATION_CHANNEL,
    };
    use serde_json::json;
    use tempfile::tempdir;
    use test_log::test;

    #[test(tokio::test)]
    async fn test_writes_queue_events_and_notify() {
        let dir = tempdir().unwrap();
        let db = DbConnection(db_init(dir.path().join(DOCGRAPH_DB)).await.unwrap());
        let store = DocumentStore::new(
            db.clone(),
            NotificationHub::new(),
            DEFAULT_NOTIFICATION_CHANNEL,
        );
        let mut rx = store.hub().subscribe();

        let first = store
            .upsert("n1", DocumentType::Editor, b"a", Some(&json!({"v": 1})))
            .await
            .unwrap();
        let second = store
            .upsert("n1", DocumentType::Editor, b"b", Some(&json!({"v": 2})))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.data, b"b".to_vec());
        assert_eq!(second.json, Some(json!({"v": 2})));

        // Same public_id, different type, is a separate document.
        store
            .upsert("n1", DocumentType::Graph, b"c", None)
            .await
            .unwrap();
        assert!(store.delete("n1", DocumentType::Editor).await.unwrap());
        assert!(!store.delete("n1", DocumentType::Editor).await.unwrap());
        assert!(store.get("n1", DocumentType::Editor).await.unwrap().is_none());
        assert!(store.get("n1", DocumentType::Graph).await.unwrap().is_some());

        let actions: Vec<String> = db
            .pending_events()
            .await
            .unwrap()
            .into_iter()
            .map(|e| format!("{} {}", e.document_type, e.action))
            .collect();
        assert_eq!(
            actions,
            vec!["EDITOR INSERT", "EDITOR UPDATE", "GRAPH INSERT", "EDITOR DELETE"]
        );

        let mut received = 0;
        while let Ok(notification) = rx.try_recv() {
            assert_eq!(notification.channel, DEFAULT_NOTIFICATION_CHANNEL);
            received += 1;
        }
        assert_eq!(received, 4);
    }
}

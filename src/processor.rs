//! # Event Processor
//!
//! Drains the `document_events` queue into the node/space graph.
//!
//! ## Pass protocol
//!
//! 1. Take the [`PROCESS_EVENTS_LEASE`] lease. If another pass holds it, return
//!    [`PassOutcome::Contended`] without touching the queue.
//! 2. Read every queued event in `(created_at, id)` order.
//! 3. For each event open a transaction whose first statement deletes the event row. A delete
//!    that matches nothing means an overlapping pass already claimed the event, so it is
//!    skipped. Otherwise the event's [`Reconciliation`] is applied and the transaction commits,
//!    removing the event and applying its mutations atomically.
//! 4. If the payload cannot be decoded, or reconciliation fails and its transaction rolls
//!    back, the event is removed in a fresh transaction that copies it to
//!    `document_event_failures` with the error text. Failed events never block the queue;
//!    [`DbConnection::requeue_failed_events`] replays them.
//! 5. Release the lease.
//!
//! In strict mode the first reconciliation error is returned to the caller once the failing
//! event has been dead-lettered, which lets tests assert error-free processing.
//!
//! A pass that dies without releasing its lease blocks new passes until the lease's TTL
//! elapses; the TTL should match the scheduler's hard timeout for one pass.

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::{sync::Arc, time::Duration};

use crate::{
    db::{now_millis, DbConnection},
    error::SyncError,
    event::{IgnoreReason, Reconciliation},
    lease::{Lease, PROCESS_EVENTS_LEASE},
    properties::{DocumentEvent, StoredEvent},
    reconcile::{self, ReconcileOutcome},
    tokenizer::Tokenizer,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorOptions {
    /// Return the first reconciliation error instead of only logging it.
    pub strict: bool,
    /// Lifetime of the pass lease.
    pub lease_ttl: Duration,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        ProcessorOptions {
            strict: false,
            lease_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassStats {
    /// Events read from the queue at the start of the pass.
    pub claimed: usize,
    pub applied: usize,
    pub ignored: usize,
    pub failed: usize,
    /// Events already taken by an overlapping pass.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassOutcome {
    Contended,
    Completed(PassStats),
}

impl PassOutcome {
    pub fn stats(&self) -> Option<&PassStats> {
        match self {
            PassOutcome::Contended => None,
            PassOutcome::Completed(stats) => Some(stats),
        }
    }
}

/// Deletes the event row. Returns false when it was already gone.
async fn claim_event(conn: &mut SqliteConnection, event_id: i64) -> Result<bool, SyncError> {
    let claimed = sqlx::query("DELETE FROM document_events WHERE id = ?")
        .bind(event_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(claimed == 1)
}

#[derive(Debug, Clone)]
pub struct EventProcessor {
    db: DbConnection,
    tokenizer: Arc<Tokenizer>,
    options: ProcessorOptions,
}

impl EventProcessor {
    pub fn new(db: DbConnection, tokenizer: Arc<Tokenizer>, options: ProcessorOptions) -> Self {
        EventProcessor {
            db,
            tokenizer,
            options,
        }
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    /// Run one pass over the queue.
    #[tracing::instrument(skip(self))]
    pub async fn process_pending(&self) -> Result<PassOutcome, SyncError> {
        let Some(lease) =
            Lease::try_acquire(self.db.pool(), PROCESS_EVENTS_LEASE, self.options.lease_ttl)
                .await?
        else {
            tracing::info!("[EventProcessor] another pass holds the lease, nothing to do");
            return Ok(PassOutcome::Contended);
        };

        let drained = self.drain().await;
        let released = lease.release().await;
        let stats = drained?;
        released?;

        tracing::info!(
            "[EventProcessor] pass complete: {} claimed, {} applied, {} ignored, {} failed, {} skipped",
            stats.claimed,
            stats.applied,
            stats.ignored,
            stats.failed,
            stats.skipped
        );
        Ok(PassOutcome::Completed(stats))
    }

    async fn drain(&self) -> Result<PassStats, SyncError> {
        let events = self.db.pending_events().await?;
        let mut stats = PassStats {
            claimed: events.len(),
            ..Default::default()
        };
        for stored in events {
            self.process_stored(stored, &mut stats).await?;
        }
        Ok(stats)
    }

    async fn process_stored(
        &self,
        stored: StoredEvent,
        stats: &mut PassStats,
    ) -> Result<(), SyncError> {
        if let Err(e) = stored.kinds() {
            tracing::warn!(
                "[EventProcessor] dropping event {} for {} ({} {}): {}",
                stored.id,
                stored.public_id,
                stored.document_type,
                stored.action,
                e
            );
            let mut conn = self.db.pool().acquire().await?;
            if claim_event(&mut conn, stored.id).await? {
                stats.ignored += 1;
            } else {
                stats.skipped += 1;
            }
            return Ok(());
        }

        let event = match DocumentEvent::try_from(stored.clone()) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(
                    "[EventProcessor] event {} for {} has an undecodable payload: {}",
                    stored.id,
                    stored.public_id,
                    e
                );
                return self.fail(&stored, e, stats).await;
            }
        };

        match self.reconcile_event(&event).await {
            Ok(Some(ReconcileOutcome::Applied)) => {
                tracing::debug!("[EventProcessor] applied {}", event);
                stats.applied += 1;
            }
            Ok(Some(ReconcileOutcome::Ignored(reason))) => {
                match reason {
                    IgnoreReason::MissingPayload => tracing::error!(
                        "[EventProcessor] {} has no new_data, dropping it",
                        event
                    ),
                    IgnoreReason::Deleted => tracing::info!(
                        "[EventProcessor] {} deletes a document; graph entities are kept",
                        event
                    ),
                }
                stats.ignored += 1;
            }
            Ok(None) => {
                tracing::debug!("[EventProcessor] {} already claimed elsewhere", event);
                stats.skipped += 1;
            }
            Err(e) => {
                tracing::error!(
                    "[EventProcessor] failed to reconcile {} (public_id: {}): {}",
                    event,
                    event.public_id,
                    e
                );
                return self.fail(&stored, e, stats).await;
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        stored: &StoredEvent,
        error: SyncError,
        stats: &mut PassStats,
    ) -> Result<(), SyncError> {
        stats.failed += 1;
        self.dead_letter(stored, &error).await?;
        if self.options.strict {
            return Err(error);
        }
        Ok(())
    }

    /// Returns `Ok(None)` when the event was claimed by another pass. The transaction rolls back
    /// on every error path by being dropped.
    async fn reconcile_event(
        &self,
        event: &DocumentEvent,
    ) -> Result<Option<ReconcileOutcome>, SyncError> {
        let mut tx = self.db.begin_write().await?;
        if !claim_event(&mut tx, event.id).await? {
            tx.rollback().await?;
            return Ok(None);
        }
        let plan = Reconciliation::from_event(event);
        tracing::trace!("[EventProcessor] {} -> {}", event, plan);
        let outcome = reconcile::apply(&mut tx, plan, &self.tokenizer).await?;
        tx.commit().await?;
        Ok(Some(outcome))
    }

    async fn dead_letter(&self, stored: &StoredEvent, error: &SyncError) -> Result<(), SyncError> {
        let mut tx = self.db.begin_write().await?;
        if !claim_event(&mut tx, stored.id).await? {
            tx.rollback().await?;
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO document_event_failures \
             (event_id, public_id, document_type, action, old_data, new_data, event_created_at, \
              error, failed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(stored.id)
        .bind(&stored.public_id)
        .bind(&stored.document_type)
        .bind(&stored.action)
        .bind(&stored.old_data)
        .bind(&stored.new_data)
        .bind(stored.created_at)
        .bind(error.to_string())
        .bind(now_millis())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{db_init, DOCGRAPH_DB};
    use serde_json::json;
    use tempfile::{tempdir, TempDir};
    use test_log::test;

    async fn processor(strict: bool) -> (TempDir, DbConnection, EventProcessor) {
        let dir = tempdir().unwrap();
        let db = DbConnection(db_init(dir.path().join(DOCGRAPH_DB)).await.unwrap());
        let processor = EventProcessor::new(
            db.clone(),
            Tokenizer::shared().unwrap(),
            ProcessorOptions {
                strict,
                ..Default::default()
            },
        );
        (dir, db, processor)
    }

    #[test(tokio::test)]
    async fn test_empty_queue_completes() {
        let (_dir, _db, processor) = processor(false).await;
        assert_eq!(
            processor.process_pending().await.unwrap(),
            PassOutcome::Completed(PassStats::default())
        );
    }

    #[test(tokio::test)]
    async fn test_held_lease_makes_pass_a_no_op() {
        let (_dir, db, processor) = processor(false).await;
        db.enqueue_event("n1", "EDITOR", "INSERT", None, Some(&json!({})))
            .await
            .unwrap();
        let lease = Lease::try_acquire(db.pool(), PROCESS_EVENTS_LEASE, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            processor.process_pending().await.unwrap(),
            PassOutcome::Contended
        );
        assert_eq!(db.pending_event_count().await.unwrap(), 1);

        lease.release().await.unwrap();
        let outcome = processor.process_pending().await.unwrap();
        assert_eq!(outcome.stats().unwrap().applied, 1);
        assert_eq!(db.pending_event_count().await.unwrap(), 0);
    }

    #[test(tokio::test)]
    async fn test_unknown_event_kinds_are_dropped() {
        let (_dir, db, processor) = processor(true).await;
        db.enqueue_event("n1", "CANVAS", "INSERT", None, Some(&json!({})))
            .await
            .unwrap();
        db.enqueue_event("n1", "EDITOR", "UPSERT", None, Some(&json!({})))
            .await
            .unwrap();

        let outcome = processor.process_pending().await.unwrap();
        assert_eq!(outcome.stats().unwrap().ignored, 2);
        assert_eq!(db.pending_event_count().await.unwrap(), 0);
        assert!(db.all_nodes().await.unwrap().is_empty());
        assert!(db.failed_events().await.unwrap().is_empty());
    }

    #[test(tokio::test)]
    async fn test_missing_space_is_dead_lettered() {
        let (_dir, db, processor) = processor(false).await;
        db.enqueue_event(
            "ghost",
            "SPACE",
            "UPDATE",
            None,
            Some(&json!({"nodes": {"n1": {"title": "Alpha"}}})),
        )
        .await
        .unwrap();
        db.enqueue_event("n2", "EDITOR", "INSERT", None, Some(&json!({})))
            .await
            .unwrap();

        let stats = *processor.process_pending().await.unwrap().stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.applied, 1);
        assert_eq!(db.pending_event_count().await.unwrap(), 0);

        // The failed event's partial work was rolled back.
        assert!(db.get_node("n1").await.unwrap().is_none());
        assert!(db.get_node("n2").await.unwrap().is_some());

        let failures = db.failed_events().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].public_id, "ghost");
        assert!(failures[0].error.contains("space ghost"));
    }

    #[test(tokio::test)]
    async fn test_undecodable_payload_does_not_block_the_queue() {
        let (_dir, db, processor) = processor(false).await;
        sqlx::query(
            "INSERT INTO document_events \
             (public_id, document_type, action, old_data, new_data, created_at) \
             VALUES ('bad', 'EDITOR', 'UPDATE', NULL, 'not json', 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();
        db.enqueue_event("n1", "EDITOR", "INSERT", None, Some(&json!({})))
            .await
            .unwrap();

        let stats = *processor.process_pending().await.unwrap().stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.applied, 1);
        assert_eq!(db.pending_event_count().await.unwrap(), 0);
        assert!(db.get_node("n1").await.unwrap().is_some());
        assert!(db.get_node("bad").await.unwrap().is_none());

        let failures = db.failed_events().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].new_data.as_deref(), Some("not json"));
    }

    #[test(tokio::test)]
    async fn test_strict_mode_returns_error_and_releases_lease() {
        let (_dir, db, processor) = processor(true).await;
        db.enqueue_event("ghost", "SPACE", "INSERT", None, Some(&json!({"nodes": {}})))
            .await
            .unwrap();

        let err = processor.process_pending().await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        assert_eq!(db.pending_event_count().await.unwrap(), 0);
        assert_eq!(db.failed_events().await.unwrap().len(), 1);

        // Lease was released despite the error.
        assert!(matches!(
            processor.process_pending().await.unwrap(),
            PassOutcome::Completed(_)
        ));
    }

    #[test(tokio::test)]
    async fn test_requeued_failures_are_replayed() {
        let (_dir, db, processor) = processor(false).await;
        db.enqueue_event(
            "s1",
            "SPACE",
            "INSERT",
            None,
            Some(&json!({"nodes": {"n1": {"title": "Alpha"}}})),
        )
        .await
        .unwrap();
        processor.process_pending().await.unwrap();
        assert_eq!(db.failed_events().await.unwrap().len(), 1);

        db.create_space("s1", "Space One", None).await.unwrap();
        assert_eq!(db.requeue_failed_events().await.unwrap(), 1);
        assert!(db.failed_events().await.unwrap().is_empty());

        let stats = *processor.process_pending().await.unwrap().stats().unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(db.space_nodes("s1").await.unwrap().len(), 1);
    }

    #[test(tokio::test)]
    async fn test_space_event_without_payload_is_ignored() {
        let (_dir, db, processor) = processor(true).await;
        db.create_space("s1", "Space", None).await.unwrap();
        db.enqueue_event("s1", "SPACE", "UPDATE", None, None)
            .await
            .unwrap();
        let stats = *processor.process_pending().await.unwrap().stats().unwrap();
        assert_eq!(stats.ignored, 1);
        assert_eq!(db.pending_event_count().await.unwrap(), 0);
    }
}

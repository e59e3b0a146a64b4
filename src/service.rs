//! # Sync Service
//!
//! [`SyncService`] is the long-running host for the processing and snapshot workers. It owns
//! a multi-thread tokio runtime, the database pool, the [`NotificationHub`] and the handles of
//! the tasks it spawns.
//!
//! ## Tasks
//!
//! 1. **Listener** ([`listen`]): subscribes to the hub and wakes the processing worker for
//!    every notification on the configured channel.
//! 2. **Processing worker**: waits for a wake-up or for the poll interval to elapse, then runs
//!    one [`EventProcessor::process_pending`] pass under the pass timeout. Wake-ups that arrive
//!    during a pass collapse into one follow-up pass.
//! 3. **Snapshot worker**: runs [`SnapshotWorker::run`] every snapshot interval under the
//!    snapshot timeout.
//!
//! A pass that times out is dropped mid-flight. Its open transaction rolls back and its lease
//! row expires after the same timeout, at which point the next pass can take over.
//!
//! ## Shutdown
//!
//! [`SyncService::shutdown`] aborts every task. Dropping the service does the same.
//!
//! ```rust,no_run
//! use docgraph_sync::{config::SyncConfig, properties::DocumentType, service::SyncService};
//!
//! let service = SyncService::new(SyncConfig::default())?;
//! service.start()?;
//! let documents = service.documents();
//! service.block_on(documents.upsert("n1", DocumentType::Editor, b"", None))?;
//! # Ok::<(), docgraph_sync::SyncError>(())
//! ```

use parking_lot::Mutex;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    runtime::Runtime,
    sync::Notify,
    task::JoinHandle,
    time::{sleep, timeout},
};

use crate::{
    config::SyncConfig,
    db::{db_init, DbConnection},
    documents::DocumentStore,
    error::SyncError,
    listener::listen,
    notify::NotificationHub,
    processor::{EventProcessor, PassOutcome},
    snapshot::{SnapshotOutcome, SnapshotWorker},
    tokenizer::Tokenizer,
};

pub struct SyncService {
    config: SyncConfig,
    db: DbConnection,
    hub: NotificationHub,
    processor: EventProcessor,
    snapshots: SnapshotWorker,
    work_notifier: Arc<Notify>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    runtime: Runtime,
}

impl SyncService {
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()?;

        let db = DbConnection(runtime.block_on(db_init(&config.database_path))?);
        let tokenizer = Arc::new(Tokenizer::for_model(&config.tokenizer_model)?);
        let processor = EventProcessor::new(db.clone(), tokenizer, config.processor_options());
        let snapshots = SnapshotWorker::new(db.clone(), config.snapshot_options());

        Ok(SyncService {
            config,
            db,
            hub: NotificationHub::new(),
            processor,
            snapshots,
            work_notifier: Arc::new(Notify::new()),
            handles: Mutex::new(Vec::new()),
            runtime,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn db_connection(&self) -> DbConnection {
        self.db.clone()
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    /// A document store publishing on this service's hub and channel.
    pub fn documents(&self) -> DocumentStore {
        DocumentStore::new(
            self.db.clone(),
            self.hub.clone(),
            self.config.notification_channel.clone(),
        )
    }

    pub fn processor(&self) -> &EventProcessor {
        &self.processor
    }

    pub fn snapshots(&self) -> &SnapshotWorker {
        &self.snapshots
    }

    /// Drive `future` to completion on the service runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Ask the processing worker for a pass.
    pub fn wake(&self) {
        self.work_notifier.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.handles.lock().iter().any(|handle| !handle.is_finished())
    }

    /// Spawn the listener, processing and snapshot tasks.
    pub fn start(&self) -> Result<(), SyncError> {
        let mut handles = self.handles.lock();
        if handles.iter().any(|handle| !handle.is_finished()) {
            return Err(SyncError::Custom(
                "SyncService workers are already running".to_string(),
            ));
        }
        handles.clear();

        handles.push(self.runtime.spawn(listen(
            self.hub.subscribe(),
            self.config.notification_channel.clone(),
            self.work_notifier.clone(),
        )));

        let processor = self.processor.clone();
        let notifier = self.work_notifier.clone();
        let poll_interval = self.config.poll_interval();
        let pass_timeout = self.config.pass_timeout();
        handles.push(self.runtime.spawn(async move {
            tracing::info!("[SyncService] Starting event processing worker");
            loop {
                tokio::select! {
                    _ = notifier.notified() => {
                        tracing::debug!("[SyncService] Notification received, running a pass");
                    }
                    _ = sleep(poll_interval) => {
                        tracing::trace!("[SyncService] Poll interval elapsed, running a pass");
                    }
                }
                run_process_pass(&processor, pass_timeout).await;
            }
        }));

        let snapshots = self.snapshots.clone();
        let snapshot_interval = self.config.snapshot_interval();
        let snapshot_timeout = self.config.snapshot_timeout();
        handles.push(self.runtime.spawn(async move {
            tracing::info!("[SyncService] Starting snapshot worker");
            let mut ticker = tokio::time::interval(snapshot_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                run_snapshot_pass(&snapshots, snapshot_timeout).await;
            }
        }));

        // Drain whatever was queued while no worker was running.
        self.work_notifier.notify_one();
        Ok(())
    }

    pub fn shutdown(&self) {
        let mut handles = self.handles.lock();
        if handles.is_empty() {
            return;
        }
        tracing::info!("[SyncService] Shutting down {} tasks", handles.len());
        for handle in handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_process_pass(processor: &EventProcessor, limit: Duration) {
    match timeout(limit, processor.process_pending()).await {
        Ok(Ok(PassOutcome::Completed(stats))) => {
            tracing::debug!("[SyncService] Pass finished: {:?}", stats);
        }
        Ok(Ok(PassOutcome::Contended)) => {}
        Ok(Err(e)) => tracing::error!("[SyncService] Event processing pass failed: {}", e),
        Err(elapsed) => tracing::warn!(
            "[SyncService] Event processing pass abandoned: {}",
            SyncError::from(elapsed)
        ),
    }
}

async fn run_snapshot_pass(snapshots: &SnapshotWorker, limit: Duration) {
    match timeout(limit, snapshots.run()).await {
        Ok(Ok(SnapshotOutcome::Completed(stats))) => {
            tracing::debug!("[SyncService] Snapshot finished: {:?}", stats);
        }
        Ok(Ok(SnapshotOutcome::Contended)) => {}
        Ok(Err(e)) => tracing::error!("[SyncService] Snapshot pass failed: {}", e),
        Err(elapsed) => tracing::warn!(
            "[SyncService] Snapshot pass abandoned: {}",
            SyncError::from(elapsed)
        ),
    }
}

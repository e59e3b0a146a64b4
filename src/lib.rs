//! # docgraph-sync
//!
//! Keeps a relational node/space graph in step with a store of collaborative (CRDT) documents.
//!
//! ## Overview
//!
//! Every write to the `documents` table appends a row to the `document_events` queue (via
//! database triggers) and publishes a notification. A single-flight [`processor::EventProcessor`]
//! drains the queue in creation order and reconciles each event into the graph:
//!
//! - **EDITOR** documents become the content of a [`properties::Node`], whose flattened
//!   `text` and token counts are recomputed on every save.
//! - **SPACE** documents define the complete membership of an existing [`properties::Space`],
//!   renaming and creating member nodes as needed.
//! - **GRAPH** / **METHOD_GRAPH** documents add parent/child edges between nodes, creating
//!   nodes that do not exist yet.
//!
//! Independently, a [`snapshot::SnapshotWorker`] writes immutable, hash-deduplicated
//! [`properties::DocumentVersion`]s of recently changed documents.
//!
//! ## Architecture
//!
//! - **[`db`]**: SQLite pool, embedded migrations, queue access
//! - **[`lease`]**: named expiring leases that make passes single-flight
//! - **[`event`]**: pure mapping from an event to a [`event::Reconciliation`] plan
//! - **[`reconcile`]** / **[`graph`]**: plan execution and graph storage
//! - **[`processor`]**: the pass protocol, dead-lettering and strict mode
//! - **[`snapshot`]**: document versioning
//! - **[`documents`]**, **[`notify`]**, **[`listener`]**: the write path and wake-up signal
//! - **[`service`]**: long-running host for the workers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docgraph_sync::{
//!     db::{db_init, DbConnection},
//!     documents::DocumentStore,
//!     notify::{NotificationHub, DEFAULT_NOTIFICATION_CHANNEL},
//!     processor::{EventProcessor, ProcessorOptions},
//!     properties::DocumentType,
//!     tokenizer::Tokenizer,
//! };
//! use serde_json::json;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), docgraph_sync::SyncError> {
//!     let db = DbConnection(db_init("docgraph.db").await?);
//!     let store = DocumentStore::new(
//!         db.clone(),
//!         NotificationHub::new(),
//!         DEFAULT_NOTIFICATION_CHANNEL,
//!     );
//!     store
//!         .upsert(
//!             "n1",
//!             DocumentType::Editor,
//!             b"",
//!             Some(&json!({"type": "doc", "content": [{"type": "text", "text": "Hello"}]})),
//!         )
//!         .await?;
//!
//!     let tokenizer = Tokenizer::shared()?;
//!     let processor = EventProcessor::new(db.clone(), tokenizer, ProcessorOptions::default());
//!     processor.process_pending().await?;
//!
//!     let node = db.get_node("n1").await?;
//!     println!("{:?}", node.map(|n| n.text));
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **default**: the library
//! - **bin**: the `docgraph` command line tool

pub mod config;
pub mod db;
pub mod documents;
pub mod error;
pub mod event;
pub mod graph;
pub mod lease;
pub mod listener;
pub mod notify;
pub mod processor;
pub mod properties;
pub mod reconcile;
pub mod service;
pub mod snapshot;
pub mod text;
pub mod tokenizer;

pub use error::*;

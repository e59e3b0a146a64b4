//! Applies a [`Reconciliation`] to the node/space graph inside the caller's transaction.

use serde_json::Value;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::SyncError,
    event::{IgnoreReason, Reconciliation},
    graph,
    properties::{DocumentType, NodeKind},
    tokenizer::Tokenizer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    Ignored(IgnoreReason),
}

pub async fn apply(
    conn: &mut SqliteConnection,
    plan: Reconciliation,
    tokenizer: &Tokenizer,
) -> Result<ReconcileOutcome, SyncError> {
    match plan {
        Reconciliation::Editor { public_id, content } => {
            apply_editor(conn, &public_id, content, tokenizer).await?;
        }
        Reconciliation::Space { public_id, titles } => {
            apply_space(conn, &public_id, titles, tokenizer).await?;
        }
        Reconciliation::Graph {
            public_id,
            document_type,
            kind,
            children,
        } => {
            apply_graph(conn, &public_id, document_type, kind, &children, tokenizer).await?;
        }
        Reconciliation::Ignore(reason) => return Ok(ReconcileOutcome::Ignored(reason)),
    }
    Ok(ReconcileOutcome::Applied)
}

async fn apply_editor(
    conn: &mut SqliteConnection,
    public_id: &str,
    content: Value,
    tokenizer: &Tokenizer,
) -> Result<(), SyncError> {
    let mut node = graph::get_or_create_node(conn, public_id, NodeKind::Default, tokenizer).await?;
    graph::attach_node_documents(conn, &mut node, DocumentType::Graph).await?;
    node.content = match content {
        Value::Null => None,
        content => Some(content),
    };
    graph::save_node(conn, &mut node, tokenizer).await?;
    tracing::debug!(
        "[reconcile] editor content for {} now has {} text tokens",
        public_id,
        node.text_token_count.unwrap_or_default()
    );
    Ok(())
}

async fn apply_space(
    conn: &mut SqliteConnection,
    public_id: &str,
    titles: BTreeMap<String, String>,
    tokenizer: &Tokenizer,
) -> Result<(), SyncError> {
    let mut space = graph::get_space(conn, public_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("space {public_id}")))?;
    graph::attach_space_document(conn, &mut space).await?;

    let ids: Vec<String> = titles.keys().cloned().collect();
    let existing = graph::node_headers(conn, &ids).await?;
    let member_ids: Vec<i64> = existing.iter().map(|header| header.id).collect();
    graph::set_space_nodes(conn, space.id, &member_ids).await?;

    let mut renamed = 0;
    for header in existing.iter() {
        if let Some(title) = titles.get(&header.public_id) {
            if *title != header.title {
                graph::update_node_title(conn, header.id, title, tokenizer).await?;
                renamed += 1;
            }
        }
    }

    let known: BTreeSet<&str> = existing.iter().map(|h| h.public_id.as_str()).collect();
    let mut created_ids = Vec::new();
    for (node_id, title) in titles.iter() {
        if known.contains(node_id.as_str()) {
            continue;
        }
        let mut node =
            graph::create_node(conn, node_id, title, NodeKind::Default, tokenizer).await?;
        if graph::attach_node_documents(conn, &mut node, DocumentType::Graph).await? {
            graph::save_node(conn, &mut node, tokenizer).await?;
        }
        created_ids.push(node.id);
    }
    graph::add_space_nodes(conn, space.id, &created_ids).await?;

    tracing::debug!(
        "[reconcile] space {}: {} existing members, {} renamed, {} created",
        public_id,
        existing.len(),
        renamed,
        created_ids.len()
    );
    Ok(())
}

async fn apply_graph(
    conn: &mut SqliteConnection,
    public_id: &str,
    document_type: DocumentType,
    kind: NodeKind,
    children: &[String],
    tokenizer: &Tokenizer,
) -> Result<(), SyncError> {
    let mut parent = graph::get_or_create_node(conn, public_id, kind, tokenizer).await?;
    if parent.graph_document_id.is_none() {
        if let Some(document_id) = graph::find_document_id(conn, public_id, document_type).await? {
            parent.graph_document_id = Some(document_id);
            graph::save_node(conn, &mut parent, tokenizer).await?;
        }
    }

    let mut added = 0;
    for child_id in children {
        if child_id == public_id {
            tracing::warn!("[reconcile] {} lists itself as a child, skipping", public_id);
            continue;
        }
        let child =
            graph::get_or_create_node(conn, child_id, NodeKind::Default, tokenizer).await?;
        if graph::add_subnode(conn, parent.id, child.id).await? {
            added += 1;
        }
    }
    tracing::debug!(
        "[reconcile] {} {}: {} children listed, {} new edges",
        document_type,
        public_id,
        children.len(),
        added
    );
    Ok(())
}

//! Entities shared by the event queue, the document store and the node/space graph.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use crate::{
    error::SyncError,
    text::extract_text,
    tokenizer::Tokenizer,
};

/// The kind of CRDT document a row or event belongs to. A single `public_id` may carry one
/// document of each type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    Editor,
    Space,
    Graph,
    MethodGraph,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Editor => "EDITOR",
            DocumentType::Space => "SPACE",
            DocumentType::Graph => "GRAPH",
            DocumentType::MethodGraph => "METHOD_GRAPH",
        }
    }
}

impl Display for DocumentType {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EDITOR" => Ok(DocumentType::Editor),
            "SPACE" => Ok(DocumentType::Space),
            "GRAPH" => Ok(DocumentType::Graph),
            "METHOD_GRAPH" => Ok(DocumentType::MethodGraph),
            other => Err(SyncError::Serialization(format!(
                "unknown document type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventAction {
    Insert,
    Update,
    Delete,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Insert => "INSERT",
            EventAction::Update => "UPDATE",
            EventAction::Delete => "DELETE",
        }
    }
}

impl Display for EventAction {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventAction {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(EventAction::Insert),
            "UPDATE" => Ok(EventAction::Update),
            "DELETE" => Ok(EventAction::Delete),
            other => Err(SyncError::Serialization(format!(
                "unknown event action '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    Default,
    /// Nodes materialized from a METHOD_GRAPH document.
    Method,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Default => "default",
            NodeKind::Method => "method",
        }
    }
}

impl FromStr for NodeKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(NodeKind::Default),
            "method" => Ok(NodeKind::Method),
            other => Err(SyncError::Serialization(format!("unknown node kind '{other}'"))),
        }
    }
}

fn parse_json_column(row: &SqliteRow, column: &str) -> sqlx::Result<Option<Value>> {
    let raw: Option<&str> = row.try_get(column)?;
    Ok(parse_json_text(raw)?)
}

/// Decode an optional JSON text column.
pub fn parse_json_text(raw: Option<&str>) -> Result<Option<Value>, SyncError> {
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(text)?)),
        None => Ok(None),
    }
}

/// A CRDT document revision holder keyed by `(public_id, document_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub public_id: String,
    pub document_type: DocumentType,
    /// Opaque CRDT encoding.
    pub data: Vec<u8>,
    pub json: Option<Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FromRow<'_, SqliteRow> for Document {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let document_type: &str = row.try_get("document_type")?;
        Ok(Document {
            id: row.try_get("id")?,
            public_id: row.try_get("public_id")?,
            document_type: DocumentType::from_str(document_type)?,
            data: row.try_get("data")?,
            json: parse_json_column(row, "json")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// A queued change event as stored. Every column stays raw here since the queue is written by
/// database triggers and external tooling, and one malformed row must not fail a whole queue
/// read. [`DocumentEvent::try_from`] validates the kinds and decodes the payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    pub public_id: String,
    pub document_type: String,
    pub action: String,
    pub old_data: Option<String>,
    pub new_data: Option<String>,
    pub created_at: i64,
}

impl StoredEvent {
    pub fn kinds(&self) -> Result<(DocumentType, EventAction), SyncError> {
        Ok((
            DocumentType::from_str(&self.document_type)?,
            EventAction::from_str(&self.action)?,
        ))
    }
}

impl FromRow<'_, SqliteRow> for StoredEvent {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(StoredEvent {
            id: row.try_get("id")?,
            public_id: row.try_get("public_id")?,
            document_type: row.try_get("document_type")?,
            action: row.try_get("action")?,
            old_data: row.try_get("old_data")?,
            new_data: row.try_get("new_data")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEvent {
    pub id: i64,
    pub public_id: String,
    pub document_type: DocumentType,
    pub action: EventAction,
    pub old_data: Option<Value>,
    pub new_data: Option<Value>,
    pub created_at: i64,
}

impl TryFrom<StoredEvent> for DocumentEvent {
    type Error = SyncError;

    fn try_from(stored: StoredEvent) -> Result<Self, Self::Error> {
        let (document_type, action) = stored.kinds()?;
        Ok(DocumentEvent {
            id: stored.id,
            document_type,
            action,
            old_data: parse_json_text(stored.old_data.as_deref())?,
            new_data: parse_json_text(stored.new_data.as_deref())?,
            public_id: stored.public_id,
            created_at: stored.created_at,
        })
    }
}

impl Display for DocumentEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "DocumentEvent(id: {}, {} {} {})",
            self.id, self.document_type, self.action, self.public_id
        )
    }
}

/// An event that failed reconciliation and was moved out of the queue. Payloads are kept
/// verbatim, including ones that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEvent {
    pub id: i64,
    pub event_id: i64,
    pub public_id: String,
    pub document_type: String,
    pub action: String,
    pub old_data: Option<String>,
    pub new_data: Option<String>,
    pub event_created_at: i64,
    pub error: String,
    pub failed_at: i64,
}

impl FromRow<'_, SqliteRow> for FailedEvent {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(FailedEvent {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            public_id: row.try_get("public_id")?,
            document_type: row.try_get("document_type")?,
            action: row.try_get("action")?,
            old_data: row.try_get("old_data")?,
            new_data: row.try_get("new_data")?,
            event_created_at: row.try_get("event_created_at")?,
            error: row.try_get("error")?,
            failed_at: row.try_get("failed_at")?,
        })
    }
}

/// Immutable point-in-time copy of a [`Document`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: i64,
    pub public_id: String,
    pub document_type: DocumentType,
    pub document_id: i64,
    pub json_hash: String,
    pub data: Vec<u8>,
    pub created_at: i64,
}

impl FromRow<'_, SqliteRow> for DocumentVersion {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let document_type: &str = row.try_get("document_type")?;
        Ok(DocumentVersion {
            id: row.try_get("id")?,
            public_id: row.try_get("public_id")?,
            document_type: DocumentType::from_str(document_type)?,
            document_id: row.try_get("document_id")?,
            json_hash: row.try_get("json_hash")?,
            data: row.try_get("data")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// The canonical graph vertex.
///
/// `text`, `text_token_count` and `title_token_count` are derived from `content` and `title`.
/// They are only written through [`Node::refresh_derived`], which every save path calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub public_id: String,
    pub kind: NodeKind,
    pub title: String,
    pub title_token_count: Option<i64>,
    pub content: Option<Value>,
    pub text: String,
    pub text_token_count: Option<i64>,
    pub removed: bool,
    pub editor_document_id: Option<i64>,
    pub graph_document_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Node {
    /// Recompute every derived field from its source field.
    pub fn refresh_derived(&mut self, tokenizer: &Tokenizer) {
        self.text = match &self.content {
            Some(content) => extract_text(content).join(" "),
            None => String::new(),
        };
        self.text_token_count = tokenizer.token_count(Some(&self.text)).map(|c| c as i64);
        self.title_token_count = tokenizer.token_count(Some(&self.title)).map(|c| c as i64);
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Node({}, '{}', kind: {}{})",
            self.public_id,
            self.title,
            self.kind.as_str(),
            if self.removed { ", removed" } else { "" }
        )
    }
}

impl FromRow<'_, SqliteRow> for Node {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let kind: &str = row.try_get("kind")?;
        Ok(Node {
            id: row.try_get("id")?,
            public_id: row.try_get("public_id")?,
            kind: NodeKind::from_str(kind)?,
            title: row.try_get("title")?,
            title_token_count: row.try_get("title_token_count")?,
            content: parse_json_column(row, "content")?,
            text: row.try_get("text")?,
            text_token_count: row.try_get("text_token_count")?,
            removed: row.try_get("removed")?,
            editor_document_id: row.try_get("editor_document_id")?,
            graph_document_id: row.try_get("graph_document_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// A node row without its heavy content columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeader {
    pub id: i64,
    pub public_id: String,
    pub title: String,
    pub created_at: i64,
}

impl FromRow<'_, SqliteRow> for NodeHeader {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(NodeHeader {
            id: row.try_get("id")?,
            public_id: row.try_get("public_id")?,
            title: row.try_get("title")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// A workspace container of nodes. `title_slug` is fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub id: i64,
    pub public_id: String,
    pub title: String,
    pub title_slug: String,
    pub document_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FromRow<'_, SqliteRow> for Space {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Space {
            id: row.try_get("id")?,
            public_id: row.try_get("public_id")?,
            title: row.try_get("title")?,
            title_slug: row.try_get("title_slug")?,
            document_id: row.try_get("document_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceMember {
    pub space_id: i64,
    pub principal: String,
    pub role: String,
}

impl FromRow<'_, SqliteRow> for SpaceMember {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(SpaceMember {
            space_id: row.try_get("space_id")?,
            principal: row.try_get("principal")?,
            role: row.try_get("role")?,
        })
    }
}

//! Node/space graph persistence.
//!
//! Free functions take a `&mut SqliteConnection` so the event processor can run them inside
//! its per-event transaction; [`DbConnection`] wraps them for application callers.
//!
//! When several rows are written in one transaction, parents are written before children and
//! spaces before their member nodes.

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::{sqlite::Sqlite, QueryBuilder, SqliteConnection};
use std::collections::BTreeSet;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::{
    db::{now_millis, DbConnection},
    error::SyncError,
    properties::{DocumentType, Node, NodeHeader, NodeKind, Space, SpaceMember},
    tokenizer::Tokenizer,
};

pub const SPACE_OWNER_ROLE: &str = "owner";
const SLUG_ATTEMPTS: usize = 16;
const SLUG_SUFFIX_LEN: usize = 6;

static SLUG_STRIP: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s-]").unwrap());
static SLUG_COLLAPSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-\s]+").unwrap());

/// Lowercase ASCII slug of `title`: accents folded, punctuation dropped, runs of whitespace and
/// dashes collapsed to a single dash.
pub fn slugify(title: &str) -> String {
    let ascii: String = title.nfkd().filter(char::is_ascii).collect();
    let lowered = ascii.to_lowercase();
    let stripped = SLUG_STRIP.replace_all(&lowered, "");
    SLUG_COLLAPSE
        .replace_all(stripped.trim(), "-")
        .trim_matches(|c| c == '-' || c == '_')
        .to_string()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

pub async fn get_node(
    conn: &mut SqliteConnection,
    public_id: &str,
) -> Result<Option<Node>, SyncError> {
    Ok(
        sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE public_id = ?")
            .bind(public_id)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

/// Insert a fresh node. Fails with a unique violation if `public_id` is taken.
pub async fn create_node(
    conn: &mut SqliteConnection,
    public_id: &str,
    title: &str,
    kind: NodeKind,
    tokenizer: &Tokenizer,
) -> Result<Node, sqlx::Error> {
    let now = now_millis();
    let mut node = Node {
        id: 0,
        public_id: public_id.to_string(),
        kind,
        title: title.to_string(),
        title_token_count: None,
        content: None,
        text: String::new(),
        text_token_count: None,
        removed: false,
        editor_document_id: None,
        graph_document_id: None,
        created_at: now,
        updated_at: now,
    };
    node.refresh_derived(tokenizer);
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO nodes \
         (public_id, kind, title, title_token_count, content, text, text_token_count, removed, \
          created_at, updated_at) \
         VALUES (?, ?, ?, ?, NULL, ?, ?, 0, ?, ?) RETURNING id",
    )
    .bind(&node.public_id)
    .bind(node.kind.as_str())
    .bind(&node.title)
    .bind(node.title_token_count)
    .bind(&node.text)
    .bind(node.text_token_count)
    .bind(node.created_at)
    .bind(node.updated_at)
    .fetch_one(&mut *conn)
    .await?;
    node.id = id;
    tracing::debug!("[graph] created {}", node);
    Ok(node)
}

/// Fetch the node for `public_id`, creating it with `kind` when absent. A concurrent insert of
/// the same id surfaces as a unique violation, after which the winner's row is re-fetched.
pub async fn get_or_create_node(
    conn: &mut SqliteConnection,
    public_id: &str,
    kind: NodeKind,
    tokenizer: &Tokenizer,
) -> Result<Node, SyncError> {
    if let Some(node) = get_node(conn, public_id).await? {
        return Ok(node);
    }
    match create_node(conn, public_id, "", kind, tokenizer).await {
        Ok(node) => Ok(node),
        Err(e) if is_unique_violation(&e) => {
            tracing::debug!(
                "[graph] node {} was created concurrently, re-fetching",
                public_id
            );
            get_node(conn, public_id).await?.ok_or_else(|| {
                SyncError::NotFound(format!("node {public_id} vanished after unique violation"))
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Persist every column of `node`, recomputing derived fields first.
pub async fn save_node(
    conn: &mut SqliteConnection,
    node: &mut Node,
    tokenizer: &Tokenizer,
) -> Result<(), SyncError> {
    node.refresh_derived(tokenizer);
    node.updated_at = now_millis();
    let content = node.content.as_ref().map(|c| c.to_string());
    sqlx::query(
        "UPDATE nodes SET kind = ?, title = ?, title_token_count = ?, content = ?, text = ?, \
         text_token_count = ?, removed = ?, editor_document_id = ?, graph_document_id = ?, \
         updated_at = ? WHERE id = ?",
    )
    .bind(node.kind.as_str())
    .bind(&node.title)
    .bind(node.title_token_count)
    .bind(content)
    .bind(&node.text)
    .bind(node.text_token_count)
    .bind(node.removed)
    .bind(node.editor_document_id)
    .bind(node.graph_document_id)
    .bind(node.updated_at)
    .bind(node.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Write only the title and its token count.
pub async fn update_node_title(
    conn: &mut SqliteConnection,
    node_id: i64,
    title: &str,
    tokenizer: &Tokenizer,
) -> Result<(), SyncError> {
    let title_token_count = tokenizer.token_count(Some(title)).map(|c| c as i64);
    sqlx::query(
        "UPDATE nodes SET title = ?, title_token_count = ?, updated_at = ? WHERE id = ?",
    )
    .bind(title)
    .bind(title_token_count)
    .bind(now_millis())
    .bind(node_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn find_document_id(
    conn: &mut SqliteConnection,
    public_id: &str,
    document_type: DocumentType,
) -> Result<Option<i64>, SyncError> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM documents WHERE public_id = ? AND document_type = ?")
            .bind(public_id)
            .bind(document_type.as_str())
            .fetch_optional(&mut *conn)
            .await?;
    Ok(row.map(|(id,)| id))
}

/// Fill in missing document back-references of `node`. `graph_type` picks which graph document
/// (GRAPH or METHOD_GRAPH) backs the node. Missing documents are not an error. Returns whether
/// anything changed; the caller persists.
pub async fn attach_node_documents(
    conn: &mut SqliteConnection,
    node: &mut Node,
    graph_type: DocumentType,
) -> Result<bool, SyncError> {
    let mut changed = false;
    if node.graph_document_id.is_none() {
        if let Some(id) = find_document_id(conn, &node.public_id, graph_type).await? {
            node.graph_document_id = Some(id);
            changed = true;
        }
    }
    if node.editor_document_id.is_none() {
        if let Some(id) = find_document_id(conn, &node.public_id, DocumentType::Editor).await? {
            node.editor_document_id = Some(id);
            changed = true;
        }
    }
    Ok(changed)
}

pub async fn get_space(
    conn: &mut SqliteConnection,
    public_id: &str,
) -> Result<Option<Space>, SyncError> {
    Ok(
        sqlx::query_as::<_, Space>("SELECT * FROM spaces WHERE public_id = ?")
            .bind(public_id)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

/// Attach the SPACE document backing `space` if it is not set yet.
pub async fn attach_space_document(
    conn: &mut SqliteConnection,
    space: &mut Space,
) -> Result<bool, SyncError> {
    if space.document_id.is_some() {
        return Ok(false);
    }
    let Some(document_id) = find_document_id(conn, &space.public_id, DocumentType::Space).await?
    else {
        return Ok(false);
    };
    space.document_id = Some(document_id);
    space.updated_at = now_millis();
    sqlx::query("UPDATE spaces SET document_id = ?, updated_at = ? WHERE id = ?")
        .bind(document_id)
        .bind(space.updated_at)
        .bind(space.id)
        .execute(&mut *conn)
        .await?;
    Ok(true)
}

/// Node headers for `public_ids`, newest first. When an id matches more than once only the
/// most recently created row is kept.
pub async fn node_headers(
    conn: &mut SqliteConnection,
    public_ids: &[String],
) -> Result<Vec<NodeHeader>, SyncError> {
    if public_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT id, public_id, title, created_at FROM nodes WHERE public_id IN (",
    );
    let mut separated = qb.separated(", ");
    for public_id in public_ids {
        separated.push_bind(public_id.clone());
    }
    separated.push_unseparated(") ORDER BY created_at DESC, id DESC");
    let headers = qb
        .build_query_as::<NodeHeader>()
        .fetch_all(&mut *conn)
        .await?;

    let mut seen = BTreeSet::new();
    Ok(headers
        .into_iter()
        .filter(|header| seen.insert(header.public_id.clone()))
        .collect())
}

/// Replace the complete membership of a space.
pub async fn set_space_nodes(
    conn: &mut SqliteConnection,
    space_id: i64,
    node_ids: &[i64],
) -> Result<(), SyncError> {
    sqlx::query("DELETE FROM space_nodes WHERE space_id = ?")
        .bind(space_id)
        .execute(&mut *conn)
        .await?;
    add_space_nodes(conn, space_id, node_ids).await
}

pub async fn add_space_nodes(
    conn: &mut SqliteConnection,
    space_id: i64,
    node_ids: &[i64],
) -> Result<(), SyncError> {
    if node_ids.is_empty() {
        return Ok(());
    }
    let mut qb =
        QueryBuilder::<Sqlite>::new("INSERT OR IGNORE INTO space_nodes (space_id, node_id) ");
    qb.push_values(node_ids, |mut b, node_id| {
        b.push_bind(space_id).push_bind(*node_id);
    });
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

/// Add `child_id` under `parent_id`. Returns false when the edge already existed.
pub async fn add_subnode(
    conn: &mut SqliteConnection,
    parent_id: i64,
    child_id: i64,
) -> Result<bool, SyncError> {
    let inserted =
        sqlx::query("INSERT OR IGNORE INTO node_subnodes (parent_id, child_id) VALUES (?, ?)")
            .bind(parent_id)
            .bind(child_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    Ok(inserted > 0)
}

async fn slug_taken(conn: &mut SqliteConnection, slug: &str) -> Result<bool, SyncError> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM spaces WHERE title_slug = ?")
        .bind(slug)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

/// Create a space with a unique slug derived from its title, optionally recording `owner` as
/// its first member.
pub async fn create_space(
    conn: &mut SqliteConnection,
    public_id: &str,
    title: &str,
    owner: Option<&str>,
) -> Result<Space, SyncError> {
    if get_space(conn, public_id).await?.is_some() {
        return Err(SyncError::Custom(format!("space {public_id} already exists")));
    }
    let base = match slugify(title) {
        slug if slug.is_empty() => "space".to_string(),
        slug => slug,
    };

    for attempt in 0..SLUG_ATTEMPTS {
        let candidate = if attempt == 0 {
            base.clone()
        } else {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("{}-{}", base, &suffix[..SLUG_SUFFIX_LEN])
        };
        if slug_taken(conn, &candidate).await? {
            continue;
        }
        let now = now_millis();
        let inserted = sqlx::query_as::<_, Space>(
            "INSERT INTO spaces (public_id, title, title_slug, document_id, created_at, updated_at) \
             VALUES (?, ?, ?, NULL, ?, ?) RETURNING *",
        )
        .bind(public_id)
        .bind(title)
        .bind(&candidate)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await;
        let space = match inserted {
            Ok(space) => space,
            // Lost a race for this slug.
            Err(e) if is_unique_violation(&e) => continue,
            Err(e) => return Err(e.into()),
        };
        if let Some(owner) = owner {
            sqlx::query("INSERT INTO space_members (space_id, principal, role) VALUES (?, ?, ?)")
                .bind(space.id)
                .bind(owner)
                .bind(SPACE_OWNER_ROLE)
                .execute(&mut *conn)
                .await?;
        }
        tracing::info!("[graph] created space {} ('{}')", space.public_id, space.title_slug);
        return Ok(space);
    }
    Err(SyncError::Custom(format!(
        "could not find a free slug for space '{title}' after {SLUG_ATTEMPTS} attempts"
    )))
}

impl DbConnection {
    pub async fn get_node(&self, public_id: &str) -> Result<Option<Node>, SyncError> {
        let mut conn = self.0.acquire().await?;
        get_node(&mut conn, public_id).await
    }

    /// Every node, including soft-deleted ones.
    pub async fn all_nodes(&self) -> Result<Vec<Node>, SyncError> {
        Ok(
            sqlx::query_as::<_, Node>("SELECT * FROM nodes ORDER BY created_at ASC, id ASC")
                .fetch_all(&self.0)
                .await?,
        )
    }

    /// Nodes that have not been soft-deleted.
    pub async fn active_nodes(&self) -> Result<Vec<Node>, SyncError> {
        Ok(sqlx::query_as::<_, Node>(
            "SELECT * FROM nodes WHERE removed = 0 ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.0)
        .await?)
    }

    pub async fn subnodes(&self, public_id: &str) -> Result<Vec<Node>, SyncError> {
        Ok(sqlx::query_as::<_, Node>(
            "SELECT c.* FROM nodes p \
             JOIN node_subnodes e ON e.parent_id = p.id \
             JOIN nodes c ON c.id = e.child_id \
             WHERE p.public_id = ? ORDER BY c.public_id",
        )
        .bind(public_id)
        .fetch_all(&self.0)
        .await?)
    }

    pub async fn parents(&self, public_id: &str) -> Result<Vec<Node>, SyncError> {
        Ok(sqlx::query_as::<_, Node>(
            "SELECT p.* FROM nodes c \
             JOIN node_subnodes e ON e.child_id = c.id \
             JOIN nodes p ON p.id = e.parent_id \
             WHERE c.public_id = ? ORDER BY p.public_id",
        )
        .bind(public_id)
        .fetch_all(&self.0)
        .await?)
    }

    /// Set a node's title through the save path so its token count follows.
    pub async fn set_node_title(&self, public_id: &str, title: &str) -> Result<Node, SyncError> {
        let tokenizer = Tokenizer::shared()?;
        let mut tx = self.begin_write().await?;
        let mut node = get_node(&mut tx, public_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("node {public_id}")))?;
        node.title = title.to_string();
        save_node(&mut tx, &mut node, &tokenizer).await?;
        tx.commit().await?;
        Ok(node)
    }

    pub async fn remove_node(&self, public_id: &str) -> Result<(), SyncError> {
        self.set_node_removed(public_id, true).await
    }

    pub async fn restore_node(&self, public_id: &str) -> Result<(), SyncError> {
        self.set_node_removed(public_id, false).await
    }

    async fn set_node_removed(&self, public_id: &str, removed: bool) -> Result<(), SyncError> {
        let changed =
            sqlx::query("UPDATE nodes SET removed = ?, updated_at = ? WHERE public_id = ?")
                .bind(removed)
                .bind(now_millis())
                .bind(public_id)
                .execute(&self.0)
                .await?
                .rows_affected();
        if changed == 0 {
            return Err(SyncError::NotFound(format!("node {public_id}")));
        }
        Ok(())
    }

    pub async fn get_space(&self, public_id: &str) -> Result<Option<Space>, SyncError> {
        let mut conn = self.0.acquire().await?;
        get_space(&mut conn, public_id).await
    }

    pub async fn create_space(
        &self,
        public_id: &str,
        title: &str,
        owner: Option<&str>,
    ) -> Result<Space, SyncError> {
        let mut tx = self.begin_write().await?;
        let space = create_space(&mut tx, public_id, title, owner).await?;
        tx.commit().await?;
        Ok(space)
    }

    pub async fn space_nodes(&self, public_id: &str) -> Result<Vec<Node>, SyncError> {
        self.space_relation_nodes("space_nodes", public_id).await
    }

    pub async fn space_deleted_nodes(&self, public_id: &str) -> Result<Vec<Node>, SyncError> {
        self.space_relation_nodes("space_deleted_nodes", public_id).await
    }

    async fn space_relation_nodes(
        &self,
        table: &str,
        public_id: &str,
    ) -> Result<Vec<Node>, SyncError> {
        let sql = format!(
            "SELECT n.* FROM spaces s \
             JOIN {table} m ON m.space_id = s.id \
             JOIN nodes n ON n.id = m.node_id \
             WHERE s.public_id = ? ORDER BY n.public_id"
        );
        Ok(sqlx::query_as::<_, Node>(&sql)
            .bind(public_id)
            .fetch_all(&self.0)
            .await?)
    }

    pub async fn space_members(&self, public_id: &str) -> Result<Vec<SpaceMember>, SyncError> {
        Ok(sqlx::query_as::<_, SpaceMember>(
            "SELECT m.* FROM space_members m JOIN spaces s ON s.id = m.space_id \
             WHERE s.public_id = ? ORDER BY m.principal",
        )
        .bind(public_id)
        .fetch_all(&self.0)
        .await?)
    }

    /// Move a node from a space's live membership into its deleted set.
    pub async fn remove_node_from_space(
        &self,
        space_public_id: &str,
        node_public_id: &str,
    ) -> Result<(), SyncError> {
        let mut tx = self.begin_write().await?;
        let space = get_space(&mut tx, space_public_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("space {space_public_id}")))?;
        let node = get_node(&mut tx, node_public_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("node {node_public_id}")))?;
        sqlx::query("DELETE FROM space_nodes WHERE space_id = ? AND node_id = ?")
            .bind(space.id)
            .bind(node.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT OR IGNORE INTO space_deleted_nodes (space_id, node_id) VALUES (?, ?)")
            .bind(space.id)
            .bind(node.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

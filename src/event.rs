use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
};

use crate::properties::{DocumentEvent, DocumentType, EventAction, NodeKind};

const NODES_KEY: &str = "nodes";
const TITLE_KEY: &str = "title";
const ID_KEY: &str = "id";

/// Why an event produced no graph mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IgnoreReason {
    /// Document deletions never delete graph entities.
    Deleted,
    /// A SPACE insert/update arrived without `new_data`.
    MissingPayload,
}

impl Display for IgnoreReason {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            IgnoreReason::Deleted => write!(f, "Deleted"),
            IgnoreReason::MissingPayload => write!(f, "MissingPayload"),
        }
    }
}

/// The graph mutation an event asks for, decided from its type, action and payload alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reconciliation {
    /// Get-or-create the node and replace its content.
    Editor { public_id: String, content: Value },
    /// Replace the space's membership with `titles` (child id -> title), renaming and
    /// creating nodes as needed.
    Space {
        public_id: String,
        titles: BTreeMap<String, String>,
    },
    /// Get-or-create the parent and add every child to its subnodes.
    Graph {
        public_id: String,
        document_type: DocumentType,
        kind: NodeKind,
        children: Vec<String>,
    },
    Ignore(IgnoreReason),
}

impl Reconciliation {
    pub fn from_event(event: &DocumentEvent) -> Reconciliation {
        let public_id = event.public_id.clone();
        match (event.document_type, event.action) {
            (_, EventAction::Delete) => Reconciliation::Ignore(IgnoreReason::Deleted),
            (DocumentType::Editor, EventAction::Insert | EventAction::Update) => {
                Reconciliation::Editor {
                    public_id,
                    content: event.new_data.clone().unwrap_or(Value::Null),
                }
            }
            (DocumentType::Space, EventAction::Insert | EventAction::Update) => {
                match &event.new_data {
                    Some(data) => Reconciliation::Space {
                        public_id,
                        titles: space_titles(data),
                    },
                    None => Reconciliation::Ignore(IgnoreReason::MissingPayload),
                }
            }
            (
                doc_type @ (DocumentType::Graph | DocumentType::MethodGraph),
                EventAction::Insert | EventAction::Update,
            ) => Reconciliation::Graph {
                public_id,
                document_type: doc_type,
                kind: match doc_type {
                    DocumentType::MethodGraph => NodeKind::Method,
                    _ => NodeKind::Default,
                },
                children: graph_children(event.new_data.as_ref()),
            },
        }
    }
}

impl Display for Reconciliation {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Reconciliation::Editor { public_id, .. } => write!(f, "Editor({public_id})"),
            Reconciliation::Space { public_id, titles } => {
                write!(f, "Space({public_id}, {} nodes)", titles.len())
            }
            Reconciliation::Graph {
                public_id,
                document_type,
                children,
                ..
            } => write!(f, "{document_type}({public_id}, {} children)", children.len()),
            Reconciliation::Ignore(reason) => write!(f, "Ignore({reason})"),
        }
    }
}

/// `{"nodes": {"<id>": {"title": "..."}, ...}}` -> id -> title. Entries without a string title
/// map to an empty title.
pub fn space_titles(data: &Value) -> BTreeMap<String, String> {
    let Some(nodes) = data.get(NODES_KEY).and_then(Value::as_object) else {
        return BTreeMap::new();
    };
    nodes
        .iter()
        .map(|(id, entry)| {
            let title = entry
                .get(TITLE_KEY)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (id.clone(), title)
        })
        .collect()
}

/// Child ids of a graph document's `nodes` collection, in payload order. The collection may be
/// an object keyed by id, or an array of ids or of objects carrying an `id`.
pub fn graph_children(data: Option<&Value>) -> Vec<String> {
    match data.and_then(|d| d.get(NODES_KEY)) {
        Some(Value::Object(nodes)) => nodes.keys().cloned().collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(id) => Some(id.clone()),
                Value::Object(entry) => entry.get(ID_KEY).and_then(Value::as_str).map(String::from),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_log::test;

    fn event(
        document_type: DocumentType,
        action: EventAction,
        new_data: Option<Value>,
    ) -> DocumentEvent {
        DocumentEvent {
            id: 1,
            public_id: "x".to_string(),
            document_type,
            action,
            old_data: None,
            new_data,
            created_at: 0,
        }
    }

    #[test]
    fn test_deletes_are_ignored_for_every_type() {
        for doc_type in [
            DocumentType::Editor,
            DocumentType::Space,
            DocumentType::Graph,
            DocumentType::MethodGraph,
        ] {
            assert_eq!(
                Reconciliation::from_event(&event(doc_type, EventAction::Delete, Some(json!({})))),
                Reconciliation::Ignore(IgnoreReason::Deleted)
            );
        }
    }

    #[test]
    fn test_space_without_payload_is_ignored() {
        assert_eq!(
            Reconciliation::from_event(&event(DocumentType::Space, EventAction::Update, None)),
            Reconciliation::Ignore(IgnoreReason::MissingPayload)
        );
    }

    #[test]
    fn test_space_titles_extraction() {
        let plan = Reconciliation::from_event(&event(
            DocumentType::Space,
            EventAction::Insert,
            Some(json!({"nodes": {"n1": {"title": "Alpha"}, "n2": {}}, "deletedNodes": []})),
        ));
        let Reconciliation::Space { titles, .. } = plan else {
            panic!("expected a space plan, got {plan:?}");
        };
        assert_eq!(titles.get("n1").map(String::as_str), Some("Alpha"));
        assert_eq!(titles.get("n2").map(String::as_str), Some(""));
    }

    #[test]
    fn test_method_graph_marks_kind() {
        let plan = Reconciliation::from_event(&event(
            DocumentType::MethodGraph,
            EventAction::Insert,
            Some(json!({"nodes": {"a": {}, "b": {}}})),
        ));
        assert_eq!(
            plan,
            Reconciliation::Graph {
                public_id: "x".to_string(),
                document_type: DocumentType::MethodGraph,
                kind: NodeKind::Method,
                children: vec!["a".to_string(), "b".to_string()],
            }
        );
    }

    #[test]
    fn test_graph_children_shapes() {
        assert_eq!(
            graph_children(Some(&json!({"nodes": ["a", {"id": "b"}, 3]}))),
            vec!["a", "b"]
        );
        assert!(graph_children(None).is_empty());
        assert!(graph_children(Some(&json!({"edges": []}))).is_empty());
    }

    #[test]
    fn test_editor_without_payload_clears_content() {
        assert_eq!(
            Reconciliation::from_event(&event(DocumentType::Editor, EventAction::Insert, None)),
            Reconciliation::Editor {
                public_id: "x".to_string(),
                content: Value::Null
            }
        );
    }
}

//! Plain-text extraction from rich-text editor trees.
//!
//! Editor documents arrive as a nested AST of typed nodes:
//!
//! ```json
//! {"type": "doc", "content": [
//!     {"type": "paragraph", "content": [{"type": "text", "text": "Hello"}]},
//!     {"type": "nodeEmbed", "attrs": {"id": "n2"}}
//! ]}
//! ```
//!
//! Only `type: "text"` leaves produce output. Structural wrappers are walked through their
//! `content` children; anything else an element carries (`attrs`, `marks`, embedded node
//! references) is opaque and contributes nothing.

use serde_json::Value;

const TYPE_KEY: &str = "type";
const TEXT_TYPE: &str = "text";
const TEXT_KEY: &str = "text";
const CONTENT_KEY: &str = "content";

/// Collect the text leaves of `tree` in document order.
pub fn extract_text(tree: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_text(tree, &mut out);
    out
}

fn collect_text(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_text(item, out);
            }
        }
        Value::Object(map) => {
            if map.get(TYPE_KEY).and_then(Value::as_str) == Some(TEXT_TYPE) {
                if let Some(text) = map.get(TEXT_KEY).and_then(Value::as_str) {
                    out.push(text.to_string());
                }
                return;
            }
            if let Some(children) = map.get(CONTENT_KEY) {
                collect_text(children, out);
            }
        }
        _ => {}
    }
}

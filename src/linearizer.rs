//! Conversation linearizer.
//!
//! Recovers one chronological message path from a parent/child node map by
//! walking parent pointers back from a start node, then reversing.
//!
//! ## Start Node
//!
//! The explicit `current_node` pointer when present, otherwise the childless
//! node carrying a message with the greatest creation time (missing times
//! count as 0, ties go to the smallest node id).
//!
//! ## Safety
//!
//! A visited-id set turns any revisit into a cycle error. The step count is
//! additionally capped at node count plus a small constant. A missing or
//! empty parent marks the root.
//!
//! ## Noise Filtering
//!
//! Nodes are structurally cleaned, never summarized:
//! - empty system messages flagged hidden-from-conversation are dropped
//! - tool messages with no text, title or url and an image-like content
//!   type are dropped
//! - anything left with no text, content type, url or title is dropped

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use crate::types::{null_as_default, RawMessage, RawNode, SimplifiedMessage, ROLE_SYSTEM, ROLE_TOOL, ROLE_UNKNOWN};

/// Extra steps allowed beyond the node count.
const WALK_SLACK: usize = 5;

/// Metadata flag marking nodes the export UI hides.
const HIDDEN_FLAG: &str = "is_visually_hidden_from_conversation";

/// Error type for linearization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinearizeError {
    /// No current node and no leaf with a message.
    #[error("no current_node and no leaf node found")]
    NoStartNode,
    /// A referenced node is absent from the mapping.
    #[error("missing node {node:?} in mapping")]
    MissingNode {
        /// Referenced node id.
        node: String,
    },
    /// The parent chain revisits a node.
    #[error("cycle detected at node {node:?}")]
    CycleDetected {
        /// First revisited node id.
        node: String,
    },
}

/// Linearize a node map into chronological messages.
///
/// An empty mapping yields no messages. An empty `current_node` falls back
/// to [`pick_best_leaf`].
pub fn linearize(
    mapping: &BTreeMap<String, RawNode>,
    current_node: &str,
) -> Result<Vec<SimplifiedMessage>, LinearizeError> {
    if mapping.is_empty() {
        return Ok(Vec::new());
    }

    let mut cursor = if current_node.is_empty() {
        pick_best_leaf(mapping).ok_or(LinearizeError::NoStartNode)?
    } else {
        current_node
    };

    let mut visited: HashSet<&str> = HashSet::with_capacity(mapping.len());
    let mut reversed = Vec::new();
    let mut reached_root = false;

    for _ in 0..mapping.len() + WALK_SLACK {
        let node = mapping
            .get(cursor)
            .ok_or_else(|| LinearizeError::MissingNode { node: cursor.to_string() })?;

        if !visited.insert(cursor) {
            return Err(LinearizeError::CycleDetected { node: cursor.to_string() });
        }

        if let Some(message) = node.message.as_ref().and_then(simplify_message) {
            reversed.push(message);
        }

        match node.parent.as_deref() {
            Some(parent) if !parent.is_empty() => cursor = parent,
            _ => {
                reached_root = true;
                break;
            }
        }
    }

    if !reached_root {
        tracing::warn!(
            nodes = mapping.len(),
            collected = reversed.len(),
            "Parent walk hit the step ceiling before reaching a root"
        );
    }

    reversed.reverse();
    Ok(reversed)
}

/// Pick the childless node with a message and the greatest creation time.
pub fn pick_best_leaf(mapping: &BTreeMap<String, RawNode>) -> Option<&str> {
    let mut best: Option<(&str, f64)> = None;

    for (id, node) in mapping {
        let Some(message) = node.message.as_ref() else { continue };
        if !node.children.is_empty() {
            continue;
        }
        let time = message.create_time.unwrap_or(0.0);
        match best {
            Some((_, best_time)) if time <= best_time => {}
            _ => best = Some((id.as_str(), time)),
        }
    }

    best.map(|(id, _)| id)
}

/// Clean one raw message, or `None` when it is structural noise.
pub fn simplify_message(message: &RawMessage) -> Option<SimplifiedMessage> {
    let role = match message.author.role.trim() {
        "" => ROLE_UNKNOWN.to_string(),
        r => r.to_string(),
    };
    let name = message
        .author
        .name
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    let content = ContentFields::extract(message.content.as_ref());

    if role == ROLE_SYSTEM && content.text.trim().is_empty() && is_hidden(message) {
        return None;
    }

    let simplified = SimplifiedMessage {
        role,
        name,
        create_time: message.create_time,
        content_type: content.content_type,
        text: content.text,
        domain: content.domain,
        title: content.title,
        url: content.url,
    };

    if simplified.role == ROLE_TOOL
        && simplified.text.trim().is_empty()
        && simplified.title.is_empty()
        && simplified.url.is_empty()
        && is_image_like(&simplified.content_type)
    {
        return None;
    }

    if simplified.text.trim().is_empty()
        && simplified.content_type.is_empty()
        && simplified.url.is_empty()
        && simplified.title.is_empty()
    {
        return None;
    }

    Some(simplified)
}

fn is_hidden(message: &RawMessage) -> bool {
    message
        .metadata
        .as_ref()
        .and_then(|m| m.get(HIDDEN_FLAG))
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

fn is_image_like(content_type: &str) -> bool {
    content_type.trim().to_lowercase().contains("image")
}

/// Loose view of message content.
///
/// Covers both `{content_type, parts: [..]}` and the tool/browser shape
/// `{content_type, text, url, title, domain}`. Content that fits neither
/// shape yields empty fields.
#[derive(Debug, Default, Deserialize)]
struct ContentFields {
    #[serde(default, deserialize_with = "null_as_default")]
    content_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    parts: Vec<serde_json::Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    text: String,
    #[serde(default, deserialize_with = "null_as_default")]
    domain: String,
    #[serde(default, deserialize_with = "null_as_default")]
    title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    url: String,
}

impl ContentFields {
    fn extract(content: Option<&serde_json::Value>) -> Self {
        let Some(value) = content else { return Self::default() };
        let fields = Self::deserialize(value).unwrap_or_default();

        let parts: Vec<&str> = fields.parts.iter().filter_map(|p| p.as_str()).collect();
        let text = if !parts.is_empty() { parts.join("\n") } else { fields.text };

        Self {
            content_type: fields.content_type.trim().to_string(),
            parts: Vec::new(),
            text,
            domain: fields.domain.trim().to_string(),
            title: fields.title.trim().to_string(),
            url: fields.url.trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(value: serde_json::Value) -> BTreeMap<String, RawNode> {
        serde_json::from_value(value).unwrap()
    }

    fn text_node(parent: Option<&str>, role: &str, text: &str, time: f64) -> serde_json::Value {
        json!({
            "message": {
                "author": {"role": role},
                "create_time": time,
                "content": {"content_type": "text", "parts": [text]}
            },
            "parent": parent,
            "children": []
        })
    }

    #[test]
    fn test_hidden_system_root_is_dropped() {
        let map = mapping(json!({
            "root": {"message": null, "parent": null, "children": ["sys"]},
            "sys": {
                "message": {
                    "author": {"role": "system"},
                    "content": {"content_type": "text", "parts": [""]},
                    "metadata": {"is_visually_hidden_from_conversation": true}
                },
                "parent": "root",
                "children": ["u"]
            },
            "u": text_node(Some("sys"), "user", "hi", 1.0),
            "a": text_node(Some("u"), "assistant", "hello", 2.0),
        }));

        let msgs = linearize(&map, "a").unwrap();

        assert_eq!(msgs.len(), 2);
        assert_eq!((msgs[0].role.as_str(), msgs[0].text.as_str()), ("user", "hi"));
        assert_eq!((msgs[1].role.as_str(), msgs[1].text.as_str()), ("assistant", "hello"));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let map = mapping(json!({ "x": text_node(Some("x"), "user", "loop", 1.0) }));

        assert_eq!(
            linearize(&map, "x"),
            Err(LinearizeError::CycleDetected { node: "x".into() })
        );
    }

    #[test]
    fn test_two_node_cycle() {
        let map = mapping(json!({
            "a": text_node(Some("b"), "user", "a", 1.0),
            "b": text_node(Some("a"), "assistant", "b", 2.0),
        }));

        assert!(matches!(linearize(&map, "a"), Err(LinearizeError::CycleDetected { .. })));
    }

    #[test]
    fn test_missing_parent_node() {
        let map = mapping(json!({ "a": text_node(Some("ghost"), "user", "a", 1.0) }));

        assert_eq!(
            linearize(&map, "a"),
            Err(LinearizeError::MissingNode { node: "ghost".into() })
        );
    }

    #[test]
    fn test_missing_current_node() {
        let map = mapping(json!({ "a": text_node(None, "user", "a", 1.0) }));

        assert_eq!(
            linearize(&map, "nope"),
            Err(LinearizeError::MissingNode { node: "nope".into() })
        );
    }

    #[test]
    fn test_best_leaf_is_latest_childless_message() {
        let map = mapping(json!({
            "root": {"message": null, "parent": null, "children": ["u"]},
            "u": {
                "message": {"author": {"role": "user"}, "create_time": 1.0,
                            "content": {"parts": ["q"]}},
                "parent": "root",
                "children": ["old", "new"]
            },
            "old": text_node(Some("u"), "assistant", "first try", 2.0),
            "new": text_node(Some("u"), "assistant", "second try", 3.0),
        }));

        assert_eq!(pick_best_leaf(&map), Some("new"));

        let msgs = linearize(&map, "").unwrap();
        assert_eq!(msgs.last().unwrap().text, "second try");
    }

    #[test]
    fn test_empty_mapping_yields_nothing() {
        assert!(linearize(&BTreeMap::new(), "anything").unwrap().is_empty());
    }

    #[test]
    fn test_no_leaf_with_message() {
        let map = mapping(json!({ "a": {"message": null, "parent": null, "children": []} }));
        assert_eq!(linearize(&map, ""), Err(LinearizeError::NoStartNode));
    }

    #[test]
    fn test_tool_link_fields_are_captured() {
        let raw: RawMessage = serde_json::from_value(json!({
            "author": {"role": "tool", "name": " browser "},
            "content": {
                "content_type": "tether_quote",
                "text": "",
                "url": " https://example.com ",
                "title": "Example",
                "domain": "example.com"
            }
        }))
        .unwrap();

        let msg = simplify_message(&raw).unwrap();
        assert_eq!(msg.name, "browser");
        assert_eq!(msg.url, "https://example.com");
        assert_eq!(msg.title, "Example");
        assert_eq!(msg.content_type, "tether_quote");
    }

    #[test]
    fn test_image_tool_output_is_dropped() {
        let raw: RawMessage = serde_json::from_value(json!({
            "author": {"role": "tool"},
            "content": {"content_type": "image_asset_pointer", "parts": [{"asset": "x"}]}
        }))
        .unwrap();

        assert!(simplify_message(&raw).is_none());
    }

    #[test]
    fn test_content_without_signal_is_dropped() {
        let raw: RawMessage = serde_json::from_value(json!({
            "author": {"role": "assistant"},
            "content": "not an object"
        }))
        .unwrap();

        assert!(simplify_message(&raw).is_none());
    }

    #[test]
    fn test_empty_role_becomes_unknown() {
        let raw: RawMessage = serde_json::from_value(json!({
            "author": {"role": "  "},
            "content": {"parts": ["a", 7, "b"]}
        }))
        .unwrap();

        let msg = simplify_message(&raw).unwrap();
        assert_eq!(msg.role, "unknown");
        assert_eq!(msg.text, "a\nb");
    }
}

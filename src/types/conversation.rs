//! Conversation shapes: the raw export element and the simplified thread.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::null_as_default;

/// Role of a user-authored message. Turns start at these.
pub const ROLE_USER: &str = "user";
/// Role of system messages.
pub const ROLE_SYSTEM: &str = "system";
/// Role of tool output messages.
pub const ROLE_TOOL: &str = "tool";
/// Role assigned when the export carries none.
pub const ROLE_UNKNOWN: &str = "unknown";

/// One linear thread, as written by the splitter.
///
/// Written once per conversation and never modified downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimplifiedConversation {
    /// Non-empty conversation identifier.
    pub conversation_id: String,
    /// Conversation title (empty when absent).
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub title: String,
    /// Creation time in unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<f64>,
    /// Last update time in unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<f64>,
    /// Messages in chronological order.
    #[serde(default, deserialize_with = "null_as_default")]
    pub messages: Vec<SimplifiedMessage>,
}

impl SimplifiedConversation {
    /// Thread start time: the conversation's creation time, else the first message's.
    pub fn start_time(&self) -> Option<f64> {
        self.create_time
            .or_else(|| self.messages.first().and_then(|m| m.create_time))
    }
}

/// One cleaned message. Empty strings are omitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimplifiedMessage {
    /// Author role, never empty.
    pub role: String,
    /// Author name.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Creation time in unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<f64>,
    /// Content type reported by the export.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    /// Message text.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub text: String,
    /// Source domain of tool-style content.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub domain: String,
    /// Source title of tool-style content.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub title: String,
    /// Source URL of tool-style content.
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub url: String,
}

impl SimplifiedMessage {
    /// Create a message with a role and text.
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: text.into(),
            ..Self::default()
        }
    }

    /// Set the creation time.
    pub fn at(mut self, create_time: f64) -> Self {
        self.create_time = Some(create_time);
        self
    }

    /// Whether this message opens a turn.
    pub fn is_user(&self) -> bool {
        self.role == ROLE_USER
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Raw export shapes
// ─────────────────────────────────────────────────────────────────────────────

/// One conversation element of the export.
///
/// Transient: lives only while its element is being simplified.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConversation {
    /// Preferred identifier.
    #[serde(default, deserialize_with = "null_as_default")]
    pub conversation_id: String,
    /// Fallback identifier.
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    /// Title.
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    /// Creation time.
    #[serde(default)]
    pub create_time: Option<f64>,
    /// Update time.
    #[serde(default)]
    pub update_time: Option<f64>,
    /// Node the user was last looking at.
    #[serde(default, deserialize_with = "null_as_default")]
    pub current_node: String,
    /// Node id to node. Ordered so leaf selection is deterministic.
    #[serde(default, deserialize_with = "null_as_default")]
    pub mapping: BTreeMap<String, RawNode>,
}

/// A node in the message graph.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawNode {
    /// Node id.
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    /// Payload; structural nodes carry none.
    #[serde(default)]
    pub message: Option<RawMessage>,
    /// Parent node id. `None` or empty marks the root.
    #[serde(default)]
    pub parent: Option<String>,
    /// Child node ids.
    #[serde(default, deserialize_with = "null_as_default")]
    pub children: Vec<String>,
}

/// Message payload of a node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMessage {
    /// Author.
    #[serde(default, deserialize_with = "null_as_default")]
    pub author: RawAuthor,
    /// Creation time.
    #[serde(default)]
    pub create_time: Option<f64>,
    /// Content, read loosely: `{parts: [..]}` or `{text, url, title, domain}`.
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Message author.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAuthor {
    /// Author role.
    #[serde(default, deserialize_with = "null_as_default")]
    pub role: String,
    /// Author name.
    #[serde(default)]
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_fields_are_omitted() {
        let conv = SimplifiedConversation {
            conversation_id: "c1".into(),
            title: String::new(),
            create_time: None,
            update_time: None,
            messages: vec![SimplifiedMessage::new("user", "hi")],
        };

        let json = serde_json::to_string(&conv).unwrap();
        assert_eq!(
            json,
            r#"{"conversation_id":"c1","messages":[{"role":"user","text":"hi"}]}"#
        );
    }

    #[test]
    fn test_null_messages_read_as_empty() {
        let conv: SimplifiedConversation =
            serde_json::from_str(r#"{"conversation_id":"c1","messages":null}"#).unwrap();
        assert!(conv.messages.is_empty());
    }

    #[test]
    fn test_raw_conversation_tolerates_nulls() {
        let raw: RawConversation = serde_json::from_str(
            r#"{"id":"x","title":null,"current_node":null,"mapping":{"a":{"id":"a","message":{"author":null,"content":null},"parent":null,"children":null}}}"#,
        )
        .unwrap();

        assert_eq!(raw.id, "x");
        assert!(raw.title.is_empty());
        assert!(raw.current_node.is_empty());
        let node = &raw.mapping["a"];
        assert!(node.children.is_empty());
        assert!(node.message.as_ref().unwrap().author.role.is_empty());
    }

    #[test]
    fn test_start_time_falls_back_to_first_message() {
        let mut conv = SimplifiedConversation {
            conversation_id: "c".into(),
            title: String::new(),
            create_time: None,
            update_time: None,
            messages: vec![SimplifiedMessage::new("user", "a").at(42.0)],
        };
        assert_eq!(conv.start_time(), Some(42.0));

        conv.create_time = Some(7.0);
        assert_eq!(conv.start_time(), Some(7.0));
    }
}

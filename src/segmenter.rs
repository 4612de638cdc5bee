//! Turn segmentation.
//!
//! A turn opens at every user message and runs up to, not including, the
//! next one. Messages before the first user message belong to the first
//! turn; a thread without user messages is a single turn.

use crate::types::{SimplifiedMessage, Turn};

/// Group an ordered message list into user-led turns.
///
/// The returned turns are contiguous and cover every message exactly once.
/// An empty list yields no turns.
pub fn build_turns(messages: &[SimplifiedMessage]) -> Vec<Turn> {
    if messages.is_empty() {
        return Vec::new();
    }

    let mut starts: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_user())
        .map(|(i, _)| i)
        .collect();
    // Leading non-user messages join the first turn.
    match starts.first_mut() {
        Some(first) => *first = 0,
        None => starts.push(0),
    }

    let mut turns = Vec::with_capacity(starts.len());
    for (index, &start) in starts.iter().enumerate() {
        let end = starts.get(index + 1).map_or(messages.len(), |&next| next) - 1;
        turns.push(build_turn(index, start, end, &messages[start..=end]));
    }
    turns
}

fn build_turn(index: usize, start: usize, end: usize, span: &[SimplifiedMessage]) -> Turn {
    let mut user_parts: Vec<&str> = Vec::new();
    let mut other_parts: Vec<String> = Vec::new();

    for message in span {
        if message.is_user() {
            let text = message.text.trim();
            if !text.is_empty() {
                user_parts.push(text);
            }
        } else if let Some(part) = non_user_part(message) {
            other_parts.push(part);
        }
    }

    Turn {
        index,
        start_message_index: start,
        end_message_index: end,
        start_time: span.first().and_then(|m| m.create_time),
        user_text: user_parts.join("\n"),
        assistant_text: other_parts.join("\n"),
    }
}

/// Text of a non-user message, or `title url` for link-only messages.
fn non_user_part(message: &SimplifiedMessage) -> Option<String> {
    let text = message.text.trim();
    if !text.is_empty() {
        return Some(text.to_string());
    }
    if message.url.is_empty() && message.title.is_empty() {
        return None;
    }
    Some(format!("{} {}", message.title, message.url).trim().to_string())
}

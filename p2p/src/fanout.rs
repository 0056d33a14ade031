use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{ChatEnvelope, MAX_TEXT_CHARS};

/// Default number of chat messages retained in history.
pub const HISTORY_CAPACITY: usize = 300;

/// A chat message as presented to the UI. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub from: String,
    pub text: String,
    pub timestamp: i64,
    pub is_self: bool,
}

/// Deduplicated, capacity-bounded chat history.
///
/// The seen-id set grows for the whole session and is never evicted, so a
/// message pushed out of history by capacity still cannot be re-delivered.
#[derive(Debug)]
pub struct ChatLog {
    history: VecDeque<ChatMessage>,
    seen: HashSet<String>,
    capacity: usize,
    max_text_chars: usize,
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

impl ChatLog {
    pub fn new(capacity: usize) -> Self {
        Self::with_limits(capacity, MAX_TEXT_CHARS)
    }

    pub fn with_limits(capacity: usize, max_text_chars: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity.min(1024)),
            seen: HashSet::new(),
            capacity: capacity.max(1),
            max_text_chars: max_text_chars.min(MAX_TEXT_CHARS),
        }
    }

    /// Build and record an outgoing message. Returns `None` when the text is
    /// empty after trimming; nothing is recorded in that case.
    pub fn compose(&mut self, self_id: &str, text: &str, ts: i64) -> Option<ChatMessage> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        let text = truncate_chars(trimmed, self.max_text_chars);
        let message = ChatMessage {
            id: message_id(self_id, ts),
            from: self_id.to_string(),
            text: text.to_string(),
            timestamp: ts,
            is_self: true,
        };
        self.seen.insert(message.id.clone());
        self.push(message.clone());
        Some(message)
    }

    /// Record an incoming chat envelope unless its id was already seen.
    /// Returns the stored message on first sight.
    pub fn receive(&mut self, chat: &ChatEnvelope) -> Option<ChatMessage> {
        let id = chat
            .id
            .clone()
            .unwrap_or_else(|| fallback_id(&chat.from, chat.ts));
        if !self.seen.insert(id.clone()) {
            return None;
        }
        let message = ChatMessage {
            id,
            from: chat.from.clone(),
            text: truncate_chars(&chat.text, self.max_text_chars).to_string(),
            timestamp: chat.ts,
            is_self: false,
        };
        self.push(message.clone());
        Some(message)
    }

    fn push(&mut self, message: ChatMessage) {
        while self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(message);
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// History in arrival order, most recent last.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.history.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.seen.clear();
    }
}

/// `{self}-{ts}-{random}`; the random part keeps ids unique per sender even
/// for messages sent within the same millisecond.
pub fn message_id(self_id: &str, ts: i64) -> String {
    format!("{self_id}-{ts}-{}", Uuid::new_v4().simple())
}

/// Id used for chat envelopes that arrive without one.
pub fn fallback_id(from: &str, ts: i64) -> String {
    format!("{from}-{ts}")
}

/// First `max` characters of `text`, never splitting a character.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

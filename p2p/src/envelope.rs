//! Wire envelopes exchanged over direct mesh links.
//!
//! Frames are JSON text. Decoding happens in two steps: a permissive serde
//! pass into [`WireEnvelope`], then a validating conversion into the typed
//! [`Envelope`]. Protocol code only ever sees the typed form.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The single chat channel currently carried by the mesh.
pub const CHAT_CHANNEL: &str = "global";

/// Upper bound on chat text, counted in characters.
pub const MAX_TEXT_CHARS: usize = 2000;

/// A validated mesh envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    Hello { from: String, ts: i64 },
    Bye { from: String, ts: i64 },
    RosterSnapshot { ids: Vec<String>, from: String, ts: i64 },
    Chat(ChatEnvelope),
}

/// Chat payload carried by [`Envelope::Chat`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatEnvelope {
    pub channel: String,
    pub text: String,
    pub from: String,
    pub ts: i64,
    pub id: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown envelope kind: {0}")]
    UnknownKind(String),
    #[error("unknown presence type: {0}")]
    UnknownPresenceType(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("unsupported chat channel: {0}")]
    UnsupportedChannel(String),
    #[error("chat text exceeds 2000 characters")]
    TextTooLong,
}

/// Raw on-the-wire record. Every field is optional so that unexpected
/// shapes fail validation instead of deserialization panics downstream.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WireEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub presence_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl Envelope {
    pub fn hello(from: &str) -> Self {
        Envelope::Hello {
            from: from.to_string(),
            ts: now_millis(),
        }
    }

    pub fn bye(from: &str) -> Self {
        Envelope::Bye {
            from: from.to_string(),
            ts: now_millis(),
        }
    }

    pub fn roster(from: &str, ids: Vec<String>) -> Self {
        Envelope::RosterSnapshot {
            ids,
            from: from.to_string(),
            ts: now_millis(),
        }
    }

    pub fn chat(from: &str, text: &str, ts: i64, id: &str) -> Self {
        Envelope::Chat(ChatEnvelope {
            channel: CHAT_CHANNEL.to_string(),
            text: text.to_string(),
            from: from.to_string(),
            ts,
            id: Some(id.to_string()),
        })
    }

    /// Peer id that authored this envelope.
    pub fn from_peer(&self) -> &str {
        match self {
            Envelope::Hello { from, .. }
            | Envelope::Bye { from, .. }
            | Envelope::RosterSnapshot { from, .. } => from,
            Envelope::Chat(chat) => &chat.from,
        }
    }

    /// Encode into a JSON text frame.
    pub fn encode(&self) -> String {
        let wire = WireEnvelope::from(self);
        // A struct of strings, integers and string vectors always serializes.
        serde_json::to_string(&wire).unwrap_or_default()
    }

    /// Decode and validate a JSON text frame.
    pub fn decode(frame: &str) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope =
            serde_json::from_str(frame).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        Envelope::try_from(wire)
    }
}

impl From<&Envelope> for WireEnvelope {
    fn from(envelope: &Envelope) -> Self {
        fn presence(kind: &str, from: &str, ts: i64) -> WireEnvelope {
            WireEnvelope {
                kind: Some("presence".into()),
                presence_type: Some(kind.into()),
                from: Some(from.into()),
                ts: Some(ts),
                ..Default::default()
            }
        }

        match envelope {
            Envelope::Hello { from, ts } => presence("hello", from, *ts),
            Envelope::Bye { from, ts } => presence("bye", from, *ts),
            Envelope::RosterSnapshot { ids, from, ts } => WireEnvelope {
                ids: Some(ids.clone()),
                ..presence("roster", from, *ts)
            },
            Envelope::Chat(chat) => WireEnvelope {
                kind: Some("chat".into()),
                from: Some(chat.from.clone()),
                ts: Some(chat.ts),
                channel: Some(chat.channel.clone()),
                text: Some(chat.text.clone()),
                id: chat.id.clone(),
                ..Default::default()
            },
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let from = wire
            .from
            .filter(|f| !f.is_empty())
            .ok_or(EnvelopeError::MissingField("from"))?;
        let ts = wire.ts.ok_or(EnvelopeError::MissingField("ts"))?;

        match wire.kind.as_deref() {
            Some("presence") => match wire.presence_type.as_deref() {
                Some("hello") => Ok(Envelope::Hello { from, ts }),
                Some("bye") => Ok(Envelope::Bye { from, ts }),
                Some("roster") => {
                    let ids = wire.ids.ok_or(EnvelopeError::MissingField("ids"))?;
                    let ids = ids.into_iter().filter(|id| !id.is_empty()).collect();
                    Ok(Envelope::RosterSnapshot { ids, from, ts })
                }
                Some(other) => Err(EnvelopeError::UnknownPresenceType(other.to_string())),
                None => Err(EnvelopeError::MissingField("type")),
            },
            Some("chat") => {
                let channel = wire.channel.unwrap_or_else(|| CHAT_CHANNEL.to_string());
                if channel != CHAT_CHANNEL {
                    return Err(EnvelopeError::UnsupportedChannel(channel));
                }
                let text = wire.text.ok_or(EnvelopeError::MissingField("text"))?;
                if text.chars().count() > MAX_TEXT_CHARS {
                    return Err(EnvelopeError::TextTooLong);
                }
                Ok(Envelope::Chat(ChatEnvelope {
                    channel,
                    text,
                    from,
                    ts,
                    id: wire.id.filter(|id| !id.is_empty()),
                }))
            }
            Some(other) => Err(EnvelopeError::UnknownKind(other.to_string())),
            None => Err(EnvelopeError::MissingField("kind")),
        }
    }
}

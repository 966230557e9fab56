//! Tagged-enum event model.
//!
//! The wire format is a loose key-value map keyed by a `type` string; rather
//! than carry that dynamism into Rust, known types become enum variants and
//! anything else falls into [`Event::Unknown`] so forward-compatible event
//! types still round-trip without the pump having to understand them.

use serde::{Deserialize, Serialize};

/// Fields shared by every event, regardless of type.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventEnvelope {
    #[serde(default)]
    pub from: Option<String>,
    /// `None` means broadcast (wire value `"*"`).
    #[serde(default)]
    pub to: Option<String>,
    pub date: f64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(flatten)]
    envelope: EventEnvelope,
}

#[derive(Debug, Clone)]
pub enum Event {
    ChatText(EventEnvelope),
    PasswordRequest(EventEnvelope),
    PasswordReply(EventEnvelope),
    Unknown {
        event_type: String,
        envelope: EventEnvelope,
    },
}

impl Event {
    pub const TYPE_CHAT_TEXT: &'static str = "chat-text";
    pub const TYPE_PASSWORD_REQUEST: &'static str = "password-request";
    pub const TYPE_PASSWORD_REPLY: &'static str = "password-reply";

    pub fn chat_text(envelope: EventEnvelope) -> Self {
        Event::ChatText(envelope)
    }

    pub fn event_type(&self) -> &str {
        match self {
            Event::ChatText(_) => Self::TYPE_CHAT_TEXT,
            Event::PasswordRequest(_) => Self::TYPE_PASSWORD_REQUEST,
            Event::PasswordReply(_) => Self::TYPE_PASSWORD_REPLY,
            Event::Unknown { event_type, .. } => event_type,
        }
    }

    pub fn envelope(&self) -> &EventEnvelope {
        match self {
            Event::ChatText(e) | Event::PasswordRequest(e) | Event::PasswordReply(e) => e,
            Event::Unknown { envelope, .. } => envelope,
        }
    }

    pub fn envelope_mut(&mut self) -> &mut EventEnvelope {
        match self {
            Event::ChatText(e) | Event::PasswordRequest(e) | Event::PasswordReply(e) => e,
            Event::Unknown { envelope, .. } => envelope,
        }
    }

    /// True if this type is intercepted by the receive pump's auto-event
    /// handling (password-exchange) before being handed to the caller.
    pub fn is_protocol_reserved(&self) -> bool {
        matches!(self, Event::PasswordRequest(_) | Event::PasswordReply(_))
    }

    fn from_raw(raw: RawEvent) -> Self {
        match raw.event_type.as_str() {
            Self::TYPE_CHAT_TEXT => Event::ChatText(raw.envelope),
            Self::TYPE_PASSWORD_REQUEST => Event::PasswordRequest(raw.envelope),
            Self::TYPE_PASSWORD_REPLY => Event::PasswordReply(raw.envelope),
            _ => Event::Unknown {
                event_type: raw.event_type,
                envelope: raw.envelope,
            },
        }
    }

    fn to_raw(&self) -> RawEvent {
        RawEvent {
            event_type: self.event_type().to_string(),
            envelope: self.envelope().clone(),
        }
    }
}

impl Serialize for Event {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_raw().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        RawEvent::deserialize(deserializer).map(Event::from_raw)
    }
}

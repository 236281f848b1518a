use chatflow_core::{ChatId, ConversationStatus, Result, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

/// Structured data a command keeps across the steps of a conversation
pub type Notes = Map<String, Value>;

/// Text stored for a freshly inserted conversation
pub const EMPTY_NOTES: &str = "{}";

/// A persisted conversation row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub command: String,
    pub status: ConversationStatus,
    /// JSON text of the notes mapping
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn new(user_id: UserId, chat_id: ChatId, command: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            chat_id,
            command: command.into(),
            status: ConversationStatus::Active,
            notes: EMPTY_NOTES.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ConversationStatus::Active
    }

    /// Apply `fields` to this row and bump `updated_at`
    pub fn apply(&mut self, fields: &ConversationFields) {
        if let Some(status) = fields.status {
            self.status = status;
        }
        if let Some(notes) = &fields.notes {
            self.notes = notes.clone();
        }
        self.updated_at = Utc::now();
    }
}

/// Column values written by an update. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationFields {
    pub status: Option<ConversationStatus>,
    pub notes: Option<String>,
}

impl ConversationFields {
    pub fn status(status: ConversationStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn notes(notes: impl Into<String>) -> Self {
        Self {
            notes: Some(notes.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.notes.is_none()
    }
}

/// Equality predicates of an update. A row matches when every set predicate holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationFilter {
    pub id: Option<Uuid>,
    pub user_id: Option<UserId>,
    pub chat_id: Option<ChatId>,
    pub status: Option<ConversationStatus>,
}

impl ConversationFilter {
    pub fn by_id(id: Uuid) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn user_id(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn chat_id(mut self, chat_id: ChatId) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    pub fn status(mut self, status: ConversationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, record: &ConversationRecord) -> bool {
        self.id.map_or(true, |id| record.id == id)
            && self.user_id.map_or(true, |user_id| record.user_id == user_id)
            && self.chat_id.map_or(true, |chat_id| record.chat_id == chat_id)
            && self.status.map_or(true, |status| record.status == status)
    }
}

/// Decode persisted notes.
///
/// Malformed text, or JSON that is not an object, yields empty notes. The
/// failure is logged but never surfaced to the caller.
pub fn decode_notes(raw: &str) -> Notes {
    if raw.trim().is_empty() {
        return Notes::new();
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        // Legacy rows store an empty list for "no notes"
        Ok(Value::Array(items)) if items.is_empty() => Notes::new(),
        Ok(other) => {
            warn!("Conversation notes are not a JSON object ({}), using empty notes", json_kind(&other));
            Notes::new()
        }
        Err(e) => {
            warn!("Failed to decode conversation notes, using empty notes: {}", e);
            Notes::new()
        }
    }
}

pub fn encode_notes(notes: &Notes) -> Result<String> {
    Ok(serde_json::to_string(notes)?)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

/// A configured Q&A occasion, identified by its human-entered code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub session_active: bool,
    #[serde(default)]
    pub current_session_id: Option<String>,
    #[serde(default)]
    pub active_speaker_entry_id: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl Event {
    pub fn is_public(&self) -> bool {
        self.visibility == Visibility::Public
    }

    /// Merge a partial update field by field; absent fields are left alone.
    pub fn apply(&mut self, patch: &EventPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(visibility) = patch.visibility {
            self.visibility = visibility;
        }
        if let Some(active) = patch.session_active {
            self.session_active = active;
        }
        if let Some(session) = &patch.current_session_id {
            self.current_session_id = session.clone();
        }
        if let Some(speaker) = &patch.active_speaker_entry_id {
            self.active_speaker_entry_id = speaker.clone();
        }
    }
}

/// Partial event update. For the nullable fields the outer `Option` says
/// whether the field is touched, the inner one is the new value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_active: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub current_session_id: Option<Option<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub active_speaker_entry_id: Option<Option<String>>,
}

impl EventPatch {
    pub fn is_empty(&self) -> bool {
        self == &EventPatch::default()
    }
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub code: String,
    pub name: String,
    pub visibility: Visibility,
    pub created_by: Option<String>,
}

/// One open/close cycle within an event. Immutable once `closed_at` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub event_id: String,
    pub event_code: String,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_sealed(&self) -> bool {
        self.closed_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Waiting,
    Answered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub session_id: String,
    pub event_code: String,
    pub display_name: String,
    #[serde(default)]
    pub business_name: Option<String>,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn is_waiting(&self) -> bool {
        self.status == EntryStatus::Waiting
    }
}

/// A sealed session together with every entry raised in it, answered or not.
/// Read-only; used for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSession {
    pub session: Session,
    #[serde(default)]
    pub participants: Vec<QueueEntry>,
}

/// Point-in-time view of one event as the remote store currently sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub event: Event,
    #[serde(default)]
    pub waiting: Vec<QueueEntry>,
    #[serde(default)]
    pub answered: Vec<QueueEntry>,
    #[serde(default)]
    pub sealed_sessions: Vec<SealedSession>,
}

impl Snapshot {
    pub fn session_active(&self) -> bool {
        self.event.session_active
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.event.current_session_id.as_deref()
    }

    pub fn active_speaker_id(&self) -> Option<&str> {
        self.event.active_speaker_entry_id.as_deref()
    }
}

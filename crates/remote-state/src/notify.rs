//! Push-notification topics and payloads shared by backends and subscribers.

use serde::{Deserialize, Serialize};

use crate::model::EventPatch;

const EVENT_TOPIC_PREFIX: &str = "events.";
const QUEUE_TOPIC: &str = "queue";

/// What a subscriber can listen to. Queue changes are a single firehose across
/// every event and session; subscribers filter on the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Event(String),
    QueueEntries,
}

impl Topic {
    pub fn key(&self) -> String {
        match self {
            Topic::Event(id) => format!("{EVENT_TOPIC_PREFIX}{id}"),
            Topic::QueueEntries => QUEUE_TOPIC.to_string(),
        }
    }

    pub fn parse(key: &str) -> Option<Topic> {
        if key == QUEUE_TOPIC {
            return Some(Topic::QueueEntries);
        }
        key.strip_prefix(EVENT_TOPIC_PREFIX)
            .filter(|id| !id.is_empty())
            .map(|id| Topic::Event(id.to_string()))
    }
}

/// Payload of an event-document change: the document id plus the fields that
/// changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventChange {
    pub id: String,
    #[serde(flatten)]
    pub patch: EventPatch,
}

//! Push-notification routing.
//!
//! The backend's queue topic is a firehose over every event and session, so
//! each message is checked against the live [`JoinedContext`] at delivery
//! time. Only one subscription exists at a time and it is replaced only when
//! the joined event id changes.

use std::sync::{Arc, Weak};

use change_feed::{ChangeKind, FeedMessage, FeedSubscription};
use parking_lot::Mutex;
use remote_state::{EventChange, EventPatch, QueueEntry, Topic};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::JoinedContext;
use crate::engine::{EngineInner, SyncEngine};
use crate::queue_store::QueueDelta;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutedChange {
    Queue(QueueDelta),
    Event(EventPatch),
}

impl RoutedChange {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RoutedChange::Queue(_) => "queue",
            RoutedChange::Event(_) => "event",
        }
    }
}

/// Decides whether a raw feed message concerns the joined event and, if so,
/// what it changes. Entries are never deleted, so delete notifications are
/// dropped.
pub fn route(message: &FeedMessage, context: &JoinedContext) -> Option<RoutedChange> {
    if message.kind == ChangeKind::Delete {
        return None;
    }
    match Topic::parse(&message.topic)? {
        Topic::QueueEntries => {
            let entry: QueueEntry = match serde_json::from_slice(&message.payload) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(topic = %message.topic, error = %err, "undecodable queue change");
                    return None;
                }
            };
            if !context.owns_entry(&entry.event_code, &entry.session_id) {
                return None;
            }
            Some(RoutedChange::Queue(match message.kind {
                ChangeKind::Create => QueueDelta::Created(entry),
                _ => QueueDelta::Updated(entry),
            }))
        }
        Topic::Event(id) => {
            if context.event_id.as_deref() != Some(id.as_str()) {
                return None;
            }
            match serde_json::from_slice::<EventChange>(&message.payload) {
                Ok(change) if change.id == id => Some(RoutedChange::Event(change.patch)),
                Ok(change) => {
                    debug!(topic = %message.topic, id = %change.id, "event change for another document");
                    None
                }
                Err(err) => {
                    warn!(topic = %message.topic, error = %err, "undecodable event change");
                    None
                }
            }
        }
    }
}

struct ActiveRoute {
    event_id: String,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct SubscriptionRouter {
    active: Mutex<Option<ActiveRoute>>,
}

impl SubscriptionRouter {
    pub fn subscribed_event(&self) -> Option<String> {
        self.active
            .lock()
            .as_ref()
            .map(|route| route.event_id.clone())
    }

    /// Subscribes for `event_id` unless already subscribed to it. Returns
    /// `true` when a new subscription was opened. Backends without push leave
    /// the router idle.
    pub(crate) fn attach(&self, engine: &Arc<EngineInner>, event_id: &str) -> bool {
        let mut active = self.active.lock();
        if active
            .as_ref()
            .is_some_and(|route| route.event_id == event_id)
        {
            return false;
        }
        if let Some(previous) = active.take() {
            debug!(event_id = %previous.event_id, "dropping push subscription");
            previous.task.abort();
        }
        let topics = [Topic::Event(event_id.to_string()), Topic::QueueEntries];
        let Some(subscription) = engine.remote.subscribe(&topics) else {
            debug!(event_id, "backend has no push channel; polling only");
            return false;
        };
        debug!(event_id, topics = ?subscription.topics(), "push subscription open");
        let task = tokio::spawn(forward(subscription, Arc::downgrade(engine)));
        *active = Some(ActiveRoute {
            event_id: event_id.to_string(),
            task,
        });
        true
    }

    pub(crate) fn detach(&self) {
        if let Some(previous) = self.active.lock().take() {
            debug!(event_id = %previous.event_id, "dropping push subscription");
            previous.task.abort();
        }
    }
}

impl Drop for SubscriptionRouter {
    fn drop(&mut self) {
        if let Some(previous) = self.active.get_mut().take() {
            previous.task.abort();
        }
    }
}

async fn forward(mut subscription: FeedSubscription, engine: Weak<EngineInner>) {
    while let Some(message) = subscription.recv().await {
        let Some(inner) = engine.upgrade() else {
            break;
        };
        SyncEngine { inner }.handle_feed_message(message).await;
    }
    debug!("push subscription ended");
}

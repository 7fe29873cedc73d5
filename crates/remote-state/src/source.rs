use async_trait::async_trait;
use change_feed::FeedSubscription;

use crate::error::{TransportError, WriteError};
use crate::model::{EntryStatus, Event, EventPatch, NewEvent, Snapshot};
use crate::notify::Topic;

#[async_trait]
pub trait RemoteStateSource: Send + Sync {
    /// Everything the engine needs to reconcile one event: the event record,
    /// the current session's waiting and answered entries, and sealed history.
    async fn fetch_snapshot(&self, event_code: &str) -> Result<Snapshot, TransportError>;

    async fn find_event(&self, code: &str) -> Result<Option<Event>, TransportError>;

    async fn list_events(&self) -> Result<Vec<Event>, TransportError>;

    async fn create_event(&self, draft: NewEvent) -> Result<Event, WriteError>;

    /// Returns the confirmed entry id.
    async fn create_queue_entry(
        &self,
        session_id: &str,
        event_code: &str,
        name: &str,
        business_name: Option<&str>,
    ) -> Result<String, WriteError>;

    async fn update_entry_status(&self, entry_id: &str, status: EntryStatus)
        -> Result<(), WriteError>;

    /// Creates a new, open session row and returns its id. Does not touch the
    /// event record; callers follow up with [`RemoteStateSource::update_event`].
    async fn open_session(&self, event_id: &str) -> Result<String, WriteError>;

    async fn close_session(&self, session_id: &str) -> Result<(), WriteError>;

    async fn set_active_speaker(
        &self,
        event_id: &str,
        entry_id: Option<&str>,
    ) -> Result<(), WriteError>;

    async fn update_event(&self, event_id: &str, patch: EventPatch) -> Result<(), WriteError>;

    /// Push notifications for the given topics. Backends without push return
    /// `None` and the engine runs on polling alone.
    fn subscribe(&self, _topics: &[Topic]) -> Option<FeedSubscription> {
        None
    }
}

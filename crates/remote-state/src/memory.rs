use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use change_feed::{ChangeFeed, ChangeKind, FeedSubscription, LocalFeed};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{TransportError, WriteError};
use crate::model::{
    EntryStatus, Event, EventPatch, NewEvent, QueueEntry, SealedSession, Session, Snapshot,
    Visibility,
};
use crate::notify::{EventChange, Topic};
use crate::source::RemoteStateSource;

const HISTORY_LIMIT: usize = 20;

#[derive(Default)]
struct Tables {
    events: Vec<Event>,
    sessions: Vec<Session>,
    entries: Vec<QueueEntry>,
    last_stamp: Option<DateTime<Utc>>,
}

impl Tables {
    /// Strictly increasing creation stamps so insertion order is total.
    fn stamp(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_stamp {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.last_stamp = Some(now);
        now
    }

    fn session_entries(&self, session_id: &str) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self
            .entries
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        entries
    }
}

#[derive(Default)]
struct Faults {
    failing_writes: AtomicUsize,
    failing_fetches: AtomicUsize,
    closed_readings: AtomicUsize,
    push_disabled: AtomicBool,
    failing_ops: parking_lot::Mutex<Vec<String>>,
}

fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Document-store style backend kept in memory. Writes publish change
/// notifications on the attached feed, the way a realtime document database
/// would. Fault injection hooks let tests drive every failure path.
#[derive(Default)]
pub struct InMemoryRemote {
    tables: Mutex<Tables>,
    feed: Option<Arc<LocalFeed>>,
    faults: Faults,
}

impl InMemoryRemote {
    /// Polling-only store: `subscribe` returns `None`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_feed(feed: Arc<LocalFeed>) -> Arc<Self> {
        Arc::new(Self {
            feed: Some(feed),
            ..Self::default()
        })
    }

    pub fn feed(&self) -> Option<&Arc<LocalFeed>> {
        self.feed.as_ref()
    }

    pub async fn seed_event(&self, code: &str, name: &str, visibility: Visibility) -> Event {
        let event = Event {
            id: format!("evt-{}", Uuid::new_v4().simple()),
            code: code.to_string(),
            name: name.to_string(),
            visibility,
            session_active: false,
            current_session_id: None,
            active_speaker_entry_id: None,
            created_by: None,
        };
        self.tables.lock().await.events.push(event.clone());
        event
    }

    /// The next `count` writes fail with [`WriteError::Unavailable`].
    pub fn fail_next_writes(&self, count: usize) {
        self.faults.failing_writes.store(count, Ordering::SeqCst);
    }

    /// The next write named `op` (for example `"set_active_speaker"`) fails
    /// with [`WriteError::Unavailable`]; other writes go through.
    pub fn fail_next_write_to(&self, op: &str) {
        self.faults.failing_ops.lock().push(op.to_string());
    }

    /// The next `count` snapshot fetches fail with [`TransportError::Unavailable`].
    pub fn fail_next_fetches(&self, count: usize) {
        self.faults.failing_fetches.store(count, Ordering::SeqCst);
    }

    /// The next `count` snapshots report the session as closed regardless of
    /// the stored flag, like a lagging replica would.
    pub fn report_closed_for_next(&self, count: usize) {
        self.faults.closed_readings.store(count, Ordering::SeqCst);
    }

    pub fn set_push_enabled(&self, enabled: bool) {
        self.faults.push_disabled.store(!enabled, Ordering::SeqCst);
    }

    pub async fn event(&self, code: &str) -> Option<Event> {
        self.tables
            .lock()
            .await
            .events
            .iter()
            .find(|e| e.code == code)
            .cloned()
    }

    pub async fn entries(&self) -> Vec<QueueEntry> {
        self.tables.lock().await.entries.clone()
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.tables.lock().await.sessions.clone()
    }

    fn push_enabled(&self) -> bool {
        !self.faults.push_disabled.load(Ordering::SeqCst)
    }

    fn check_write(&self, op: &str) -> Result<(), WriteError> {
        if take(&self.faults.failing_writes) {
            debug!(op, "injected write failure");
            return Err(WriteError::Unavailable(format!("injected failure in {op}")));
        }
        let mut ops = self.faults.failing_ops.lock();
        if let Some(pos) = ops.iter().position(|failing| failing == op) {
            ops.remove(pos);
            debug!(op, "injected write failure");
            return Err(WriteError::Unavailable(format!("injected failure in {op}")));
        }
        Ok(())
    }

    fn notify<T: Serialize>(&self, topic: Topic, kind: ChangeKind, payload: &T) {
        let Some(feed) = &self.feed else {
            return;
        };
        if !self.push_enabled() {
            return;
        }
        let key = topic.key();
        match serde_json::to_vec(payload) {
            Ok(bytes) => {
                if let Err(err) = feed.publish(&key, kind, Bytes::from(bytes)) {
                    warn!(topic = %key, error = %err, "failed to publish change");
                }
            }
            Err(err) => warn!(topic = %key, error = %err, "failed to encode change"),
        }
    }

    fn notify_event(&self, event_id: &str, patch: EventPatch) {
        let change = EventChange {
            id: event_id.to_string(),
            patch,
        };
        self.notify(Topic::Event(event_id.to_string()), ChangeKind::Update, &change);
    }
}

#[async_trait]
impl RemoteStateSource for InMemoryRemote {
    async fn fetch_snapshot(&self, event_code: &str) -> Result<Snapshot, TransportError> {
        if take(&self.faults.failing_fetches) {
            return Err(TransportError::Unavailable("injected fetch failure".into()));
        }
        let tables = self.tables.lock().await;
        let mut event = tables
            .events
            .iter()
            .find(|e| e.code == event_code)
            .cloned()
            .ok_or_else(|| TransportError::Unavailable(format!("unknown event {event_code}")))?;
        if take(&self.faults.closed_readings) {
            event.session_active = false;
        }

        let (waiting, answered): (Vec<QueueEntry>, Vec<QueueEntry>) =
            match &event.current_session_id {
                Some(session_id) => tables
                    .session_entries(session_id)
                    .into_iter()
                    .filter(|e| e.event_code == event_code)
                    .partition(|e| e.is_waiting()),
                None => (Vec::new(), Vec::new()),
            };

        let mut sealed: Vec<&Session> = tables
            .sessions
            .iter()
            .filter(|s| s.event_code == event_code && s.is_sealed())
            .collect();
        sealed.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
        let sealed_sessions = sealed
            .into_iter()
            .take(HISTORY_LIMIT)
            .map(|session| SealedSession {
                participants: tables.session_entries(&session.id),
                session: session.clone(),
            })
            .collect();

        Ok(Snapshot {
            event,
            waiting,
            answered,
            sealed_sessions,
        })
    }

    async fn find_event(&self, code: &str) -> Result<Option<Event>, TransportError> {
        Ok(self.event(code).await)
    }

    async fn list_events(&self) -> Result<Vec<Event>, TransportError> {
        let mut events = self.tables.lock().await.events.clone();
        events.reverse();
        Ok(events)
    }

    async fn create_event(&self, draft: NewEvent) -> Result<Event, WriteError> {
        self.check_write("create_event")?;
        let mut tables = self.tables.lock().await;
        if tables.events.iter().any(|e| e.code == draft.code) {
            return Err(WriteError::Rejected(format!(
                "event code {} already in use",
                draft.code
            )));
        }
        let event = Event {
            id: format!("evt-{}", Uuid::new_v4().simple()),
            code: draft.code,
            name: draft.name,
            visibility: draft.visibility,
            session_active: false,
            current_session_id: None,
            active_speaker_entry_id: None,
            created_by: draft.created_by,
        };
        tables.events.push(event.clone());
        Ok(event)
    }

    async fn create_queue_entry(
        &self,
        session_id: &str,
        event_code: &str,
        name: &str,
        business_name: Option<&str>,
    ) -> Result<String, WriteError> {
        self.check_write("create_queue_entry")?;
        let entry = {
            let mut tables = self.tables.lock().await;
            if !tables.sessions.iter().any(|s| s.id == session_id) {
                return Err(WriteError::NotFound(format!("session {session_id}")));
            }
            let entry = QueueEntry {
                id: format!("q-{}", Uuid::new_v4().simple()),
                session_id: session_id.to_string(),
                event_code: event_code.to_string(),
                display_name: name.to_string(),
                business_name: business_name.map(str::to_string),
                status: EntryStatus::Waiting,
                created_at: tables.stamp(),
            };
            tables.entries.push(entry.clone());
            entry
        };
        self.notify(Topic::QueueEntries, ChangeKind::Create, &entry);
        Ok(entry.id)
    }

    async fn update_entry_status(
        &self,
        entry_id: &str,
        status: EntryStatus,
    ) -> Result<(), WriteError> {
        self.check_write("update_entry_status")?;
        let entry = {
            let mut tables = self.tables.lock().await;
            let entry = tables
                .entries
                .iter_mut()
                .find(|e| e.id == entry_id)
                .ok_or_else(|| WriteError::NotFound(format!("entry {entry_id}")))?;
            if entry.status == EntryStatus::Answered && status != EntryStatus::Answered {
                return Err(WriteError::Rejected(format!(
                    "entry {entry_id} is already answered"
                )));
            }
            entry.status = status;
            entry.clone()
        };
        self.notify(Topic::QueueEntries, ChangeKind::Update, &entry);
        Ok(())
    }

    async fn open_session(&self, event_id: &str) -> Result<String, WriteError> {
        self.check_write("open_session")?;
        let mut tables = self.tables.lock().await;
        let event_code = tables
            .events
            .iter()
            .find(|e| e.id == event_id)
            .map(|e| e.code.clone())
            .ok_or_else(|| WriteError::NotFound(format!("event {event_id}")))?;
        let session = Session {
            id: format!("s-{}", Uuid::new_v4().simple()),
            event_id: event_id.to_string(),
            event_code,
            opened_at: tables.stamp(),
            closed_at: None,
        };
        let id = session.id.clone();
        tables.sessions.push(session);
        Ok(id)
    }

    async fn close_session(&self, session_id: &str) -> Result<(), WriteError> {
        self.check_write("close_session")?;
        let mut tables = self.tables.lock().await;
        let stamp = tables.stamp();
        let session = tables
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| WriteError::NotFound(format!("session {session_id}")))?;
        if session.closed_at.is_none() {
            session.closed_at = Some(stamp);
        }
        Ok(())
    }

    async fn set_active_speaker(
        &self,
        event_id: &str,
        entry_id: Option<&str>,
    ) -> Result<(), WriteError> {
        self.check_write("set_active_speaker")?;
        self.update_event(
            event_id,
            EventPatch {
                active_speaker_entry_id: Some(entry_id.map(str::to_string)),
                ..EventPatch::default()
            },
        )
        .await
    }

    async fn update_event(&self, event_id: &str, patch: EventPatch) -> Result<(), WriteError> {
        self.check_write("update_event")?;
        {
            let mut tables = self.tables.lock().await;
            let event = tables
                .events
                .iter_mut()
                .find(|e| e.id == event_id)
                .ok_or_else(|| WriteError::NotFound(format!("event {event_id}")))?;
            event.apply(&patch);
        }
        self.notify_event(event_id, patch);
        Ok(())
    }

    fn subscribe(&self, topics: &[Topic]) -> Option<FeedSubscription> {
        let feed = self.feed.as_ref()?;
        if !self.push_enabled() {
            return None;
        }
        let keys: Vec<String> = topics.iter().map(Topic::key).collect();
        Some(feed.subscribe(&keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    async fn open_event(remote: &InMemoryRemote) -> (Event, String) {
        let event = remote
            .seed_event("SEMINAR24", "Seminar", Visibility::Public)
            .await;
        let session_id = remote.open_session(&event.id).await.expect("open");
        remote
            .update_event(
                &event.id,
                EventPatch {
                    session_active: Some(true),
                    current_session_id: Some(Some(session_id.clone())),
                    ..EventPatch::default()
                },
            )
            .await
            .expect("update");
        (event, session_id)
    }

    #[tokio::test]
    async fn snapshot_partitions_current_session() {
        let remote = InMemoryRemote::new();
        let (event, session_id) = open_event(&remote).await;
        let first = remote
            .create_queue_entry(&session_id, &event.code, "Alice", Some("ACME"))
            .await
            .unwrap();
        let second = remote
            .create_queue_entry(&session_id, &event.code, "Bob", None)
            .await
            .unwrap();
        remote
            .update_entry_status(&first, EntryStatus::Answered)
            .await
            .unwrap();

        let snapshot = remote.fetch_snapshot(&event.code).await.unwrap();
        assert!(snapshot.session_active());
        assert_eq!(snapshot.current_session_id(), Some(session_id.as_str()));
        assert_eq!(
            snapshot.waiting.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec![second.as_str()]
        );
        assert_eq!(snapshot.answered.len(), 1);
        assert_eq!(snapshot.answered[0].id, first);
        assert!(snapshot.sealed_sessions.is_empty());
    }

    #[tokio::test]
    async fn sealed_sessions_carry_all_participants() {
        let remote = InMemoryRemote::new();
        let (event, session_id) = open_event(&remote).await;
        remote
            .create_queue_entry(&session_id, &event.code, "Alice", Some("ACME"))
            .await
            .unwrap();
        remote.close_session(&session_id).await.unwrap();

        let snapshot = remote.fetch_snapshot(&event.code).await.unwrap();
        assert_eq!(snapshot.sealed_sessions.len(), 1);
        assert_eq!(snapshot.sealed_sessions[0].participants.len(), 1);
        assert!(snapshot.sealed_sessions[0].session.is_sealed());
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let remote = InMemoryRemote::new();
        let (event, session_id) = open_event(&remote).await;

        remote.fail_next_writes(1);
        let err = remote
            .create_queue_entry(&session_id, &event.code, "Alice", None)
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Unavailable(_)));
        assert!(remote
            .create_queue_entry(&session_id, &event.code, "Alice", None)
            .await
            .is_ok());

        remote.fail_next_fetches(1);
        assert!(remote.fetch_snapshot(&event.code).await.is_err());
        assert!(remote.fetch_snapshot(&event.code).await.is_ok());

        remote.report_closed_for_next(1);
        assert!(!remote.fetch_snapshot(&event.code).await.unwrap().session_active());
        assert!(remote.fetch_snapshot(&event.code).await.unwrap().session_active());
    }

    #[tokio::test]
    async fn answered_entries_never_return_to_waiting() {
        let remote = InMemoryRemote::new();
        let (event, session_id) = open_event(&remote).await;
        let id = remote
            .create_queue_entry(&session_id, &event.code, "Alice", None)
            .await
            .unwrap();
        remote
            .update_entry_status(&id, EntryStatus::Answered)
            .await
            .unwrap();

        let err = remote
            .update_entry_status(&id, EntryStatus::Waiting)
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Rejected(_)));
        assert!(remote
            .update_entry_status(&id, EntryStatus::Answered)
            .await
            .is_ok());
        assert_eq!(remote.entries().await[0].status, EntryStatus::Answered);
    }

    #[tokio::test]
    async fn targeted_write_failure_spares_other_writes() {
        let remote = InMemoryRemote::new();
        let (event, session_id) = open_event(&remote).await;
        remote.fail_next_write_to("set_active_speaker");

        let id = remote
            .create_queue_entry(&session_id, &event.code, "Alice", None)
            .await
            .unwrap();
        assert!(remote.set_active_speaker(&event.id, Some(&id)).await.is_err());
        assert!(remote.set_active_speaker(&event.id, Some(&id)).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_duplicate_event_codes() {
        let remote = InMemoryRemote::new();
        remote
            .seed_event("SEMINAR24", "Seminar", Visibility::Public)
            .await;
        let err = remote
            .create_event(NewEvent {
                code: "SEMINAR24".into(),
                name: "Again".into(),
                visibility: Visibility::Private,
                created_by: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Rejected(_)));
    }

    #[tokio::test]
    async fn publishes_queue_creates_on_feed() {
        let feed = Arc::new(LocalFeed::new());
        let remote = InMemoryRemote::with_feed(feed);
        let (event, session_id) = open_event(&remote).await;
        let mut sub = remote
            .subscribe(&[Topic::QueueEntries])
            .expect("push supported");

        let id = remote
            .create_queue_entry(&session_id, &event.code, "Alice", None)
            .await
            .unwrap();

        let msg = tokio::time::timeout(StdDuration::from_secs(1), sub.recv())
            .await
            .expect("recv timeout")
            .expect("message");
        assert_eq!(msg.kind, ChangeKind::Create);
        let entry: QueueEntry = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(entry.id, id);
    }

    #[tokio::test]
    async fn push_can_be_disabled() {
        let remote = InMemoryRemote::with_feed(Arc::new(LocalFeed::new()));
        remote.set_push_enabled(false);
        assert!(remote.subscribe(&[Topic::QueueEntries]).is_none());
        assert!(InMemoryRemote::new()
            .subscribe(&[Topic::QueueEntries])
            .is_none());
    }
}

//! The synchronization engine.
//!
//! One [`SyncEngine`] owns the reconciled local view of a single joined event.
//! Three writers feed it: commands issued through the engine, snapshots pulled
//! by the poll loop, and deltas delivered by the subscription router. All of
//! them mutate [`SyncState`] under one lock that is never held across an
//! await, so every mutation is a short synchronous step between suspension
//! points.
//!
//! Two counters guard against stale data. The context generation changes when
//! the joined event changes; the state revision changes when a local lifecycle
//! command rewrites session fields. A snapshot whose fetch started under an
//! older generation or revision is dropped on arrival.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use change_feed::FeedMessage;
use parking_lot::Mutex;
use remote_state::{Event, QueueEntry, RemoteStateSource, SealedSession, Snapshot};
use tracing::{debug, info, warn};

use crate::config::EngineSettings;
use crate::context::{JoinedContext, SessionContext};
use crate::error::{EngineResult, ValidationError};
use crate::history::{self, merge_history};
use crate::identity::Participant;
use crate::metrics;
use crate::queue_store::{OptimisticQueueStore, QueuedEntry};
use crate::rank::current_user_rank;
use crate::stability::{transition, StabilityFilter, Transition};
use crate::subscription::{route, RoutedChange, SubscriptionRouter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No event joined; nothing fetched.
    Idle,
    Applied,
    /// A `false` session reading was absorbed by the stability filter.
    Debounced,
    /// The filtered session state flipped to closed.
    Closed,
    /// The joined event or local lifecycle changed while the fetch was in
    /// flight; the result was dropped.
    Stale,
}

impl PollOutcome {
    pub fn metric_label(self) -> &'static str {
        match self {
            PollOutcome::Applied | PollOutcome::Closed => "ok",
            PollOutcome::Idle | PollOutcome::Debounced => "ignored",
            PollOutcome::Stale => "stale",
        }
    }
}

pub(crate) struct SyncState {
    pub(crate) event: Option<Event>,
    pub(crate) store: OptimisticQueueStore,
    pub(crate) filter: StabilityFilter,
    pub(crate) stable_active: bool,
    pub(crate) history: Vec<SealedSession>,
    pub(crate) user: Option<Participant>,
    pub(crate) revision: u64,
}

impl SyncState {
    fn new(settings: &EngineSettings) -> Self {
        Self {
            event: None,
            store: OptimisticQueueStore::new(settings.match_window),
            filter: StabilityFilter::new(settings.close_threshold),
            stable_active: false,
            history: Vec::new(),
            user: None,
            revision: 0,
        }
    }

    pub(crate) fn joined_event(&self) -> Result<&Event, ValidationError> {
        self.event.as_ref().ok_or(ValidationError::NoEventJoined)
    }

    pub(crate) fn joined_event_mut(&mut self) -> Result<&mut Event, ValidationError> {
        self.event.as_mut().ok_or(ValidationError::NoEventJoined)
    }

    pub(crate) fn is_joined_to(&self, event_id: &str) -> bool {
        self.event.as_ref().is_some_and(|event| event.id == event_id)
    }

    pub(crate) fn participant(&self) -> Result<&Participant, ValidationError> {
        self.user.as_ref().ok_or(ValidationError::NoParticipant)
    }

    pub(crate) fn moderator(&self) -> Result<&Participant, ValidationError> {
        match &self.user {
            Some(user) if user.is_moderator() => Ok(user),
            _ => Err(ValidationError::NotModerator),
        }
    }

    pub(crate) fn require_open(&self) -> Result<&Event, ValidationError> {
        let event = self.joined_event()?;
        if !self.stable_active {
            return Err(ValidationError::SessionClosed);
        }
        Ok(event)
    }

    pub(crate) fn bump_revision(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    /// Local half of a close: the filtered flag drops, the speaker clears and
    /// the queue is retired.
    pub(crate) fn close_locally(&mut self) {
        self.stable_active = false;
        self.filter.reset();
        self.store.clear();
        if let Some(event) = self.event.as_mut() {
            event.session_active = false;
            event.active_speaker_entry_id = None;
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) remote: Arc<dyn RemoteStateSource>,
    pub(crate) settings: EngineSettings,
    pub(crate) state: Mutex<SyncState>,
    pub(crate) context: SessionContext,
    pub(crate) router: SubscriptionRouter,
    loading: AtomicUsize,
}

/// Rendered state of the engine at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineView {
    pub event: Option<Event>,
    pub waiting: Vec<QueuedEntry>,
    pub answered: Vec<QueueEntry>,
    pub current_user_rank: Option<usize>,
    pub active_speaker_id: Option<String>,
    pub is_session_active: bool,
    pub is_loading: bool,
    pub history: Vec<SealedSession>,
}

#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct LoadingGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SyncEngine {
    pub fn new(remote: Arc<dyn RemoteStateSource>, settings: EngineSettings) -> Self {
        let state = SyncState::new(&settings);
        Self {
            inner: Arc::new(EngineInner {
                remote,
                settings,
                state: Mutex::new(state),
                context: SessionContext::new(),
                router: SubscriptionRouter::default(),
                loading: AtomicUsize::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn context(&self) -> JoinedContext {
        self.inner.context.current()
    }

    pub fn revision(&self) -> u64 {
        self.inner.state.lock().revision
    }

    pub fn set_user(&self, user: Participant) {
        self.inner.state.lock().user = Some(user);
    }

    pub fn user(&self) -> Option<Participant> {
        self.inner.state.lock().user.clone()
    }

    /// Event id the push subscription currently covers, if any.
    pub fn subscribed_event(&self) -> Option<String> {
        self.inner.router.subscribed_event()
    }

    pub(crate) fn loading_guard(&self) -> LoadingGuard<'_> {
        self.inner.loading.fetch_add(1, Ordering::AcqRel);
        LoadingGuard {
            counter: &self.inner.loading,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.inner.loading.load(Ordering::Acquire) > 0
    }

    pub fn view(&self) -> EngineView {
        let state = self.inner.state.lock();
        let waiting = if state.stable_active {
            state.store.waiting().to_vec()
        } else {
            Vec::new()
        };
        let current_user_rank = state
            .user
            .as_ref()
            .and_then(|user| current_user_rank(&waiting, &user.key()));
        EngineView {
            event: state.event.clone(),
            current_user_rank,
            waiting,
            answered: state.store.answered().to_vec(),
            active_speaker_id: state
                .event
                .as_ref()
                .and_then(|event| event.active_speaker_entry_id.clone()),
            is_session_active: state.stable_active,
            is_loading: self.is_loading(),
            history: state.history.clone(),
        }
    }

    pub fn event(&self) -> Option<Event> {
        self.inner.state.lock().event.clone()
    }

    pub fn waiting(&self) -> Vec<QueuedEntry> {
        self.view().waiting
    }

    pub fn answered(&self) -> Vec<QueueEntry> {
        self.inner.state.lock().store.answered().to_vec()
    }

    pub fn current_user_rank(&self) -> Option<usize> {
        self.view().current_user_rank
    }

    pub fn active_speaker_id(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .event
            .as_ref()
            .and_then(|event| event.active_speaker_entry_id.clone())
    }

    pub fn is_session_active(&self) -> bool {
        self.inner.state.lock().stable_active
    }

    pub fn history(&self) -> Vec<SealedSession> {
        self.inner.state.lock().history.clone()
    }

    /// How often a participant has been queued: every entry of the sealed
    /// sessions plus the live session's answered list.
    pub fn participant_count(&self, name: &str, business_name: Option<&str>) -> usize {
        let state = self.inner.state.lock();
        let live_session = state
            .event
            .as_ref()
            .filter(|_| state.stable_active)
            .and_then(|event| event.current_session_id.as_deref());
        history::participant_count(
            &state.history,
            live_session,
            state.store.answered(),
            name,
            business_name,
        )
    }

    /// Fetches a snapshot of the joined event and reconciles it.
    pub async fn refresh(&self) -> EngineResult<PollOutcome> {
        let context = self.inner.context.current();
        let Some(code) = context.event_code else {
            return Ok(PollOutcome::Idle);
        };
        let revision = self.revision();
        match self.inner.remote.fetch_snapshot(&code).await {
            Ok(snapshot) => {
                let outcome = self.apply_snapshot(snapshot, context.generation, revision);
                metrics::POLLS
                    .with_label_values(&[outcome.metric_label()])
                    .inc();
                Ok(outcome)
            }
            Err(err) => {
                metrics::POLLS.with_label_values(&["error"]).inc();
                Err(err.into())
            }
        }
    }

    /// Re-reads sealed sessions only; the queue is left alone.
    pub(crate) async fn refresh_history(&self) -> EngineResult<bool> {
        let context = self.inner.context.current();
        let Some(code) = context.event_code else {
            return Ok(false);
        };
        let snapshot = self.inner.remote.fetch_snapshot(&code).await?;
        let mut state = self.inner.state.lock();
        if !self.inner.context.is_current(context.generation)
            || !state.is_joined_to(&snapshot.event.id)
        {
            return Ok(false);
        }
        merge_history(&mut state.history, snapshot.sealed_sessions);
        Ok(true)
    }

    /// Reconciles a snapshot whose fetch began under `generation` and
    /// `revision`.
    pub fn apply_snapshot(&self, snapshot: Snapshot, generation: u64, revision: u64) -> PollOutcome {
        let context = &self.inner.context;
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if !context.is_current(generation)
            || state.revision != revision
            || !state.is_joined_to(&snapshot.event.id)
        {
            debug!(event_code = %snapshot.event.code, "dropping stale snapshot");
            return PollOutcome::Stale;
        }

        let Snapshot {
            event,
            waiting,
            answered,
            sealed_sessions,
        } = snapshot;
        merge_history(&mut state.history, sealed_sessions);

        let previous = state.stable_active;
        let raw = event.session_active;
        let stable = state.filter.apply(previous, raw);
        state.stable_active = stable;

        if stable && !raw {
            debug!(
                event_code = %event.code,
                readings = state.filter.pending_false(),
                "ignoring transient closed reading"
            );
            if let Some(local) = state.event.as_mut() {
                local.name = event.name;
                local.visibility = event.visibility;
            }
            return PollOutcome::Debounced;
        }

        if !stable {
            state.store.clear();
            context.set_session(event.current_session_id.clone());
            let code = event.code.clone();
            state.event = Some(event);
            if transition(previous, stable) == Some(Transition::Closed) {
                info!(event_code = %code, "session closed");
                return PollOutcome::Closed;
            }
            return PollOutcome::Applied;
        }

        let session_changed = state
            .event
            .as_ref()
            .map_or(true, |local| local.current_session_id != event.current_session_id);
        if session_changed {
            state.store.clear();
        }
        context.set_session(event.current_session_id.clone());
        if transition(previous, stable) == Some(Transition::Opened) {
            info!(
                event_code = %event.code,
                session_id = ?event.current_session_id,
                "session opened"
            );
        }
        state.event = Some(event);
        state.store.reconcile_snapshot(waiting, answered);
        PollOutcome::Applied
    }

    /// Applies a routed push change. Returns `true` when the change closed the
    /// session and history should be re-read.
    pub(crate) fn apply_push(&self, change: RoutedChange) -> bool {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        match change {
            RoutedChange::Queue(delta) => {
                if !state.stable_active {
                    debug!("queue change while session closed ignored");
                    return false;
                }
                let outcome = state.store.apply_delta(delta);
                debug!(?outcome, "applied queue change");
                false
            }
            RoutedChange::Event(patch) => {
                let previous_active = state.stable_active;
                let Some(event) = state.event.as_mut() else {
                    return false;
                };
                let previous_session = event.current_session_id.clone();
                event.apply(&patch);
                let active = event.session_active;
                let session = event.current_session_id.clone();
                let code = event.code.clone();

                let session_moved = session != previous_session;
                if session_moved {
                    state.store.clear();
                    self.inner.context.set_session(session);
                }
                if session_moved || active != previous_active {
                    state.filter.reset();
                    state.bump_revision();
                }
                state.stable_active = active;
                if previous_active && !active {
                    state.store.clear();
                    if let Some(event) = state.event.as_mut() {
                        event.active_speaker_entry_id = None;
                    }
                    info!(event_code = %code, "session closed by push");
                    return true;
                }
                false
            }
        }
    }

    pub(crate) async fn handle_feed_message(&self, message: FeedMessage) {
        let context = self.inner.context.current();
        let Some(change) = route(&message, &context) else {
            metrics::PUSH_CHANGES.with_label_values(&["rejected"]).inc();
            return;
        };
        metrics::PUSH_CHANGES
            .with_label_values(&[change.metric_label()])
            .inc();
        if self.apply_push(change) {
            if let Err(err) = self.refresh_history().await {
                warn!(error = %err, "history refresh after push close failed");
            }
        }
    }

    /// Makes `event` the joined event. Local state from any previous event is
    /// dropped and a new context generation starts.
    pub(crate) fn enter_event(&self, event: Event) -> u64 {
        let mut state = self.inner.state.lock();
        let session = event
            .current_session_id
            .clone()
            .filter(|_| event.session_active);
        let generation = self.inner.context.join(&event.id, &event.code, session);
        state.store.clear();
        state.history.clear();
        state.filter.reset();
        state.stable_active = event.session_active;
        state.event = Some(event);
        state.bump_revision();
        generation
    }

    pub(crate) fn exit_event(&self) {
        let mut state = self.inner.state.lock();
        self.inner.context.leave();
        state.store.clear();
        state.history.clear();
        state.filter.reset();
        state.stable_active = false;
        state.event = None;
        state.bump_revision();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use remote_state::{EntryStatus, EventPatch, InMemoryRemote, Visibility};

    use crate::queue_store::QueueDelta;

    fn event(active: bool, session: Option<&str>) -> Event {
        Event {
            id: "evt-1".into(),
            code: "SEMINAR24".into(),
            name: "Seminar".into(),
            visibility: Visibility::Public,
            session_active: active,
            current_session_id: session.map(str::to_string),
            active_speaker_entry_id: None,
            created_by: None,
        }
    }

    fn entry(id: &str, name: &str, secs: i64) -> QueueEntry {
        QueueEntry {
            id: id.into(),
            session_id: "s-1".into(),
            event_code: "SEMINAR24".into(),
            display_name: name.into(),
            business_name: None,
            status: EntryStatus::Waiting,
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    fn snapshot(active: bool, waiting: Vec<QueueEntry>) -> Snapshot {
        Snapshot {
            event: event(active, Some("s-1")),
            waiting,
            answered: vec![],
            sealed_sessions: vec![],
        }
    }

    fn engine() -> (SyncEngine, u64) {
        let engine = SyncEngine::new(InMemoryRemote::new(), EngineSettings::default());
        let generation = engine.enter_event(event(true, Some("s-1")));
        (engine, generation)
    }

    #[test]
    fn isolated_closed_readings_keep_the_queue() {
        let (engine, generation) = engine();
        let rev = engine.revision();
        engine.apply_snapshot(snapshot(true, vec![entry("q-1", "Alice", 0)]), generation, rev);

        for _ in 0..2 {
            let outcome = engine.apply_snapshot(snapshot(false, vec![]), generation, rev);
            assert_eq!(outcome, PollOutcome::Debounced);
            assert_eq!(engine.waiting().len(), 1);
        }
        let outcome = engine.apply_snapshot(snapshot(false, vec![]), generation, rev);
        assert_eq!(outcome, PollOutcome::Closed);
        assert!(engine.waiting().is_empty());
        assert!(!engine.is_session_active());
    }

    #[test]
    fn snapshots_from_an_old_generation_are_dropped() {
        let (engine, generation) = engine();
        let rev = engine.revision();
        let newer = engine.enter_event(event(true, Some("s-1")));
        assert_ne!(generation, newer);

        let outcome = engine.apply_snapshot(snapshot(true, vec![entry("q-1", "Alice", 0)]), generation, rev);
        assert_eq!(outcome, PollOutcome::Stale);
        assert!(engine.waiting().is_empty());
    }

    #[test]
    fn snapshots_from_before_a_lifecycle_change_are_dropped() {
        let (engine, generation) = engine();
        let rev = engine.revision();
        engine.inner.state.lock().bump_revision();
        let outcome = engine.apply_snapshot(snapshot(false, vec![]), generation, rev);
        assert_eq!(outcome, PollOutcome::Stale);
        assert!(engine.is_session_active());
    }

    #[test]
    fn new_session_id_retires_the_old_queue() {
        let (engine, generation) = engine();
        let rev = engine.revision();
        engine.apply_snapshot(snapshot(true, vec![entry("q-1", "Alice", 0)]), generation, rev);

        let mut next = snapshot(true, vec![]);
        next.event.current_session_id = Some("s-2".into());
        engine.apply_snapshot(next, generation, rev);
        assert!(engine.waiting().is_empty());
        assert_eq!(engine.context().session_id.as_deref(), Some("s-2"));
    }

    #[test]
    fn push_close_clears_queue_and_requests_history() {
        let (engine, generation) = engine();
        let rev = engine.revision();
        engine.apply_snapshot(snapshot(true, vec![entry("q-1", "Alice", 0)]), generation, rev);

        let needs_history = engine.apply_push(RoutedChange::Event(EventPatch {
            session_active: Some(false),
            ..EventPatch::default()
        }));
        assert!(needs_history);
        assert!(engine.waiting().is_empty());
        assert!(!engine.is_session_active());
        assert_ne!(engine.revision(), rev);
    }

    #[test]
    fn push_queue_changes_are_ignored_while_closed() {
        let (engine, _) = engine();
        engine.inner.state.lock().close_locally();
        engine.apply_push(RoutedChange::Queue(QueueDelta::Created(entry("q-1", "Alice", 0))));
        assert!(engine.view().waiting.is_empty());
    }

    #[test]
    fn loading_guard_nests() {
        let (engine, _) = engine();
        assert!(!engine.is_loading());
        {
            let _outer = engine.loading_guard();
            {
                let _inner = engine.loading_guard();
                assert!(engine.is_loading());
            }
            assert!(engine.is_loading());
        }
        assert!(!engine.is_loading());
    }
}

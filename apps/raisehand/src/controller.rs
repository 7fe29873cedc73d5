//! Commands issued by participants and moderators.
//!
//! Every command validates against the local view first and fails with a
//! [`ValidationError`] before touching the remote. Commands that change what
//! the user sees apply the change locally, then write, and undo their own
//! optimistic step when the write fails. Session open and close are the
//! exception: a failed lifecycle write is reported but left for the next poll
//! to correct.

use chrono::Utc;
use remote_state::{
    EntryStatus, Event, EventPatch, NewEvent, QueueEntry, SealedSession, Session, Visibility,
};
use tracing::{debug, info, warn};

use crate::engine::SyncEngine;
use crate::error::{EngineResult, ValidationError};
use crate::history::merge_history;
use crate::identity::EventCode;
use crate::metrics;

impl SyncEngine {
    pub async fn join_event(&self, code: &str) -> EngineResult<Event> {
        let result = self.join_event_inner(code).await;
        metrics::command_result("join_event", &result);
        result
    }

    async fn join_event_inner(&self, code: &str) -> EngineResult<Event> {
        let code = EventCode::parse(code)?;
        let _loading = self.loading_guard();
        let event = self
            .inner
            .remote
            .find_event(code.as_str())
            .await?
            .ok_or_else(|| ValidationError::UnknownEvent(code.to_string()))?;
        self.enter_event(event.clone());
        self.inner.router.attach(&self.inner, &event.id);
        info!(event_code = %code, event_id = %event.id, "joined event");
        if let Err(err) = self.refresh().await {
            warn!(event_code = %code, error = %err, "initial fetch failed; poll loop will retry");
        }
        Ok(self.event().unwrap_or(event))
    }

    pub fn leave_event(&self) {
        self.inner.router.detach();
        self.exit_event();
        info!("left event");
    }

    /// Events the current user may join. Participants only see public events;
    /// moderators also see hidden ones so they can be made public again.
    pub async fn available_events(&self) -> EngineResult<Vec<Event>> {
        let moderator = self
            .inner
            .state
            .lock()
            .user
            .as_ref()
            .is_some_and(|user| user.is_moderator());
        let events = self.inner.remote.list_events().await?;
        Ok(events
            .into_iter()
            .filter(|event| moderator || event.is_public())
            .collect())
    }

    pub async fn create_event(
        &self,
        name: &str,
        code: &str,
        visibility: Visibility,
    ) -> EngineResult<Event> {
        let result = self.create_event_inner(name, code, visibility).await;
        metrics::command_result("create_event", &result);
        result
    }

    async fn create_event_inner(
        &self,
        name: &str,
        code: &str,
        visibility: Visibility,
    ) -> EngineResult<Event> {
        let created_by = self.inner.state.lock().moderator()?.name.clone();
        let code = EventCode::parse(code)?;
        let name = match name.trim() {
            "" => code.to_string(),
            trimmed => trimmed.to_string(),
        };
        let _loading = self.loading_guard();
        if self.inner.remote.find_event(code.as_str()).await?.is_some() {
            return Err(ValidationError::EventCodeTaken(code.to_string()).into());
        }
        let event = self
            .inner
            .remote
            .create_event(NewEvent {
                code: code.to_string(),
                name,
                visibility,
                created_by: Some(created_by),
            })
            .await?;
        info!(event_code = %event.code, event_id = %event.id, "event created");
        self.enter_event(event.clone());
        self.inner.router.attach(&self.inner, &event.id);
        Ok(event)
    }

    pub async fn set_visibility(&self, visibility: Visibility) -> EngineResult<()> {
        let patch = EventPatch {
            visibility: Some(visibility),
            ..EventPatch::default()
        };
        let result = self.update_joined_event(patch).await;
        metrics::command_result("set_visibility", &result);
        result
    }

    pub async fn rename_event(&self, name: &str) -> EngineResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        let patch = EventPatch {
            name: Some(name.to_string()),
            ..EventPatch::default()
        };
        let result = self.update_joined_event(patch).await;
        metrics::command_result("rename_event", &result);
        result
    }

    async fn update_joined_event(&self, patch: EventPatch) -> EngineResult<()> {
        let event_id = {
            let state = self.inner.state.lock();
            state.moderator()?;
            state.joined_event()?.id.clone()
        };
        self.inner
            .remote
            .update_event(&event_id, patch.clone())
            .await?;
        let mut state = self.inner.state.lock();
        if let Some(event) = state.event.as_mut().filter(|event| event.id == event_id) {
            event.apply(&patch);
        }
        Ok(())
    }

    /// Queues the current user in the open session. The entry shows up at
    /// once under a temporary id; the confirmed id is returned.
    pub async fn raise_hand(&self) -> EngineResult<String> {
        let result = self.raise_hand_inner().await;
        metrics::command_result("raise_hand", &result);
        result
    }

    async fn raise_hand_inner(&self) -> EngineResult<String> {
        let (temp, draft) = {
            let mut state = self.inner.state.lock();
            let user = state.participant()?.clone();
            let event = state.require_open()?;
            let session_id = event
                .current_session_id
                .clone()
                .ok_or(ValidationError::SessionClosed)?;
            let created_at = match state.store.latest_created_at() {
                Some(latest) => Utc::now().max(latest),
                None => Utc::now(),
            };
            let draft = QueueEntry {
                id: String::new(),
                session_id,
                event_code: event.code.clone(),
                display_name: user.name,
                business_name: user.business_name,
                status: EntryStatus::Waiting,
                created_at,
            };
            let temp = state.store.insert_optimistic(draft.clone())?;
            (temp, draft)
        };
        debug!(temp_id = %temp, event_code = %draft.event_code, "hand raised locally");

        let written = self
            .inner
            .remote
            .create_queue_entry(
                &draft.session_id,
                &draft.event_code,
                &draft.display_name,
                draft.business_name.as_deref(),
            )
            .await;
        let entry_id = match written {
            Ok(id) => id,
            Err(err) => {
                self.inner.state.lock().store.rollback(temp);
                metrics::ROLLBACKS.with_label_values(&["raise_hand"]).inc();
                warn!(temp_id = %temp, error = %err, "raise hand failed; optimistic entry removed");
                return Err(err.into());
            }
        };
        self.inner.state.lock().store.confirm(temp, &entry_id);

        if let Err(err) = self.refresh().await {
            debug!(entry_id = %entry_id, error = %err, "confirmation read failed; keeping local entry");
        }
        Ok(entry_id)
    }

    /// Opens a new session. Moderator only; the session must be closed.
    pub async fn start_session(&self) -> EngineResult<String> {
        let result = self.start_session_inner().await;
        metrics::command_result("start_session", &result);
        result
    }

    async fn start_session_inner(&self) -> EngineResult<String> {
        let event_id = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.moderator()?;
            if state.stable_active {
                state.joined_event()?;
                return Err(ValidationError::SessionAlreadyOpen.into());
            }
            let event = state.joined_event_mut()?;
            event.session_active = true;
            event.current_session_id = None;
            event.active_speaker_entry_id = None;
            let event_id = event.id.clone();
            state.stable_active = true;
            state.filter.reset();
            state.store.clear();
            state.bump_revision();
            event_id
        };
        self.inner.context.set_session(None);
        let _loading = self.loading_guard();

        let session_id = self.inner.remote.open_session(&event_id).await?;
        {
            let mut state = self.inner.state.lock();
            if let Some(event) = state.event.as_mut().filter(|event| event.id == event_id) {
                event.current_session_id = Some(session_id.clone());
                self.inner.context.set_session(Some(session_id.clone()));
            }
        }
        self.inner
            .remote
            .update_event(
                &event_id,
                EventPatch {
                    session_active: Some(true),
                    current_session_id: Some(Some(session_id.clone())),
                    active_speaker_entry_id: Some(None),
                    ..EventPatch::default()
                },
            )
            .await?;
        self.inner.state.lock().bump_revision();
        info!(event_id = %event_id, session_id = %session_id, "session started");
        Ok(session_id)
    }

    /// Seals the current session. The visible queue empties immediately;
    /// history is re-read after the settle delay.
    pub async fn stop_session(&self) -> EngineResult<()> {
        let result = self.stop_session_inner().await;
        metrics::command_result("stop_session", &result);
        result
    }

    async fn stop_session_inner(&self) -> EngineResult<()> {
        let (event_id, session_id) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.moderator()?;
            let event = state.require_open()?.clone();
            if let Some(session_id) = &event.current_session_id {
                let raised = state
                    .store
                    .waiting()
                    .iter()
                    .filter(|queued| !queued.is_pending())
                    .map(|queued| &queued.entry);
                let sealed = seal_locally(&event, session_id, state.store.answered(), raised);
                merge_history(&mut state.history, vec![sealed]);
            }
            state.close_locally();
            state.bump_revision();
            (event.id, event.current_session_id)
        };
        let _loading = self.loading_guard();

        if let Some(session_id) = &session_id {
            self.inner.remote.close_session(session_id).await?;
        }
        self.inner
            .remote
            .update_event(
                &event_id,
                EventPatch {
                    session_active: Some(false),
                    active_speaker_entry_id: Some(None),
                    ..EventPatch::default()
                },
            )
            .await?;
        self.inner.state.lock().bump_revision();
        info!(event_id = %event_id, session_id = ?session_id, "session stopped");

        tokio::time::sleep(self.inner.settings.settle_delay).await;
        if let Err(err) = self.refresh_history().await {
            warn!(event_id = %event_id, error = %err, "history refresh after stop failed");
        }
        Ok(())
    }

    /// Points the active speaker at a confirmed entry of the current session.
    pub async fn select_speaker(&self, entry_id: &str) -> EngineResult<()> {
        let result = self.set_speaker(Some(entry_id)).await;
        metrics::command_result("select_speaker", &result);
        result
    }

    pub async fn clear_speaker(&self) -> EngineResult<()> {
        let result = self.set_speaker(None).await;
        metrics::command_result("clear_speaker", &result);
        result
    }

    async fn set_speaker(&self, entry_id: Option<&str>) -> EngineResult<()> {
        let (event_id, previous) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.moderator()?;
            state.require_open()?;
            if let Some(id) = entry_id {
                if state.store.find(id).is_none() {
                    return Err(ValidationError::UnknownEntry(id.to_string()).into());
                }
            }
            let event = state.joined_event_mut()?;
            let previous = std::mem::replace(
                &mut event.active_speaker_entry_id,
                entry_id.map(str::to_string),
            );
            let event_id = event.id.clone();
            state.bump_revision();
            (event_id, previous)
        };

        let written = self
            .inner
            .remote
            .set_active_speaker(&event_id, entry_id)
            .await;
        let mut state = self.inner.state.lock();
        match written {
            Ok(()) => {
                state.bump_revision();
                Ok(())
            }
            Err(err) => {
                if let Some(event) = state.event.as_mut().filter(|event| event.id == event_id) {
                    if event.active_speaker_entry_id.as_deref() == entry_id {
                        event.active_speaker_entry_id = previous;
                    }
                }
                metrics::ROLLBACKS.with_label_values(&["select_speaker"]).inc();
                Err(err.into())
            }
        }
    }

    /// Moves a waiting entry to answered, clearing the active speaker when it
    /// pointed at that entry.
    pub async fn mark_as_answered(&self, entry_id: &str) -> EngineResult<()> {
        let result = self.mark_as_answered_inner(entry_id).await;
        metrics::command_result("mark_as_answered", &result);
        result
    }

    async fn mark_as_answered_inner(&self, entry_id: &str) -> EngineResult<()> {
        let (event_id, moved, was_speaker) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.moderator()?;
            state.require_open()?;
            let moved = state.store.mark_answered_local(entry_id)?;
            let event = state.joined_event_mut()?;
            let was_speaker = event.active_speaker_entry_id.as_deref() == Some(entry_id);
            if was_speaker {
                event.active_speaker_entry_id = None;
            }
            let event_id = event.id.clone();
            state.bump_revision();
            (event_id, moved, was_speaker)
        };

        if let Err(err) = self
            .inner
            .remote
            .update_entry_status(entry_id, EntryStatus::Answered)
            .await
        {
            let mut state = self.inner.state.lock();
            if state.is_joined_to(&event_id) {
                state.store.revert_answer(&moved);
                if was_speaker {
                    if let Some(event) = state.event.as_mut() {
                        event.active_speaker_entry_id.get_or_insert_with(|| entry_id.to_string());
                    }
                }
            }
            metrics::ROLLBACKS.with_label_values(&["mark_as_answered"]).inc();
            return Err(err.into());
        }

        // The answer has landed. The remote pointer keeps naming this entry
        // until the next clear_speaker.
        if was_speaker {
            if let Err(err) = self.inner.remote.set_active_speaker(&event_id, None).await {
                warn!(entry_id, error = %err, "answered but failed to clear the speaker");
            }
        }
        self.inner.state.lock().bump_revision();
        Ok(())
    }
}

/// Local stand-in for a session the remote has not sealed yet, so counts stay
/// right between the stop and the history refresh.
fn seal_locally<'a>(
    event: &Event,
    session_id: &str,
    answered: &[QueueEntry],
    waiting: impl Iterator<Item = &'a QueueEntry>,
) -> SealedSession {
    let participants: Vec<QueueEntry> = answered.iter().cloned().chain(waiting.cloned()).collect();
    let closed_at = Utc::now();
    let opened_at = participants
        .iter()
        .map(|entry| entry.created_at)
        .min()
        .unwrap_or(closed_at);
    SealedSession {
        session: Session {
            id: session_id.to_string(),
            event_id: event.id.clone(),
            event_code: event.code.clone(),
            opened_at,
            closed_at: Some(closed_at),
        },
        participants,
    }
}

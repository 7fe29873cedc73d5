//! Local view of the live queue, reconciled from three writers: the user's own
//! optimistic actions, polled snapshots and pushed deltas.
//!
//! Entries the user raised locally carry a [`Provenance`] until the remote
//! store is seen to contain them. Authoritative data always wins for entries
//! it knows about; locally raised entries it does not know about yet survive
//! until a matching confirmed entry shows up, which then takes their slot.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use remote_state::{EntryStatus, QueueEntry};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::identity::ParticipantKey;

pub const DEFAULT_MATCH_WINDOW: Duration = Duration::from_secs(60);

/// Identifier of an optimistic entry before the remote assigned one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempId(Uuid);

impl TempId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TempId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "temp-{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Present in authoritative data.
    Observed,
    /// Raised locally; the create call has not returned. The entry id is the
    /// temp id.
    Pending(TempId),
    /// Raised locally and acknowledged with a confirmed id, but no snapshot or
    /// delta has shown it yet.
    Written(TempId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEntry {
    pub entry: QueueEntry,
    pub provenance: Provenance,
}

impl QueuedEntry {
    fn observed(entry: QueueEntry) -> Self {
        Self {
            entry,
            provenance: Provenance::Observed,
        }
    }

    pub fn id(&self) -> &str {
        &self.entry.id
    }

    /// Still waiting for the create call to return.
    pub fn is_pending(&self) -> bool {
        matches!(self.provenance, Provenance::Pending(_))
    }

    pub fn is_observed(&self) -> bool {
        self.provenance == Provenance::Observed
    }

    fn has_confirmed_id(&self, id: &str) -> bool {
        !self.is_pending() && self.entry.id == id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueDelta {
    Created(QueueEntry),
    Updated(QueueEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Inserted,
    ReplacedPending,
    Refreshed,
    MovedToAnswered,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct OptimisticQueueStore {
    waiting: Vec<QueuedEntry>,
    answered: Vec<QueueEntry>,
    match_window: chrono::Duration,
}

impl Default for OptimisticQueueStore {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_WINDOW)
    }
}

impl OptimisticQueueStore {
    pub fn new(match_window: Duration) -> Self {
        Self {
            waiting: Vec::new(),
            answered: Vec::new(),
            match_window: chrono::Duration::from_std(match_window)
                .unwrap_or_else(|_| chrono::Duration::weeks(52)),
        }
    }

    pub fn waiting(&self) -> &[QueuedEntry] {
        &self.waiting
    }

    pub fn answered(&self) -> &[QueueEntry] {
        &self.answered
    }

    pub fn has_waiting(&self, key: &ParticipantKey) -> bool {
        self.waiting.iter().any(|q| key.matches(&q.entry))
    }

    /// Confirmed entry with this id, waiting or answered.
    pub fn find(&self, id: &str) -> Option<&QueueEntry> {
        self.waiting
            .iter()
            .find(|q| q.has_confirmed_id(id))
            .map(|q| &q.entry)
            .or_else(|| self.answered.iter().find(|e| e.id == id))
    }

    pub fn clear(&mut self) {
        self.waiting.clear();
        self.answered.clear();
    }

    pub fn clear_waiting(&mut self) {
        self.waiting.clear();
    }

    /// Appends a locally raised entry under a fresh temp id. Rejects a second
    /// waiting entry for the same participant.
    pub fn insert_optimistic(&mut self, mut entry: QueueEntry) -> Result<TempId, ValidationError> {
        if self.has_waiting(&ParticipantKey::of(&entry)) {
            return Err(ValidationError::DuplicateRaise);
        }
        let temp = TempId::new();
        entry.id = temp.to_string();
        entry.status = EntryStatus::Waiting;
        self.waiting.push(QueuedEntry {
            entry,
            provenance: Provenance::Pending(temp),
        });
        Ok(temp)
    }

    /// The create call returned `confirmed_id`. If authoritative data already
    /// delivered that entry the optimistic copy is dropped.
    pub fn confirm(&mut self, temp: TempId, confirmed_id: &str) -> bool {
        let Some(pos) = self.pending_position(temp) else {
            return false;
        };
        if self.find(confirmed_id).is_some() {
            self.waiting.remove(pos);
            return true;
        }
        let slot = &mut self.waiting[pos];
        slot.entry.id = confirmed_id.to_string();
        slot.provenance = Provenance::Written(temp);
        true
    }

    /// Drops an optimistic entry whose write failed.
    pub fn rollback(&mut self, temp: TempId) -> bool {
        match self.pending_position(temp) {
            Some(pos) => {
                self.waiting.remove(pos);
                true
            }
            None => false,
        }
    }

    fn pending_position(&self, temp: TempId) -> Option<usize> {
        self.waiting
            .iter()
            .position(|q| q.provenance == Provenance::Pending(temp))
    }

    fn within_window(&self, local: &QueueEntry, confirmed: &QueueEntry) -> bool {
        let distance = confirmed.created_at - local.created_at;
        distance.abs() <= self.match_window
    }

    /// Replaces the view with authoritative lists. Answered entries are
    /// append-only: ones answered locally but not yet replicated stay answered
    /// and are kept out of `waiting`. Locally raised entries the snapshot does
    /// not contain yet are kept at the tail; written ones match by id, pending
    /// ones by identity and creation time.
    pub fn reconcile_snapshot(&mut self, waiting: Vec<QueueEntry>, answered: Vec<QueueEntry>) {
        let (mut authoritative, stray_answered): (Vec<QueueEntry>, Vec<QueueEntry>) =
            waiting.into_iter().partition(QueueEntry::is_waiting);
        for entry in answered.into_iter().chain(stray_answered) {
            self.upsert_answered(entry);
        }

        let answered_ids: HashSet<&str> = self.answered.iter().map(|e| e.id.as_str()).collect();
        let mut seen = HashSet::new();
        authoritative.retain(|e| !answered_ids.contains(e.id.as_str()) && seen.insert(e.id.clone()));
        sort_by_creation(&mut authoritative);

        let local: Vec<QueuedEntry> = self
            .waiting
            .drain(..)
            .filter(|q| !q.is_observed())
            .collect();
        let mut claimed: HashSet<String> = HashSet::new();
        let mut survivors = Vec::new();
        for queued in local {
            let confirmed = match queued.provenance {
                Provenance::Written(_) => authoritative
                    .iter()
                    .chain(self.answered.iter())
                    .find(|c| c.id == queued.entry.id),
                _ => authoritative
                    .iter()
                    .find(|c| !claimed.contains(&c.id) && self.confirms_pending(&queued, c)),
            };
            match confirmed {
                Some(c) => {
                    claimed.insert(c.id.clone());
                }
                None => survivors.push(queued),
            }
        }

        self.waiting = authoritative.into_iter().map(QueuedEntry::observed).collect();
        self.waiting.extend(survivors);
    }

    /// A confirmed waiting entry stands in for a pending one when it carries
    /// the same identity and was created close enough in time.
    fn confirms_pending(&self, local: &QueuedEntry, candidate: &QueueEntry) -> bool {
        local.is_pending()
            && ParticipantKey::of(&local.entry) == ParticipantKey::of(candidate)
            && self.within_window(&local.entry, candidate)
    }

    pub fn apply_delta(&mut self, delta: QueueDelta) -> DeltaOutcome {
        let entry = match delta {
            QueueDelta::Created(entry) | QueueDelta::Updated(entry) => entry,
        };
        match entry.status {
            EntryStatus::Answered => self.move_to_answered(entry),
            EntryStatus::Waiting => self.upsert_waiting(entry),
        }
    }

    fn upsert_waiting(&mut self, entry: QueueEntry) -> DeltaOutcome {
        if self.answered.iter().any(|e| e.id == entry.id) {
            return DeltaOutcome::Ignored;
        }
        if let Some(slot) = self.waiting.iter_mut().find(|q| q.has_confirmed_id(&entry.id)) {
            let outcome = if slot.is_observed() && slot.entry == entry {
                DeltaOutcome::Ignored
            } else {
                DeltaOutcome::Refreshed
            };
            *slot = QueuedEntry::observed(entry);
            return outcome;
        }
        let key = ParticipantKey::of(&entry);
        if let Some(pos) = self.waiting.iter().position(|q| {
            q.is_pending() && ParticipantKey::of(&q.entry) == key && self.within_window(&q.entry, &entry)
        }) {
            self.waiting[pos] = QueuedEntry::observed(entry);
            return DeltaOutcome::ReplacedPending;
        }
        let pos = self
            .waiting
            .partition_point(|q| q.entry.created_at <= entry.created_at);
        self.waiting.insert(pos, QueuedEntry::observed(entry));
        DeltaOutcome::Inserted
    }

    fn move_to_answered(&mut self, entry: QueueEntry) -> DeltaOutcome {
        self.waiting.retain(|q| !q.has_confirmed_id(&entry.id));
        if self.upsert_answered(entry) {
            DeltaOutcome::MovedToAnswered
        } else {
            DeltaOutcome::Ignored
        }
    }

    /// Returns `true` when the entry was not answered before.
    fn upsert_answered(&mut self, mut entry: QueueEntry) -> bool {
        entry.status = EntryStatus::Answered;
        match self.answered.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => {
                *existing = entry;
                false
            }
            None => {
                self.answered.push(entry);
                true
            }
        }
    }

    /// Optimistically answers a confirmed waiting entry.
    pub fn mark_answered_local(&mut self, id: &str) -> Result<QueueEntry, ValidationError> {
        let pos = self
            .waiting
            .iter()
            .position(|q| q.has_confirmed_id(id))
            .ok_or_else(|| ValidationError::UnknownEntry(id.to_string()))?;
        let mut entry = self.waiting.remove(pos).entry;
        entry.status = EntryStatus::Answered;
        self.answered.push(entry.clone());
        Ok(entry)
    }

    /// Undoes [`Self::mark_answered_local`] after the status write failed.
    pub fn revert_answer(&mut self, entry: &QueueEntry) {
        self.answered.retain(|e| e.id != entry.id);
        if self.waiting.iter().any(|q| q.has_confirmed_id(&entry.id)) {
            return;
        }
        let mut restored = entry.clone();
        restored.status = EntryStatus::Waiting;
        let pos = self
            .waiting
            .partition_point(|q| q.entry.created_at <= restored.created_at);
        self.waiting.insert(pos, QueuedEntry::observed(restored));
    }

    /// Newest creation stamp in the view; used to build optimistic entries that
    /// never sort ahead of what is already queued.
    pub fn latest_created_at(&self) -> Option<DateTime<Utc>> {
        self.waiting.iter().map(|q| q.entry.created_at).max()
    }
}

fn sort_by_creation(entries: &mut [QueueEntry]) {
    entries.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

//! Participation counts over sealed sessions plus the live answered list.

use remote_state::{QueueEntry, SealedSession};

/// Keep at most this many sealed sessions in the local view.
pub const HISTORY_LIMIT: usize = 20;

/// Name filter for [`participant_count`]. A missing or blank business name
/// matches any business, which keeps rows recorded before business names
/// existed countable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantFilter {
    name: String,
    business: Option<String>,
}

impl ParticipantFilter {
    pub fn new(name: &str, business: Option<&str>) -> Self {
        Self {
            name: name.trim().to_lowercase(),
            business: business
                .map(|b| b.trim().to_lowercase())
                .filter(|b| !b.is_empty()),
        }
    }

    pub fn matches(&self, entry: &QueueEntry) -> bool {
        if entry.display_name.trim().to_lowercase() != self.name {
            return false;
        }
        match &self.business {
            None => true,
            Some(wanted) => entry
                .business_name
                .as_deref()
                .map(|b| b.trim().to_lowercase() == *wanted)
                .unwrap_or(false),
        }
    }
}

/// Counts `name` across sealed sessions plus the live answered list. A sealed
/// copy of `live_session` is skipped; `answered` already covers it.
pub fn participant_count(
    history: &[SealedSession],
    live_session: Option<&str>,
    answered: &[QueueEntry],
    name: &str,
    business: Option<&str>,
) -> usize {
    let filter = ParticipantFilter::new(name, business);
    let sealed = history
        .iter()
        .filter(|sealed| live_session != Some(sealed.session.id.as_str()))
        .flat_map(|sealed| sealed.participants.iter())
        .filter(|entry| filter.matches(entry))
        .count();
    let live = answered.iter().filter(|entry| filter.matches(entry)).count();
    sealed + live
}

/// Folds freshly fetched history into the local copy. Refreshed sessions
/// replace local ones with the same id; the result is newest first.
pub fn merge_history(current: &mut Vec<SealedSession>, refreshed: Vec<SealedSession>) {
    for sealed in refreshed {
        match current
            .iter_mut()
            .find(|existing| existing.session.id == sealed.session.id)
        {
            Some(existing) => *existing = sealed,
            None => current.push(sealed),
        }
    }
    current.sort_by(|a, b| b.session.closed_at.cmp(&a.session.closed_at));
    current.truncate(HISTORY_LIMIT);
}

use crate::identity::ParticipantKey;
use crate::queue_store::QueuedEntry;

/// 1-based position of the participant in the live queue. The first entry is
/// rank 1; `None` means the participant has no waiting entry.
pub fn current_user_rank(waiting: &[QueuedEntry], key: &ParticipantKey) -> Option<usize> {
    waiting
        .iter()
        .position(|queued| key.matches(&queued.entry))
        .map(|index| index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_store::OptimisticQueueStore;
    use chrono::{TimeZone, Utc};
    use remote_state::{EntryStatus, QueueEntry};

    fn entry(id: &str, name: &str, business: Option<&str>, secs: i64) -> QueueEntry {
        QueueEntry {
            id: id.into(),
            session_id: "s-1".into(),
            event_code: "SEMINAR24".into(),
            display_name: name.into(),
            business_name: business.map(str::to_string),
            status: EntryStatus::Waiting,
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn first_in_line_is_rank_one() {
        let mut store = OptimisticQueueStore::default();
        store.reconcile_snapshot(
            vec![
                entry("q-2", "Bob", None, 2),
                entry("q-1", "Alice", Some("ACME"), 1),
            ],
            vec![],
        );
        let alice = ParticipantKey::new("alice", Some("acme"));
        let bob = ParticipantKey::new("Bob", None);
        assert_eq!(current_user_rank(store.waiting(), &alice), Some(1));
        assert_eq!(current_user_rank(store.waiting(), &bob), Some(2));
    }

    #[test]
    fn absent_participant_has_no_rank() {
        let mut store = OptimisticQueueStore::default();
        store.reconcile_snapshot(vec![entry("q-1", "Alice", Some("ACME"), 1)], vec![]);
        assert_eq!(
            current_user_rank(store.waiting(), &ParticipantKey::new("Alice", None)),
            None
        );
        assert_eq!(current_user_rank(&[], &ParticipantKey::new("Alice", None)), None);
    }

    #[test]
    fn pending_entries_count_towards_rank() {
        let mut store = OptimisticQueueStore::default();
        store.reconcile_snapshot(vec![entry("q-1", "Bob", None, 1)], vec![]);
        store.insert_optimistic(entry("", "Carol", None, 5)).unwrap();
        assert_eq!(
            current_user_rank(store.waiting(), &ParticipantKey::new("carol", None)),
            Some(2)
        );
    }
}

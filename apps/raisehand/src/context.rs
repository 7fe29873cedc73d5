//! Live reference to the joined event and its current session.
//!
//! Async callbacks (poll completions, push deliveries) read this at the moment
//! they run instead of capturing values when they were scheduled. The
//! generation changes on every join or leave, so work started for an earlier
//! context can tell it is stale.

use parking_lot::RwLock;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinedContext {
    pub generation: u64,
    pub event_id: Option<String>,
    pub event_code: Option<String>,
    pub session_id: Option<String>,
}

impl JoinedContext {
    pub fn is_joined(&self) -> bool {
        self.event_id.is_some()
    }

    /// Queue changes belong to this context only when both the event code and
    /// the current session match.
    pub fn owns_entry(&self, event_code: &str, session_id: &str) -> bool {
        self.event_code.as_deref() == Some(event_code)
            && self.session_id.as_deref() == Some(session_id)
    }
}

#[derive(Debug, Default)]
pub struct SessionContext {
    inner: RwLock<JoinedContext>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> JoinedContext {
        self.inner.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    pub fn join(&self, event_id: &str, event_code: &str, session_id: Option<String>) -> u64 {
        let mut guard = self.inner.write();
        guard.generation += 1;
        guard.event_id = Some(event_id.to_string());
        guard.event_code = Some(event_code.to_string());
        guard.session_id = session_id;
        guard.generation
    }

    pub fn leave(&self) -> u64 {
        let mut guard = self.inner.write();
        guard.generation += 1;
        guard.event_id = None;
        guard.event_code = None;
        guard.session_id = None;
        guard.generation
    }

    /// The current session moved without the joined event changing; the
    /// generation stays.
    pub fn set_session(&self, session_id: Option<String>) {
        self.inner.write().session_id = session_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_leave_bump_generation() {
        let ctx = SessionContext::new();
        let first = ctx.join("evt-1", "SEMINAR24", Some("s-1".into()));
        assert!(ctx.is_current(first));

        ctx.set_session(Some("s-2".into()));
        assert!(ctx.is_current(first), "session moves keep the generation");

        let second = ctx.join("evt-2", "OTHER", None);
        assert!(!ctx.is_current(first));
        assert!(ctx.is_current(second));

        ctx.leave();
        assert!(!ctx.current().is_joined());
        assert!(!ctx.is_current(second));
    }

    #[test]
    fn ownership_reads_live_session() {
        let ctx = SessionContext::new();
        ctx.join("evt-1", "SEMINAR24", Some("s-1".into()));
        assert!(ctx.current().owns_entry("SEMINAR24", "s-1"));

        ctx.set_session(Some("s-2".into()));
        let live = ctx.current();
        assert!(!live.owns_entry("SEMINAR24", "s-1"));
        assert!(live.owns_entry("SEMINAR24", "s-2"));
        assert!(!live.owns_entry("OTHER", "s-2"));
    }
}

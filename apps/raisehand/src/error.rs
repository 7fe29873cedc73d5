use remote_state::{TransportError, WriteError};
use thiserror::Error;

/// Rejected before any remote call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("participant already has a waiting entry")]
    DuplicateRaise,
    #[error("session is not open")]
    SessionClosed,
    #[error("session is already open")]
    SessionAlreadyOpen,
    #[error("no event joined")]
    NoEventJoined,
    #[error("no participant identity set")]
    NoParticipant,
    #[error("participant name must not be empty")]
    EmptyName,
    #[error("invalid event code {0:?}")]
    InvalidEventCode(String),
    #[error("no event with code {0}")]
    UnknownEvent(String),
    #[error("event code {0} is already in use")]
    EventCodeTaken(String),
    #[error("no queue entry {0} in the current session")]
    UnknownEntry(String),
    #[error("moderator role required")]
    NotModerator,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("remote write failed: {0}")]
    Write(#[from] WriteError),
    #[error("remote fetch failed: {0}")]
    Transport(#[from] TransportError),
}

impl EngineError {
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            EngineError::Validation(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, EngineError::Write(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

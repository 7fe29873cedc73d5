//! Raise-hand queue synchronization engine.
//!
//! Keeps a participant's or moderator's view of one event's live queue in
//! step with an eventually consistent remote store. See [`SyncEngine`] for the
//! entry point; the pure pieces ([`stability`], [`queue_store`], [`history`],
//! [`rank`]) are usable on their own.

pub mod config;
pub mod context;
mod controller;
pub mod engine;
pub mod error;
pub mod history;
pub mod identity;
pub mod log_throttle;
pub mod metrics;
pub mod poller;
pub mod queue_store;
pub mod rank;
pub mod stability;
pub mod subscription;
pub mod telemetry;

pub use config::{Backend, EngineConfig, EngineSettings};
pub use engine::{EngineView, PollOutcome, SyncEngine};
pub use error::{EngineError, EngineResult, ValidationError};
pub use identity::{EventCode, Participant, ParticipantKey, Role};
pub use queue_store::{OptimisticQueueStore, QueuedEntry};

//! System-of-record access for the raise-hand queue.
//!
//! The synchronization engine only ever talks to a [`RemoteStateSource`]. The
//! store behind it is eventually consistent: snapshots may lag writes, and
//! push notifications (where a backend supports them) are best effort.
//!
//! Backends:
//! - [`InMemoryRemote`]: document-store style, publishes changes on a
//!   [`change_feed::LocalFeed`]; used by tests and the local demo mode.
//! - [`HttpRemote`]: spreadsheet-style action endpoint, polling only.

pub mod error;
pub mod http;
pub mod memory;
pub mod model;
pub mod notify;
pub mod source;

pub use error::{TransportError, WriteError};
pub use http::HttpRemote;
pub use memory::InMemoryRemote;
pub use model::{
    EntryStatus, Event, EventPatch, NewEvent, QueueEntry, SealedSession, Session, Snapshot,
    Visibility,
};
pub use notify::{EventChange, Topic};
pub use source::RemoteStateSource;

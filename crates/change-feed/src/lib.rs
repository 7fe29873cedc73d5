//! Topic-addressed change notifications.
//!
//! A [`ChangeFeed`] fans published changes out to every subscriber of the
//! topic. A single [`FeedSubscription`] may cover several topics; the
//! per-topic receivers are merged into one stream and the forwarding tasks are
//! torn down when the subscription is dropped, so dropping it is the
//! unsubscribe.

use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const DEFAULT_TOPIC_CAPACITY: usize = 64;
const MERGED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMessage {
    pub topic: String,
    pub kind: ChangeKind,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed channel closed")]
    Closed,
    #[error("feed transport error: {0}")]
    Transport(String),
}

pub type FeedResult<T> = Result<T, FeedError>;

pub trait ChangeFeed: Send + Sync {
    /// Must be called from within a Tokio runtime; forwarding tasks are
    /// spawned per topic.
    fn subscribe(&self, topics: &[String]) -> FeedSubscription;

    /// Returns how many subscribers the change was delivered to. Publishing
    /// to a topic nobody listens on is not an error.
    fn publish(&self, topic: &str, kind: ChangeKind, payload: Bytes) -> FeedResult<usize>;
}

/// Merged receiver over one or more topics.
pub struct FeedSubscription {
    topics: Vec<String>,
    rx: mpsc::Receiver<FeedMessage>,
    forwarders: Vec<JoinHandle<()>>,
}

impl FeedSubscription {
    pub fn from_receivers(receivers: Vec<(String, broadcast::Receiver<FeedMessage>)>) -> Self {
        let (tx, rx) = mpsc::channel(MERGED_CAPACITY);
        let mut topics = Vec::with_capacity(receivers.len());
        let mut forwarders = Vec::with_capacity(receivers.len());
        for (topic, mut sub) in receivers {
            topics.push(topic.clone());
            let tx = tx.clone();
            forwarders.push(tokio::spawn(async move {
                loop {
                    match sub.recv().await {
                        Ok(msg) => {
                            if tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "feed subscriber lagged; changes dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!(topic = %topic, "feed topic closed");
                            break;
                        }
                    }
                }
            }));
        }
        Self {
            topics,
            rx,
            forwarders,
        }
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Next change on any subscribed topic, or `None` once every topic closed.
    pub async fn recv(&mut self) -> Option<FeedMessage> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        for handle in self.forwarders.drain(..) {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("topics", &self.topics)
            .finish()
    }
}

/// In-process feed used by the in-memory backend and tests.
#[derive(Debug)]
pub struct LocalFeed {
    capacity: usize,
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<FeedMessage>>>,
}

impl Default for LocalFeed {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }
}

impl LocalFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<FeedMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl ChangeFeed for LocalFeed {
    fn subscribe(&self, topics: &[String]) -> FeedSubscription {
        let receivers = topics
            .iter()
            .map(|topic| (topic.clone(), self.sender_for(topic).subscribe()))
            .collect();
        FeedSubscription::from_receivers(receivers)
    }

    fn publish(&self, topic: &str, kind: ChangeKind, payload: Bytes) -> FeedResult<usize> {
        let sender = self.sender_for(topic);
        Ok(sender
            .send(FeedMessage {
                topic: topic.to_string(),
                kind,
                payload,
            })
            .unwrap_or(0))
    }
}

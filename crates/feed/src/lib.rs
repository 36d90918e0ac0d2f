use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};

pub mod error;
pub mod ids;
pub mod memory;
pub mod types;

pub use error::{FeedError, FeedResult};
pub use ids::{ParticipantId, RecordId};
pub use memory::{FaultKind, MemoryFeed};
pub use types::{ChangeBatch, ChangeEvent, ChangeKind, Document, FieldFilter, Fields, Query};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Remote document store with equality-filtered live queries.
pub trait ChangeFeed: Send + Sync {
    fn insert<'a>(&'a self, collection: &'a str, fields: Fields) -> BoxFuture<'a, FeedResult<RecordId>>;

    /// Resolves once the listener is registered. The first item on the returned
    /// subscription is the initial batch of matching documents.
    fn subscribe<'a>(&'a self, query: Query) -> BoxFuture<'a, FeedResult<FeedSubscription>>;
}

/// Live cursor over one query. Dropping it cancels the listener.
pub struct FeedSubscription {
    query: Query,
    events: mpsc::UnboundedReceiver<FeedResult<ChangeBatch>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl FeedSubscription {
    pub fn new(
        query: Query,
        events: mpsc::UnboundedReceiver<FeedResult<ChangeBatch>>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            query,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// `None` once the store side has gone away. An `Err` item is terminal.
    pub async fn recv(&mut self) -> Option<FeedResult<ChangeBatch>> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FeedResult<ChangeBatch>> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Channel halves a store implementation keeps for one registered listener.
pub struct ListenerChannels {
    pub events_tx: mpsc::UnboundedSender<FeedResult<ChangeBatch>>,
    pub cancel_rx: oneshot::Receiver<()>,
}

pub fn make_subscription(query: Query) -> (ListenerChannels, FeedSubscription) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        ListenerChannels {
            events_tx,
            cancel_rx,
        },
        FeedSubscription::new(query, events_rx, cancel_tx),
    )
}

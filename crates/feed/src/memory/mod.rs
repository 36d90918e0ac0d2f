use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::oneshot::error::TryRecvError;

use super::error::{
    FeedError, FeedResult, ListenerClosedSnafu, NotFoundSnafu, PermissionDeniedSnafu,
    RejectedSnafu, UnavailableSnafu,
};
use super::ids::RecordId;
use super::types::{ChangeBatch, ChangeEvent, Document, Fields, Query};
use super::{BoxFuture, ChangeFeed, FeedSubscription, ListenerChannels, make_subscription};

/// Failure modes that can be injected into a [`MemoryFeed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Unavailable,
    PermissionDenied,
    Rejected,
    /// The call never resolves; used to exercise caller deadlines.
    Stall,
}

impl FaultKind {
    fn into_error(self, stage: &'static str, collection: &str) -> FeedError {
        match self {
            Self::Unavailable | Self::Stall => UnavailableSnafu {
                stage,
                details: format!("injected fault on collection '{collection}'"),
            }
            .build(),
            Self::PermissionDenied => PermissionDeniedSnafu { stage, collection }.build(),
            Self::Rejected => RejectedSnafu {
                stage,
                collection,
                details: "injected rejection".to_string(),
            }
            .build(),
        }
    }
}

struct Listener {
    query: Query,
    channels: ListenerChannels,
}

impl Listener {
    fn is_live(&mut self) -> bool {
        !self.channels.events_tx.is_closed()
            && matches!(self.channels.cancel_rx.try_recv(), Err(TryRecvError::Empty))
    }

    fn push(&self, batch: ChangeBatch) -> bool {
        self.channels.events_tx.send(Ok(batch)).is_ok()
    }
}

#[derive(Default)]
struct FeedState {
    collections: HashMap<String, Vec<Document>>,
    listeners: Vec<Listener>,
    subscription_faults: Vec<(Query, FaultKind)>,
    insert_fault: Option<FaultKind>,
    insert_count: usize,
}

impl FeedState {
    fn prune_listeners(&mut self) {
        self.listeners.retain_mut(Listener::is_live);
    }

    fn matching_documents(&self, query: &Query) -> Vec<Document> {
        self.collections
            .get(&query.collection)
            .map(|documents| {
                documents
                    .iter()
                    .filter(|document| query.matches(document))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn broadcast(&mut self, collection: &str, event: ChangeEvent) {
        self.prune_listeners();
        for listener in &self.listeners {
            if listener.query.collection == collection && listener.query.matches(&event.document)
            {
                listener.push(vec![event.clone()]);
            }
        }
    }
}

/// In-process change feed: collections of JSON documents plus live listeners.
///
/// Every delivery happens while the state lock is held, so listeners observe
/// writes in insertion order.
#[derive(Clone, Default)]
pub struct MemoryFeed {
    state: Arc<Mutex<FeedState>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn documents(&self, collection: &str) -> Vec<Document> {
        let state = self.state.lock().await;
        state.collections.get(collection).cloned().unwrap_or_default()
    }

    pub async fn insert_count(&self) -> usize {
        self.state.lock().await.insert_count
    }

    pub async fn listener_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.prune_listeners();
        state.listeners.len()
    }

    pub async fn modify(&self, collection: &str, id: &RecordId, fields: Fields) -> FeedResult<()> {
        let mut state = self.state.lock().await;
        let document = state
            .collections
            .get_mut(collection)
            .and_then(|documents| documents.iter_mut().find(|document| &document.id == id))
            .ok_or_else(|| {
                NotFoundSnafu {
                    stage: "memory-feed-modify",
                    collection,
                    id: id.to_string(),
                }
                .build()
            })?;
        document.fields.extend(fields);
        let updated = document.clone();
        state.broadcast(collection, ChangeEvent::modified(updated));
        Ok(())
    }

    pub async fn remove(&self, collection: &str, id: &RecordId) -> FeedResult<()> {
        let mut state = self.state.lock().await;
        let documents = state.collections.get_mut(collection);
        let position = documents
            .as_ref()
            .and_then(|documents| documents.iter().position(|document| &document.id == id));
        let (Some(documents), Some(position)) = (documents, position) else {
            return NotFoundSnafu {
                stage: "memory-feed-remove",
                collection,
                id: id.to_string(),
            }
            .fail();
        };
        let removed = documents.remove(position);
        state.broadcast(collection, ChangeEvent::removed(removed));
        Ok(())
    }

    /// Re-delivers every matching document to listeners of an equal query,
    /// the way a store replays state after a reconnect.
    pub async fn replay(&self, query: &Query) -> usize {
        let mut state = self.state.lock().await;
        state.prune_listeners();
        let batch: ChangeBatch = state
            .matching_documents(query)
            .into_iter()
            .map(ChangeEvent::added)
            .collect();

        state
            .listeners
            .iter()
            .filter(|listener| &listener.query == query)
            .filter(|listener| listener.push(batch.clone()))
            .count()
    }

    pub async fn fail_subscriptions(&self, query: Query, kind: FaultKind) {
        self.state.lock().await.subscription_faults.push((query, kind));
    }

    pub async fn fail_inserts(&self, kind: FaultKind) {
        self.state.lock().await.insert_fault = Some(kind);
    }

    pub async fn clear_faults(&self) {
        let mut state = self.state.lock().await;
        state.subscription_faults.clear();
        state.insert_fault = None;
    }

    /// Pushes a terminal error into every live listener of `query`.
    pub async fn fail_listeners(&self, query: &Query, kind: FaultKind) -> usize {
        let mut state = self.state.lock().await;
        state.prune_listeners();
        let mut failed = 0;
        state.listeners.retain(|listener| {
            if &listener.query != query {
                return true;
            }
            let error = match kind {
                FaultKind::Stall => ListenerClosedSnafu {
                    stage: "memory-feed-fail-listener",
                    collection: query.collection.clone(),
                }
                .build(),
                other => other.into_error("memory-feed-fail-listener", &query.collection),
            };
            if listener.channels.events_tx.send(Err(error)).is_ok() {
                failed += 1;
            }
            false
        });
        failed
    }

    async fn insert_document(&self, collection: &str, fields: Fields) -> FeedResult<RecordId> {
        let fault = self.state.lock().await.insert_fault;
        match fault {
            Some(FaultKind::Stall) => std::future::pending::<()>().await,
            Some(kind) => return Err(kind.into_error("memory-feed-insert", collection)),
            None => {}
        }

        let mut state = self.state.lock().await;
        let document = Document::new(RecordId::generate(), fields);
        let id = document.id.clone();
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(document.clone());
        state.insert_count += 1;
        state.broadcast(collection, ChangeEvent::added(document));

        tracing::trace!(collection, record_id = %id, "memory feed stored document");
        Ok(id)
    }

    async fn register_listener(&self, query: Query) -> FeedResult<FeedSubscription> {
        let fault = {
            let state = self.state.lock().await;
            state
                .subscription_faults
                .iter()
                .find(|(faulted, _)| faulted == &query)
                .map(|(_, kind)| *kind)
        };
        match fault {
            Some(FaultKind::Stall) => std::future::pending::<()>().await,
            Some(kind) => return Err(kind.into_error("memory-feed-subscribe", &query.collection)),
            None => {}
        }

        let mut state = self.state.lock().await;
        state.prune_listeners();
        let (channels, subscription) = make_subscription(query.clone());
        let initial: ChangeBatch = state
            .matching_documents(&query)
            .into_iter()
            .map(ChangeEvent::added)
            .collect();
        let _ = channels.events_tx.send(Ok(initial));
        state.listeners.push(Listener { query, channels });
        Ok(subscription)
    }
}

impl ChangeFeed for MemoryFeed {
    fn insert<'a>(&'a self, collection: &'a str, fields: Fields) -> BoxFuture<'a, FeedResult<RecordId>> {
        Box::pin(self.insert_document(collection, fields))
    }

    fn subscribe<'a>(&'a self, query: Query) -> BoxFuture<'a, FeedResult<FeedSubscription>> {
        Box::pin(self.register_listener(query))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::ChangeKind;

    fn fields(value: Value) -> Fields {
        let Value::Object(fields) = value else {
            panic!("fixture must be an object");
        };
        fields
    }

    fn directional(sender: &str, receiver: &str) -> Query {
        Query::collection("chat")
            .where_eq("senderId", sender)
            .where_eq("receiverId", receiver)
    }

    async fn next_batch(subscription: &mut FeedSubscription) -> ChangeBatch {
        subscription
            .recv()
            .await
            .expect("listener still open")
            .expect("listener delivered a batch")
    }

    #[tokio::test]
    async fn subscribe_delivers_initial_batch_then_incremental_adds() {
        let feed = MemoryFeed::new();
        feed.insert("chat", fields(json!({"senderId": "a", "receiverId": "b", "message": "one"})))
            .await
            .expect("insert");

        let mut subscription = feed.subscribe(directional("a", "b")).await.expect("subscribe");
        let initial = next_batch(&mut subscription).await;
        assert_eq!(initial.len(), 1);
        assert!(initial.iter().all(|event| event.kind == ChangeKind::Added));

        feed.insert("chat", fields(json!({"senderId": "a", "receiverId": "b", "message": "two"})))
            .await
            .expect("insert");
        let incremental = next_batch(&mut subscription).await;
        assert_eq!(incremental.len(), 1);
        assert_eq!(incremental[0].document.field_str("message"), Some("two"));
    }

    #[tokio::test]
    async fn opposite_directions_never_share_a_record() {
        let feed = MemoryFeed::new();
        let mut outgoing = feed.subscribe(directional("l", "r")).await.expect("outgoing");
        let mut incoming = feed.subscribe(directional("r", "l")).await.expect("incoming");
        assert!(next_batch(&mut outgoing).await.is_empty());
        assert!(next_batch(&mut incoming).await.is_empty());

        for (sender, receiver) in [("l", "r"), ("r", "l"), ("l", "r"), ("r", "l")] {
            feed.insert("chat", fields(json!({"senderId": sender, "receiverId": receiver})))
                .await
                .expect("insert");
        }

        let mut outgoing_ids = Vec::new();
        while let Some(Ok(batch)) = outgoing.try_recv() {
            outgoing_ids.extend(batch.into_iter().map(|event| event.document.id));
        }
        let mut incoming_ids = Vec::new();
        while let Some(Ok(batch)) = incoming.try_recv() {
            incoming_ids.extend(batch.into_iter().map(|event| event.document.id));
        }

        assert_eq!(outgoing_ids.len(), 2);
        assert_eq!(incoming_ids.len(), 2);
        assert!(outgoing_ids.iter().all(|id| !incoming_ids.contains(id)));
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned() {
        let feed = MemoryFeed::new();
        let subscription = feed.subscribe(directional("a", "b")).await.expect("subscribe");
        assert_eq!(feed.listener_count().await, 1);
        drop(subscription);
        assert_eq!(feed.listener_count().await, 0);
    }

    #[tokio::test]
    async fn injected_faults_surface_as_feed_errors() {
        let feed = MemoryFeed::new();
        feed.fail_subscriptions(directional("a", "b"), FaultKind::PermissionDenied)
            .await;
        feed.fail_inserts(FaultKind::Rejected).await;

        let subscribe_error = feed
            .subscribe(directional("a", "b"))
            .await
            .err()
            .expect("subscription must fail");
        assert!(matches!(subscribe_error, FeedError::PermissionDenied { .. }));

        let insert_error = feed
            .insert("chat", fields(json!({"senderId": "a"})))
            .await
            .expect_err("insert must fail");
        assert!(matches!(insert_error, FeedError::Rejected { .. }));
        assert_eq!(feed.insert_count().await, 0);

        feed.clear_faults().await;
        assert!(feed.subscribe(directional("a", "b")).await.is_ok());
    }

    #[tokio::test]
    async fn modify_and_remove_reach_matching_listeners() {
        let feed = MemoryFeed::new();
        let id = feed
            .insert("chat", fields(json!({"senderId": "a", "receiverId": "b", "message": "x"})))
            .await
            .expect("insert");
        let mut subscription = feed.subscribe(directional("a", "b")).await.expect("subscribe");
        let _ = next_batch(&mut subscription).await;

        feed.modify("chat", &id, fields(json!({"message": "y"})))
            .await
            .expect("modify");
        let modified = next_batch(&mut subscription).await;
        assert_eq!(modified[0].kind, ChangeKind::Modified);
        assert_eq!(modified[0].document.field_str("message"), Some("y"));

        feed.remove("chat", &id).await.expect("remove");
        let removed = next_batch(&mut subscription).await;
        assert_eq!(removed[0].kind, ChangeKind::Removed);
        assert!(feed.documents("chat").await.is_empty());

        let missing = feed.remove("chat", &id).await.expect_err("already removed");
        assert!(matches!(missing, FeedError::NotFound { .. }));
    }

    #[tokio::test]
    async fn replay_redelivers_matching_documents() {
        let feed = MemoryFeed::new();
        let query = directional("a", "b");
        feed.insert("chat", fields(json!({"senderId": "a", "receiverId": "b"})))
            .await
            .expect("insert");
        let mut subscription = feed.subscribe(query.clone()).await.expect("subscribe");
        let initial = next_batch(&mut subscription).await;

        assert_eq!(feed.replay(&query).await, 1);
        let replayed = next_batch(&mut subscription).await;
        assert_eq!(replayed, initial);
    }

    #[tokio::test]
    async fn failed_listeners_receive_a_terminal_error() {
        let feed = MemoryFeed::new();
        let query = directional("a", "b");
        let mut subscription = feed.subscribe(query.clone()).await.expect("subscribe");
        let _ = next_batch(&mut subscription).await;

        assert_eq!(feed.fail_listeners(&query, FaultKind::Unavailable).await, 1);
        let item = subscription.recv().await.expect("error item");
        assert!(matches!(item, Err(FeedError::Unavailable { .. })));
        assert!(subscription.recv().await.is_none());
    }
}

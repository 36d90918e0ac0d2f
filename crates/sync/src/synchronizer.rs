use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use snafu::ResultExt;
use tandem_feed::{ChangeBatch, ChangeFeed, ChangeKind, FeedError, FeedSubscription, Query, RecordId};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{
    DirectionFailure, FeedSnafu, FeedUnavailableSnafu, HandshakeTimedOutSnafu, SubscribeFailure,
    SyncResult,
};
use crate::events::{SubscriptionDirection, SyncNotice, TimelineUpdate};
use crate::message::ConversationKey;
use crate::settings::SyncSettings;
use crate::submit::MessageSender;
use crate::timeline::{Timeline, TimelineSnapshot};

/// Opens conversation views against one feed.
#[derive(Clone)]
pub struct ConversationSynchronizer {
    feed: Arc<dyn ChangeFeed>,
    settings: Arc<SyncSettings>,
}

impl ConversationSynchronizer {
    pub fn new(feed: Arc<dyn ChangeFeed>, settings: SyncSettings) -> Self {
        Self {
            feed,
            settings: Arc::new(settings.normalized()),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn sender(&self) -> MessageSender {
        MessageSender::new(self.feed.clone(), self.settings.clone())
    }

    /// Establishes both directional subscriptions and starts merging them.
    ///
    /// Fails only when neither direction could be subscribed. A single failed
    /// direction is reported as the first notice on the returned handle.
    pub async fn open(&self, key: ConversationKey) -> SyncResult<ConversationHandle> {
        let collection = self.settings.collection.as_str();
        let (outgoing, incoming) = tokio::join!(
            self.establish(SubscriptionDirection::Outgoing, key.outgoing_query(collection)),
            self.establish(SubscriptionDirection::Incoming, key.incoming_query(collection)),
        );

        let mut live = Vec::with_capacity(2);
        let mut failures = Vec::new();
        for (direction, established) in [
            (SubscriptionDirection::Outgoing, outgoing),
            (SubscriptionDirection::Incoming, incoming),
        ] {
            match established {
                Ok(subscription) => live.push((direction, subscription)),
                Err(failure) => {
                    tracing::warn!(
                        conversation = %key,
                        direction = %direction,
                        error = %failure,
                        "directional subscription failed to open"
                    );
                    failures.push(DirectionFailure { direction, failure });
                }
            }
        }

        if live.is_empty() {
            return FeedUnavailableSnafu {
                stage: "open-subscriptions",
                conversation: key.to_string(),
                failures,
            }
            .fail();
        }

        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let degraded = !failures.is_empty();
        for failure in failures {
            let _ = notice_tx.send(SyncNotice::PartialSyncDegraded {
                failed: failure.direction,
                reason: failure.failure.to_string(),
            });
        }
        if key.is_self_conversation() {
            tracing::warn!(
                conversation = %key,
                "local and remote ids coincide; both subscriptions watch the same records"
            );
            let _ = notice_tx.send(SyncNotice::SelfConversation);
        }

        let latest = Arc::new(ArcSwap::from_pointee(TimelineSnapshot::default()));
        let (update_tx, _) = broadcast::channel(self.settings.update_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::with_capacity(live.len() + 1);
        for (direction, subscription) in live {
            tasks.push(tokio::spawn(run_producer(
                key.clone(),
                direction,
                subscription,
                ingest_tx.clone(),
                shutdown_rx.clone(),
            )));
        }
        drop(ingest_tx);

        let materializer = Materializer {
            key: key.clone(),
            timeline: Timeline::new(),
            revision: 0,
            reported_malformed: HashSet::new(),
            latest: latest.clone(),
            update_tx: update_tx.clone(),
            notice_tx,
        };
        tasks.push(tokio::spawn(run_consumer(materializer, ingest_rx, shutdown_rx)));

        tracing::info!(
            conversation = %key,
            live_subscriptions = tasks.len() - 1,
            degraded,
            "conversation opened"
        );

        Ok(ConversationHandle {
            key,
            sender: self.sender(),
            latest,
            update_tx,
            notices: notice_rx,
            degraded,
            shutdown_tx,
            tasks,
        })
    }

    async fn establish(
        &self,
        direction: SubscriptionDirection,
        query: Query,
    ) -> Result<FeedSubscription, SubscribeFailure> {
        let subscribe = self.feed.subscribe(query);
        let subscribed = match self.settings.subscribe_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, subscribe).await {
                Ok(subscribed) => subscribed,
                Err(_) => {
                    return HandshakeTimedOutSnafu {
                        stage: "subscribe-handshake-deadline",
                        timeout,
                    }
                    .fail();
                }
            },
            None => subscribe.await,
        };

        tracing::debug!(direction = %direction, ok = subscribed.is_ok(), "subscription handshake finished");
        subscribed.context(FeedSnafu {
            stage: "subscribe-handshake",
        })
    }
}

/// One open conversation view. Owns its subscriptions until closed or dropped.
pub struct ConversationHandle {
    key: ConversationKey,
    sender: MessageSender,
    latest: Arc<ArcSwap<TimelineSnapshot>>,
    update_tx: broadcast::Sender<TimelineUpdate>,
    notices: mpsc::UnboundedReceiver<SyncNotice>,
    degraded: bool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConversationHandle {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// Latest published timeline. Receivers that lag behind the update channel
    /// should redraw from here.
    pub fn snapshot(&self) -> Arc<TimelineSnapshot> {
        self.latest.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimelineUpdate> {
        self.update_tx.subscribe()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub async fn next_notice(&mut self) -> Option<SyncNotice> {
        self.notices.recv().await
    }

    pub fn try_next_notice(&mut self) -> Option<SyncNotice> {
        self.notices.try_recv().ok()
    }

    /// Writes a message from the local to the remote participant.
    pub async fn send(&self, body: &str) -> SyncResult<RecordId> {
        self.sender.send(&self.key.local, &self.key.remote, body).await
    }

    /// Cancels both subscriptions and waits for every task to stop. Nothing is
    /// applied or published once this returns.
    pub async fn close(mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            if let Err(error) = task.await {
                tracing::warn!(conversation = %self.key, error = %error, "sync task ended abnormally");
            }
        }
        tracing::info!(conversation = %self.key, "conversation closed");
    }
}

impl Drop for ConversationHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

enum Ingest {
    Batch {
        direction: SubscriptionDirection,
        batch: ChangeBatch,
    },
    Lost {
        direction: SubscriptionDirection,
        error: FeedError,
    },
}

async fn run_producer(
    key: ConversationKey,
    direction: SubscriptionDirection,
    mut subscription: FeedSubscription,
    ingest_tx: mpsc::UnboundedSender<Ingest>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            item = subscription.recv() => match item {
                Some(Ok(batch)) => {
                    if ingest_tx.send(Ingest::Batch { direction, batch }).is_err() {
                        break;
                    }
                }
                Some(Err(error)) => {
                    let _ = ingest_tx.send(Ingest::Lost { direction, error });
                    break;
                }
                None => {
                    tracing::debug!(conversation = %key, direction = %direction, "feed closed subscription");
                    break;
                }
            },
        }
    }
    subscription.cancel();
}

async fn run_consumer(
    mut materializer: Materializer,
    mut ingest_rx: mpsc::UnboundedReceiver<Ingest>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            ingest = ingest_rx.recv() => match ingest {
                Some(Ingest::Batch { direction, batch }) => materializer.apply_batch(direction, batch),
                Some(Ingest::Lost { direction, error }) => materializer.report_lost(direction, error),
                None => break,
            },
        }
    }
    tracing::debug!(
        conversation = %materializer.key,
        messages = materializer.timeline.len(),
        "timeline consumer stopped"
    );
}

/// Sole owner of the timeline. Runs on the consumer task only.
struct Materializer {
    key: ConversationKey,
    timeline: Timeline,
    revision: u64,
    /// Malformed ids already surfaced as notices. Replays stay quiet.
    reported_malformed: HashSet<RecordId>,
    latest: Arc<ArcSwap<TimelineSnapshot>>,
    update_tx: broadcast::Sender<TimelineUpdate>,
    notice_tx: mpsc::UnboundedSender<SyncNotice>,
}

impl Materializer {
    fn apply_batch(&mut self, direction: SubscriptionDirection, batch: ChangeBatch) {
        let mut added = Vec::with_capacity(batch.len());
        let mut ignored = 0_usize;
        for event in batch {
            match event.kind {
                ChangeKind::Added => added.push(event.document),
                ChangeKind::Modified | ChangeKind::Removed => ignored += 1,
            }
        }

        if ignored > 0 {
            tracing::debug!(
                conversation = %self.key,
                direction = %direction,
                ignored,
                "ignoring modified/removed events"
            );
        }
        if added.is_empty() {
            return;
        }

        let result = self.timeline.apply_added(&added);
        for malformed in result.malformed {
            if !self.reported_malformed.insert(malformed.record_id.clone()) {
                tracing::debug!(
                    conversation = %self.key,
                    record_id = %malformed.record_id,
                    "malformed record redelivered"
                );
                continue;
            }
            tracing::warn!(
                conversation = %self.key,
                direction = %direction,
                record_id = %malformed.record_id,
                error = %malformed.error,
                "skipping malformed record"
            );
            let _ = self.notice_tx.send(SyncNotice::MalformedRecord {
                direction,
                record_id: malformed.record_id,
                reason: malformed.error.to_string(),
            });
        }

        self.revision += 1;
        let snapshot = Arc::new(self.timeline.snapshot(self.revision));
        self.latest.store(snapshot.clone());

        tracing::debug!(
            conversation = %self.key,
            direction = %direction,
            revision = self.revision,
            inserted = result.inserted,
            duplicates = result.duplicates,
            initial_load = result.initial_load,
            "timeline batch applied"
        );

        // No receivers is fine; the snapshot above stays readable.
        let _ = self.update_tx.send(TimelineUpdate {
            snapshot,
            initial_load: result.initial_load,
        });
    }

    fn report_lost(&self, direction: SubscriptionDirection, error: FeedError) {
        tracing::warn!(
            conversation = %self.key,
            direction = %direction,
            stage = error.stage(),
            error = %error,
            "directional subscription lost"
        );
        let _ = self.notice_tx.send(SyncNotice::SubscriptionLost {
            direction,
            reason: error.to_string(),
        });
    }
}

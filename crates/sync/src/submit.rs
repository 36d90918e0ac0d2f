use std::sync::Arc;

use chrono::Utc;
use snafu::{ResultExt, ensure};
use tandem_feed::{ChangeFeed, ParticipantId, RecordId};

use crate::error::{EmptyBodySnafu, SyncResult, WriteFailedSnafu, WriteTimedOutSnafu};
use crate::message::MessageDocument;
use crate::settings::{SyncSettings, duration_millis};

/// Validates and writes outbound messages.
///
/// A successful send only means the feed stored the record. It reaches the
/// timeline through the conversation's own outgoing subscription.
#[derive(Clone)]
pub struct MessageSender {
    feed: Arc<dyn ChangeFeed>,
    settings: Arc<SyncSettings>,
}

impl MessageSender {
    pub fn new(feed: Arc<dyn ChangeFeed>, settings: Arc<SyncSettings>) -> Self {
        Self { feed, settings }
    }

    pub async fn send(
        &self,
        local_id: &ParticipantId,
        remote_id: &ParticipantId,
        body: &str,
    ) -> SyncResult<RecordId> {
        ensure!(
            !body.trim().is_empty(),
            EmptyBodySnafu {
                stage: "send-validate-body",
            }
        );

        let fields =
            MessageDocument::new(local_id.clone(), remote_id.clone(), body, Utc::now()).into_fields();
        let insert = self.feed.insert(&self.settings.collection, fields);

        let inserted = match self.settings.write_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, insert).await {
                Ok(inserted) => inserted,
                Err(_) => {
                    tracing::warn!(
                        sender = %local_id,
                        receiver = %remote_id,
                        timeout_ms = duration_millis(timeout),
                        "message insert was not acknowledged in time"
                    );
                    return WriteTimedOutSnafu {
                        stage: "send-insert-deadline",
                        timeout,
                    }
                    .fail();
                }
            },
            None => insert.await,
        };

        let record_id = inserted.context(WriteFailedSnafu {
            stage: "send-insert",
            sender: local_id.to_string(),
            receiver: remote_id.to_string(),
        })?;

        tracing::debug!(
            sender = %local_id,
            receiver = %remote_id,
            record_id = %record_id,
            "message stored in feed"
        );
        Ok(record_id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tandem_feed::{FaultKind, MemoryFeed};

    use super::*;
    use crate::error::SyncError;

    fn sender(feed: &MemoryFeed, settings: SyncSettings) -> MessageSender {
        MessageSender::new(Arc::new(feed.clone()), Arc::new(settings))
    }

    #[tokio::test]
    async fn blank_bodies_never_reach_the_feed() {
        let feed = MemoryFeed::new();
        let sender = sender(&feed, SyncSettings::default());

        let error = sender
            .send(&"l".into(), &"r".into(), "   \n\t")
            .await
            .expect_err("blank body is rejected");
        assert!(matches!(error, SyncError::EmptyBody { .. }));
        assert_eq!(feed.insert_count().await, 0);
    }

    #[tokio::test]
    async fn accepted_messages_are_written_once_with_untrimmed_body() {
        let feed = MemoryFeed::new();
        let sender = sender(&feed, SyncSettings::default());

        let id = sender
            .send(&"l".into(), &"r".into(), "  hello ")
            .await
            .expect("send succeeds");

        let documents = feed.documents("chat").await;
        assert_eq!(feed.insert_count().await, 1);
        assert_eq!(documents[0].id, id);
        assert_eq!(documents[0].field_str("senderId"), Some("l"));
        assert_eq!(documents[0].field_str("receiverId"), Some("r"));
        assert_eq!(documents[0].field_str("message"), Some("  hello "));
        assert!(documents[0].field_str("timeStamp").is_some());
    }

    #[tokio::test]
    async fn feed_rejections_surface_as_write_failures() {
        let feed = MemoryFeed::new();
        feed.fail_inserts(FaultKind::Rejected).await;
        let sender = sender(&feed, SyncSettings::default());

        let error = sender
            .send(&"l".into(), &"r".into(), "hi")
            .await
            .expect_err("insert is rejected");
        assert!(matches!(error, SyncError::WriteFailed { .. }));
    }

    #[tokio::test]
    async fn unacknowledged_writes_hit_the_deadline() {
        let feed = MemoryFeed::new();
        feed.fail_inserts(FaultKind::Stall).await;
        let settings = SyncSettings::default().with_write_timeout(Some(Duration::from_millis(30)));
        let sender = sender(&feed, settings);

        let error = sender
            .send(&"l".into(), &"r".into(), "hi")
            .await
            .expect_err("insert stalls");
        assert!(matches!(error, SyncError::WriteTimedOut { .. }));
    }
}

use std::fmt;
use std::sync::Arc;

use tandem_feed::RecordId;

use crate::timeline::TimelineSnapshot;

/// Which of the two directional subscriptions an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionDirection {
    /// `sender = local, receiver = remote`.
    Outgoing,
    /// `sender = remote, receiver = local`.
    Incoming,
}

impl fmt::Display for SubscriptionDirection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
        })
    }
}

/// Published after every batch that carried at least one added record.
#[derive(Debug, Clone)]
pub struct TimelineUpdate {
    pub snapshot: Arc<TimelineSnapshot>,
    /// True when the timeline was empty before this batch: redraw everything.
    /// Otherwise append and scroll to the end.
    pub initial_load: bool,
}

/// Non-fatal conditions surfaced to the conversation view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    /// One direction failed at open. Queued once, before any other notice.
    PartialSyncDegraded {
        failed: SubscriptionDirection,
        reason: String,
    },
    /// Local and remote ids coincide, so both subscriptions watch the same records.
    SelfConversation,
    /// A live subscription ended with an error after open.
    SubscriptionLost {
        direction: SubscriptionDirection,
        reason: String,
    },
    MalformedRecord {
        direction: SubscriptionDirection,
        record_id: RecordId,
        reason: String,
    },
}

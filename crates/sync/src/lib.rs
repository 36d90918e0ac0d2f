//! Live two-party conversation views over a [`ChangeFeed`](tandem_feed::ChangeFeed).
//!
//! A conversation is the union of two directional subscriptions, merged into
//! one ordered, deduplicated timeline by a single consumer task.

pub mod error;
pub mod events;
pub mod message;
pub mod settings;
pub mod submit;
pub mod synchronizer;
pub mod timeline;

pub use error::{
    DirectionFailure, MalformedRecord, RecordError, SubscribeFailure, SyncError, SyncResult,
};
pub use events::{SubscriptionDirection, SyncNotice, TimelineUpdate};
pub use message::{
    ConversationKey, Message, MessageDirection, MessageDocument, SessionIdentity, StaticIdentity,
};
pub use settings::{SettingsError, SyncSettings};
pub use submit::MessageSender;
pub use synchronizer::{ConversationHandle, ConversationSynchronizer};
pub use timeline::{ApplyResult, Timeline, TimelineSnapshot};

use std::fmt;
use std::time::Duration;

use snafu::Snafu;
use tandem_feed::{FeedError, RecordId};

use crate::events::SubscriptionDirection;

/// Why one directional subscription could not be established.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SubscribeFailure {
    #[snafu(display("{source}"))]
    Feed {
        stage: &'static str,
        source: FeedError,
    },
    #[snafu(display("no handshake within {}ms", timeout.as_millis()))]
    HandshakeTimedOut {
        stage: &'static str,
        timeout: Duration,
    },
}

#[derive(Debug)]
pub struct DirectionFailure {
    pub direction: SubscriptionDirection,
    pub failure: SubscribeFailure,
}

impl fmt::Display for DirectionFailure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}: {}", self.direction, self.failure)
    }
}

fn describe_failures(failures: &[DirectionFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display(
        "conversation {conversation} has no live subscription: {}",
        describe_failures(failures)
    ))]
    FeedUnavailable {
        stage: &'static str,
        conversation: String,
        failures: Vec<DirectionFailure>,
    },
    #[snafu(display("message body is empty after trimming"))]
    EmptyBody { stage: &'static str },
    #[snafu(display("feed rejected message from {sender} to {receiver} on `{stage}`: {source}"))]
    WriteFailed {
        stage: &'static str,
        sender: String,
        receiver: String,
        source: FeedError,
    },
    #[snafu(display("feed did not acknowledge message within {}ms", timeout.as_millis()))]
    WriteTimedOut {
        stage: &'static str,
        timeout: Duration,
    },
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Why a delivered document could not become a message.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RecordError {
    #[snafu(display("required field '{field}' is absent"))]
    MissingField {
        stage: &'static str,
        field: &'static str,
    },
    #[snafu(display("field '{field}' has an unexpected shape: {source}"))]
    InvalidField {
        stage: &'static str,
        field: &'static str,
        source: serde_json::Error,
    },
}

/// A skipped record, kept for the caller instead of aborting its batch.
#[derive(Debug)]
pub struct MalformedRecord {
    pub record_id: RecordId,
    pub error: RecordError,
}

impl fmt::Display for MalformedRecord {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "record {} skipped: {}", self.record_id, self.error)
    }
}

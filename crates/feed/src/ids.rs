use std::fmt;
use std::str::FromStr;

use snafu::ensure;
use uuid::Uuid;

use super::error::{FeedError, FeedResult, InvalidIdSnafu};

// Store ids are opaque text; one macro keeps every wrapper's surface identical.
macro_rules! define_feed_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn parse(raw: &str) -> FeedResult<Self> {
                let trimmed = raw.trim();
                ensure!(
                    !trimmed.is_empty(),
                    InvalidIdSnafu {
                        stage: "parse-feed-id",
                        id_type: $id_type,
                        raw: raw.to_string(),
                    }
                );
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl FromStr for $name {
            type Err = FeedError;

            fn from_str(raw: &str) -> FeedResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_feed_id!(ParticipantId, "participant-id");
define_feed_id!(RecordId, "record-id");

impl RecordId {
    /// Mints a fresh store identifier. UUIDv7 text sorts by creation time.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use tandem_feed::{Document, Fields, ParticipantId, Query, RecordId};

use crate::error::{InvalidFieldSnafu, MissingFieldSnafu, RecordError};

pub const DEFAULT_COLLECTION: &str = "chat";
pub const SENDER_FIELD: &str = "senderId";
pub const RECEIVER_FIELD: &str = "receiverId";
pub const BODY_FIELD: &str = "message";
pub const SENT_AT_FIELD: &str = "timeStamp";

const READABLE_TIME_FORMAT: &str = "%b %d, %Y - %I:%M %p";

/// Write-side shape of one message document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDocument {
    pub sender_id: ParticipantId,
    pub receiver_id: ParticipantId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl MessageDocument {
    pub fn new(
        sender_id: ParticipantId,
        receiver_id: ParticipantId,
        body: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sender_id,
            receiver_id,
            body: body.into(),
            sent_at,
        }
    }

    pub fn into_fields(self) -> Fields {
        Fields::from_iter([
            (
                SENDER_FIELD.to_string(),
                Value::String(self.sender_id.to_string()),
            ),
            (
                RECEIVER_FIELD.to_string(),
                Value::String(self.receiver_id.to_string()),
            ),
            (BODY_FIELD.to_string(), Value::String(self.body)),
            (
                SENT_AT_FIELD.to_string(),
                Value::String(self.sent_at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            ),
        ])
    }
}

/// How a message relates to the local participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageDirection {
    Sent,
    Received,
}

/// One materialized message. Never mutated once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: RecordId,
    pub sender_id: ParticipantId,
    pub receiver_id: ParticipantId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    /// `senderId`, `receiverId` and `timeStamp` are required; an absent body
    /// decodes as empty text.
    pub fn from_document(document: &Document) -> Result<Self, RecordError> {
        let sender_id: String = required_field(&document.fields, SENDER_FIELD)?;
        let receiver_id: String = required_field(&document.fields, RECEIVER_FIELD)?;
        let sent_at: DateTime<Utc> = required_field(&document.fields, SENT_AT_FIELD)?;
        let body: Option<String> = optional_field(&document.fields, BODY_FIELD)?;

        Ok(Self {
            id: document.id.clone(),
            sender_id: ParticipantId::new(sender_id),
            receiver_id: ParticipantId::new(receiver_id),
            body: body.unwrap_or_default(),
            sent_at,
        })
    }

    pub fn direction(&self, local_id: &ParticipantId) -> MessageDirection {
        if &self.sender_id == local_id {
            MessageDirection::Sent
        } else {
            MessageDirection::Received
        }
    }

    /// Formats `sent_at` like "Oct 18, 2026 - 09:05 AM".
    pub fn readable_sent_at(&self) -> String {
        self.sent_at.format(READABLE_TIME_FORMAT).to_string()
    }
}

fn required_field<T: DeserializeOwned>(
    fields: &Fields,
    field: &'static str,
) -> Result<T, RecordError> {
    optional_field(fields, field)?.context(MissingFieldSnafu {
        stage: "decode-required-field",
        field,
    })
}

fn optional_field<T: DeserializeOwned>(
    fields: &Fields,
    field: &'static str,
) -> Result<Option<T>, RecordError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .context(InvalidFieldSnafu {
                stage: "decode-field",
                field,
            }),
    }
}

/// Supplies the local participant for the active session.
pub trait SessionIdentity: Send + Sync {
    fn local_id(&self) -> ParticipantId;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticIdentity(pub ParticipantId);

impl SessionIdentity for StaticIdentity {
    fn local_id(&self) -> ParticipantId {
        self.0.clone()
    }
}

/// The two participants of one conversation view, seen from the local side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub local: ParticipantId,
    pub remote: ParticipantId,
}

impl ConversationKey {
    pub fn new(local: ParticipantId, remote: ParticipantId) -> Self {
        Self { local, remote }
    }

    pub fn from_session(identity: &dyn SessionIdentity, remote: ParticipantId) -> Self {
        Self::new(identity.local_id(), remote)
    }

    pub fn is_self_conversation(&self) -> bool {
        self.local == self.remote
    }

    /// Sorted pair, identical for both participants' views.
    pub fn unordered_pair(&self) -> (&ParticipantId, &ParticipantId) {
        if self.local <= self.remote {
            (&self.local, &self.remote)
        } else {
            (&self.remote, &self.local)
        }
    }

    pub fn same_pair(&self, other: &Self) -> bool {
        self.unordered_pair() == other.unordered_pair()
    }

    pub fn outgoing_query(&self, collection: &str) -> Query {
        directional_query(collection, &self.local, &self.remote)
    }

    pub fn incoming_query(&self, collection: &str) -> Query {
        directional_query(collection, &self.remote, &self.local)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.local, self.remote)
    }
}

fn directional_query(collection: &str, sender: &ParticipantId, receiver: &ParticipantId) -> Query {
    Query::collection(collection)
        .where_eq(SENDER_FIELD, sender.as_str())
        .where_eq(RECEIVER_FIELD, receiver.as_str())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn document(fields: Value) -> Document {
        let Value::Object(fields) = fields else {
            panic!("fixture must be an object");
        };
        Document::new(RecordId::new("m1"), fields)
    }

    #[test]
    fn written_fields_decode_back_into_the_same_message() {
        let sent_at = Utc.with_ymd_and_hms(2026, 10, 18, 9, 5, 0).unwrap();
        let fields = MessageDocument::new("alice".into(), "bob".into(), "hi", sent_at).into_fields();
        let message = Message::from_document(&Document::new(RecordId::new("m1"), fields))
            .expect("well-formed document decodes");

        assert_eq!(message.sender_id.as_str(), "alice");
        assert_eq!(message.receiver_id.as_str(), "bob");
        assert_eq!(message.body, "hi");
        assert_eq!(message.sent_at, sent_at);
        assert_eq!(message.readable_sent_at(), "Oct 18, 2026 - 09:05 AM");
    }

    #[test]
    fn missing_required_fields_are_reported_by_name() {
        let error = Message::from_document(&document(json!({
            "senderId": "alice",
            "receiverId": "bob",
            "message": "no timestamp"
        })))
        .expect_err("timestamp is required");
        assert!(matches!(
            error,
            RecordError::MissingField {
                field: SENT_AT_FIELD,
                ..
            }
        ));

        let error = Message::from_document(&document(json!({
            "receiverId": "bob",
            "timeStamp": "2026-10-18T09:05:00Z"
        })))
        .expect_err("sender is required");
        assert!(matches!(
            error,
            RecordError::MissingField {
                field: SENDER_FIELD,
                ..
            }
        ));
    }

    #[test]
    fn wrongly_typed_fields_are_invalid_and_absent_body_is_empty() {
        let error = Message::from_document(&document(json!({
            "senderId": "alice",
            "receiverId": "bob",
            "timeStamp": "yesterday"
        })))
        .expect_err("timestamp must parse");
        assert!(matches!(
            error,
            RecordError::InvalidField {
                field: SENT_AT_FIELD,
                ..
            }
        ));

        let message = Message::from_document(&document(json!({
            "senderId": "alice",
            "receiverId": "bob",
            "timeStamp": "2026-10-18T09:05:00Z"
        })))
        .expect("body is optional");
        assert!(message.body.is_empty());
    }

    #[test]
    fn direction_follows_the_local_participant() {
        let message = Message::from_document(&document(json!({
            "senderId": "alice",
            "receiverId": "bob",
            "timeStamp": "2026-10-18T09:05:00Z"
        })))
        .expect("decodes");

        assert_eq!(message.direction(&"alice".into()), MessageDirection::Sent);
        assert_eq!(message.direction(&"bob".into()), MessageDirection::Received);
    }

    #[test]
    fn conversation_keys_build_mirrored_queries() {
        let key = ConversationKey::new("alice".into(), "bob".into());
        let mirrored = ConversationKey::from_session(&StaticIdentity("bob".into()), "alice".into());

        assert_eq!(key.outgoing_query("chat"), mirrored.incoming_query("chat"));
        assert_eq!(key.incoming_query("chat"), mirrored.outgoing_query("chat"));
        assert!(key.same_pair(&mirrored));
        assert_ne!(key, mirrored);
        assert!(!key.is_self_conversation());
        assert!(ConversationKey::new("a".into(), "a".into()).is_self_conversation());
    }
}

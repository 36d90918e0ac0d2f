use std::collections::HashSet;
use std::sync::Arc;

use tandem_feed::{Document, RecordId};

use crate::error::MalformedRecord;
use crate::message::Message;

/// Outcome of one batch apply.
#[derive(Debug, Default)]
pub struct ApplyResult {
    /// The timeline was empty immediately before this batch.
    pub initial_load: bool,
    pub inserted: usize,
    pub duplicates: usize,
    pub malformed: Vec<MalformedRecord>,
}

impl ApplyResult {
    pub fn changed(&self) -> bool {
        self.inserted > 0
    }
}

#[derive(Debug, Clone)]
struct Entry {
    arrival: u64,
    message: Message,
}

/// Ordered, deduplicated, grow-only message sequence for one conversation.
///
/// Ordered by `(sent_at, arrival)`, where `arrival` is the position at which a
/// record was first accepted. Equal timestamps therefore keep arrival order.
#[derive(Debug, Default)]
pub struct Timeline {
    entries: Vec<Entry>,
    seen: HashSet<RecordId>,
    next_arrival: u64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.seen.contains(id)
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|entry| &entry.message)
    }

    /// Applies the added records of one batch.
    ///
    /// Every record is decoded before the timeline is touched, so the batch lands
    /// as a whole. Malformed records are skipped and reported; known ids are
    /// skipped silently.
    pub fn apply_added(&mut self, batch: &[Document]) -> ApplyResult {
        let mut result = ApplyResult {
            initial_load: self.is_empty(),
            ..ApplyResult::default()
        };

        let mut accepted: Vec<Message> = Vec::with_capacity(batch.len());
        let mut batch_ids: HashSet<&RecordId> = HashSet::with_capacity(batch.len());
        for document in batch {
            if self.seen.contains(&document.id) || !batch_ids.insert(&document.id) {
                result.duplicates += 1;
                continue;
            }

            match Message::from_document(document) {
                Ok(message) => accepted.push(message),
                Err(error) => result.malformed.push(MalformedRecord {
                    record_id: document.id.clone(),
                    error,
                }),
            }
        }

        result.inserted = accepted.len();
        if accepted.is_empty() {
            return result;
        }

        for message in accepted {
            self.seen.insert(message.id.clone());
            self.entries.push(Entry {
                arrival: self.next_arrival,
                message,
            });
            self.next_arrival += 1;
        }
        self.entries
            .sort_by_key(|entry| (entry.message.sent_at, entry.arrival));

        result
    }

    pub fn snapshot(&self, revision: u64) -> TimelineSnapshot {
        TimelineSnapshot {
            revision,
            messages: self.messages().cloned().collect(),
        }
    }
}

/// Immutable copy of a timeline handed to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimelineSnapshot {
    /// Incremented once per published change; 0 means nothing was published yet.
    pub revision: u64,
    pub messages: Arc<[Message]>,
}

impl TimelineSnapshot {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.messages.iter().map(|message| message.id.clone()).collect()
    }
}

use serde_json::{Map, Value};

use super::ids::RecordId;

/// Field map of one stored document.
pub type Fields = Map<String, Value>;

/// One record in a feed collection, as the store hands it out.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: RecordId,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: RecordId, fields: Fields) -> Self {
        Self { id, fields }
    }

    pub fn field_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldFilter {
    pub field: String,
    pub value: String,
}

/// Equality-filtered live query. All filters must hold; there is no OR.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<FieldFilter>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.filters
            .iter()
            .all(|filter| document.field_str(&filter.field) == Some(filter.value.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub document: Document,
}

impl ChangeEvent {
    pub fn added(document: Document) -> Self {
        Self {
            kind: ChangeKind::Added,
            document,
        }
    }

    pub fn modified(document: Document) -> Self {
        Self {
            kind: ChangeKind::Modified,
            document,
        }
    }

    pub fn removed(document: Document) -> Self {
        Self {
            kind: ChangeKind::Removed,
            document,
        }
    }
}

/// Events delivered together by one listener invocation.
pub type ChangeBatch = Vec<ChangeEvent>;

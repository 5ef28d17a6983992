//! Filtered, ordered and paginated document queries.
//!
//! Queries always target one collection. Filters compare JSON values found
//! under a dotted path of the document body (`"state.name"`); a missing path
//! reads as `null`.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use jobdoc_core::Document;

use super::r#trait::{StoreError, StoredDocument};

/// Filter on a JSON path of the document body.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldFilter {
    Eq { path: Vec<String>, value: JsonValue },
    OneOf { path: Vec<String>, values: Vec<JsonValue> },
    IsNull { path: Vec<String> },
    NotNull { path: Vec<String> },
    /// RFC 3339 timestamp strictly earlier than `at`; null or non-timestamp
    /// values never match.
    Before { path: Vec<String>, at: DateTime<Utc> },
}

impl FieldFilter {
    pub fn path(&self) -> &[String] {
        match self {
            FieldFilter::Eq { path, .. }
            | FieldFilter::OneOf { path, .. }
            | FieldFilter::IsNull { path }
            | FieldFilter::NotNull { path }
            | FieldFilter::Before { path, .. } => path,
        }
    }

    pub fn matches(&self, body: &JsonValue) -> bool {
        let found = lookup(body, self.path());
        match self {
            FieldFilter::Eq { value, .. } => found == value,
            FieldFilter::OneOf { values, .. } => values.iter().any(|v| v == found),
            FieldFilter::IsNull { .. } => found.is_null(),
            FieldFilter::NotNull { .. } => !found.is_null(),
            FieldFilter::Before { at, .. } => found
                .as_str()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .is_some_and(|t| t.with_timezone(&Utc) < *at),
        }
    }
}

static NULL: JsonValue = JsonValue::Null;

fn lookup<'a>(body: &'a JsonValue, path: &[String]) -> &'a JsonValue {
    let mut current = body;
    for segment in path {
        match current.get(segment.as_str()) {
            Some(next) => current = next,
            None => return &NULL,
        }
    }
    current
}

fn split_path(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

/// Result ordering (by creation sequence).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Order {
    /// Oldest first.
    #[default]
    Arrival,
    /// Newest first.
    ArrivalDesc,
}

/// Query over a single collection.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentQuery {
    pub collection: String,
    pub filters: Vec<FieldFilter>,
    pub order: Order,
    pub skip: usize,
    pub take: Option<usize>,
}

impl DocumentQuery {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order: Order::Arrival,
            skip: 0,
            take: None,
        }
    }

    /// Query over the collection of a document kind.
    pub fn of<T: Document>() -> Self {
        Self::collection(T::COLLECTION)
    }

    pub fn where_eq(mut self, path: &str, value: impl Into<JsonValue>) -> Self {
        self.filters.push(FieldFilter::Eq {
            path: split_path(path),
            value: value.into(),
        });
        self
    }

    pub fn where_in<I, V>(mut self, path: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        self.filters.push(FieldFilter::OneOf {
            path: split_path(path),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn where_null(mut self, path: &str) -> Self {
        self.filters.push(FieldFilter::IsNull {
            path: split_path(path),
        });
        self
    }

    pub fn where_not_null(mut self, path: &str) -> Self {
        self.filters.push(FieldFilter::NotNull {
            path: split_path(path),
        });
        self
    }

    pub fn where_before(mut self, path: &str, at: DateTime<Utc>) -> Self {
        self.filters.push(FieldFilter::Before {
            path: split_path(path),
            at,
        });
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn take(mut self, take: usize) -> Self {
        self.take = Some(take);
        self
    }

    /// Reject queries no backend can evaluate.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.collection.is_empty() {
            return Err(StoreError::InvalidQuery("collection must not be empty".to_string()));
        }
        if let Some(bad) = self
            .filters
            .iter()
            .find(|f| f.path().is_empty() || f.path().iter().any(String::is_empty))
        {
            return Err(StoreError::InvalidQuery(format!(
                "malformed filter path '{}'",
                bad.path().join(".")
            )));
        }
        Ok(())
    }

    pub fn matches(&self, document: &StoredDocument) -> bool {
        document.id.collection() == self.collection
            && self.filters.iter().all(|f| f.matches(&document.body))
    }

    /// Sort and paginate documents that already passed [`Self::matches`].
    pub fn finish(&self, mut documents: Vec<StoredDocument>) -> Vec<StoredDocument> {
        match self.order {
            Order::Arrival => documents.sort_by_key(|d| d.sequence),
            Order::ArrivalDesc => documents.sort_by(|a, b| b.sequence.cmp(&a.sequence)),
        }

        let iter = documents.into_iter().skip(self.skip);
        match self.take {
            Some(take) => iter.take(take).collect(),
            None => iter.collect(),
        }
    }
}

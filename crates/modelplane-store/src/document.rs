//! Document persistence contract
//!
//! The control plane only needs per-document CRUD, term search, bulk writes
//! and existence checks. Conditional writes carry an optimistic-concurrency
//! token (sequence number + primary term); a stale token fails with
//! `VersionConflict` instead of overwriting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use modelplane_core::ModelPlaneResult;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Optimistic-concurrency token of a stored document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyToken {
    pub seq_no: u64,
    pub primary_term: u64,
}

/// A stored document
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub source: Value,
    pub token: ConcurrencyToken,
}

/// Outcome of a write
#[derive(Debug, Clone)]
pub struct WriteResult {
    pub id: String,
    pub token: ConcurrencyToken,
    /// True when the write created the document
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Term search: every filter must match; a filter matches when the field equals
/// one of its values, or when the field is an array containing one of them.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub filters: Vec<(String, Vec<Value>)>,
    pub sort: Option<(String, SortOrder)>,
    pub size: Option<usize>,
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn term(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push((field.to_string(), vec![value.into()]));
        self
    }

    pub fn terms(mut self, field: &str, values: Vec<Value>) -> Self {
        self.filters.push((field.to_string(), values));
        self
    }

    pub fn sort(mut self, field: &str, order: SortOrder) -> Self {
        self.sort = Some((field.to_string(), order));
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Whether a document source satisfies every filter
    pub fn matches(&self, source: &Value) -> bool {
        self.filters.iter().all(|(field, values)| match source.get(field) {
            Some(Value::Array(items)) => items.iter().any(|item| values.contains(item)),
            Some(value) => values.contains(value),
            None => false,
        })
    }

    /// Order two documents by the sort field, missing values last
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let Some((field, order)) = &self.sort else {
            return Ordering::Equal;
        };
        let ordering = match (a.get(field), b.get(field)) {
            (Some(x), Some(y)) => compare_values(x, y),
            (Some(_), None) => return Ordering::Less,
            (None, Some(_)) => return Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => {
            // Timestamps are stored as RFC 3339 strings whose fraction width varies
            match (x.parse::<DateTime<Utc>>(), y.parse::<DateTime<Utc>>()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        _ => Ordering::Equal,
    }
}

/// Persistence backend
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Get a document by id; `None` when the index or document is missing
    async fn get(&self, index: &str, id: &str) -> ModelPlaneResult<Option<Document>>;

    /// Create a document; fails with `VersionConflict` if it already exists
    async fn create(&self, index: &str, id: &str, source: Value) -> ModelPlaneResult<WriteResult>;

    /// Create or replace a document, optionally conditional on a token
    async fn put(
        &self,
        index: &str,
        id: &str,
        source: Value,
        condition: Option<ConcurrencyToken>,
    ) -> ModelPlaneResult<WriteResult>;

    /// Merge top-level fields into an existing document
    async fn update(
        &self,
        index: &str,
        id: &str,
        fields: Map<String, Value>,
        condition: Option<ConcurrencyToken>,
    ) -> ModelPlaneResult<WriteResult>;

    /// Delete a document; returns whether it existed
    async fn delete(&self, index: &str, id: &str) -> ModelPlaneResult<bool>;

    /// Delete every document whose `field` equals `value`; returns the count
    async fn delete_by_term(&self, index: &str, field: &str, value: Value) -> ModelPlaneResult<u64>;

    /// Term search; fails with `ResourceNotFound` when the index is missing
    async fn search(&self, index: &str, query: &SearchQuery) -> ModelPlaneResult<Vec<Document>>;

    /// Create or replace many documents
    async fn bulk_put(
        &self,
        index: &str,
        docs: Vec<(String, Value)>,
    ) -> ModelPlaneResult<Vec<WriteResult>>;

    /// Whether a document exists
    async fn exists(&self, index: &str, id: &str) -> ModelPlaneResult<bool>;

    /// Whether an index exists
    async fn index_exists(&self, index: &str) -> ModelPlaneResult<bool>;
}

//! In-memory document store

use async_trait::async_trait;
use modelplane_core::{ModelPlaneError, ModelPlaneResult};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use crate::document::{ConcurrencyToken, Document, DocumentStore, SearchQuery, WriteResult};

const PRIMARY_TERM: u64 = 1;

#[derive(Debug, Clone)]
struct StoredDoc {
    source: Value,
    seq_no: u64,
}

type Index = HashMap<String, StoredDoc>;

/// Document store kept in process memory.
///
/// Indices are created on first write, sequence numbers are global and
/// strictly increasing.
pub struct MemoryStore {
    indices: RwLock<HashMap<String, Index>>,
    next_seq_no: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(HashMap::new()),
            next_seq_no: AtomicU64::new(0),
        }
    }

    fn next_token(&self) -> ConcurrencyToken {
        ConcurrencyToken {
            seq_no: self.next_seq_no.fetch_add(1, Ordering::SeqCst),
            primary_term: PRIMARY_TERM,
        }
    }

    /// Number of documents in an index
    pub async fn count(&self, index: &str) -> usize {
        let indices = self.indices.read().await;
        indices.get(index).map_or(0, HashMap::len)
    }

    fn check_condition(
        index: &str,
        id: &str,
        existing: Option<&StoredDoc>,
        condition: Option<ConcurrencyToken>,
    ) -> ModelPlaneResult<()> {
        let Some(expected) = condition else {
            return Ok(());
        };
        match existing {
            Some(doc) if doc.seq_no == expected.seq_no && expected.primary_term == PRIMARY_TERM => {
                Ok(())
            }
            _ => Err(ModelPlaneError::VersionConflict(format!("{}/{}", index, id))),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, index: &str, id: &str) -> ModelPlaneResult<Option<Document>> {
        let indices = self.indices.read().await;
        Ok(indices.get(index).and_then(|docs| docs.get(id)).map(|doc| Document {
            id: id.to_string(),
            source: doc.source.clone(),
            token: ConcurrencyToken {
                seq_no: doc.seq_no,
                primary_term: PRIMARY_TERM,
            },
        }))
    }

    async fn create(&self, index: &str, id: &str, source: Value) -> ModelPlaneResult<WriteResult> {
        let mut indices = self.indices.write().await;
        let docs = indices.entry(index.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(ModelPlaneError::VersionConflict(format!(
                "{}/{} already exists",
                index, id
            )));
        }
        let token = self.next_token();
        docs.insert(
            id.to_string(),
            StoredDoc {
                source,
                seq_no: token.seq_no,
            },
        );
        debug!(index = index, id = id, seq_no = token.seq_no, "Created document");
        Ok(WriteResult {
            id: id.to_string(),
            token,
            created: true,
        })
    }

    async fn put(
        &self,
        index: &str,
        id: &str,
        source: Value,
        condition: Option<ConcurrencyToken>,
    ) -> ModelPlaneResult<WriteResult> {
        let mut indices = self.indices.write().await;
        let docs = indices.entry(index.to_string()).or_default();
        Self::check_condition(index, id, docs.get(id), condition)?;
        let token = self.next_token();
        let previous = docs.insert(
            id.to_string(),
            StoredDoc {
                source,
                seq_no: token.seq_no,
            },
        );
        Ok(WriteResult {
            id: id.to_string(),
            token,
            created: previous.is_none(),
        })
    }

    async fn update(
        &self,
        index: &str,
        id: &str,
        fields: Map<String, Value>,
        condition: Option<ConcurrencyToken>,
    ) -> ModelPlaneResult<WriteResult> {
        let mut indices = self.indices.write().await;
        let doc = indices
            .get_mut(index)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| ModelPlaneError::not_found(format!("document {}/{}", index, id)))?;
        Self::check_condition(index, id, Some(doc), condition)?;

        let Value::Object(object) = &mut doc.source else {
            return Err(ModelPlaneError::Internal(format!(
                "document {}/{} is not an object",
                index, id
            )));
        };
        object.extend(fields);
        let token = self.next_token();
        doc.seq_no = token.seq_no;

        Ok(WriteResult {
            id: id.to_string(),
            token,
            created: false,
        })
    }

    async fn delete(&self, index: &str, id: &str) -> ModelPlaneResult<bool> {
        let mut indices = self.indices.write().await;
        Ok(indices
            .get_mut(index)
            .and_then(|docs| docs.remove(id))
            .is_some())
    }

    async fn delete_by_term(&self, index: &str, field: &str, value: Value) -> ModelPlaneResult<u64> {
        let mut indices = self.indices.write().await;
        let Some(docs) = indices.get_mut(index) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, doc| doc.source.get(field) != Some(&value));
        let removed = (before - docs.len()) as u64;
        debug!(index = index, field = field, removed = removed, "Deleted by term");
        Ok(removed)
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> ModelPlaneResult<Vec<Document>> {
        let indices = self.indices.read().await;
        let docs = indices
            .get(index)
            .ok_or_else(|| ModelPlaneError::not_found(format!("index {}", index)))?;

        let mut hits: Vec<Document> = docs
            .iter()
            .filter(|(_, doc)| query.matches(&doc.source))
            .map(|(id, doc)| Document {
                id: id.clone(),
                source: doc.source.clone(),
                token: ConcurrencyToken {
                    seq_no: doc.seq_no,
                    primary_term: PRIMARY_TERM,
                },
            })
            .collect();
        hits.sort_by(|a, b| query.compare(&a.source, &b.source));
        if let Some(size) = query.size {
            hits.truncate(size);
        }
        Ok(hits)
    }

    async fn bulk_put(
        &self,
        index: &str,
        docs: Vec<(String, Value)>,
    ) -> ModelPlaneResult<Vec<WriteResult>> {
        let mut results = Vec::with_capacity(docs.len());
        for (id, source) in docs {
            results.push(self.put(index, &id, source, None).await?);
        }
        Ok(results)
    }

    async fn exists(&self, index: &str, id: &str) -> ModelPlaneResult<bool> {
        let indices = self.indices.read().await;
        Ok(indices.get(index).is_some_and(|docs| docs.contains_key(id)))
    }

    async fn index_exists(&self, index: &str) -> ModelPlaneResult<bool> {
        let indices = self.indices.read().await;
        Ok(indices.contains_key(index))
    }
}

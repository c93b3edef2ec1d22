use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::StoreError;
use crate::models::TermKey;
use crate::normalize::storage_key;

#[cfg(test)]
pub mod memory;
pub mod postgres;

pub const MAX_BATCH_OPS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath {
    pub collection: String,
    pub id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self, collection: &str) -> Result<T, StoreError> {
        decode_value(&DocPath::new(collection, self.id.clone()), self.data.clone())
    }
}

pub fn decode_value<T: DeserializeOwned>(path: &DocPath, data: Value) -> Result<T, StoreError> {
    serde_json::from_value(data).map_err(|source| StoreError::Decode {
        path: path.to_string(),
        source,
    })
}

pub fn encode_value<T: serde::Serialize>(path: &DocPath, doc: &T) -> Result<Value, StoreError> {
    serde_json::to_value(doc).map_err(|source| StoreError::Encode {
        path: path.to_string(),
        source,
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    fields: Map<String, Value>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    #[cfg(test)]
    pub fn matches(&self, data: &Value) -> bool {
        self.fields
            .iter()
            .all(|(field, expected)| data.get(field) == Some(expected))
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set { path: DocPath, data: Value },
    // shallow, creates the document if absent
    Merge { path: DocPath, data: Value },
    Delete { path: DocPath },
}

#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new(ops: Vec<WriteOp>) -> Result<Self, StoreError> {
        if ops.len() > MAX_BATCH_OPS {
            return Err(StoreError::BatchTooLarge {
                ops: ops.len(),
                max: MAX_BATCH_OPS,
            });
        }
        Ok(Self { ops })
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Exclusive hold on a named lock, released on drop.
pub struct Lease {
    _held: Box<dyn Send>,
}

impl Lease {
    pub fn new(held: impl Send + 'static) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &DocPath) -> Result<Option<Value>, StoreError>;

    async fn scan(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError>;

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Wait until no other holder of `key` remains, across every process
    /// sharing this store.
    async fn lock(&self, key: &str) -> Result<Lease, StoreError>;
}

/// Returns the number of batches written. Earlier batches stay committed
/// when a later one fails.
pub async fn commit_chunked(
    store: &dyn DocumentStore,
    mut ops: Vec<WriteOp>,
) -> Result<usize, StoreError> {
    let mut batches = 0usize;
    while !ops.is_empty() {
        let rest = ops.split_off(ops.len().min(MAX_BATCH_OPS));
        let batch = WriteBatch::new(ops)?;
        debug!(batch = batches, ops = batch.len(), "committing write batch");
        store.commit(batch).await?;
        batches += 1;
        ops = rest;
    }
    Ok(batches)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchoolPaths {
    school_id: String,
    root: String,
}

impl SchoolPaths {
    pub fn new(school_id: &str) -> Self {
        Self {
            school_id: school_id.to_string(),
            root: format!("schools/{school_id}"),
        }
    }

    pub fn school(&self) -> DocPath {
        DocPath::new("schools", self.school_id.clone())
    }

    pub fn snapshots(&self) -> String {
        format!("{}/snapshots", self.root)
    }

    pub fn snapshot(&self, snapshot_id: &str) -> DocPath {
        DocPath::new(self.snapshots(), snapshot_id)
    }

    pub fn rows(&self, snapshot_id: &str) -> String {
        format!("{}/snapshots/{snapshot_id}/rows", self.root)
    }

    pub fn row(&self, snapshot_id: &str, external_id: &str) -> DocPath {
        DocPath::new(self.rows(snapshot_id), storage_key(external_id))
    }

    pub fn uploads(&self) -> String {
        format!("{}/uploads", self.root)
    }

    pub fn upload(&self, upload_id: &str) -> DocPath {
        DocPath::new(self.uploads(), upload_id)
    }

    pub fn leaderboards(&self) -> String {
        format!("{}/leaderboards", self.root)
    }

    pub fn leaderboard(&self, term: TermKey) -> DocPath {
        DocPath::new(self.leaderboards(), term.doc_id())
    }

    pub fn roster(&self) -> String {
        format!("{}/roster", self.root)
    }

    pub fn roster_entry(&self, external_id: &str) -> DocPath {
        DocPath::new(self.roster(), storage_key(external_id))
    }
}

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{DocPath, Document, DocumentStore, Filter, Lease, WriteBatch, WriteOp};
use crate::error::StoreError;

#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<BTreeMap<DocPath, Value>>,
    commits: AtomicUsize,
    fail_after: Mutex<Option<usize>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Every commit after `successful` more batches returns `Unavailable`.
    pub async fn fail_commits_after(&self, successful: usize) {
        *self.fail_after.lock().await = Some(self.commits() + successful);
    }

    pub async fn heal(&self) {
        *self.fail_after.lock().await = None;
    }

    pub async fn count(&self, collection: &str) -> usize {
        self.docs
            .lock()
            .await
            .keys()
            .filter(|path| path.collection == collection)
            .count()
    }

    pub async fn put(&self, path: DocPath, data: Value) {
        self.docs.lock().await.insert(path, data);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Value>, StoreError> {
        Ok(self.docs.lock().await.get(path).cloned())
    }

    async fn scan(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .docs
            .lock()
            .await
            .iter()
            .filter(|(path, data)| path.collection == collection && filter.matches(data))
            .map(|(path, data)| Document {
                id: path.id.clone(),
                data: data.clone(),
            })
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if let Some(limit) = *self.fail_after.lock().await {
            if self.commits() >= limit {
                return Err(StoreError::Unavailable("injected commit failure".to_string()));
            }
        }

        let mut docs = self.docs.lock().await;
        for op in batch.into_ops() {
            match op {
                WriteOp::Set { path, data } => {
                    docs.insert(path, data);
                }
                WriteOp::Merge { path, data } => {
                    let entry = docs
                        .entry(path)
                        .or_insert_with(|| Value::Object(Default::default()));
                    if let (Value::Object(target), Value::Object(patch)) = (entry, data) {
                        for (key, value) in patch {
                            target.insert(key, value);
                        }
                    }
                }
                WriteOp::Delete { path } => {
                    docs.remove(&path);
                }
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn lock(&self, key: &str) -> Result<Lease, StoreError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(key.to_string()).or_default().clone()
        };
        Ok(Lease::new(lock.lock_owned().await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::commit_chunked;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn chunked_commits_split_at_batch_limit() {
        let store = MemoryStore::new();
        let ops: Vec<WriteOp> = (0..1_203)
            .map(|i| WriteOp::Set {
                path: DocPath::new("rows", format!("{i:05}")),
                data: json!({ "n": i }),
            })
            .collect();

        let batches = commit_chunked(&store, ops).await.unwrap();
        assert_eq!(batches, 3);
        assert_eq!(store.commits(), 3);
        assert_eq!(store.count("rows").await, 1_203);
    }

    #[tokio::test]
    async fn earlier_batches_survive_a_later_failure() {
        let store = MemoryStore::new();
        store.fail_commits_after(1).await;
        let ops: Vec<WriteOp> = (0..700)
            .map(|i| WriteOp::Set {
                path: DocPath::new("rows", format!("{i:05}")),
                data: json!({ "n": i }),
            })
            .collect();

        let err = commit_chunked(&store, ops).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.count("rows").await, 500);
    }

    #[tokio::test]
    async fn lock_is_exclusive_per_key() {
        let store = MemoryStore::new();
        let held = store.lock("a").await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(20), store.lock("a"))
            .await
            .is_err());
        store.lock("b").await.unwrap();
        drop(held);
        store.lock("a").await.unwrap();
    }

    #[tokio::test]
    async fn merge_keeps_untouched_fields() {
        let store = MemoryStore::new();
        let path = DocPath::new("c", "a");
        store.put(path.clone(), json!({ "x": 1, "y": 2 })).await;
        store
            .commit(
                WriteBatch::new(vec![WriteOp::Merge {
                    path: path.clone(),
                    data: json!({ "y": 3, "z": 4 }),
                }])
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            store.get(&path).await.unwrap(),
            Some(json!({ "x": 1, "y": 3, "z": 4 }))
        );
    }
}

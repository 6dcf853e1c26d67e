use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::store::{Commit, Filter, TransactionalStore, VersionedDoc, WriteOp};

#[derive(Debug, Clone)]
struct Stored {
    version: u64,
    data: Value,
}

/// In-memory reference implementation of [`TransactionalStore`]: versioned
/// JSON documents with optimistic commit-time conflict detection. Point reads
/// and queries are lock-free; commits serialize behind a single mutex so the
/// validate-then-apply step is atomic.
#[derive(Default)]
pub struct MemoryStore {
    docs: DashMap<(String, String), Stored>,
    commit_lock: Mutex<()>,
    injected_conflicts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a conflict. Test hook for
    /// exercising the retry layer.
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    fn key(collection: &str, id: &str) -> (String, String) {
        (collection.to_string(), id.to_string())
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    async fn get(
        &self,
        collection: &'static str,
        id: &str,
    ) -> Result<Option<VersionedDoc>, StoreError> {
        Ok(self.docs.get(&Self::key(collection, id)).map(|entry| {
            VersionedDoc {
                id: id.to_string(),
                version: entry.version,
                data: entry.data.clone(),
            }
        }))
    }

    async fn query(
        &self,
        collection: &'static str,
        filters: &[Filter],
    ) -> Result<Vec<VersionedDoc>, StoreError> {
        let mut results: Vec<VersionedDoc> = self
            .docs
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .filter(|entry| {
                filters
                    .iter()
                    .all(|f| entry.value().data.get(&f.field) == Some(&f.equals))
            })
            .map(|entry| VersionedDoc {
                id: entry.key().1.clone(),
                version: entry.value().version,
                data: entry.value().data.clone(),
            })
            .collect();

        // Deterministic order for callers that iterate.
        results.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(results)
    }

    async fn commit(&self, commit: Commit) -> Result<(), StoreError> {
        let _guard = self.commit_lock.lock().await;

        if self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Conflict("injected conflict".to_string()));
        }

        for stamp in &commit.reads {
            let current = self
                .docs
                .get(&Self::key(stamp.collection, &stamp.id))
                .map(|entry| entry.version);
            if current != stamp.version {
                return Err(StoreError::Conflict(format!(
                    "{}/{} changed since read (read {:?}, now {:?})",
                    stamp.collection, stamp.id, stamp.version, current
                )));
            }
        }

        for write in commit.writes {
            match write {
                WriteOp::Set {
                    collection,
                    id,
                    data,
                } => {
                    let key = Self::key(collection, &id);
                    let version = self.docs.get(&key).map(|e| e.version).unwrap_or(0) + 1;
                    self.docs.insert(key, Stored { version, data });
                }
                WriteOp::Delete { collection, id } => {
                    self.docs.remove(&Self::key(collection, &id));
                }
            }
        }

        Ok(())
    }
}

pub mod memory;
pub mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::StoreError;

/// Collection names used by the dispatch engine.
pub mod collections {
    pub const BOOKINGS: &str = "bookings";
    pub const ASSIGNMENTS: &str = "assignments";
    pub const DRIVERS: &str = "drivers";
    pub const DRIVER_AVAILABILITY: &str = "driver_availability";
    pub const RETRY_TASKS: &str = "retry_tasks";
    pub const STATE_TRANSITIONS: &str = "state_transitions";
}

/// A stored document plus the version stamp used for conflict detection.
#[derive(Debug, Clone)]
pub struct VersionedDoc {
    pub id: String,
    pub version: u64,
    pub data: Value,
}

/// Equality filter on a top-level document field. Richer predicates are
/// applied in code after the fetch.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub equals: Value,
}

impl Filter {
    pub fn eq(field: &str, value: impl Serialize) -> Self {
        Self {
            field: field.to_string(),
            equals: serde_json::to_value(value).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WriteOp {
    Set {
        collection: &'static str,
        id: String,
        data: Value,
    },
    Delete {
        collection: &'static str,
        id: String,
    },
}

/// Version observed when a document was read inside a transaction.
/// `version == None` records that the document was absent.
#[derive(Debug, Clone)]
pub struct ReadStamp {
    pub collection: &'static str,
    pub id: String,
    pub version: Option<u64>,
}

/// An atomic commit: applied only if every read stamp still matches the
/// current version of its document.
#[derive(Debug, Clone, Default)]
pub struct Commit {
    pub reads: Vec<ReadStamp>,
    pub writes: Vec<WriteOp>,
}

/// The persistence contract required by the dispatch engine: per-document
/// atomic writes and optimistic serializable commits. Any ACID-capable store
/// can sit behind this trait; [`memory::MemoryStore`] is the reference
/// implementation.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn get(&self, collection: &'static str, id: &str)
    -> Result<Option<VersionedDoc>, StoreError>;

    async fn query(
        &self,
        collection: &'static str,
        filters: &[Filter],
    ) -> Result<Vec<VersionedDoc>, StoreError>;

    /// Atomically apply `commit.writes` iff every read stamp is still current.
    /// Fails with [`StoreError::Conflict`] otherwise.
    async fn commit(&self, commit: Commit) -> Result<(), StoreError>;
}

/// Unconditional atomic batch (empty read set).
pub async fn batch_write(
    store: &dyn TransactionalStore,
    writes: Vec<WriteOp>,
) -> Result<(), StoreError> {
    store
        .commit(Commit {
            reads: Vec::new(),
            writes,
        })
        .await
}

/// Typed point read outside any transaction.
pub async fn fetch<T: DeserializeOwned>(
    store: &dyn TransactionalStore,
    collection: &'static str,
    id: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(collection, id).await? {
        Some(doc) => Ok(Some(serde_json::from_value(doc.data)?)),
        None => Ok(None),
    }
}

/// Typed query outside any transaction.
pub async fn query_as<T: DeserializeOwned>(
    store: &dyn TransactionalStore,
    collection: &'static str,
    filters: &[Filter],
) -> Result<Vec<T>, StoreError> {
    let docs = store.query(collection, filters).await?;
    docs.into_iter()
        .map(|doc| serde_json::from_value(doc.data).map_err(StoreError::from))
        .collect()
}

/// Unit-of-work handle. Records a read stamp per `get` and stages writes;
/// nothing touches the store until the retry layer commits. Reads see the
/// transaction's own staged writes.
pub struct Tx {
    store: Arc<dyn TransactionalStore>,
    reads: Vec<ReadStamp>,
    writes: Vec<WriteOp>,
}

impl Tx {
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self {
            store,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    pub async fn get<T: DeserializeOwned>(
        &mut self,
        collection: &'static str,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        for write in self.writes.iter().rev() {
            match write {
                WriteOp::Set {
                    collection: c,
                    id: i,
                    data,
                } if *c == collection && i == id => {
                    return Ok(Some(serde_json::from_value(data.clone())?));
                }
                WriteOp::Delete {
                    collection: c,
                    id: i,
                } if *c == collection && i == id => return Ok(None),
                _ => {}
            }
        }

        let doc = self.store.get(collection, id).await?;

        let already_stamped = self
            .reads
            .iter()
            .any(|r| r.collection == collection && r.id == id);
        if !already_stamped {
            self.reads.push(ReadStamp {
                collection,
                id: id.to_string(),
                version: doc.as_ref().map(|d| d.version),
            });
        }

        match doc {
            Some(doc) => Ok(Some(serde_json::from_value(doc.data)?)),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize>(
        &mut self,
        collection: &'static str,
        id: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_value(value)?;
        self.writes.push(WriteOp::Set {
            collection,
            id: id.to_string(),
            data,
        });
        Ok(())
    }

    pub fn delete(&mut self, collection: &'static str, id: &str) {
        self.writes.push(WriteOp::Delete {
            collection,
            id: id.to_string(),
        });
    }

    pub fn into_commit(self) -> Commit {
        Commit {
            reads: self.reads,
            writes: self.writes,
        }
    }
}

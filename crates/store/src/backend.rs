use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StoreError;
use crate::types::{Author, Record};

/// Everything a backend holds, as loaded at open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub records: Vec<Record>,
    pub authors: Vec<Author>,
}

/// Upserts accumulated since the last commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub records: Vec<Record>,
    pub authors: Vec<Author>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len() + self.authors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.authors.is_empty()
    }
}

/// Durable storage behind a [`RecordStore`](crate::RecordStore).
///
/// `persist` must be all-or-nothing: after an error, the backend holds
/// exactly what it held before the call.
pub trait StorageBackend: Send + Sync {
    fn load(&self) -> Result<Snapshot, StoreError>;
    fn persist(&self, batch: &Batch) -> Result<(), StoreError>;
}

impl<T: StorageBackend + ?Sized> StorageBackend for Arc<T> {
    fn load(&self) -> Result<Snapshot, StoreError> {
        (**self).load()
    }

    fn persist(&self, batch: &Batch) -> Result<(), StoreError> {
        (**self).persist(batch)
    }
}

/// In-process backend. Data lives as long as the value.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<Snapshot>,
    fail_persist: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `persist` fail until cleared.
    pub fn set_fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Snapshot {
        self.data.lock().clone()
    }
}

fn upsert_by<T: Clone>(items: &mut Vec<T>, incoming: &[T], key: impl Fn(&T) -> &str) {
    for item in incoming {
        match items.iter_mut().find(|existing| key(existing) == key(item)) {
            Some(existing) => *existing = item.clone(),
            None => items.push(item.clone()),
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&self) -> Result<Snapshot, StoreError> {
        Ok(self.data.lock().clone())
    }

    fn persist(&self, batch: &Batch) -> Result<(), StoreError> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected persist failure".to_string()));
        }

        let mut data = self.data.lock();
        upsert_by(&mut data.records, &batch.records, |r| r.sha.as_str());
        upsert_by(&mut data.authors, &batch.authors, |a| a.name.as_str());
        Ok(())
    }
}

#[cfg(feature = "rocksdb")]
pub mod rocks {
    use super::*;
    use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
    use serde::de::DeserializeOwned;
    use std::path::Path;

    const CF_RECORDS: &str = "records";
    const CF_AUTHORS: &str = "authors";

    /// RocksDB backend. Records and authors live in separate column
    /// families, keyed by sha and name, with bincode values.
    pub struct RocksBackend {
        db: DB,
    }

    impl RocksBackend {
        pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
            let mut opts = Options::default();
            opts.create_if_missing(true);
            opts.create_missing_column_families(true);

            let cfs = vec![
                ColumnFamilyDescriptor::new(CF_RECORDS, Options::default()),
                ColumnFamilyDescriptor::new(CF_AUTHORS, Options::default()),
            ];

            let db = DB::open_cf_descriptors(&opts, path, cfs)
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            Ok(Self { db })
        }

        fn load_cf<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, StoreError> {
            let cf = self
                .db
                .cf_handle(name)
                .ok_or_else(|| StoreError::Backend(format!("CF {} not found", name)))?;

            let mut items = Vec::new();
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (_, value) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
                let decoded = bincode::deserialize(&value)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                items.push(decoded);
            }
            Ok(items)
        }
    }

    impl StorageBackend for RocksBackend {
        fn load(&self) -> Result<Snapshot, StoreError> {
            Ok(Snapshot {
                records: self.load_cf(CF_RECORDS)?,
                authors: self.load_cf(CF_AUTHORS)?,
            })
        }

        fn persist(&self, batch: &Batch) -> Result<(), StoreError> {
            let cf_records = self
                .db
                .cf_handle(CF_RECORDS)
                .ok_or_else(|| StoreError::Backend("CF records not found".to_string()))?;
            let cf_authors = self
                .db
                .cf_handle(CF_AUTHORS)
                .ok_or_else(|| StoreError::Backend("CF authors not found".to_string()))?;

            let mut write = WriteBatch::default();
            for record in &batch.records {
                let bytes = bincode::serialize(record)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                write.put_cf(cf_records, record.sha.as_bytes(), bytes);
            }
            for author in &batch.authors {
                let bytes = bincode::serialize(author)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                write.put_cf(cf_authors, author.name.as_bytes(), bytes);
            }

            self.db
                .write(write)
                .map_err(|e| StoreError::Backend(e.to_string()))
        }
    }
}

#[cfg(feature = "rocksdb")]
pub use rocks::RocksBackend;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(sha: &str, message: &str) -> Record {
        Record {
            sha: sha.to_string(),
            message: message.to_string(),
            url: String::new(),
            date: Utc::now(),
            author: "Joe".to_string(),
        }
    }

    #[test]
    fn test_memory_persist_overwrites_by_key() {
        let backend = MemoryBackend::new();
        backend
            .persist(&Batch {
                records: vec![record("a", "one"), record("b", "two")],
                authors: vec![],
            })
            .unwrap();
        backend
            .persist(&Batch {
                records: vec![record("a", "uno")],
                authors: vec![],
            })
            .unwrap();

        let snapshot = backend.load().unwrap();
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(snapshot.records[0].message, "uno");
    }

    #[test]
    fn test_memory_injected_failure_leaves_data() {
        let backend = MemoryBackend::new();
        backend.set_fail_persist(true);
        let result = backend.persist(&Batch {
            records: vec![record("a", "one")],
            authors: vec![],
        });
        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert!(backend.snapshot().records.is_empty());
    }

    #[cfg(feature = "rocksdb")]
    #[test]
    fn test_rocks_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = RocksBackend::open(dir.path()).unwrap();
            backend
                .persist(&Batch {
                    records: vec![record("a", "one")],
                    authors: vec![Author {
                        name: "Joe".to_string(),
                        email: "joe@example.com".to_string(),
                    }],
                })
                .unwrap();
        }

        let backend = RocksBackend::open(dir.path()).unwrap();
        let snapshot = backend.load().unwrap();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].message, "one");
        assert_eq!(snapshot.authors[0].email, "joe@example.com");
    }
}

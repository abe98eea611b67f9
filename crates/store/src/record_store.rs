use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::backend::{Batch, StorageBackend};
use crate::error::StoreError;
use crate::filter::Filter;
use crate::types::{Author, RawRecord, Record};

#[derive(Default)]
struct State {
    records: HashMap<String, Record>,
    authors: HashMap<String, Author>,
    pending_records: HashMap<String, Record>,
    pending_authors: HashMap<String, Author>,
}

impl State {
    fn pending_len(&self) -> usize {
        self.pending_records.len() + self.pending_authors.len()
    }

    fn batch(&self) -> Batch {
        let mut records: Vec<Record> = self.pending_records.values().cloned().collect();
        records.sort_by(|a, b| a.sha.cmp(&b.sha));
        let mut authors: Vec<Author> = self.pending_authors.values().cloned().collect();
        authors.sort_by(|a, b| a.name.cmp(&b.name));
        Batch { records, authors }
    }
}

/// Commit records merged last-writer-wins by sha.
///
/// Upserts are staged and only become visible to [`query`](Self::query)
/// once [`commit`](Self::commit) has persisted them. All access is
/// serialized behind one lock.
pub struct RecordStore {
    backend: Box<dyn StorageBackend>,
    state: RwLock<State>,
}

impl RecordStore {
    /// Load everything the backend holds.
    pub fn open(backend: impl StorageBackend + 'static) -> Result<Self, StoreError> {
        let snapshot = backend.load()?;
        let mut state = State::default();
        for author in snapshot.authors {
            state.authors.insert(author.name.clone(), author);
        }
        for record in snapshot.records {
            state.records.insert(record.sha.clone(), record);
        }
        debug!(
            records = state.records.len(),
            authors = state.authors.len(),
            "Opened record store"
        );

        Ok(Self {
            backend: Box::new(backend),
            state: RwLock::new(state),
        })
    }

    /// Stage `raw`, replacing every field of any record with the same sha.
    ///
    /// An author is created only when no author of that name exists yet;
    /// an existing author keeps its email.
    pub fn upsert(&self, raw: RawRecord) -> Record {
        let (record, author) = raw.split();
        let mut state = self.state.write();

        if !state.authors.contains_key(&author.name)
            && !state.pending_authors.contains_key(&author.name)
        {
            state.pending_authors.insert(author.name.clone(), author);
        }

        if state.records.get(&record.sha) == Some(&record) {
            state.pending_records.remove(&record.sha);
        } else {
            state
                .pending_records
                .insert(record.sha.clone(), record.clone());
        }
        record
    }

    /// Persist the pending batch. On failure nothing becomes visible and
    /// the batch stays pending.
    pub fn commit(&self) -> Result<usize, StoreError> {
        let mut state = self.state.write();
        let pending = state.pending_len();
        if pending == 0 {
            return Ok(0);
        }

        if let Err(e) = self.backend.persist(&state.batch()) {
            warn!("Commit of {} changes failed: {}", pending, e);
            return Err(StoreError::Commit {
                pending,
                source: Box::new(e),
            });
        }

        let State {
            records,
            authors,
            pending_records,
            pending_authors,
        } = &mut *state;
        authors.extend(pending_authors.drain());
        records.extend(pending_records.drain());
        debug!("Committed {} changes", pending);
        Ok(pending)
    }

    pub fn has_changes(&self) -> bool {
        self.state.read().pending_len() > 0
    }

    /// Drop staged changes without persisting them.
    pub fn discard(&self) {
        let mut state = self.state.write();
        state.pending_records.clear();
        state.pending_authors.clear();
    }

    /// Committed records matching `filter`, newest first, ties by sha.
    pub fn query(&self, filter: Option<&Filter>) -> Vec<Record> {
        let state = self.state.read();
        let mut results: Vec<Record> = state
            .records
            .values()
            .filter(|r| filter.map_or(true, |f| f.matches(r)))
            .cloned()
            .collect();
        results.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.sha.cmp(&b.sha)));
        results
    }

    pub fn get(&self, sha: &str) -> Option<Record> {
        self.state.read().records.get(sha).cloned()
    }

    pub fn author(&self, name: &str) -> Option<Author> {
        self.state.read().authors.get(name).cloned()
    }

    /// Committed authors sorted by name.
    pub fn authors(&self) -> Vec<Author> {
        let mut authors: Vec<Author> = self.state.read().authors.values().cloned().collect();
        authors.sort_by(|a, b| a.name.cmp(&b.name));
        authors
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

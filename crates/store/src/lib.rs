//! Local store of repository commits.
//!
//! Records are merged last-writer-wins by sha, staged until committed, and
//! queried newest-first through composable [`Filter`]s. Durability comes
//! from a [`StorageBackend`]; remote commits arrive through a
//! [`CommitSource`].

pub mod backend;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod record_store;
pub mod types;

pub use backend::{Batch, MemoryBackend, Snapshot, StorageBackend};
pub use error::{FetchError, StoreError};
pub use fetch::{parse_commits, sync, CommitSource, GitHubSource};
pub use filter::{Filter, FilterPreset, UnknownPreset};
pub use record_store::RecordStore;
pub use types::{Author, RawRecord, Record};

#[cfg(feature = "rocksdb")]
pub use backend::RocksBackend;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use peerlog_store::{
    sync, CommitSource, FetchError, Filter, MemoryBackend, RawRecord, RecordStore, StoreError,
};

fn raw(sha: &str, message: &str, author: &str, age_hours: i64) -> RawRecord {
    RawRecord {
        sha: sha.to_string(),
        message: message.to_string(),
        url: format!("https://github.com/apple/swift/commit/{}", sha),
        date: Utc::now() - Duration::hours(age_hours),
        author_name: author.to_string(),
        author_email: format!("{}@example.com", author.to_lowercase()),
    }
}

/// Serves canned pages and fails on any page it has no entry for.
struct FakeSource {
    pages: Mutex<HashMap<u32, Vec<RawRecord>>>,
    empty_after: u32,
    requests: AtomicU32,
}

impl FakeSource {
    fn new(pages: Vec<Vec<RawRecord>>) -> Self {
        let empty_after = pages.len() as u32;
        Self {
            pages: Mutex::new(
                pages
                    .into_iter()
                    .enumerate()
                    .map(|(i, p)| (i as u32 + 1, p))
                    .collect(),
            ),
            empty_after,
            requests: AtomicU32::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            empty_after: u32::MAX,
            requests: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl CommitSource for FakeSource {
    async fn fetch_page(&self, page: u32) -> Result<Vec<RawRecord>, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(records) = self.pages.lock().get(&page) {
            return Ok(records.clone());
        }
        if page > self.empty_after {
            return Ok(Vec::new());
        }
        Err(FetchError::Status(503))
    }
}

#[tokio::test]
async fn test_sync_merges_one_record_per_sha() {
    let store = RecordStore::open(MemoryBackend::new()).unwrap();
    let first = FakeSource::new(vec![vec![
        raw("a", "first draft", "Joe", 3),
        raw("b", "Add parser", "Ann", 2),
    ]]);
    assert_eq!(sync(&store, &first, 1).await.unwrap(), 2);

    let second = FakeSource::new(vec![vec![raw("a", "final wording", "Joe", 3)]]);
    sync(&store, &second, 1).await.unwrap();

    assert_eq!(store.len(), 2);
    assert_eq!(store.get("a").unwrap().message, "final wording");
    assert_eq!(store.authors().len(), 2);
}

#[tokio::test]
async fn test_sync_reads_pages_until_empty() {
    let store = RecordStore::open(MemoryBackend::new()).unwrap();
    let source = FakeSource::new(vec![
        vec![raw("a", "one", "Joe", 1)],
        vec![raw("b", "two", "Joe", 2)],
    ]);

    assert_eq!(sync(&store, &source, 5).await.unwrap(), 2);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn test_zero_pages_fetches_nothing() {
    let store = RecordStore::open(MemoryBackend::new()).unwrap();
    let source = FakeSource::failing();

    assert_eq!(sync(&store, &source, 0).await.unwrap(), 0);
    assert!(store.is_empty());
    assert_eq!(source.requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_fetch_yields_zero_records() {
    let store = RecordStore::open(MemoryBackend::new()).unwrap();
    store.upsert(raw("a", "kept", "Joe", 1));
    store.commit().unwrap();

    assert_eq!(sync(&store, &FakeSource::failing(), 3).await.unwrap(), 0);
    assert_eq!(store.len(), 1);
    assert!(!store.has_changes());
}

#[tokio::test]
async fn test_records_without_sha_are_skipped() {
    let store = RecordStore::open(MemoryBackend::new()).unwrap();
    let source = FakeSource::new(vec![vec![raw("", "orphan", "Joe", 1), raw("a", "ok", "Joe", 1)]]);

    assert_eq!(sync(&store, &source, 1).await.unwrap(), 1);
    assert!(store.get("").is_none());
}

#[test]
fn test_commit_failure_keeps_committed_view() {
    let backend = Arc::new(MemoryBackend::new());
    let store = RecordStore::open(backend.clone()).unwrap();
    store.upsert(raw("a", "original", "Joe", 2));
    store.commit().unwrap();

    backend.set_fail_persist(true);
    store.upsert(raw("a", "rewritten", "Joe", 2));
    store.upsert(raw("b", "new", "Ann", 1));

    match store.commit() {
        Err(StoreError::Commit { pending, .. }) => assert_eq!(pending, 3),
        other => panic!("expected commit failure, got {:?}", other),
    }
    assert_eq!(store.len(), 1);
    assert_eq!(store.get("a").unwrap().message, "original");
    assert!(store.author("Ann").is_none());
    assert!(store.has_changes());

    backend.set_fail_persist(false);
    assert_eq!(store.commit().unwrap(), 3);
    assert_eq!(store.get("a").unwrap().message, "rewritten");
    assert_eq!(backend.snapshot().records.len(), 2);
}

#[test]
fn test_filtered_queries() {
    let store = RecordStore::open(MemoryBackend::new()).unwrap();
    store.upsert(raw("a", "Fix crash in lexer", "Joe", 1));
    store.upsert(raw("b", "Merge pull request #42 from ann/fix", "Ann", 2));
    store.upsert(raw("c", "Add docs", "Joe", 30));
    store.upsert(raw("d", "prefix cleanup", "Ann", 40));
    store.commit().unwrap();

    let shas = |filter: &Filter| -> Vec<String> {
        store.query(Some(filter)).into_iter().map(|r| r.sha).collect()
    };

    assert_eq!(shas(&Filter::fixes_only()), vec!["a", "b", "d"]);
    assert_eq!(shas(&Filter::ignore_merges()), vec!["a", "c", "d"]);
    assert_eq!(shas(&Filter::recent(Utc::now())), vec!["a", "b"]);
    assert_eq!(shas(&Filter::by_author("Joe")), vec!["a", "c"]);
    assert_eq!(
        shas(&Filter::fixes_only().and(Filter::ignore_merges())),
        vec!["a", "d"]
    );
    assert_eq!(store.query(None).len(), 4);
}

#[test]
fn test_equal_dates_tie_break_by_sha() {
    let store = RecordStore::open(MemoryBackend::new()).unwrap();
    let date = Utc::now();
    for sha in ["c", "a", "b"] {
        let mut r = raw(sha, "same time", "Joe", 0);
        r.date = date;
        store.upsert(r);
    }
    store.commit().unwrap();

    let shas: Vec<String> = store.query(None).into_iter().map(|r| r.sha).collect();
    assert_eq!(shas, vec!["a", "b", "c"]);
}

#[cfg(feature = "rocksdb")]
#[test]
fn test_rocks_store_survives_reopen() {
    use peerlog_store::RocksBackend;

    let dir = tempfile::tempdir().unwrap();
    {
        let store = RecordStore::open(RocksBackend::open(dir.path()).unwrap()).unwrap();
        store.upsert(raw("a", "first", "Joe", 2));
        store.upsert(raw("b", "second", "Joe", 1));
        store.commit().unwrap();
        store.upsert(raw("a", "first, amended", "Joe", 2));
        store.commit().unwrap();
        store.upsert(raw("c", "never committed", "Ann", 0));
    }

    let store = RecordStore::open(RocksBackend::open(dir.path()).unwrap()).unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(store.get("a").unwrap().message, "first, amended");
    assert!(store.get("c").is_none());
    assert_eq!(store.authors().len(), 1);
}

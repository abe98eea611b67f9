use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{FetchError, StoreError};
use crate::record_store::RecordStore;
use crate::types::RawRecord;

pub const DEFAULT_OWNER: &str = "apple";
pub const DEFAULT_REPO: &str = "swift";
pub const DEFAULT_PER_PAGE: u32 = 100;

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("peerlogd/", env!("CARGO_PKG_VERSION"));

/// A remote producer of commit records, one page at a time.
#[async_trait]
pub trait CommitSource: Send + Sync {
    /// Pages are numbered from 1. An empty page means there is nothing more.
    async fn fetch_page(&self, page: u32) -> Result<Vec<RawRecord>, FetchError>;
}

/// The GitHub REST commits listing for one repository.
pub struct GitHubSource {
    client: reqwest::Client,
    base_url: String,
    owner: String,
    repo: String,
    per_page: u32,
}

impl GitHubSource {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            base_url: API_BASE.to_string(),
            owner: owner.into(),
            repo: repo.into(),
            per_page: DEFAULT_PER_PAGE,
        })
    }

    /// Parse `owner/name`.
    pub fn from_slug(slug: &str) -> Result<Self, FetchError> {
        match slug.split_once('/') {
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => {
                Self::new(owner, repo)
            }
            _ => Err(FetchError::Parse(format!(
                "repository '{}' is not of the form owner/name",
                slug
            ))),
        }
    }

    pub fn with_per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page.clamp(1, 100);
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn page_url(&self, page: u32) -> String {
        format!(
            "{}/repos/{}/{}/commits?per_page={}&page={}",
            self.base_url.trim_end_matches('/'),
            self.owner,
            self.repo,
            self.per_page,
            page
        )
    }
}

impl Default for GitHubSource {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: API_BASE.to_string(),
            owner: DEFAULT_OWNER.to_string(),
            repo: DEFAULT_REPO.to_string(),
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

#[async_trait]
impl CommitSource for GitHubSource {
    async fn fetch_page(&self, page: u32) -> Result<Vec<RawRecord>, FetchError> {
        let url = self.page_url(page);
        debug!("Fetching {}", url);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        parse_commits(&body, Utc::now())
    }
}

/// Map a commits listing to raw records. Missing strings become empty,
/// missing or malformed dates become `now`.
pub fn parse_commits(body: &str, now: DateTime<Utc>) -> Result<Vec<RawRecord>, FetchError> {
    let value: Value = serde_json::from_str(body).map_err(|e| FetchError::Parse(e.to_string()))?;
    let items = value
        .as_array()
        .ok_or_else(|| FetchError::Parse("expected a JSON array".to_string()))?;

    Ok(items.iter().map(|item| raw_record(item, now)).collect())
}

fn string_at(item: &Value, pointer: &str) -> String {
    item.pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn raw_record(item: &Value, now: DateTime<Utc>) -> RawRecord {
    let date = item
        .pointer("/commit/committer/date")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(now);

    RawRecord {
        sha: string_at(item, "/sha"),
        message: string_at(item, "/commit/message"),
        url: string_at(item, "/html_url"),
        date,
        author_name: string_at(item, "/commit/committer/name"),
        author_email: string_at(item, "/commit/committer/email"),
    }
}

/// Fetch up to `pages` pages from `source` and merge them into `store`.
///
/// A page that fails to fetch ends the cycle with whatever earlier pages
/// produced. Records without a sha are skipped. `pages == 0` fetches
/// nothing. Returns the number of records merged.
pub async fn sync(
    store: &RecordStore,
    source: &dyn CommitSource,
    pages: u32,
) -> Result<usize, StoreError> {
    let mut merged = 0;

    for page in 1..=pages {
        let records = match source.fetch_page(page).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Fetch of page {} failed: {}", page, e);
                break;
            }
        };
        if records.is_empty() {
            break;
        }

        for raw in records {
            if raw.sha.is_empty() {
                warn!("Skipping commit without sha");
                continue;
            }
            store.upsert(raw);
            merged += 1;
        }
    }

    store.commit()?;
    info!("Received {} new commits", merged);
    Ok(merged)
}

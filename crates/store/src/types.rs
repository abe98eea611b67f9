use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored commit. `sha` is the natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub sha: String,
    pub message: String,
    pub url: String,
    pub date: DateTime<Utc>,
    /// Name of the owning [`Author`].
    pub author: String,
}

/// Commit author, keyed by name. Several records may share one author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: String,
}

/// A record as delivered by a remote source, before it is merged into the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub sha: String,
    pub message: String,
    pub url: String,
    pub date: DateTime<Utc>,
    pub author_name: String,
    pub author_email: String,
}

impl RawRecord {
    pub(crate) fn split(self) -> (Record, Author) {
        let record = Record {
            sha: self.sha,
            message: self.message,
            url: self.url,
            date: self.date,
            author: self.author_name.clone(),
        };
        let author = Author {
            name: self.author_name,
            email: self.author_email,
        };
        (record, author)
    }
}

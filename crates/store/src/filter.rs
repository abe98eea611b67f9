use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};

use crate::types::Record;

pub const MERGE_PREFIX: &str = "Merge pull request";
pub const RECENT_WINDOW_HOURS: i64 = 12;

/// Predicate over committed records. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Case-insensitive substring match on the message.
    MessageContains(String),
    /// Case-sensitive prefix match on the message.
    MessageStartsWith(String),
    /// Strictly after the instant.
    DateAfter(DateTime<Utc>),
    AuthorIs(String),
    Not(Box<Filter>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn fixes_only() -> Self {
        Filter::MessageContains("fix".to_string())
    }

    pub fn ignore_merges() -> Self {
        Filter::Not(Box::new(Filter::MessageStartsWith(MERGE_PREFIX.to_string())))
    }

    /// Records dated within the last twelve hours of `now`.
    pub fn recent(now: DateTime<Utc>) -> Self {
        Filter::DateAfter(now - Duration::hours(RECENT_WINDOW_HOURS))
    }

    pub fn by_author(name: impl Into<String>) -> Self {
        Filter::AuthorIs(name.into())
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut parts) => {
                parts.push(other);
                Filter::And(parts)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut parts) => {
                parts.push(other);
                Filter::Or(parts)
            }
            first => Filter::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Filter::Not(Box::new(self))
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::MessageContains(needle) => record
                .message
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            Filter::MessageStartsWith(prefix) => record.message.starts_with(prefix.as_str()),
            Filter::DateAfter(instant) => record.date > *instant,
            Filter::AuthorIs(name) => record.author == *name,
            Filter::Not(inner) => !inner.matches(record),
            Filter::And(parts) => parts.iter().all(|f| f.matches(record)),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(record)),
        }
    }
}

/// Named filters selectable from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterPreset {
    All,
    FixesOnly,
    IgnoreMerges,
    Recent,
    ByAuthor(String),
}

impl FilterPreset {
    /// `None` means no filter. `Recent` is anchored at `now`.
    pub fn to_filter(&self, now: DateTime<Utc>) -> Option<Filter> {
        match self {
            FilterPreset::All => None,
            FilterPreset::FixesOnly => Some(Filter::fixes_only()),
            FilterPreset::IgnoreMerges => Some(Filter::ignore_merges()),
            FilterPreset::Recent => Some(Filter::recent(now)),
            FilterPreset::ByAuthor(name) => Some(Filter::by_author(name.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown filter preset '{0}' (expected all, fixes, no-merges, recent or author:<name>)")]
pub struct UnknownPreset(pub String);

impl FromStr for FilterPreset {
    type Err = UnknownPreset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(FilterPreset::All),
            "fixes" => Ok(FilterPreset::FixesOnly),
            "no-merges" => Ok(FilterPreset::IgnoreMerges),
            "recent" => Ok(FilterPreset::Recent),
            other => match other.strip_prefix("author:") {
                Some(name) if !name.is_empty() => Ok(FilterPreset::ByAuthor(name.to_string())),
                _ => Err(UnknownPreset(other.to_string())),
            },
        }
    }
}

impl fmt::Display for FilterPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterPreset::All => f.write_str("all"),
            FilterPreset::FixesOnly => f.write_str("fixes"),
            FilterPreset::IgnoreMerges => f.write_str("no-merges"),
            FilterPreset::Recent => f.write_str("recent"),
            FilterPreset::ByAuthor(name) => write!(f, "author:{}", name),
        }
    }
}

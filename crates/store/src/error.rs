use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A batch could not be persisted. Committed state is unchanged and
    /// the batch is still pending.
    #[error("Commit of {pending} pending changes failed: {source}")]
    Commit {
        pending: usize,
        #[source]
        source: Box<StoreError>,
    },
}

/// Failure to obtain records from a remote source.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status: {0}")]
    Status(u16),

    #[error("Unparsable payload: {0}")]
    Parse(String),
}

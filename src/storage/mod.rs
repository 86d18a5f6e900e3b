//! Source storage abstraction.
//!
//! Stage tasks read raw records from object storage through the
//! [`StorageReader`] trait. Readers return a lazy stream so that large
//! sources are never held in memory at once.

mod local;
mod memory;

pub use local::LocalStorageReader;
pub use memory::InMemoryStorageReader;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::PathBuf;
use thiserror::Error;

use crate::credentials::Credentials;

/// Errors that can occur while reading source storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The bucket (or root container) does not exist.
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    /// The storage service could not be reached.
    #[error("storage unreachable: {0}")]
    Unreachable(String),

    /// The supplied credentials were rejected.
    #[error("access denied to {0}")]
    AccessDenied(String),

    /// A line of an object could not be decoded as text.
    #[error("malformed record in {object} line {line}: {message}")]
    Malformed {
        object: String,
        line: usize,
        message: String,
    },

    /// I/O error while listing or reading an object.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What to read: every object under `prefix` in `bucket`.
#[derive(Debug, Clone)]
pub struct SourceRequest {
    pub bucket: String,
    pub prefix: String,
    pub credentials: Option<Credentials>,
}

impl SourceRequest {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
            credentials: None,
        }
    }

    /// Builder: attach resolved credentials.
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }
}

/// One raw record (a line) read from an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Key of the object the record came from.
    pub object: String,
    /// 1-based line number within the object.
    pub line: usize,
    pub data: String,
}

/// Lazy stream of raw records, objects in key order.
pub type RecordStream = BoxStream<'static, Result<RawRecord, StorageError>>;

/// Reads raw records from source storage.
#[async_trait]
pub trait StorageReader: Send + Sync {
    /// Open a stream over every record under the request's prefix.
    ///
    /// Fails up front when the source cannot be reached at all; errors while
    /// reading individual objects surface as stream items.
    async fn open(&self, request: &SourceRequest) -> Result<RecordStream, StorageError>;
}

/// Does `key` fall under `prefix`, respecting path segments?
///
/// `log_data/2018/1` matches `log_data/2018/1/a.json` but not
/// `log_data/2018/11/a.json`.
pub(crate) fn key_matches(key: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match key.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

//! In-memory storage reader.
//!
//! Holds objects as lists of lines. Useful for tests and for driving a
//! pipeline without touching the filesystem.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{RawRecord, RecordStream, SourceRequest, StorageError, StorageReader, key_matches};

#[derive(Default)]
struct State {
    /// bucket -> key -> lines
    buckets: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    unreachable: bool,
    required_key: Option<String>,
}

/// Thread-safe in-memory object store.
#[derive(Default)]
pub struct InMemoryStorageReader {
    state: RwLock<State>,
    opens: AtomicUsize,
}

impl InMemoryStorageReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add an object.
    pub fn with_object<I, S>(self, bucket: &str, key: &str, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.put_object(bucket, key, lines);
        self
    }

    /// Add or replace an object.
    pub fn put_object<I, S>(&self, bucket: &str, key: &str, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut state) = self.state.write() {
            state
                .buckets
                .entry(bucket.to_string())
                .or_default()
                .insert(key.to_string(), lines.into_iter().map(Into::into).collect());
        }
    }

    /// Simulate an outage: every `open` fails with `Unreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        if let Ok(mut state) = self.state.write() {
            state.unreachable = unreachable;
        }
    }

    /// Reject requests that don't carry this access key id.
    pub fn require_access_key(self, access_key_id: impl Into<String>) -> Self {
        if let Ok(mut state) = self.state.write() {
            state.required_key = Some(access_key_id.into());
        }
        self
    }

    /// Number of times a source was opened.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageReader for InMemoryStorageReader {
    async fn open(&self, request: &SourceRequest) -> Result<RecordStream, StorageError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let state = self
            .state
            .read()
            .map_err(|_| StorageError::Unreachable("storage lock poisoned".to_string()))?;

        if state.unreachable {
            return Err(StorageError::Unreachable(format!(
                "{}/{}",
                request.bucket, request.prefix
            )));
        }

        if let Some(required) = &state.required_key {
            let presented = request.credentials.as_ref().map(|c| c.access_key_id.as_str());
            if presented != Some(required.as_str()) {
                return Err(StorageError::AccessDenied(request.bucket.clone()));
            }
        }

        let objects = state
            .buckets
            .get(&request.bucket)
            .ok_or_else(|| StorageError::BucketNotFound(request.bucket.clone()))?;

        // Snapshot the matching objects so the stream doesn't hold the lock.
        let records: Vec<Result<RawRecord, StorageError>> = objects
            .iter()
            .filter(|(key, _)| key_matches(key, &request.prefix))
            .flat_map(|(key, lines)| {
                lines
                    .iter()
                    .enumerate()
                    .filter(|(_, data)| !data.trim().is_empty())
                    .map(move |(i, data)| {
                        Ok(RawRecord {
                            object: key.clone(),
                            line: i + 1,
                            data: data.clone(),
                        })
                    })
            })
            .collect();

        Ok(stream::iter(records).boxed())
    }
}

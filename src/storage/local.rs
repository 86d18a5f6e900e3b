//! Directory-backed storage reader.
//!
//! Buckets are sub-directories of a root directory and object keys are file
//! paths relative to the bucket, joined with `/`. Every non-blank line of a
//! file is one record.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Split};
use tracing::debug;

use super::{RawRecord, RecordStream, SourceRequest, StorageError, StorageReader, key_matches};

/// Reads records from a local directory tree.
#[derive(Debug, Clone)]
pub struct LocalStorageReader {
    root: PathBuf,
}

impl LocalStorageReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// List every file below `bucket_dir` as `(key, path)`, sorted by key.
async fn list_objects(bucket_dir: &Path) -> Result<Vec<(String, PathBuf)>, StorageError> {
    let mut objects = Vec::new();
    let mut pending = vec![bucket_dir.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(|e| io_error(&path, e))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let key = path
                    .strip_prefix(bucket_dir)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                objects.push((key, path));
            }
        }
    }

    objects.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(objects)
}

struct Cursor {
    objects: VecDeque<(String, PathBuf)>,
    current: Option<OpenObject>,
}

struct OpenObject {
    key: String,
    path: PathBuf,
    lines: Split<BufReader<File>>,
    line: usize,
}

impl Cursor {
    async fn next_record(&mut self) -> Option<Result<RawRecord, StorageError>> {
        loop {
            if let Some(open) = self.current.as_mut() {
                match open.lines.next_segment().await {
                    Ok(Some(mut bytes)) => {
                        open.line += 1;
                        if bytes.last() == Some(&b'\r') {
                            bytes.pop();
                        }
                        let data = match String::from_utf8(bytes) {
                            Ok(data) => data,
                            Err(e) => {
                                return Some(Err(StorageError::Malformed {
                                    object: open.key.clone(),
                                    line: open.line,
                                    message: e.utf8_error().to_string(),
                                }));
                            }
                        };
                        if data.trim().is_empty() {
                            continue;
                        }
                        return Some(Ok(RawRecord {
                            object: open.key.clone(),
                            line: open.line,
                            data,
                        }));
                    }
                    Ok(None) => self.current = None,
                    Err(e) => {
                        let err = io_error(&open.path, e);
                        self.current = None;
                        self.objects.clear();
                        return Some(Err(err));
                    }
                }
            }

            let (key, path) = self.objects.pop_front()?;
            match File::open(&path).await {
                Ok(file) => {
                    self.current = Some(OpenObject {
                        key,
                        path,
                        lines: BufReader::new(file).split(b'\n'),
                        line: 0,
                    });
                }
                Err(e) => {
                    self.objects.clear();
                    return Some(Err(io_error(&path, e)));
                }
            }
        }
    }
}

#[async_trait]
impl StorageReader for LocalStorageReader {
    async fn open(&self, request: &SourceRequest) -> Result<RecordStream, StorageError> {
        let bucket_dir = self.root.join(&request.bucket);
        match tokio::fs::metadata(&bucket_dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(StorageError::BucketNotFound(request.bucket.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::BucketNotFound(request.bucket.clone()));
            }
            Err(e) => return Err(StorageError::Unreachable(e.to_string())),
        }

        let objects: VecDeque<_> = list_objects(&bucket_dir)
            .await?
            .into_iter()
            .filter(|(key, _)| key_matches(key, &request.prefix))
            .collect();

        debug!(
            bucket = %request.bucket,
            prefix = %request.prefix,
            objects = objects.len(),
            "opened local source"
        );

        let cursor = Cursor {
            objects,
            current: None,
        };

        Ok(stream::unfold(cursor, |mut cursor| async move {
            let item = cursor.next_record().await?;
            Some((item, cursor))
        })
        .boxed())
    }
}

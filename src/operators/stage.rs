//! Stage behavior: copy raw records from source storage into a landing
//! relation.
//!
//! Staging is truncate-then-load, so re-running a stage (a retry, or a
//! second run over the same execution date) always leaves exactly one copy
//! of the source in the target.

use chrono::NaiveDate;
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::core::task::{FormatHint, StageParams};
use crate::credentials::CredentialProvider;
use crate::storage::{RawRecord, SourceRequest, StorageError, StorageReader};
use crate::warehouse::{Row, Statement, Warehouse, WarehouseError};

/// Errors that can occur while staging.
#[derive(Debug, Error)]
pub enum StageError {
    /// Credentials could not be resolved or were rejected.
    #[error("credentials error: {0}")]
    Credentials(String),

    /// The source could not be listed or read.
    #[error("source unreachable: {0}")]
    SourceUnreachable(String),

    /// A record could not be parsed with the task's format hint.
    #[error("malformed record #{index} ({object} line {line}): {message}")]
    MalformedRecord {
        /// 0-based position of the record in the source stream.
        index: usize,
        object: String,
        line: usize,
        message: String,
    },

    /// The landing relation could not be written.
    #[error("target unavailable: {0}")]
    TargetUnavailable(String),
}

impl StageError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            StageError::Credentials(_) => "credentials",
            StageError::SourceUnreachable(_) => "source_unreachable",
            StageError::MalformedRecord { .. } => "malformed_record",
            StageError::TargetUnavailable(_) => "target_unavailable",
        }
    }
}

impl From<StorageError> for StageError {
    fn from(err: StorageError) -> Self {
        match err {
            denied @ StorageError::AccessDenied(_) => StageError::Credentials(denied.to_string()),
            other => StageError::SourceUnreachable(other.to_string()),
        }
    }
}

impl From<WarehouseError> for StageError {
    fn from(err: WarehouseError) -> Self {
        StageError::TargetUnavailable(err.to_string())
    }
}

/// Turns raw records into rows according to a [`FormatHint`].
enum RecordParser {
    Auto,
    JsonPaths(Vec<(String, Vec<String>)>),
    Csv {
        delimiter: char,
        object: Option<String>,
        header: Vec<String>,
    },
}

impl RecordParser {
    fn new(format: &FormatHint) -> Self {
        match format {
            FormatHint::Auto => RecordParser::Auto,
            FormatHint::JsonPaths { paths } => RecordParser::JsonPaths(
                paths
                    .iter()
                    .map(|path| {
                        let segments: Vec<String> = path
                            .trim_start_matches('$')
                            .split('.')
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect();
                        let column = segments
                            .last()
                            .map(|s| s.to_lowercase())
                            .unwrap_or_else(|| path.to_lowercase());
                        (column, segments)
                    })
                    .collect(),
            ),
            FormatHint::Csv { delimiter } => RecordParser::Csv {
                delimiter: *delimiter,
                object: None,
                header: Vec::new(),
            },
        }
    }

    /// Parse one record. `Ok(None)` means the record carried no row (a CSV
    /// header line).
    fn parse(&mut self, record: &RawRecord) -> Result<Option<Row>, String> {
        match self {
            RecordParser::Auto => {
                let object = parse_object(&record.data)?;
                Ok(Some(
                    object
                        .into_iter()
                        .map(|(k, v)| (k.to_lowercase(), v))
                        .collect(),
                ))
            }
            RecordParser::JsonPaths(paths) => {
                let object = Value::Object(parse_object(&record.data)?);
                let mut row = Row::new();
                for (column, segments) in paths.iter() {
                    let value = segments
                        .iter()
                        .try_fold(&object, |v, seg| v.get(seg))
                        .cloned()
                        .unwrap_or(Value::Null);
                    row.insert(column.clone(), value);
                }
                Ok(Some(row))
            }
            RecordParser::Csv {
                delimiter,
                object,
                header,
            } => {
                let cells: Vec<&str> = record.data.split(*delimiter).map(str::trim).collect();
                if object.as_deref() != Some(record.object.as_str()) {
                    *object = Some(record.object.clone());
                    *header = cells.iter().map(|c| c.to_lowercase()).collect();
                    return Ok(None);
                }
                if cells.len() != header.len() {
                    return Err(format!(
                        "expected {} fields, found {}",
                        header.len(),
                        cells.len()
                    ));
                }
                Ok(Some(
                    header
                        .iter()
                        .zip(cells)
                        .map(|(name, cell)| {
                            let value = if cell.is_empty() {
                                Value::Null
                            } else {
                                Value::String(cell.to_string())
                            };
                            (name.clone(), value)
                        })
                        .collect(),
                ))
            }
        }
    }
}

fn parse_object(data: &str) -> Result<serde_json::Map<String, Value>, String> {
    match serde_json::from_str::<Value>(data) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, found {}", json_kind(&other))),
        Err(e) => Err(e.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Everything a stage needs besides its parameters.
pub struct StageOperator<'a> {
    pub warehouse: &'a dyn Warehouse,
    pub storage: &'a dyn StorageReader,
    pub credentials: &'a dyn CredentialProvider,
    pub execution_date: NaiveDate,
    pub batch_size: usize,
}

impl StageOperator<'_> {
    /// Stage the source into the target and return the number of rows
    /// landed.
    pub async fn execute(&self, params: &StageParams) -> Result<u64, StageError> {
        let credentials = params
            .credentials
            .as_deref()
            .map(|id| self.credentials.resolve(id))
            .transpose()
            .map_err(|e| StageError::Credentials(e.to_string()))?;

        let prefix = params.source.resolve_key(self.execution_date);
        let request =
            SourceRequest::new(&params.source.bucket, &prefix).with_credentials(credentials);

        // Open the source before touching the target so an unreachable
        // source leaves the previous contents in place.
        let mut records = self.storage.open(&request).await?;

        self.warehouse
            .execute(&Statement::Truncate {
                table: params.target.clone(),
            })
            .await?;

        let batch_size = self.batch_size.max(1);
        let mut parser = RecordParser::new(&params.format);
        let mut batch: Vec<Row> = Vec::with_capacity(batch_size);
        let mut landed = 0u64;
        let mut index = 0usize;

        while let Some(record) = records.next().await {
            let record = match record {
                Ok(record) => record,
                Err(StorageError::Malformed {
                    object,
                    line,
                    message,
                }) => {
                    return Err(StageError::MalformedRecord {
                        index,
                        object,
                        line,
                        message,
                    });
                }
                Err(err) => return Err(err.into()),
            };
            let row = parser
                .parse(&record)
                .map_err(|message| StageError::MalformedRecord {
                    index,
                    object: record.object.clone(),
                    line: record.line,
                    message,
                })?;
            index += 1;

            if let Some(row) = row {
                batch.push(row);
            }
            if batch.len() >= batch_size {
                landed += self.flush(&params.target, &mut batch).await?;
            }
        }
        landed += self.flush(&params.target, &mut batch).await?;

        info!(
            source = %params.source,
            prefix = %prefix,
            table = %params.target,
            rows = landed,
            "staged source"
        );
        Ok(landed)
    }

    async fn flush(&self, target: &str, batch: &mut Vec<Row>) -> Result<u64, StageError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let rows = std::mem::take(batch);
        debug!(table = %target, rows = rows.len(), "landing batch");
        Ok(self
            .warehouse
            .execute(&Statement::InsertRows {
                table: target.to_string(),
                rows,
            })
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::SourceLocation;
    use crate::credentials::{Credentials, StaticCredentials};
    use crate::storage::InMemoryStorageReader;
    use crate::warehouse::InMemoryWarehouse;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2018, 11, 1).unwrap()
    }

    fn params(key: &str, format: FormatHint) -> StageParams {
        StageParams {
            source: SourceLocation::new("udacity-dend", key),
            target: "staging".into(),
            format,
            credentials: None,
        }
    }

    async fn stage(
        warehouse: &InMemoryWarehouse,
        storage: &dyn StorageReader,
        params: &StageParams,
        batch_size: usize,
    ) -> Result<u64, StageError> {
        let credentials = StaticCredentials::new().with("aws", Credentials::new("AKIA", "s"));
        StageOperator {
            warehouse,
            storage,
            credentials: &credentials,
            execution_date: date(),
            batch_size,
        }
        .execute(params)
        .await
    }

    #[tokio::test]
    async fn test_stage_auto_lowercases_columns() {
        let warehouse = InMemoryWarehouse::new().with_table("staging");
        let storage = InMemoryStorageReader::new().with_object(
            "udacity-dend",
            "log_data/a.json",
            [r#"{"userId": 7, "firstName": "Lily"}"#],
        );

        let rows = stage(&warehouse, &storage, &params("log_data", FormatHint::Auto), 10)
            .await
            .unwrap();

        assert_eq!(rows, 1);
        let landed = warehouse.rows("staging").unwrap();
        assert_eq!(landed[0]["userid"], 7);
        assert_eq!(landed[0]["firstname"], "Lily");
    }

    #[tokio::test]
    async fn test_stage_is_idempotent() {
        let warehouse = InMemoryWarehouse::new().with_table("staging");
        let storage = InMemoryStorageReader::new().with_object(
            "udacity-dend",
            "song_data/a.json",
            [r#"{"song_id": "S1"}"#, r#"{"song_id": "S2"}"#],
        );
        let p = params("song_data", FormatHint::Auto);

        stage(&warehouse, &storage, &p, 10).await.unwrap();
        stage(&warehouse, &storage, &p, 10).await.unwrap();

        assert_eq!(warehouse.row_count("staging"), Some(2));
    }

    #[tokio::test]
    async fn test_stage_lands_in_batches() {
        let warehouse = InMemoryWarehouse::new().with_table("staging");
        let lines: Vec<String> = (0..5).map(|i| format!(r#"{{"n": {}}}"#, i)).collect();
        let storage = InMemoryStorageReader::new().with_object("udacity-dend", "k/a.json", lines);

        let rows = stage(&warehouse, &storage, &params("k", FormatHint::Auto), 2)
            .await
            .unwrap();

        assert_eq!(rows, 5);
        let inserts = warehouse
            .statements()
            .iter()
            .filter(|s| s.starts_with("INSERT"))
            .count();
        assert_eq!(inserts, 3);
        assert_eq!(warehouse.statements()[0], "TRUNCATE TABLE staging");
    }

    #[tokio::test]
    async fn test_stage_json_paths() {
        let warehouse = InMemoryWarehouse::new().with_table("staging");
        let storage = InMemoryStorageReader::new().with_object(
            "udacity-dend",
            "log_data/a.json",
            [r#"{"artist": "Blur", "song": {"Title": "Song 2"}}"#],
        );
        let format = FormatHint::JsonPaths {
            paths: vec!["$.song.Title".into(), "$.artist".into(), "$.length".into()],
        };

        stage(&warehouse, &storage, &params("log_data", format), 10)
            .await
            .unwrap();

        let row = &warehouse.rows("staging").unwrap()[0];
        assert_eq!(row["title"], "Song 2");
        assert_eq!(row["artist"], "Blur");
        assert_eq!(row["length"], Value::Null);
    }

    #[tokio::test]
    async fn test_stage_csv_reads_header_per_object() {
        let warehouse = InMemoryWarehouse::new().with_table("staging");
        let storage = InMemoryStorageReader::new()
            .with_object("udacity-dend", "csv/a.csv", ["id;Name", "1;a", "2;"])
            .with_object("udacity-dend", "csv/b.csv", ["Name;id", "c;3"]);
        let format = FormatHint::Csv { delimiter: ';' };

        let rows = stage(&warehouse, &storage, &params("csv", format), 10)
            .await
            .unwrap();

        assert_eq!(rows, 3);
        let landed = warehouse.rows("staging").unwrap();
        assert_eq!(landed[1]["name"], Value::Null);
        assert_eq!(landed[2]["id"], "3");
    }

    #[tokio::test]
    async fn test_stage_malformed_record_carries_index() {
        let warehouse = InMemoryWarehouse::new().with_table("staging");
        let storage = InMemoryStorageReader::new().with_object(
            "udacity-dend",
            "log_data/a.json",
            [r#"{"ok": 1}"#, "not json"],
        );

        let err = stage(&warehouse, &storage, &params("log_data", FormatHint::Auto), 10)
            .await
            .unwrap_err();

        match err {
            StageError::MalformedRecord {
                index,
                object,
                line,
                ..
            } => {
                assert_eq!(index, 1);
                assert_eq!(object, "log_data/a.json");
                assert_eq!(line, 2);
            }
            other => panic!("expected malformed record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stage_undecodable_local_line_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("udacity-dend/log_data/a.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{\"n\":1}\n\xff\xfe\n").unwrap();
        let warehouse = InMemoryWarehouse::new().with_table("staging");
        let storage = crate::storage::LocalStorageReader::new(dir.path());

        let err = stage(&warehouse, &storage, &params("log_data", FormatHint::Auto), 10)
            .await
            .unwrap_err();

        assert_eq!(err.reason_code(), "malformed_record");
        match err {
            StageError::MalformedRecord { index, line, .. } => {
                assert_eq!(index, 1);
                assert_eq!(line, 2);
            }
            other => panic!("expected malformed record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stage_non_object_json_is_malformed() {
        let warehouse = InMemoryWarehouse::new().with_table("staging");
        let storage =
            InMemoryStorageReader::new().with_object("udacity-dend", "k/a.json", ["[1, 2]"]);

        let err = stage(&warehouse, &storage, &params("k", FormatHint::Auto), 10)
            .await
            .unwrap_err();

        assert_eq!(err.reason_code(), "malformed_record");
        assert!(err.to_string().contains("an array"));
    }

    #[tokio::test]
    async fn test_unreachable_source_keeps_target() {
        let warehouse = InMemoryWarehouse::new().with_table("staging");
        warehouse
            .insert_rows("staging", vec![Row::new()])
            .unwrap();
        let storage = InMemoryStorageReader::new().with_object("udacity-dend", "k/a", ["{}"]);
        storage.set_unreachable(true);

        let err = stage(&warehouse, &storage, &params("k", FormatHint::Auto), 10)
            .await
            .unwrap_err();

        assert_eq!(err.reason_code(), "source_unreachable");
        assert_eq!(warehouse.row_count("staging"), Some(1));
    }

    #[tokio::test]
    async fn test_missing_target_is_target_unavailable() {
        let warehouse = InMemoryWarehouse::new();
        let storage = InMemoryStorageReader::new().with_object("udacity-dend", "k/a", ["{}"]);

        let err = stage(&warehouse, &storage, &params("k", FormatHint::Auto), 10)
            .await
            .unwrap_err();

        assert_eq!(err.reason_code(), "target_unavailable");
    }

    #[tokio::test]
    async fn test_credentials_are_resolved_and_presented() {
        let warehouse = InMemoryWarehouse::new().with_table("staging");
        let storage = InMemoryStorageReader::new()
            .with_object("udacity-dend", "k/a", ["{}"])
            .require_access_key("AKIA");

        let mut p = params("k", FormatHint::Auto);
        let err = stage(&warehouse, &storage, &p, 10).await.unwrap_err();
        assert_eq!(err.reason_code(), "credentials");

        p.credentials = Some("aws".into());
        assert_eq!(stage(&warehouse, &storage, &p, 10).await.unwrap(), 1);

        p.credentials = Some("unknown".into());
        let err = stage(&warehouse, &storage, &p, 10).await.unwrap_err();
        assert_eq!(err.reason_code(), "credentials");
    }

    #[tokio::test]
    async fn test_partition_template_selects_prefix() {
        let warehouse = InMemoryWarehouse::new().with_table("staging");
        let storage = InMemoryStorageReader::new()
            .with_object("udacity-dend", "log_data/2018/11/a.json", ["{\"n\": 1}"])
            .with_object("udacity-dend", "log_data/2018/12/a.json", ["{\"n\": 2}"]);
        let mut p = params("log_data", FormatHint::Auto);
        p.source = p.source.with_partition("{year}/{month}");

        let rows = stage(&warehouse, &storage, &p, 10).await.unwrap();

        assert_eq!(rows, 1);
        assert_eq!(warehouse.rows("staging").unwrap()[0]["n"], 1);
    }
}

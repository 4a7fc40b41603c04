//! Chunk sources: lazy, finite, non-restartable sequences of row chunks.

use crate::config::{ColumnConfig, SourceConfig};
use crate::data::{parse_timestamp, Chunk, Row};
use crate::error::{Error, Result};
use crate::io::store::{open_object, parse_location, StoreLocation};
use arrow::array::{Array, ArrayRef, Float64Array, StringArray, TimestampMillisecondArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use futures::StreamExt;
use object_store::ObjectStoreExt;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ProjectionMask;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A lazy sequence of row chunks.
///
/// Chunks are yielded in source order with consecutive sequence numbers
/// starting at 0. Any error is fatal for the caller.
#[async_trait]
pub trait ChunkSource: Send {
    /// Next chunk, or `None` once the source is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Chunk>>;
}

/// In-process chunk source.
#[derive(Debug, Default)]
pub struct MemoryChunkSource {
    chunks: VecDeque<Vec<Row>>,
    next_sequence: u64,
    fail_at: Option<u64>,
}

impl MemoryChunkSource {
    /// Serve the given chunks in order.
    pub fn new(chunks: Vec<Vec<Row>>) -> Self {
        Self {
            chunks: chunks.into(),
            next_sequence: 0,
            fail_at: None,
        }
    }

    /// Split `rows` into chunks of at most `chunk_size` rows.
    pub fn from_rows(rows: Vec<Row>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let chunks = rows.chunks(chunk_size).map(|c| c.to_vec()).collect();
        Self::new(chunks)
    }

    /// Report a connectivity failure instead of yielding chunk `sequence`.
    pub fn with_failure_at(mut self, sequence: u64) -> Self {
        self.fail_at = Some(sequence);
        self
    }
}

#[async_trait]
impl ChunkSource for MemoryChunkSource {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.fail_at == Some(self.next_sequence) {
            return Err(Error::connectivity(format!(
                "source unavailable at chunk {}",
                self.next_sequence
            )));
        }
        let Some(rows) = self.chunks.pop_front() else {
            return Ok(None);
        };
        let chunk = Chunk::new(self.next_sequence, rows);
        self.next_sequence += 1;
        Ok(Some(chunk))
    }
}

/// Resolved source column names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceColumns {
    pub timestamp: String,
    pub location: String,
    pub sku: String,
    pub target: String,
}

const TIMESTAMP_CANDIDATES: &[&str] = &["id_tie_fecha", "timestamp", "date", "fecha"];
const LOCATION_CANDIDATES: &[&str] = &["desc_cli_localidad", "location", "localidad"];
const SKU_CANDIDATES: &[&str] = &["id_sku", "sku"];
const TARGET_CANDIDATES: &[&str] = &["vtas_neta_tns", "quantity", "target", "sales"];

impl SourceColumns {
    /// Resolve column names against a schema, checking their types.
    pub fn resolve(schema: &Schema, overrides: &ColumnConfig) -> Result<Self> {
        let columns = Self {
            timestamp: find_column(schema, overrides.timestamp.as_deref(), TIMESTAMP_CANDIDATES)?,
            location: find_column(schema, overrides.location.as_deref(), LOCATION_CANDIDATES)?,
            sku: find_column(schema, overrides.sku.as_deref(), SKU_CANDIDATES)?,
            target: find_column(schema, overrides.target.as_deref(), TARGET_CANDIDATES)?,
        };

        let type_of = |name: &str| -> Result<DataType> {
            Ok(schema
                .field_with_name(name)
                .map_err(|e| Error::Schema(e.to_string()))?
                .data_type()
                .clone())
        };

        let ts_type = type_of(&columns.timestamp)?;
        if !is_timestamp_like(&ts_type) {
            return Err(Error::Schema(format!(
                "timestamp column '{}' has unsupported type {}",
                columns.timestamp, ts_type
            )));
        }
        for name in [&columns.location, &columns.sku] {
            let dt = type_of(name)?;
            if !is_label_like(&dt) {
                return Err(Error::Schema(format!(
                    "label column '{}' has unsupported type {}",
                    name, dt
                )));
            }
        }
        let target_type = type_of(&columns.target)?;
        if !target_type.is_numeric() {
            return Err(Error::Schema(format!(
                "target column '{}' has non-numeric type {}",
                columns.target, target_type
            )));
        }

        Ok(columns)
    }

    fn names(&self) -> [&str; 4] {
        [&self.timestamp, &self.location, &self.sku, &self.target]
    }
}

/// Find a column by explicit name or by checking candidate names.
fn find_column(schema: &Schema, explicit: Option<&str>, candidates: &[&str]) -> Result<String> {
    if let Some(name) = explicit {
        return match schema.column_with_name(name) {
            Some(_) => Ok(name.to_string()),
            None => Err(Error::Schema(format!("configured column '{}' not found", name))),
        };
    }
    for name in candidates {
        if schema.column_with_name(name).is_some() {
            return Ok(name.to_string());
        }
    }
    Err(Error::Schema(format!(
        "could not find column with any of these names: {:?}",
        candidates
    )))
}

fn is_timestamp_like(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Utf8
            | DataType::LargeUtf8
            | DataType::Utf8View
            | DataType::Date32
            | DataType::Date64
            | DataType::Timestamp(_, _)
    )
}

fn is_label_like(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View | DataType::Dictionary(_, _)
    ) || dt.is_integer()
}

/// Timestamp values of a column, `None` for nulls and unparseable strings.
fn timestamp_values(column: &ArrayRef) -> Result<Vec<Option<NaiveDateTime>>> {
    let schema_err = |e: arrow::error::ArrowError| Error::Schema(e.to_string());
    match column.data_type() {
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => {
            let strings = cast(column, &DataType::Utf8).map_err(schema_err)?;
            let strings = strings
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| Error::Schema("timestamp column is not a string array".into()))?;
            Ok(strings.iter().map(|v| v.and_then(parse_timestamp)).collect())
        }
        _ => {
            let millis = cast(column, &DataType::Timestamp(TimeUnit::Millisecond, None))
                .map_err(schema_err)?;
            let millis = millis
                .as_any()
                .downcast_ref::<TimestampMillisecondArray>()
                .ok_or_else(|| Error::Schema("timestamp column cannot be read as dates".into()))?;
            Ok((0..millis.len())
                .map(|i| {
                    if millis.is_null(i) {
                        None
                    } else {
                        millis.value_as_datetime(i)
                    }
                })
                .collect())
        }
    }
}

fn label_values(column: &ArrayRef) -> Result<StringArray> {
    let strings = cast(column, &DataType::Utf8).map_err(|e| Error::Schema(e.to_string()))?;
    strings
        .as_any()
        .downcast_ref::<StringArray>()
        .cloned()
        .ok_or_else(|| Error::Schema("label column cannot be read as strings".into()))
}

fn target_values(column: &ArrayRef) -> Result<Float64Array> {
    let values = cast(column, &DataType::Float64).map_err(|e| Error::Schema(e.to_string()))?;
    values
        .as_any()
        .downcast_ref::<Float64Array>()
        .cloned()
        .ok_or_else(|| Error::Schema("target column cannot be read as floats".into()))
}

/// Convert a record batch into rows.
///
/// Rows with a null field or an unparseable timestamp are dropped, as are rows
/// dated before `since`.
pub fn batch_to_rows(
    batch: &RecordBatch,
    columns: &SourceColumns,
    since: Option<NaiveDate>,
) -> Result<Vec<Row>> {
    let column = |name: &str| -> Result<&ArrayRef> {
        batch
            .column_by_name(name)
            .ok_or_else(|| Error::Schema(format!("column '{}' missing from batch", name)))
    };

    let timestamps = timestamp_values(column(&columns.timestamp)?)?;
    let locations = label_values(column(&columns.location)?)?;
    let skus = label_values(column(&columns.sku)?)?;
    let targets = target_values(column(&columns.target)?)?;

    let mut rows = Vec::with_capacity(batch.num_rows());
    for (i, timestamp) in timestamps.into_iter().enumerate() {
        let Some(timestamp) = timestamp else { continue };
        if locations.is_null(i) || skus.is_null(i) || targets.is_null(i) {
            continue;
        }
        if since.is_some_and(|day| timestamp.date() < day) {
            continue;
        }
        rows.push(Row::new(
            timestamp,
            locations.value(i),
            skus.value(i),
            targets.value(i),
        ));
    }
    Ok(rows)
}

/// Streams a Parquet table in chunks of up to `chunk_size` rows.
///
/// Decoding happens on a blocking thread that feeds a bounded channel, so at
/// most a couple of chunks are buffered ahead of the consumer. S3 objects are
/// spooled to a temporary file first.
pub struct ParquetChunkSource {
    receiver: mpsc::Receiver<Result<Vec<Row>>>,
    producer: Option<JoinHandle<()>>,
    columns: SourceColumns,
    next_sequence: u64,
}

impl ParquetChunkSource {
    /// Open the table named by `config.uri`.
    pub async fn open(config: &SourceConfig) -> Result<Self> {
        let location = parse_location(&config.uri).map_err(|e| Error::connectivity(e.to_string()))?;
        let file = match location {
            StoreLocation::Local(path) => File::open(&path).map_err(|e| {
                Error::connectivity(format!("cannot open {}: {}", path.display(), e))
            })?,
            StoreLocation::S3 { .. } => spool_remote(config).await?,
        };
        Self::from_file(file, config)
    }

    /// Stream an already-open Parquet file.
    pub fn from_file(file: File, config: &SourceConfig) -> Result<Self> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| Error::connectivity(format!("cannot read parquet metadata: {}", e)))?;
        let columns = SourceColumns::resolve(builder.schema(), &config.columns)?;

        let wanted = columns.names();
        let roots: Vec<usize> = builder
            .schema()
            .fields()
            .iter()
            .enumerate()
            .filter(|(_, f)| wanted.contains(&f.name().as_str()))
            .map(|(i, _)| i)
            .collect();
        let mask = ProjectionMask::roots(builder.parquet_schema(), roots);

        let reader = builder
            .with_batch_size(config.chunk_size.max(1))
            .with_projection(mask)
            .build()
            .map_err(|e| Error::connectivity(format!("cannot build parquet reader: {}", e)))?;

        tracing::info!(
            "Streaming {} in chunks of {} rows (columns: {})",
            config.uri,
            config.chunk_size,
            wanted.join(", ")
        );

        let (tx, rx) = mpsc::channel(2);
        let since = config.since;
        let producer_columns = columns.clone();
        let producer = tokio::task::spawn_blocking(move || {
            for batch in reader {
                let rows = batch
                    .map_err(|e| Error::connectivity(format!("parquet read failed: {}", e)))
                    .and_then(|batch| batch_to_rows(&batch, &producer_columns, since));
                let failed = rows.is_err();
                if matches!(&rows, Ok(r) if r.is_empty()) {
                    continue;
                }
                if tx.blocking_send(rows).is_err() || failed {
                    break;
                }
            }
        });

        Ok(Self {
            receiver: rx,
            producer: Some(producer),
            columns,
            next_sequence: 0,
        })
    }

    /// Column names in use.
    pub fn columns(&self) -> &SourceColumns {
        &self.columns
    }
}

/// Download an S3 object into an anonymous temporary file.
async fn spool_remote(config: &SourceConfig) -> Result<File> {
    let (store, path) = open_object(&config.uri, config.credentials.as_ref())
        .map_err(|e| Error::connectivity(e.to_string()))?;
    let result = store
        .get(&path)
        .await
        .map_err(|e| Error::connectivity(format!("cannot fetch {}: {}", config.uri, e)))?;

    let io_err = |e: std::io::Error| Error::connectivity(format!("spool write failed: {}", e));
    let mut file = tempfile::tempfile().map_err(io_err)?;
    let mut stream = result.into_stream();
    let mut total = 0usize;
    while let Some(part) = stream.next().await {
        let part = part.map_err(|e| Error::connectivity(format!("download failed: {}", e)))?;
        total += part.len();
        file.write_all(&part).map_err(io_err)?;
    }
    file.seek(SeekFrom::Start(0)).map_err(io_err)?;
    tracing::info!("Downloaded {} ({} bytes)", config.uri, total);
    Ok(file)
}

#[async_trait]
impl ChunkSource for ParquetChunkSource {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        match self.receiver.recv().await {
            Some(rows) => {
                let chunk = Chunk::new(self.next_sequence, rows?);
                self.next_sequence += 1;
                Ok(Some(chunk))
            }
            None => {
                if let Some(producer) = self.producer.take() {
                    producer
                        .await
                        .map_err(|e| Error::connectivity(format!("parquet reader task failed: {}", e)))?;
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Date32Array, Int64Array};
    use arrow::datatypes::Field;
    use parquet::arrow::ArrowWriter;
    use std::sync::Arc;

    fn write_parquet(path: &std::path::Path, batch: RecordBatch) {
        let file = File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    fn sales_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id_tie_fecha", DataType::Utf8, true),
            Field::new("desc_cli_localidad", DataType::Utf8, true),
            Field::new("id_sku", DataType::Int64, true),
            Field::new("vtas_neta_tns", DataType::Float64, true),
            Field::new("ignored", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![
                    Some("2023-12-31 00:00:00"),
                    Some("2024-01-01 00:00:00"),
                    Some("2024-01-02 00:00:00"),
                    Some("2024-01-03 00:00:00"),
                    Some("2024-01-04 00:00:00"),
                ])),
                Arc::new(StringArray::from(vec![
                    Some("ESQUEL"),
                    Some("ESQUEL   "),
                    Some("BARILOCHE"),
                    None,
                    Some("TREVELIN"),
                ])),
                Arc::new(Int64Array::from(vec![138202, 138202, 609400, 1, 138402])),
                Arc::new(Float64Array::from(vec![
                    Some(1.0),
                    Some(10.0),
                    Some(5.0),
                    Some(2.0),
                    Some(-2.88),
                ])),
                Arc::new(Int64Array::from(vec![0, 0, 0, 0, 0])),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_memory_source_sequences() {
        let row = Row::on_date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), "A", "1", 1.0);
        let mut source = MemoryChunkSource::from_rows(vec![row; 5], 2);

        let mut seen = Vec::new();
        while let Some(chunk) = source.next_chunk().await.unwrap() {
            seen.push((chunk.sequence, chunk.len()));
        }
        assert_eq!(seen, vec![(0, 2), (1, 2), (2, 1)]);
    }

    #[tokio::test]
    async fn test_memory_source_failure() {
        let row = Row::on_date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), "A", "1", 1.0);
        let mut source = MemoryChunkSource::new(vec![vec![row.clone()], vec![row]]).with_failure_at(1);

        assert!(source.next_chunk().await.unwrap().is_some());
        assert!(matches!(
            source.next_chunk().await,
            Err(Error::SourceConnectivity(_))
        ));
    }

    #[tokio::test]
    async fn test_parquet_source_chunks_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ventas.parquet");
        write_parquet(&path, sales_batch());

        let config = SourceConfig {
            uri: path.to_string_lossy().into_owned(),
            chunk_size: 2,
            since: NaiveDate::from_ymd_opt(2024, 1, 1),
            ..SourceConfig::default()
        };
        let mut source = ParquetChunkSource::open(&config).await.unwrap();
        assert_eq!(source.columns().target, "vtas_neta_tns");

        let mut chunks = Vec::new();
        while let Some(chunk) = source.next_chunk().await.unwrap() {
            chunks.push(chunk);
        }

        // Batch 1: 2023 row filtered out; batch 2: null location dropped
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].sequence, 0);
        assert_eq!(chunks[0].rows.len(), 1);
        assert_eq!(chunks[0].rows[0].location, "ESQUEL   ");
        assert_eq!(chunks[0].rows[0].sku, "138202");
        assert_eq!(chunks[1].rows.len(), 1);
        assert_eq!(chunks[1].rows[0].location, "BARILOCHE");
        assert_eq!(chunks[2].sequence, 2);
        assert_eq!(chunks[2].rows[0].quantity, -2.88);
    }

    #[tokio::test]
    async fn test_parquet_source_date_column_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.parquet");
        let schema = Arc::new(Schema::new(vec![
            Field::new("day", DataType::Date32, false),
            Field::new("store", DataType::Utf8, false),
            Field::new("product", DataType::Utf8, false),
            Field::new("units", DataType::Int64, false),
        ]));
        // 19723 days after the epoch is 2024-01-01
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Date32Array::from(vec![19723, 19724])),
                Arc::new(StringArray::from(vec!["ESQUEL", "BARILOCHE"])),
                Arc::new(StringArray::from(vec!["138202", "609400"])),
                Arc::new(Int64Array::from(vec![10, 5])),
            ],
        )
        .unwrap();
        write_parquet(&path, batch);

        let config = SourceConfig {
            uri: path.to_string_lossy().into_owned(),
            columns: ColumnConfig {
                timestamp: Some("day".into()),
                location: Some("store".into()),
                sku: Some("product".into()),
                target: Some("units".into()),
            },
            ..SourceConfig::default()
        };
        let mut source = ParquetChunkSource::open(&config).await.unwrap();
        let chunk = source.next_chunk().await.unwrap().unwrap();

        assert_eq!(chunk.rows.len(), 2);
        assert_eq!(
            chunk.rows[0].timestamp,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
        );
        assert_eq!(chunk.rows[1].quantity, 5.0);
        assert!(source.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_column_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.parquet");
        let schema = Arc::new(Schema::new(vec![Field::new("id_tie_fecha", DataType::Utf8, false)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(StringArray::from(vec!["2024-01-01"]))],
        )
        .unwrap();
        write_parquet(&path, batch);

        let config = SourceConfig {
            uri: path.to_string_lossy().into_owned(),
            ..SourceConfig::default()
        };
        assert!(matches!(
            ParquetChunkSource::open(&config).await,
            Err(Error::Schema(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_file_is_connectivity_error() {
        let config = SourceConfig {
            uri: "/nonexistent/ventas.parquet".into(),
            ..SourceConfig::default()
        };
        assert!(matches!(
            ParquetChunkSource::open(&config).await,
            Err(Error::SourceConnectivity(_))
        ));
    }
}

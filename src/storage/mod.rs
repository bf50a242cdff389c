//! Checkpoints (Arrow/Parquet)
//!
//! The event log is the source of truth for statistics. A checkpoint writes
//! it as one Parquet file; restoring replays the file through the
//! aggregator, which rebuilds every counter. Experiment definitions
//! (including the decision that concluded them) are saved next to it as
//! JSON so a restarted process sees the same epochs and outcomes. The
//! sequential looks taken so far go into a second Parquet file: alpha
//! already spent cannot be derived from the events.
//!
//! **Append-only**: a checkpoint is always a full rewrite of each file. Files
//! are written next to the target and renamed into place, so readers never
//! observe a half-written checkpoint.
//!
//! Event schema (one row per event):
//!
//! | column          | type                    | nullable |
//! |-----------------|-------------------------|----------|
//! | `experiment_id` | Utf8                    | no       |
//! | `visitor_id`    | Utf8                    | no       |
//! | `variant_id`    | Utf8                    | no       |
//! | `epoch`         | UInt32                  | no       |
//! | `event_type`    | Utf8                    | no       |
//! | `value`         | Float64                 | yes      |
//! | `dedupe_key`    | Utf8                    | no       |
//! | `timestamp_us`  | Timestamp(µs, UTC)      | no       |
//!
//! Look schema (one row per look, `look = 0` for a plan without looks):
//!
//! | column                 | type    |
//! |------------------------|---------|
//! | `experiment_id`        | Utf8    |
//! | `epoch`                | UInt32  |
//! | `look`                 | UInt64  |
//! | `information_fraction` | Float64 |
//! | `efficacy_boundary`    | Float64 |
//! | `planned_sample_size`  | UInt64  |
//! | `alpha_per_comparison` | Float64 |
//! | `sequence`             | UInt64  |

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    Array, Float64Array, StringArray, TimestampMicrosecondArray, UInt32Array, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::DateTime;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregate::ReplayReport;
use crate::analysis::LookRecord;
use crate::experiment::{EventRecord, EventType, ExperimentRecord};
use crate::{Error, Result};

/// Rows per record batch and Parquet row group.
pub const BATCH_ROWS: usize = 65_536;

const UTC: &str = "UTC";

/// Arrow schema of a checkpoint file.
#[must_use]
pub fn event_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("experiment_id", DataType::Utf8, false),
        Field::new("visitor_id", DataType::Utf8, false),
        Field::new("variant_id", DataType::Utf8, false),
        Field::new("epoch", DataType::UInt32, false),
        Field::new("event_type", DataType::Utf8, false),
        Field::new("value", DataType::Float64, true),
        Field::new("dedupe_key", DataType::Utf8, false),
        Field::new(
            "timestamp_us",
            DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into())),
            false,
        ),
    ]))
}

/// Convert events into one record batch.
///
/// # Errors
///
/// `Arrow` if the columns do not match the schema.
pub fn events_to_batch(events: &[EventRecord]) -> Result<RecordBatch> {
    let strings = |f: fn(&EventRecord) -> &str| StringArray::from_iter_values(events.iter().map(f));

    let batch = RecordBatch::try_new(
        event_schema(),
        vec![
            Arc::new(strings(EventRecord::experiment_id)),
            Arc::new(strings(EventRecord::visitor_id)),
            Arc::new(strings(EventRecord::variant_id)),
            Arc::new(UInt32Array::from_iter_values(events.iter().map(EventRecord::epoch))),
            Arc::new(StringArray::from_iter_values(
                events.iter().map(|e| e.event_type().as_str()),
            )),
            Arc::new(events.iter().map(EventRecord::value).collect::<Float64Array>()),
            Arc::new(strings(EventRecord::dedupe_key)),
            Arc::new(
                TimestampMicrosecondArray::from_iter_values(
                    events.iter().map(|e| e.timestamp().timestamp_micros()),
                )
                .with_timezone(UTC),
            ),
        ],
    )?;
    Ok(batch)
}

/// Convert a record batch back into events.
///
/// # Errors
///
/// `StorageError` for a missing or mistyped column, an unknown event type
/// or an out-of-range timestamp.
pub fn batch_to_events(batch: &RecordBatch) -> Result<Vec<EventRecord>> {
    let experiment_ids = column::<StringArray>(batch, "experiment_id")?;
    let visitor_ids = column::<StringArray>(batch, "visitor_id")?;
    let variant_ids = column::<StringArray>(batch, "variant_id")?;
    let epochs = column::<UInt32Array>(batch, "epoch")?;
    let event_types = column::<StringArray>(batch, "event_type")?;
    let values = column::<Float64Array>(batch, "value")?;
    let dedupe_keys = column::<StringArray>(batch, "dedupe_key")?;
    let timestamps = column::<TimestampMicrosecondArray>(batch, "timestamp_us")?;

    (0..batch.num_rows())
        .map(|row| {
            let event_type = EventType::parse(event_types.value(row)).ok_or_else(|| {
                Error::StorageError(format!(
                    "row {row}: unknown event type '{}'",
                    event_types.value(row)
                ))
            })?;
            let timestamp = DateTime::from_timestamp_micros(timestamps.value(row))
                .ok_or_else(|| Error::StorageError(format!("row {row}: timestamp out of range")))?;
            let value = (!values.is_null(row)).then(|| values.value(row));

            Ok(EventRecord::builder(
                experiment_ids.value(row),
                visitor_ids.value(row),
                variant_ids.value(row),
                event_type,
            )
            .epoch(epochs.value(row))
            .maybe_value(value)
            .dedupe_key(dedupe_keys.value(row))
            .timestamp(timestamp)
            .build())
        })
        .collect()
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::StorageError(format!("checkpoint is missing column '{name}'")))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::StorageError(format!("column '{name}' has an unexpected type")))
}

/// Write events to a Parquet checkpoint, replacing any existing file.
///
/// Returns the number of rows written.
///
/// # Errors
///
/// `Io`, `Arrow` or `Parquet` if the file cannot be produced.
pub fn write_events<P: AsRef<Path>>(path: P, events: &[EventRecord]) -> Result<usize> {
    let path = path.as_ref();
    write_parquet(path, event_schema(), events.chunks(BATCH_ROWS).map(events_to_batch))?;
    info!(path = %path.display(), rows = events.len(), "event checkpoint written");
    Ok(events.len())
}

/// Load every event from a Parquet checkpoint.
///
/// # Errors
///
/// `StorageError` if the file cannot be opened or does not match the schema.
pub fn read_events<P: AsRef<Path>>(path: P) -> Result<Vec<EventRecord>> {
    let path = path.as_ref();
    let mut events = Vec::new();
    for batch in read_parquet(path)? {
        events.extend(batch_to_events(&batch)?);
    }
    info!(path = %path.display(), rows = events.len(), "event checkpoint loaded");
    Ok(events)
}

/// Arrow schema of the look file.
#[must_use]
pub fn look_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("experiment_id", DataType::Utf8, false),
        Field::new("epoch", DataType::UInt32, false),
        Field::new("look", DataType::UInt64, false),
        Field::new("information_fraction", DataType::Float64, false),
        Field::new("efficacy_boundary", DataType::Float64, false),
        Field::new("planned_sample_size", DataType::UInt64, false),
        Field::new("alpha_per_comparison", DataType::Float64, false),
        Field::new("sequence", DataType::UInt64, false),
    ]))
}

/// Convert look records into one record batch.
///
/// # Errors
///
/// `Arrow` if the columns do not match the schema.
pub fn looks_to_batch(looks: &[LookRecord]) -> Result<RecordBatch> {
    let floats = |f: fn(&LookRecord) -> f64| Float64Array::from_iter_values(looks.iter().map(f));

    let batch = RecordBatch::try_new(
        look_schema(),
        vec![
            Arc::new(StringArray::from_iter_values(
                looks.iter().map(|l| l.experiment_id.as_str()),
            )),
            Arc::new(UInt32Array::from_iter_values(looks.iter().map(|l| l.epoch))),
            Arc::new(UInt64Array::from_iter_values(looks.iter().map(|l| l.look as u64))),
            Arc::new(floats(|l| l.information_fraction)),
            Arc::new(floats(|l| l.efficacy_boundary)),
            Arc::new(UInt64Array::from_iter_values(
                looks.iter().map(|l| l.planned_sample_size),
            )),
            Arc::new(floats(|l| l.alpha_per_comparison)),
            Arc::new(UInt64Array::from_iter_values(looks.iter().map(|l| l.sequence))),
        ],
    )?;
    Ok(batch)
}

/// Convert a record batch back into look records.
///
/// # Errors
///
/// `StorageError` for a missing or mistyped column or an oversized look index.
pub fn batch_to_looks(batch: &RecordBatch) -> Result<Vec<LookRecord>> {
    let experiment_ids = column::<StringArray>(batch, "experiment_id")?;
    let epochs = column::<UInt32Array>(batch, "epoch")?;
    let looks = column::<UInt64Array>(batch, "look")?;
    let fractions = column::<Float64Array>(batch, "information_fraction")?;
    let boundaries = column::<Float64Array>(batch, "efficacy_boundary")?;
    let planned = column::<UInt64Array>(batch, "planned_sample_size")?;
    let alphas = column::<Float64Array>(batch, "alpha_per_comparison")?;
    let sequences = column::<UInt64Array>(batch, "sequence")?;

    (0..batch.num_rows())
        .map(|row| {
            let look = usize::try_from(looks.value(row))
                .map_err(|_| Error::StorageError(format!("row {row}: look index out of range")))?;
            Ok(LookRecord {
                experiment_id: experiment_ids.value(row).to_string(),
                epoch: epochs.value(row),
                look,
                information_fraction: fractions.value(row),
                efficacy_boundary: boundaries.value(row),
                planned_sample_size: planned.value(row),
                alpha_per_comparison: alphas.value(row),
                sequence: sequences.value(row),
            })
        })
        .collect()
}

/// Write look records to Parquet, replacing any existing file.
///
/// # Errors
///
/// `Io`, `Arrow` or `Parquet` if the file cannot be produced.
pub fn write_looks<P: AsRef<Path>>(path: P, looks: &[LookRecord]) -> Result<usize> {
    let path = path.as_ref();
    write_parquet(path, look_schema(), looks.chunks(BATCH_ROWS).map(looks_to_batch))?;
    info!(path = %path.display(), rows = looks.len(), "look checkpoint written");
    Ok(looks.len())
}

/// Load look records written by [`write_looks`].
///
/// # Errors
///
/// `StorageError` if the file cannot be opened or does not match the schema.
pub fn read_looks<P: AsRef<Path>>(path: P) -> Result<Vec<LookRecord>> {
    let mut looks = Vec::new();
    for batch in read_parquet(path.as_ref())? {
        looks.extend(batch_to_looks(&batch)?);
    }
    Ok(looks)
}

fn write_parquet<I>(path: &Path, schema: SchemaRef, batches: I) -> Result<()>
where
    I: IntoIterator<Item = Result<RecordBatch>>,
{
    let staging = path.with_extension("parquet.tmp");
    let file = File::create(&staging)?;
    let props = WriterProperties::builder()
        .set_max_row_group_size(BATCH_ROWS)
        .build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    for batch in batches {
        writer.write(&batch?)?;
    }
    writer.close()?;
    std::fs::rename(&staging, path)?;
    Ok(())
}

fn read_parquet(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path).map_err(|e| {
        Error::StorageError(format!("Failed to open checkpoint {}: {e}", path.display()))
    })?;

    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| Error::StorageError(format!("Failed to parse Parquet file: {e}")))?
        .with_batch_size(BATCH_ROWS)
        .build()
        .map_err(|e| Error::StorageError(format!("Failed to create Parquet reader: {e}")))?;

    reader
        .map(|batch| {
            batch.map_err(|e| Error::StorageError(format!("Failed to read record batch: {e}")))
        })
        .collect()
}

/// Name of the event file inside a checkpoint directory.
pub const EVENTS_FILE: &str = "events.parquet";
/// Name of the experiment file inside a checkpoint directory.
pub const EXPERIMENTS_FILE: &str = "experiments.json";
/// Name of the look file inside a checkpoint directory.
pub const LOOKS_FILE: &str = "looks.parquet";

/// What a checkpoint wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    /// Experiment records saved
    pub experiments: usize,
    /// Events saved
    pub events: usize,
    /// Sequential looks saved
    pub looks: usize,
}

/// What a restore loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Experiment records re-registered
    pub experiments: usize,
    /// Experiments whose look history was rebuilt
    pub looks: usize,
    /// Outcome of replaying the events
    pub replay: ReplayReport,
}

/// Write experiment records as pretty JSON, replacing any existing file.
///
/// # Errors
///
/// `Io` or `Serialization` if the file cannot be produced.
pub fn write_experiments<P: AsRef<Path>>(path: P, experiments: &[ExperimentRecord]) -> Result<usize> {
    let path = path.as_ref();
    let staging = path.with_extension("json.tmp");
    std::fs::write(&staging, serde_json::to_vec_pretty(experiments)?)?;
    std::fs::rename(&staging, path)?;
    Ok(experiments.len())
}

/// Read experiment records written by [`write_experiments`].
///
/// # Errors
///
/// `Io` if the file cannot be read, `Serialization` for malformed JSON.
pub fn read_experiments<P: AsRef<Path>>(path: P) -> Result<Vec<ExperimentRecord>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

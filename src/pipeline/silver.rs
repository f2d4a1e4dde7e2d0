use super::bronze::CUBE_COLUMN;
use super::{Pipeline, StageFailure, StageReport};
use crate::quality::QualityGate;
use crate::storage::Tier;
use crate::table::date_parser::parse_timestamp_micros;
use crate::table::{self, Value};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Int64Array, StringArray, TimestampMicrosecondArray,
    UInt32Array,
};
use arrow::compute::{concat_batches, take, take_record_batch};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::DateTime;
use md5::{Digest, Md5};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub const EFFECTIVE_DATE: &str = "EffectiveDate";
pub const END_DATE: &str = "EndDate";
pub const CURRENT_FLAG: &str = "CurrentFlag";
/// Integer `YYYYMMDD` key carried by the date dimension.
pub const CALENDAR_KEY: &str = "CalendarKey";

/// MD5 hex digest of the value's canonical string; `None` for nulls.
pub fn surrogate_key(value: &Value) -> Option<String> {
    value
        .canonical()
        .map(|s| format!("{:x}", Md5::digest(s.as_bytes())))
}

/// A dimension table: one row per distinct value of `attribute`.
#[derive(Debug, Clone)]
pub struct Dimension {
    pub attribute: String,
    pub table: RecordBatch,
}

impl Dimension {
    pub fn key_column(attribute: &str) -> String {
        format!("{}Key", attribute)
    }

    pub fn snapshot_name(&self, cube: &str) -> String {
        format!("{}__Dim{}", cube, self.attribute)
    }
}

/// Build `(<Attr>Key, <Attr>)` tables for each present attribute. Distinct
/// non-null values keep first-seen order. The date dimension also gets
/// `CalendarKey`.
pub fn build_dimensions(
    batch: &RecordBatch,
    attributes: &[String],
    date_dimension: Option<&str>,
) -> Result<Vec<Dimension>, ArrowError> {
    let mut dims = Vec::new();
    for attribute in attributes {
        let Some(column) = batch.column_by_name(attribute) else {
            continue;
        };

        let mut seen = HashSet::new();
        let mut firsts = Vec::new();
        let mut values = Vec::new();
        for row in 0..batch.num_rows() {
            let value = Value::from_array(column.as_ref(), row);
            if !value.is_null() && seen.insert(value.clone()) {
                firsts.push(row as u32);
                values.push(value);
            }
        }

        let keys: StringArray = values.iter().map(surrogate_key).collect();
        let natural = take(column.as_ref(), &UInt32Array::from(firsts), None)?;

        let mut fields = vec![
            Field::new(Dimension::key_column(attribute), DataType::Utf8, false),
            Field::new(attribute, natural.data_type().clone(), true),
        ];
        let mut columns: Vec<ArrayRef> = vec![Arc::new(keys), natural];
        if date_dimension == Some(attribute.as_str()) {
            let calendar: Int64Array = values.iter().map(calendar_key).collect();
            fields.push(Field::new(CALENDAR_KEY, DataType::Int64, true));
            columns.push(Arc::new(calendar));
        }

        let table = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?;
        debug!(attribute = %attribute, rows = table.num_rows(), "built dimension");
        dims.push(Dimension {
            attribute: attribute.clone(),
            table,
        });
    }
    Ok(dims)
}

fn calendar_key(value: &Value) -> Option<i64> {
    let us = match value {
        Value::Timestamp(us) => *us,
        Value::Str(s) => parse_timestamp_micros(s)?,
        _ => return None,
    };
    DateTime::from_timestamp_micros(us)?
        .format("%Y%m%d")
        .to_string()
        .parse()
        .ok()
}

/// Which columns identify an entity across runs (besides the cube).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityIdentity {
    /// The tracked attribute values themselves.
    TrackedTuple,
    /// Dedicated key columns; tracked attributes then describe its state.
    NaturalKey(Vec<String>),
}

impl EntityIdentity {
    pub fn from_config(natural_key: &[String]) -> Self {
        if natural_key.is_empty() {
            EntityIdentity::TrackedTuple
        } else {
            EntityIdentity::NaturalKey(natural_key.to_vec())
        }
    }

    fn columns<'a>(&'a self, tracked: &'a [String]) -> &'a [String] {
        match self {
            EntityIdentity::TrackedTuple => tracked,
            EntityIdentity::NaturalKey(cols) => cols,
        }
    }
}

/// What one merge did to the history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    /// Incoming rows identical to their current version, dropped.
    pub unchanged: usize,
    /// New current versions appended.
    pub opened: usize,
    /// Current versions closed by a change.
    pub closed: usize,
    /// Current versions whose identity is absent from this batch.
    pub carried: usize,
}

pub struct HistoryMerge<'a> {
    pub cube: &'a str,
    pub identity: &'a EntityIdentity,
    pub tracked: &'a [String],
    pub now: i64,
}

/// Per-row values of `columns`, nulls for columns the table lacks.
struct RowKeys<'a> {
    batch: &'a RecordBatch,
    columns: Vec<Option<ArrayRef>>,
}

impl<'a> RowKeys<'a> {
    fn new(batch: &'a RecordBatch, columns: &[String]) -> Self {
        Self {
            batch,
            columns: columns.iter().map(|c| batch.column_by_name(c).cloned()).collect(),
        }
    }

    fn get(&self, row: usize) -> Vec<Value> {
        self.columns
            .iter()
            .map(|c| match c {
                Some(array) => Value::from_array(array.as_ref(), row),
                None => Value::Null,
            })
            .collect()
    }

    /// `(cube, values...)`; the row's own `cube_name` wins over `cube`.
    fn identity(&self, cube: &str, row: usize) -> Vec<Value> {
        let own = self
            .batch
            .column_by_name(CUBE_COLUMN)
            .map(|c| Value::from_array(c.as_ref(), row))
            .filter(|v| !v.is_null());
        let mut key = vec![own.unwrap_or_else(|| Value::Str(cube.to_string()))];
        key.extend(self.get(row));
        key
    }
}

fn is_current(history: &RecordBatch, row: usize) -> bool {
    let flag = history
        .column_by_name(CURRENT_FLAG)
        .map(|c| Value::from_array(c.as_ref(), row));
    let open = history
        .column_by_name(END_DATE)
        .map_or(true, |c| c.is_null(row));
    open && !matches!(flag, Some(Value::Bool(false)) | Some(Value::Null))
}

/// Merge an incoming batch into the cube's history (slowly changing
/// dimension, type 2).
///
/// An incoming row is dropped only when a current history row has the same
/// identity and the same tracked values; every other incoming row opens a
/// new version, including rows sharing an identity within the batch. A
/// current row is closed when the batch brings its identity with none of
/// its tracked values. Closed rows are never rewritten and no row is
/// deleted.
pub fn apply_history(
    incoming: &RecordBatch,
    history: Option<&RecordBatch>,
    merge: &HistoryMerge<'_>,
) -> Result<(RecordBatch, MergeSummary), ArrowError> {
    let identity_cols = merge.identity.columns(merge.tracked);
    let in_ids = RowKeys::new(incoming, identity_cols);
    let in_tracked = RowKeys::new(incoming, merge.tracked);

    let mut arriving: HashMap<Vec<Value>, Vec<Vec<Value>>> = HashMap::new();
    let rows: Vec<(Vec<Value>, Vec<Value>)> = (0..incoming.num_rows())
        .map(|row| {
            let key = in_ids.identity(merge.cube, row);
            let signature = in_tracked.get(row);
            arriving.entry(key.clone()).or_default().push(signature.clone());
            (key, signature)
        })
        .collect();

    let mut current: HashMap<Vec<Value>, Vec<(usize, Vec<Value>)>> = HashMap::new();
    if let Some(history) = history {
        let h_ids = RowKeys::new(history, identity_cols);
        let h_tracked = RowKeys::new(history, merge.tracked);
        for row in (0..history.num_rows()).filter(|&r| is_current(history, r)) {
            current
                .entry(h_ids.identity(merge.cube, row))
                .or_default()
                .push((row, h_tracked.get(row)));
        }
    }

    let mut summary = MergeSummary::default();
    let mut opened = Vec::new();
    for (row, (key, signature)) in rows.iter().enumerate() {
        let seen = current
            .get(key)
            .is_some_and(|versions| versions.iter().any(|(_, s)| s == signature));
        if seen {
            summary.unchanged += 1;
        } else {
            opened.push(row as u32);
        }
    }

    let mut closed = HashSet::new();
    for (key, versions) in &current {
        match arriving.get(key) {
            None => summary.carried += versions.len(),
            Some(signatures) => closed.extend(
                versions
                    .iter()
                    .filter(|(_, s)| !signatures.contains(s))
                    .map(|(row, _)| *row),
            ),
        }
    }
    summary.opened = opened.len();
    summary.closed = closed.len();

    let new_rows = take_record_batch(incoming, &UInt32Array::from(opened))?;
    let new_rows = tag_open(&new_rows, merge.now)?;

    let merged = match history {
        None => new_rows,
        Some(history) => {
            let history = close_rows(history, &closed, merge.now)?;
            let schema = Arc::new(table::union_schema(&history.schema(), &new_rows.schema()));
            let parts = [
                table::align_to(&history, &schema)?,
                table::align_to(&new_rows, &schema)?,
            ];
            concat_batches(&schema, &parts)?
        }
    };
    Ok((merged, summary))
}

fn tag_open(batch: &RecordBatch, now: i64) -> Result<RecordBatch, ArrowError> {
    let rows = batch.num_rows();
    let batch = table::with_column(batch, EFFECTIVE_DATE, table::constant_timestamp(now, rows))?;
    let end = TimestampMicrosecondArray::from(vec![None::<i64>; rows]);
    let batch = table::with_column(&batch, END_DATE, Arc::new(end))?;
    table::with_column(&batch, CURRENT_FLAG, Arc::new(BooleanArray::from(vec![true; rows])))
}

fn close_rows(history: &RecordBatch, rows: &HashSet<usize>, now: i64) -> Result<RecordBatch, ArrowError> {
    if rows.is_empty() {
        return Ok(history.clone());
    }
    let n = history.num_rows();
    let previous_flag = history.column_by_name(CURRENT_FLAG);
    let flags: BooleanArray = (0..n)
        .map(|r| {
            if rows.contains(&r) {
                return Some(false);
            }
            match previous_flag.map(|c| Value::from_array(c.as_ref(), r)) {
                Some(Value::Bool(b)) => Some(b),
                Some(_) => None,
                None => Some(true),
            }
        })
        .collect();

    let timestamp = DataType::Timestamp(TimeUnit::Microsecond, None);
    let previous_end = match history.column_by_name(END_DATE) {
        Some(col) => arrow::compute::cast(col.as_ref(), &timestamp)?,
        None => arrow::array::new_null_array(&timestamp, n),
    };
    let previous_end = previous_end
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .ok_or_else(|| ArrowError::CastError("EndDate is not a timestamp".into()))?;
    let ends: TimestampMicrosecondArray = (0..n)
        .map(|r| {
            if rows.contains(&r) {
                Some(now)
            } else if previous_end.is_null(r) {
                None
            } else {
                Some(previous_end.value(r))
            }
        })
        .collect();

    let history = table::with_column(history, CURRENT_FLAG, Arc::new(flags))?;
    table::with_column(&history, END_DATE, Arc::new(ends))
}

#[instrument(level = "info", skip_all, fields(cube = %cube))]
pub(super) fn run(pipeline: &Pipeline<'_>, cube: &str) -> Result<StageReport, StageFailure> {
    let config = &pipeline.config.silver;
    let bronze = pipeline.storage.load(Tier::Bronze, cube)?;

    let dimensions = build_dimensions(&bronze, &config.dimensions, config.date_dimension.as_deref())?;
    let mut saved = Vec::with_capacity(dimensions.len());
    for dim in &dimensions {
        let name = dim.snapshot_name(cube);
        pipeline.storage.save(Tier::Silver, &name, &dim.table)?;
        saved.push(name);
    }
    pipeline.audit.info(
        "silver_dimensions",
        &format!("Created {} dimensions", dimensions.len()),
        json!({ "cube": cube, "dimensions": saved }),
    );

    let history = pipeline.storage.load_if_exists(Tier::Silver, cube)?;
    let identity = EntityIdentity::from_config(&config.natural_key);
    let merge = HistoryMerge {
        cube,
        identity: &identity,
        tracked: &config.tracked_attributes,
        now: pipeline.ctx.now,
    };
    let (merged, summary) = apply_history(&bronze, history.as_ref(), &merge)?;
    info!(
        opened = summary.opened,
        closed = summary.closed,
        unchanged = summary.unchanged,
        carried = summary.carried,
        "history merged"
    );

    let quality =
        QualityGate::new(&pipeline.config.quality, pipeline.audit).evaluate(&merged, "silver", cube);

    pipeline.storage.save(Tier::Silver, cube, &merged)?;
    pipeline.audit.info(
        "silver_save",
        &format!("Saved {} rows for cube {}", merged.num_rows(), cube),
        json!({ "cube": cube, "rows": merged.num_rows(), "merge": summary }),
    );

    Ok(StageReport {
        rows: merged.num_rows(),
        quality,
        merge: Some(summary),
        dimensions: saved,
        ..Default::default()
    })
}

use super::{Pipeline, StageFailure, StageReport};
use crate::config::BronzeConfig;
use crate::quality::QualityGate;
use crate::storage::Tier;
use crate::table::date_parser::{clean_str, month_of_micros, parse_timestamp_micros};
use crate::table::{self, ColumnKind, TableSchema, Value};
use arrow::array::{Array, ArrayRef, AsArray, StringArray, TimestampMicrosecondBuilder};
use arrow::compute::{cast, cast_with_options, CastOptions};
use arrow::datatypes::DataType;
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use arrow::util::display::FormatOptions;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const CUBE_COLUMN: &str = "cube_name";
pub const EXTRACTION_TIME_COLUMN: &str = "bronze_extraction_time";

/// A declared column that could not be converted; the column keeps its
/// original values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CastFailure {
    pub column: String,
    pub from: String,
    pub to: ColumnKind,
    pub reason: String,
}

/// Cast every declared column the table has to its configured kind.
/// Undeclared columns pass through.
pub fn enforce_types(
    batch: &RecordBatch,
    column_types: &BTreeMap<String, ColumnKind>,
) -> Result<(RecordBatch, Vec<CastFailure>), ArrowError> {
    let mut out = batch.clone();
    let mut failures = Vec::new();

    for (name, kind) in column_types {
        let Some(column) = batch.column_by_name(name) else {
            continue;
        };
        match cast_column(column, *kind) {
            Ok(converted) => out = table::with_column(&out, name, converted)?,
            Err(reason) => failures.push(CastFailure {
                column: name.clone(),
                from: column.data_type().to_string(),
                to: *kind,
                reason,
            }),
        }
    }
    Ok((out, failures))
}

fn cast_column(column: &ArrayRef, kind: ColumnKind) -> Result<ArrayRef, String> {
    let target = kind.arrow_type();
    if column.data_type() == &target {
        return Ok(column.clone());
    }
    match column.data_type() {
        DataType::Utf8 | DataType::LargeUtf8 => {
            let strings = blank_as_null(column)?;
            if kind == ColumnKind::Datetime {
                parse_datetimes(&strings)
            } else {
                strict_cast(&(Arc::new(strings) as ArrayRef), &target)
            }
        }
        _ => strict_cast(column, &target),
    }
}

/// Trimmed strings, with empty cells turned into nulls.
fn blank_as_null(column: &ArrayRef) -> Result<StringArray, String> {
    let utf8 = cast(column.as_ref(), &DataType::Utf8).map_err(|e| e.to_string())?;
    Ok(utf8
        .as_string::<i32>()
        .iter()
        .map(|s| s.map(clean_str).filter(|s| !s.is_empty()))
        .collect())
}

fn parse_datetimes(strings: &StringArray) -> Result<ArrayRef, String> {
    let mut out = TimestampMicrosecondBuilder::with_capacity(strings.len());
    for s in strings.iter() {
        match s {
            None => out.append_null(),
            Some(s) => match parse_timestamp_micros(s) {
                Some(us) => out.append_value(us),
                None => return Err(format!("unparsable datetime `{}`", s)),
            },
        }
    }
    Ok(Arc::new(out.finish()))
}

fn strict_cast(column: &ArrayRef, target: &DataType) -> Result<ArrayRef, String> {
    let options = CastOptions {
        safe: false,
        format_options: FormatOptions::default(),
    };
    cast_with_options(column.as_ref(), target, &options).map_err(|e| e.to_string())
}

/// Where a row's partition value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionSource {
    /// The partition column is already there and is kept as is.
    Existing,
    /// Month of this date column.
    FromDate(String),
    /// No date column: every row gets the fallback period.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub column: String,
    pub source: PartitionSource,
    pub fallback: String,
}

impl PartitionPlan {
    pub fn resolve(desc: &TableSchema, config: &BronzeConfig, now: i64) -> Self {
        let source = if desc.has(&config.partition_column) {
            PartitionSource::Existing
        } else if desc.has(&config.date_column) {
            PartitionSource::FromDate(config.date_column.clone())
        } else {
            PartitionSource::Fallback
        };
        Self {
            column: config.partition_column.clone(),
            source,
            fallback: fallback_period(config, now),
        }
    }
}

/// Configured fallback, else the month of `now`.
pub fn fallback_period(config: &BronzeConfig, now: i64) -> String {
    config
        .fallback_partition
        .clone()
        .or_else(|| month_of_micros(now))
        .unwrap_or_else(|| "1970-01".to_string())
}

pub fn assign_partition(batch: &RecordBatch, plan: &PartitionPlan) -> Result<RecordBatch, ArrowError> {
    let rows = batch.num_rows();
    let periods: ArrayRef = match &plan.source {
        PartitionSource::Existing => return Ok(batch.clone()),
        PartitionSource::Fallback => table::constant_utf8(&plan.fallback, rows),
        PartitionSource::FromDate(column) => {
            let Some(dates) = batch.column_by_name(column) else {
                return Err(ArrowError::SchemaError(format!(
                    "date column `{}` not found",
                    column
                )));
            };
            let periods: StringArray = (0..rows)
                .map(|row| {
                    let month = match Value::from_array(dates.as_ref(), row) {
                        Value::Timestamp(us) => month_of_micros(us),
                        Value::Str(s) => parse_timestamp_micros(&s).and_then(month_of_micros),
                        _ => None,
                    };
                    Some(month.unwrap_or_else(|| plan.fallback.clone()))
                })
                .collect();
            Arc::new(periods)
        }
    };
    table::with_column(batch, &plan.column, periods)
}

/// Stamp every row with its cube and the extraction time.
pub fn add_lineage(batch: &RecordBatch, cube: &str, at: i64) -> Result<RecordBatch, ArrowError> {
    let rows = batch.num_rows();
    let batch = table::with_column(batch, CUBE_COLUMN, table::constant_utf8(cube, rows))?;
    table::with_column(&batch, EXTRACTION_TIME_COLUMN, table::constant_timestamp(at, rows))
}

#[instrument(level = "info", skip_all, fields(cube = %cube, rows = raw.num_rows()))]
pub(super) fn run(
    pipeline: &Pipeline<'_>,
    cube: &str,
    raw: &RecordBatch,
) -> Result<StageReport, StageFailure> {
    let config = &pipeline.config.bronze;
    let now = pipeline.ctx.now;

    let (typed, cast_failures) = enforce_types(raw, &config.column_types)?;
    for failure in &cast_failures {
        warn!(column = %failure.column, to = %failure.to, reason = %failure.reason, "type cast failed");
        pipeline.audit.warning(
            "type_cast_error",
            &format!("Failed to cast column {} to {}", failure.column, failure.to),
            json!({ "cube": cube, "column": failure.column, "error": failure.reason }),
        );
    }

    let plan = PartitionPlan::resolve(&TableSchema::of(&typed), config, now);
    let partitioned = assign_partition(&typed, &plan)?;
    let bronze = add_lineage(&partitioned, cube, now)?;

    let quality =
        QualityGate::new(&pipeline.config.quality, pipeline.audit).evaluate(&bronze, "bronze", cube);

    pipeline.storage.save(Tier::Bronze, cube, &bronze)?;
    info!(rows = bronze.num_rows(), "bronze snapshot saved");
    pipeline.audit.info(
        "bronze_save",
        &format!("Saved {} rows for cube {}", bronze.num_rows(), cube),
        json!({ "cube": cube, "rows": bronze.num_rows() }),
    );

    Ok(StageReport {
        rows: bronze.num_rows(),
        quality,
        cast_failures,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, TimestampMicrosecondArray};
    use arrow::datatypes::{Field, Int64Type, Schema, TimeUnit, TimestampMicrosecondType};
    use chrono::NaiveDate;

    fn micros(y: i32, m: u32, d: u32) -> i64 {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_micros()
    }

    fn raw(columns: Vec<(&str, Vec<Option<&str>>)>) -> RecordBatch {
        let fields: Vec<Field> = columns
            .iter()
            .map(|(n, _)| Field::new(*n, DataType::Utf8, true))
            .collect();
        let arrays: Vec<ArrayRef> = columns
            .into_iter()
            .map(|(_, v)| Arc::new(StringArray::from(v)) as ArrayRef)
            .collect();
        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).unwrap()
    }

    fn types(pairs: &[(&str, ColumnKind)]) -> BTreeMap<String, ColumnKind> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn casts_declared_columns() {
        let batch = raw(vec![
            ("Quantity", vec![Some("3"), Some(" 4 "), Some("")]),
            ("Date", vec![Some("2024-01-15"), Some("2024-02-01 10:30:00"), None]),
            ("Region", vec![Some("A"), Some("B"), Some("C")]),
        ]);
        let declared = types(&[
            ("Quantity", ColumnKind::Integer),
            ("Date", ColumnKind::Datetime),
            ("Sales", ColumnKind::Float),
        ]);

        let (typed, failures) = enforce_types(&batch, &declared).unwrap();

        assert!(failures.is_empty());
        let quantity = typed.column_by_name("Quantity").unwrap().as_primitive::<Int64Type>();
        assert_eq!(quantity.iter().collect::<Vec<_>>(), vec![Some(3), Some(4), None]);
        let dates = typed
            .column_by_name("Date")
            .unwrap()
            .as_primitive::<TimestampMicrosecondType>();
        assert_eq!(dates.value(0), micros(2024, 1, 15));
        assert!(dates.is_null(2));
        assert_eq!(typed.schema().field_with_name("Region").unwrap().data_type(), &DataType::Utf8);
    }

    #[test]
    fn failed_cast_leaves_column_untouched() {
        let batch = raw(vec![("Quantity", vec![Some("3"), Some("lots")])]);
        let (typed, failures) =
            enforce_types(&batch, &types(&[("Quantity", ColumnKind::Integer)])).unwrap();

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].column, "Quantity");
        assert_eq!(failures[0].to, ColumnKind::Integer);
        assert_eq!(typed, batch);
    }

    #[test]
    fn categorical_columns_become_dictionaries() {
        let batch = raw(vec![("Region", vec![Some("A"), Some("B"), Some("A")])]);
        let (typed, _) =
            enforce_types(&batch, &types(&[("Region", ColumnKind::Categorical)])).unwrap();
        assert_eq!(
            TableSchema::of(&typed).kind("Region"),
            Some(ColumnKind::Categorical)
        );
        assert_eq!(
            Value::from_array(typed.column(0).as_ref(), 2),
            Value::Str("A".into())
        );
    }

    fn dated(dates: Vec<Option<i64>>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "Date",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            true,
        )]));
        RecordBatch::try_new(
            schema,
            vec![Arc::new(TimestampMicrosecondArray::from(dates)) as ArrayRef],
        )
        .unwrap()
    }

    fn partitions(batch: &RecordBatch) -> Vec<String> {
        let col = batch.column_by_name("partition_month").unwrap();
        (0..batch.num_rows())
            .map(|r| Value::from_array(col.as_ref(), r).canonical().unwrap())
            .collect()
    }

    #[test]
    fn partition_from_date_with_fallback_for_nulls() {
        let config = BronzeConfig {
            fallback_partition: Some("1999-12".into()),
            ..Default::default()
        };
        let batch = dated(vec![Some(micros(2024, 1, 15)), None, Some(micros(2024, 2, 29))]);
        let plan = PartitionPlan::resolve(&TableSchema::of(&batch), &config, micros(2030, 6, 1));
        assert_eq!(plan.source, PartitionSource::FromDate("Date".into()));

        let out = assign_partition(&batch, &plan).unwrap();
        assert_eq!(partitions(&out), vec!["2024-01", "1999-12", "2024-02"]);
        assert_eq!(assign_partition(&batch, &plan).unwrap(), out);
    }

    #[test]
    fn partition_without_date_uses_run_month() {
        let batch = raw(vec![("Region", vec![Some("A"), Some("B")])]);
        let config = BronzeConfig::default();
        let plan = PartitionPlan::resolve(&TableSchema::of(&batch), &config, micros(2025, 3, 10));
        assert_eq!(plan.source, PartitionSource::Fallback);

        let out = assign_partition(&batch, &plan).unwrap();
        assert_eq!(partitions(&out), vec!["2025-03", "2025-03"]);
    }

    #[test]
    fn existing_partition_is_kept() {
        let batch = raw(vec![("partition_month", vec![Some("2020-01")])]);
        let plan = PartitionPlan::resolve(&TableSchema::of(&batch), &BronzeConfig::default(), 0);
        assert_eq!(plan.source, PartitionSource::Existing);
        assert_eq!(assign_partition(&batch, &plan).unwrap(), batch);
    }

    #[test]
    fn lineage_replaces_existing_columns() {
        let batch = raw(vec![("cube_name", vec![Some("old"), Some("old")])]);
        let out = add_lineage(&batch, "sales", 42).unwrap();

        assert_eq!(out.num_columns(), 2);
        assert_eq!(
            Value::from_array(out.column_by_name(CUBE_COLUMN).unwrap().as_ref(), 1),
            Value::Str("sales".into())
        );
        assert_eq!(
            Value::from_array(out.column_by_name(EXTRACTION_TIME_COLUMN).unwrap().as_ref(), 0),
            Value::Timestamp(42)
        );
    }

    #[test]
    fn integers_widen_without_failures() {
        let schema = Arc::new(Schema::new(vec![Field::new("Sales", DataType::Int64, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(vec![1, 2])) as ArrayRef],
        )
        .unwrap();
        let (typed, failures) =
            enforce_types(&batch, &types(&[("Sales", ColumnKind::Float)])).unwrap();
        assert!(failures.is_empty());
        assert_eq!(table::numeric_column(&typed, "Sales"), Some(vec![Some(1.0), Some(2.0)]));
    }
}

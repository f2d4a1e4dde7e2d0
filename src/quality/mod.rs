//! Advisory data-quality checks shared by all three stages.
//!
//! Every check is a pure function over a table. The gate combines them,
//! records the outcome as an audit event and hands the report back; it never
//! rejects data.

use crate::audit::Audit;
use crate::config::QualityConfig;
use crate::table::{self, TableSchema, Value};
use arrow::array::Array;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::{BTreeMap, HashSet};

pub const MAX_DUPLICATE_SAMPLES: usize = 5;

/// Inclusive bounds for a numeric column; a missing side is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateReport {
    pub count: usize,
    pub samples: Vec<Map<String, JsonValue>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RangeViolation {
    pub below_min: usize,
    pub above_max: usize,
}

/// Combined findings; empty parts are left out when serialised.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityReport {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub nulls: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicates: Option<DuplicateReport>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub range_violations: BTreeMap<String, RangeViolation>,
}

impl QualityReport {
    pub fn is_clean(&self) -> bool {
        self.nulls.is_empty() && self.duplicates.is_none() && self.range_violations.is_empty()
    }
}

/// Columns whose null ratio exceeds `threshold`, ratio rounded to 4 places.
pub fn validate_nulls(batch: &RecordBatch, threshold: f64) -> BTreeMap<String, f64> {
    let rows = batch.num_rows();
    let mut report = BTreeMap::new();
    if rows == 0 {
        return report;
    }
    for (field, column) in batch.schema().fields().iter().zip(batch.columns()) {
        let ratio = column.null_count() as f64 / rows as f64;
        if ratio > threshold {
            report.insert(field.name().clone(), (ratio * 10_000.0).round() / 10_000.0);
        }
    }
    report
}

/// Rows equal to an earlier row, on the whole row or on `subset`.
/// Subset columns the table lacks are ignored; if none remain the check is
/// skipped.
pub fn validate_duplicates(
    batch: &RecordBatch,
    subset: Option<&[String]>,
) -> Option<DuplicateReport> {
    let schema = batch.schema();
    let indices: Vec<usize> = match subset {
        Some(cols) => cols.iter().filter_map(|c| schema.index_of(c).ok()).collect(),
        None => (0..batch.num_columns()).collect(),
    };
    if indices.is_empty() {
        return None;
    }

    let mut seen: HashSet<Vec<Value>> = HashSet::with_capacity(batch.num_rows());
    let mut count = 0;
    let mut samples = Vec::new();
    for row in 0..batch.num_rows() {
        if !seen.insert(table::row_values(batch, &indices, row)) {
            count += 1;
            if samples.len() < MAX_DUPLICATE_SAMPLES {
                samples.push(table::row_to_json(batch, row));
            }
        }
    }

    (count > 0).then_some(DuplicateReport { count, samples })
}

/// Per numeric column, counts of non-null values outside the declared range.
pub fn validate_ranges(
    batch: &RecordBatch,
    ranges: &BTreeMap<String, Range>,
) -> BTreeMap<String, RangeViolation> {
    let desc = TableSchema::of(batch);
    let mut report = BTreeMap::new();
    for (column, range) in ranges {
        if !desc.is_numeric(column) {
            continue;
        }
        let Some(values) = table::numeric_column(batch, column) else {
            continue;
        };
        let min = range.min.unwrap_or(f64::NEG_INFINITY);
        let max = range.max.unwrap_or(f64::INFINITY);
        let below_min = values.iter().flatten().filter(|v| **v < min).count();
        let above_max = values.iter().flatten().filter(|v| **v > max).count();
        if below_min > 0 || above_max > 0 {
            report.insert(
                column.clone(),
                RangeViolation {
                    below_min,
                    above_max,
                },
            );
        }
    }
    report
}

/// Run every configured check.
pub fn full_check(batch: &RecordBatch, config: &QualityConfig) -> QualityReport {
    QualityReport {
        nulls: validate_nulls(batch, config.null_threshold),
        duplicates: validate_duplicates(batch, config.duplicate_subset.as_deref()),
        range_violations: validate_ranges(batch, &config.ranges),
    }
}

/// Runs the checks for a stage and records the verdict.
pub struct QualityGate<'a> {
    config: &'a QualityConfig,
    audit: &'a dyn Audit,
}

impl<'a> QualityGate<'a> {
    pub fn new(config: &'a QualityConfig, audit: &'a dyn Audit) -> Self {
        Self { config, audit }
    }

    pub fn evaluate(&self, batch: &RecordBatch, stage: &str, cube: &str) -> QualityReport {
        let report = full_check(batch, self.config);
        if report.is_clean() {
            self.audit.info(
                &format!("{}_data_quality_pass", stage),
                &format!("Cube {} passed all validation checks", cube),
                json!({ "cube": cube, "rows": batch.num_rows() }),
            );
        } else {
            let mut metadata = serde_json::to_value(&report).unwrap_or(JsonValue::Null);
            if let JsonValue::Object(map) = &mut metadata {
                map.insert("cube".into(), JsonValue::from(cube));
            }
            self.audit.warning(
                &format!("{}_data_quality_issues", stage),
                &format!("Cube {} failed validation", cube),
                metadata,
            );
        }
        report
    }
}

//! Grouped aggregation and the scalar/series KPI functions built on top of it.

pub mod aggregate;

pub use aggregate::{aggregate, AggFunction, AggregationSpec, GroupingPlan};

use crate::table::{self, TableSchema, Value};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// A named scalar KPI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Kpi {
    pub name: String,
    pub value: f64,
}

fn present_values(batch: &RecordBatch, column: &str) -> Vec<f64> {
    table::numeric_column(batch, column)
        .map(|v| v.into_iter().flatten().collect())
        .unwrap_or_default()
}

pub fn total(batch: &RecordBatch, column: &str) -> f64 {
    present_values(batch, column).iter().sum()
}

pub fn mean(batch: &RecordBatch, column: &str) -> f64 {
    let values = present_values(batch, column);
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn maximum(batch: &RecordBatch, column: &str) -> f64 {
    present_values(batch, column)
        .into_iter()
        .reduce(f64::max)
        .unwrap_or(0.0)
}

pub fn minimum(batch: &RecordBatch, column: &str) -> f64 {
    present_values(batch, column)
        .into_iter()
        .reduce(f64::min)
        .unwrap_or(0.0)
}

/// Per-row group key over the present `group_by` columns; one shared key when
/// none are present.
fn group_keys(batch: &RecordBatch, group_by: &[String]) -> Vec<Vec<Value>> {
    let schema = batch.schema();
    let idx: Vec<usize> = TableSchema::of(batch)
        .present(group_by)
        .iter()
        .filter_map(|c| schema.index_of(c).ok())
        .collect();
    (0..batch.num_rows())
        .map(|row| table::row_values(batch, &idx, row))
        .collect()
}

/// Running sum in row order, restarted per group. Nulls add nothing.
pub fn cumulative(batch: &RecordBatch, column: &str, group_by: &[String]) -> Vec<f64> {
    let Some(values) = table::numeric_column(batch, column) else {
        return vec![0.0; batch.num_rows()];
    };
    let mut running: HashMap<Vec<Value>, f64> = HashMap::new();
    group_keys(batch, group_by)
        .into_iter()
        .zip(values)
        .map(|(key, v)| {
            let acc = running.entry(key).or_insert(0.0);
            *acc += v.unwrap_or(0.0);
            *acc
        })
        .collect()
}

/// Mean over the trailing `window` rows of each group, counting a position as
/// soon as one non-null value is in the window. Rows whose window holds only
/// nulls are `None`.
pub fn rolling_average(
    batch: &RecordBatch,
    column: &str,
    window: usize,
    group_by: &[String],
) -> Vec<Option<f64>> {
    let Some(values) = table::numeric_column(batch, column) else {
        return vec![Some(0.0); batch.num_rows()];
    };
    let window = window.max(1);
    let mut windows: HashMap<Vec<Value>, VecDeque<Option<f64>>> = HashMap::new();
    group_keys(batch, group_by)
        .into_iter()
        .zip(values)
        .map(|(key, v)| {
            let buf = windows.entry(key).or_default();
            buf.push_back(v);
            if buf.len() > window {
                buf.pop_front();
            }
            let (sum, n) = buf
                .iter()
                .flatten()
                .fold((0.0, 0usize), |(s, n), x| (s + x, n + 1));
            (n > 0).then(|| sum / n as f64)
        })
        .collect()
}

/// Scalar KPIs for every present column in `columns`. Per column the order
/// is total, avg, max, min, cumulative; rolling averages follow for all
/// columns afterwards.
pub fn compute_kpis(batch: &RecordBatch, columns: &[String], window: usize) -> Vec<Kpi> {
    let desc = TableSchema::of(batch);
    let present = desc.present(columns);
    let mut kpis = Vec::with_capacity(present.len() * 6);

    for column in &present {
        let key = column.to_lowercase();
        let last_cumulative = cumulative(batch, column, &[]).last().copied().unwrap_or(0.0);
        kpis.extend([
            Kpi { name: format!("total_{}", key), value: total(batch, column) },
            Kpi { name: format!("avg_{}", key), value: mean(batch, column) },
            Kpi { name: format!("max_{}", key), value: maximum(batch, column) },
            Kpi { name: format!("min_{}", key), value: minimum(batch, column) },
            Kpi { name: format!("cumulative_{}", key), value: last_cumulative },
        ]);
    }
    for column in &present {
        let last = rolling_average(batch, column, window, &[])
            .last()
            .copied()
            .flatten()
            .unwrap_or(0.0);
        kpis.push(Kpi {
            name: format!("rolling_avg_{}", column.to_lowercase()),
            value: last,
        });
    }
    kpis
}

/// Attach each KPI as a constant `Float64` column.
pub fn broadcast(batch: &RecordBatch, kpis: &[Kpi]) -> Result<RecordBatch, ArrowError> {
    let rows = batch.num_rows();
    kpis.iter().try_fold(batch.clone(), |acc, kpi| {
        table::with_column(&acc, &kpi.name, table::constant_f64(kpi.value, rows))
    })
}

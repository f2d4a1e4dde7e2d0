use crate::config::MeasureAggregation;
use crate::table::{self, TableSchema, Value};
use arrow::array::{ArrayRef, Float64Array, Int64Array, UInt32Array};
use arrow::compute::take;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunction {
    Sum,
    #[serde(alias = "avg", alias = "average")]
    Mean,
    Max,
    Min,
    Count,
}

impl AggFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunction::Sum => "sum",
            AggFunction::Mean => "mean",
            AggFunction::Max => "max",
            AggFunction::Min => "min",
            AggFunction::Count => "count",
        }
    }

    /// Reduce one group's values; nulls are skipped. An empty sum is 0, an
    /// empty mean/max/min is null.
    pub fn apply(&self, values: &[Option<f64>]) -> Option<f64> {
        let mut present = values.iter().flatten().copied();
        match self {
            AggFunction::Sum => Some(present.sum()),
            AggFunction::Mean => {
                let (sum, n) = present.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                (n > 0).then(|| sum / n as f64)
            }
            AggFunction::Max => present.reduce(f64::max),
            AggFunction::Min => present.reduce(f64::min),
            AggFunction::Count => Some(present.count() as f64),
        }
    }
}

/// Ordered `(measure, function)` pairs; output column `<measure>_<function>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationSpec {
    pairs: Vec<(String, AggFunction)>,
}

impl AggregationSpec {
    /// Repeated pairs are dropped so output names stay unique.
    pub fn new(pairs: impl IntoIterator<Item = (String, AggFunction)>) -> Self {
        let mut out: Vec<(String, AggFunction)> = Vec::new();
        for pair in pairs {
            if !out.contains(&pair) {
                out.push(pair);
            }
        }
        Self { pairs: out }
    }

    pub fn from_config(measures: &[MeasureAggregation]) -> Self {
        Self::new(measures.iter().flat_map(|m| {
            m.functions
                .iter()
                .map(move |f| (m.measure.clone(), *f))
        }))
    }

    pub fn pairs(&self) -> &[(String, AggFunction)] {
        &self.pairs
    }

    pub fn output_name(measure: &str, function: AggFunction) -> String {
        format!("{}_{}", measure, function.as_str())
    }

    /// Pairs whose measure exists in the table.
    pub fn present(&self, desc: &TableSchema) -> Vec<(String, AggFunction)> {
        self.pairs
            .iter()
            .filter(|(m, _)| desc.has(m))
            .cloned()
            .collect()
    }
}

/// How rows are grouped, decided from the declared columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupingPlan {
    /// Group by these columns, in candidate order.
    Grouped(Vec<String>),
    /// None of the candidates exist: one group over the whole table.
    Global,
}

impl GroupingPlan {
    pub fn resolve(desc: &TableSchema, candidates: &[String]) -> Self {
        let present = desc.present(candidates);
        if present.is_empty() {
            GroupingPlan::Global
        } else {
            GroupingPlan::Grouped(present)
        }
    }

    pub fn columns(&self) -> &[String] {
        match self {
            GroupingPlan::Grouped(cols) => cols,
            GroupingPlan::Global => &[],
        }
    }
}

/// Group `batch` by the present subset of `group_columns` and apply `spec`.
///
/// Groups come out in ascending key order with null keys last. Key columns
/// keep their original type. Without any present measure the batch is
/// returned unchanged.
pub fn aggregate(
    batch: &RecordBatch,
    group_columns: &[String],
    spec: &AggregationSpec,
) -> Result<RecordBatch, ArrowError> {
    let desc = TableSchema::of(batch);
    let measures = spec.present(&desc);
    if measures.is_empty() {
        return Ok(batch.clone());
    }
    let plan = GroupingPlan::resolve(&desc, group_columns);

    let schema = batch.schema();
    let key_idx = plan
        .columns()
        .iter()
        .map(|c| schema.index_of(c))
        .collect::<Result<Vec<_>, _>>()?;

    let mut groups: BTreeMap<Vec<Value>, Vec<usize>> = BTreeMap::new();
    for row in 0..batch.num_rows() {
        groups
            .entry(table::row_values(batch, &key_idx, row))
            .or_default()
            .push(row);
    }

    let mut fields = Vec::with_capacity(key_idx.len() + measures.len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(fields.capacity());

    let firsts = UInt32Array::from(
        groups
            .values()
            .map(|rows| rows[0] as u32)
            .collect::<Vec<_>>(),
    );
    for &idx in &key_idx {
        let field = schema.field(idx);
        fields.push(Field::new(field.name(), field.data_type().clone(), true));
        columns.push(take(batch.column(idx).as_ref(), &firsts, None)?);
    }

    let mut numeric: HashMap<&str, Vec<Option<f64>>> = HashMap::new();
    for (measure, _) in &measures {
        if !numeric.contains_key(measure.as_str()) {
            let values = table::numeric_column(batch, measure)
                .unwrap_or_else(|| vec![None; batch.num_rows()]);
            numeric.insert(measure.as_str(), values);
        }
    }

    for (measure, function) in &measures {
        let values = &numeric[measure.as_str()];
        let reduced: Vec<Option<f64>> = groups
            .values()
            .map(|rows| {
                let group: Vec<Option<f64>> = rows.iter().map(|&r| values[r]).collect();
                function.apply(&group)
            })
            .collect();

        let name = AggregationSpec::output_name(measure, *function);
        match function {
            AggFunction::Count => {
                let counts: Int64Array = reduced.iter().map(|v| v.map(|c| c as i64)).collect();
                fields.push(Field::new(name, DataType::Int64, true));
                columns.push(Arc::new(counts));
            }
            _ => {
                fields.push(Field::new(name, DataType::Float64, true));
                columns.push(Arc::new(Float64Array::from(reduced)));
            }
        }
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
}

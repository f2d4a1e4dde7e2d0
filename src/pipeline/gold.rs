use super::bronze::{self, PartitionPlan};
use super::silver::CURRENT_FLAG;
use super::{Pipeline, StageFailure, StageReport};
use crate::config::RatioConfig;
use crate::kpi::{self, AggregationSpec};
use crate::quality::QualityGate;
use crate::storage::Tier;
use crate::table::{self, TableSchema};
use arrow::array::{Array, BooleanArray, Float64Array};
use arrow::compute::filter_record_batch;
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// A derived column computed before aggregation.
#[derive(Debug, Clone, PartialEq)]
pub enum Enrichment {
    /// `numerator / denominator`; a zero denominator counts as 1.
    Ratio {
        name: String,
        numerator: String,
        denominator: String,
    },
}

impl From<&RatioConfig> for Enrichment {
    fn from(cfg: &RatioConfig) -> Self {
        Enrichment::Ratio {
            name: cfg.name.clone(),
            numerator: cfg.numerator.clone(),
            denominator: cfg.denominator.clone(),
        }
    }
}

impl Enrichment {
    /// The enriched batch, or `None` when an input column is missing.
    pub fn apply(&self, batch: &RecordBatch) -> Result<Option<RecordBatch>, ArrowError> {
        match self {
            Enrichment::Ratio {
                name,
                numerator,
                denominator,
            } => {
                let (Some(num), Some(den)) = (
                    table::numeric_column(batch, numerator),
                    table::numeric_column(batch, denominator),
                ) else {
                    return Ok(None);
                };
                let ratio: Float64Array = num
                    .iter()
                    .zip(&den)
                    .map(|(n, d)| match (n, d) {
                        (Some(n), Some(d)) if *d == 0.0 => Some(*n),
                        (Some(n), Some(d)) => Some(n / d),
                        _ => None,
                    })
                    .collect();
                table::with_column(batch, name, Arc::new(ratio)).map(Some)
            }
        }
    }
}

/// Apply every enrichment whose inputs exist, then make sure the partition
/// column is there.
pub fn enrich(
    batch: &RecordBatch,
    enrichments: &[Enrichment],
    partition: &PartitionPlan,
) -> Result<RecordBatch, ArrowError> {
    let mut out = batch.clone();
    for enrichment in enrichments {
        match enrichment.apply(&out)? {
            Some(enriched) => out = enriched,
            None => debug!(?enrichment, "enrichment skipped, inputs missing"),
        }
    }
    bronze::assign_partition(&out, partition)
}

/// Rows flagged current; the batch as is when it has no flag column.
pub fn current_rows(batch: &RecordBatch) -> Result<RecordBatch, ArrowError> {
    let Some(flags) = batch.column_by_name(CURRENT_FLAG) else {
        return Ok(batch.clone());
    };
    let flags = arrow::compute::cast(flags.as_ref(), &arrow::datatypes::DataType::Boolean)?;
    let Some(flags) = flags.as_any().downcast_ref::<BooleanArray>() else {
        return Ok(batch.clone());
    };
    let mask: BooleanArray = flags.iter().map(|f| Some(f == Some(true))).collect();
    filter_record_batch(batch, &mask)
}

#[instrument(level = "info", skip_all, fields(cube = %cube))]
pub(super) fn run(pipeline: &Pipeline<'_>, cube: &str) -> Result<StageReport, StageFailure> {
    let config = &pipeline.config.gold;
    let silver = pipeline.storage.load(Tier::Silver, cube)?;
    let input = if config.current_only {
        current_rows(&silver)?
    } else {
        silver
    };

    let enrichments: Vec<Enrichment> = config.ratios.iter().map(Enrichment::from).collect();
    let partition =
        PartitionPlan::resolve(&TableSchema::of(&input), &pipeline.config.bronze, pipeline.ctx.now);
    let enriched = enrich(&input, &enrichments, &partition)?;

    let spec = AggregationSpec::from_config(&config.aggregations);
    let aggregated = kpi::aggregate(&enriched, &config.group_columns, &spec)?;
    let kpis = kpi::compute_kpis(&aggregated, &config.kpi_columns, config.rolling_window);
    let gold = kpi::broadcast(&aggregated, &kpis)?;
    info!(groups = gold.num_rows(), kpis = kpis.len(), "aggregated");

    let quality =
        QualityGate::new(&pipeline.config.quality, pipeline.audit).evaluate(&gold, "gold", cube);

    pipeline.storage.save(Tier::Gold, cube, &gold)?;
    pipeline.audit.info(
        "gold_save",
        &format!("Saved {} rows for cube {}", gold.num_rows(), cube),
        json!({ "cube": cube, "rows": gold.num_rows(), "kpis": kpis }),
    );

    Ok(StageReport {
        rows: gold.num_rows(),
        quality,
        kpis,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BronzeConfig, GoldConfig};
    use crate::table::Value;
    use arrow::array::{ArrayRef, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    fn sales_qty(sales: Vec<Option<f64>>, qty: Vec<Option<f64>>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("Sales", DataType::Float64, true),
            Field::new("Quantity", DataType::Float64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Float64Array::from(sales)) as ArrayRef,
                Arc::new(Float64Array::from(qty)) as ArrayRef,
            ],
        )
        .unwrap()
    }

    fn ratio() -> Enrichment {
        Enrichment::from(&GoldConfig::default().ratios[0])
    }

    #[test]
    fn ratio_guards_zero_denominator() {
        let batch = sales_qty(
            vec![Some(100.0), Some(50.0), None],
            vec![Some(0.0), Some(5.0), Some(2.0)],
        );
        let out = ratio().apply(&batch).unwrap().unwrap();
        assert_eq!(
            table::numeric_column(&out, "SalesPerUnit"),
            Some(vec![Some(100.0), Some(10.0), None])
        );
    }

    #[test]
    fn ratio_is_skipped_without_inputs() {
        let schema = Arc::new(Schema::new(vec![Field::new("Sales", DataType::Float64, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Float64Array::from(vec![1.0])) as ArrayRef],
        )
        .unwrap();
        assert!(ratio().apply(&batch).unwrap().is_none());
    }

    #[test]
    fn enrich_adds_partition_when_missing() {
        let batch = sales_qty(vec![Some(1.0)], vec![Some(1.0)]);
        let config = BronzeConfig {
            fallback_partition: Some("2024-05".into()),
            ..Default::default()
        };
        let plan = PartitionPlan::resolve(&TableSchema::of(&batch), &config, 0);

        let out = enrich(&batch, &[ratio()], &plan).unwrap();

        assert!(out.column_by_name("SalesPerUnit").is_some());
        assert_eq!(
            Value::from_array(out.column_by_name("partition_month").unwrap().as_ref(), 0),
            Value::Str("2024-05".into())
        );
    }

    #[test]
    fn only_current_rows_survive() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("Region", DataType::Utf8, true),
            Field::new(CURRENT_FLAG, DataType::Boolean, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["A", "B", "C"])) as ArrayRef,
                Arc::new(BooleanArray::from(vec![Some(true), Some(false), None])) as ArrayRef,
            ],
        )
        .unwrap();

        let current = current_rows(&batch).unwrap();
        assert_eq!(current.num_rows(), 1);
        assert_eq!(
            Value::from_array(current.column(0).as_ref(), 0),
            Value::Str("A".into())
        );
    }
}

//! Per-cube Bronze → Silver → Gold processing.
//!
//! Cubes run in parallel on the rayon pool and share nothing but the
//! storage, audit sink and config. Within a cube every stage persists its
//! snapshot before the next one loads it.

pub mod bronze;
pub mod gold;
pub mod silver;

use crate::audit::Audit;
use crate::config::PipelineConfig;
use crate::kpi::Kpi;
use crate::quality::QualityReport;
use crate::source::ExtractionOutcome;
use crate::storage::{Storage, StorageError, Tier};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use bronze::CastFailure;
use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::json;
use silver::MergeSummary;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument};

/// Shared flag checked between stages.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Values fixed for one run: the timestamp stamped on lineage and history
/// columns, and the cancellation flag.
#[derive(Clone, Debug)]
pub struct RunContext {
    /// Microseconds since the epoch, UTC.
    pub now: i64,
    pub cancel: CancelToken,
}

impl RunContext {
    pub fn at(now: i64) -> Self {
        Self {
            now,
            cancel: CancelToken::new(),
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::at(Utc::now().timestamp_micros())
    }
}

#[derive(Debug, Error)]
pub enum StageFailure {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("table error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("run cancelled")]
    Cancelled,
}

impl StageFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            StageFailure::Storage(_) => "storage",
            StageFailure::Arrow(_) => "table",
            StageFailure::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage failure for cube `{cube}` during {stage}: {source}")]
    Storage {
        cube: String,
        stage: Tier,
        #[source]
        source: StorageError,
        /// Everything the run produced before and alongside the failure.
        report: Box<RunReport>,
    },
}

/// What one stage produced for one cube.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageReport {
    pub rows: usize,
    #[serde(skip_serializing_if = "QualityReport::is_clean")]
    pub quality: QualityReport,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cast_failures: Vec<CastFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeSummary>,
    /// Dimension snapshots written next to the history.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub kpis: Vec<Kpi>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub stage: Tier,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CubeOutcome {
    pub cube: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bronze: Option<StageReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silver: Option<StageReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gold: Option<StageReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
}

impl CubeOutcome {
    fn new(cube: &str) -> Self {
        Self {
            cube: cube.to_string(),
            bronze: None,
            silver: None,
            gold: None,
            failure: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub cubes: Vec<CubeOutcome>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extraction_failures: BTreeMap<String, String>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.cubes.iter().filter(|c| c.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.cubes.len() - self.succeeded() + self.extraction_failures.len()
    }

    pub fn cube(&self, name: &str) -> Option<&CubeOutcome> {
        self.cubes.iter().find(|c| c.cube == name)
    }
}

pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    storage: &'a dyn Storage,
    audit: &'a dyn Audit,
    ctx: RunContext,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a PipelineConfig, storage: &'a dyn Storage, audit: &'a dyn Audit) -> Self {
        Self {
            config,
            storage,
            audit,
            ctx: RunContext::default(),
        }
    }

    pub fn with_context(mut self, ctx: RunContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Process every extracted cube. A failing cube never stops the others;
    /// a storage failure is surfaced as an error once all cubes are done.
    #[instrument(level = "info", skip_all, fields(cubes = extracted.tables.len()))]
    pub fn run(&self, extracted: ExtractionOutcome) -> Result<RunReport, PipelineError> {
        let started_at = Utc::now().to_rfc3339();
        self.audit.info(
            "pipeline_start",
            "Starting medallion pipeline",
            json!({ "cubes": extracted.tables.len(), "extraction_failures": extracted.failures.len() }),
        );

        let results: Vec<(CubeOutcome, Option<(Tier, StageFailure)>)> = extracted
            .tables
            .par_iter()
            .map(|(cube, raw)| self.run_cube(cube, raw))
            .collect();

        let mut cubes = Vec::with_capacity(results.len());
        let mut storage_failure = None;
        for (outcome, failure) in results {
            if let Some((stage, StageFailure::Storage(source))) = failure {
                if storage_failure.is_none() {
                    storage_failure = Some((outcome.cube.clone(), stage, source));
                }
            }
            cubes.push(outcome);
        }

        let report = RunReport {
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            cubes,
            extraction_failures: extracted
                .failures
                .iter()
                .map(|(unit, e)| (unit.clone(), e.to_string()))
                .collect(),
        };
        info!(succeeded = report.succeeded(), failed = report.failed(), "run finished");
        self.audit.info(
            "pipeline_end",
            "Medallion pipeline finished",
            json!({ "succeeded": report.succeeded(), "failed": report.failed() }),
        );

        match storage_failure {
            Some((cube, stage, source)) => Err(PipelineError::Storage {
                cube,
                stage,
                source,
                report: Box::new(report),
            }),
            None => Ok(report),
        }
    }

    /// Run all three stages for one cube, stopping at the first failure.
    pub fn run_cube(&self, cube: &str, raw: &RecordBatch) -> (CubeOutcome, Option<(Tier, StageFailure)>) {
        let mut outcome = CubeOutcome::new(cube);
        match self.stages(cube, raw, &mut outcome) {
            Ok(()) => (outcome, None),
            Err((stage, failure)) => {
                error!(cube, %stage, error = %failure, "cube failed");
                self.audit.error(
                    "pipeline_error",
                    &format!("Cube {} failed during {}", cube, stage),
                    json!({ "cube": cube, "stage": stage, "kind": failure.kind(), "error": failure.to_string() }),
                );
                outcome.failure = Some(FailureRecord {
                    stage,
                    kind: failure.kind(),
                    message: failure.to_string(),
                });
                (outcome, Some((stage, failure)))
            }
        }
    }

    fn stages(
        &self,
        cube: &str,
        raw: &RecordBatch,
        outcome: &mut CubeOutcome,
    ) -> Result<(), (Tier, StageFailure)> {
        let at = |stage: Tier| move |e: StageFailure| (stage, e);

        self.checkpoint(Tier::Bronze)?;
        outcome.bronze = Some(bronze::run(self, cube, raw).map_err(at(Tier::Bronze))?);

        self.checkpoint(Tier::Silver)?;
        outcome.silver = Some(silver::run(self, cube).map_err(at(Tier::Silver))?);

        self.checkpoint(Tier::Gold)?;
        outcome.gold = Some(gold::run(self, cube).map_err(at(Tier::Gold))?);
        Ok(())
    }

    fn checkpoint(&self, next: Tier) -> Result<(), (Tier, StageFailure)> {
        if self.ctx.cancel.is_cancelled() {
            Err((next, StageFailure::Cancelled))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::storage::ParquetStore;
    use crate::table::Value;
    use arrow::array::{ArrayRef, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn raw(rows: &[[&str; 4]]) -> RecordBatch {
        let schema = Arc::new(Schema::new(
            ["Date", "Region", "Sales", "Quantity"]
                .map(|n| Field::new(n, DataType::Utf8, true))
                .to_vec(),
        ));
        let columns = (0..4)
            .map(|i| {
                Arc::new(StringArray::from(rows.iter().map(|r| r[i]).collect::<Vec<_>>())) as ArrayRef
            })
            .collect();
        RecordBatch::try_new(schema, columns).unwrap()
    }

    fn extracted(tables: Vec<(&str, RecordBatch)>) -> ExtractionOutcome {
        ExtractionOutcome {
            tables: tables.into_iter().map(|(n, b)| (n.to_string(), b)).collect(),
            failures: BTreeMap::new(),
        }
    }

    fn sample() -> RecordBatch {
        raw(&[
            ["2024-01-15", "A", "10", "1"],
            ["2024-01-20", "A", "20", "2"],
            ["2024-01-21", "B", "5", "0"],
        ])
    }

    fn column(batch: &RecordBatch, name: &str) -> Vec<Value> {
        let col = batch.column_by_name(name).unwrap();
        (0..batch.num_rows())
            .map(|r| Value::from_array(col.as_ref(), r))
            .collect()
    }

    #[test]
    fn end_to_end_writes_all_tiers() {
        let dir = tempdir().unwrap();
        let store = ParquetStore::new(dir.path()).unwrap();
        let audit = MemoryAudit::new();
        let config = PipelineConfig::default();
        let pipeline = Pipeline::new(&config, &store, &audit).with_context(RunContext::at(1_000));

        let report = pipeline.run(extracted(vec![("sales", sample())])).unwrap();

        assert_eq!(report.succeeded(), 1);
        let outcome = report.cube("sales").unwrap();
        assert_eq!(outcome.bronze.as_ref().unwrap().rows, 3);
        assert_eq!(outcome.silver.as_ref().unwrap().merge.unwrap().opened, 3);

        let gold = store.load(Tier::Gold, "sales").unwrap();
        assert_eq!(gold.num_rows(), 2);
        assert_eq!(column(&gold, "Region"), vec![Value::Str("A".into()), Value::Str("B".into())]);
        assert_eq!(column(&gold, "Sales_sum"), vec![Value::Float(30.0), Value::Float(5.0)]);
        assert_eq!(column(&gold, "total_sales_sum"), vec![Value::Float(35.0), Value::Float(35.0)]);

        assert!(store.list(Tier::Silver).unwrap().contains(&"sales__DimRegion".to_string()));
        assert_eq!(audit.count("pipeline_start"), 1);
        assert_eq!(audit.count("gold_save"), 1);
    }

    #[test]
    fn distinct_rows_with_equal_measures_all_reach_gold() {
        let dir = tempdir().unwrap();
        let store = ParquetStore::new(dir.path()).unwrap();
        let audit = MemoryAudit::new();
        let config = PipelineConfig::default();
        let input = raw(&[
            ["2024-01-15", "North", "100", "1"],
            ["2024-01-15", "South", "100", "1"],
            ["2024-01-15", "East", "100", "1"],
        ]);

        let report = Pipeline::new(&config, &store, &audit)
            .with_context(RunContext::at(1_000))
            .run(extracted(vec![("sales", input.clone())]))
            .unwrap();

        let silver = report.cube("sales").unwrap().silver.as_ref().unwrap();
        assert_eq!(silver.rows, 3);
        assert_eq!(silver.merge.unwrap().opened, 3);
        let gold = store.load(Tier::Gold, "sales").unwrap();
        assert_eq!(gold.num_rows(), 3);
        assert_eq!(column(&gold, "total_sales_sum")[0], Value::Float(300.0));

        let report = Pipeline::new(&config, &store, &audit)
            .with_context(RunContext::at(2_000))
            .run(extracted(vec![("sales", input)]))
            .unwrap();
        let merge = report.cube("sales").unwrap().silver.as_ref().unwrap().merge.unwrap();
        assert_eq!(merge.unchanged, 3);
        assert_eq!(store.load(Tier::Silver, "sales").unwrap().num_rows(), 3);
        assert_eq!(store.load(Tier::Gold, "sales").unwrap(), gold);
    }

    #[test]
    fn gold_is_deterministic_across_reruns() {
        let dir = tempdir().unwrap();
        let store = ParquetStore::new(dir.path()).unwrap();
        let audit = MemoryAudit::new();
        let config = PipelineConfig::default();

        Pipeline::new(&config, &store, &audit)
            .with_context(RunContext::at(1_000))
            .run(extracted(vec![("sales", sample())]))
            .unwrap();
        let first = store.load(Tier::Gold, "sales").unwrap();

        let report = Pipeline::new(&config, &store, &audit)
            .with_context(RunContext::at(2_000))
            .run(extracted(vec![("sales", sample())]))
            .unwrap();
        let second = store.load(Tier::Gold, "sales").unwrap();

        assert_eq!(first, second);
        let merge = report.cube("sales").unwrap().silver.as_ref().unwrap().merge.unwrap();
        assert_eq!(merge.opened, 0);
        assert_eq!(merge.unchanged, 3);
        assert_eq!(store.load(Tier::Silver, "sales").unwrap().num_rows(), 3);
    }

    #[test]
    fn cancelled_runs_write_nothing() {
        let dir = tempdir().unwrap();
        let store = ParquetStore::new(dir.path()).unwrap();
        let audit = MemoryAudit::new();
        let config = PipelineConfig::default();
        let ctx = RunContext::at(1_000);
        ctx.cancel.cancel();

        let report = Pipeline::new(&config, &store, &audit)
            .with_context(ctx)
            .run(extracted(vec![("sales", sample())]))
            .unwrap();

        let failure = report.cube("sales").unwrap().failure.as_ref().unwrap();
        assert_eq!(failure.stage, Tier::Bronze);
        assert_eq!(failure.kind, "cancelled");
        assert!(store.list(Tier::Bronze).unwrap().is_empty());
    }

    /// Fails every save for one cube.
    struct FlakyStore {
        inner: ParquetStore,
        broken: &'static str,
        saves: Mutex<usize>,
    }

    impl Storage for FlakyStore {
        fn load(&self, tier: Tier, name: &str) -> Result<RecordBatch, StorageError> {
            self.inner.load(tier, name)
        }

        fn save(&self, tier: Tier, name: &str, batch: &RecordBatch) -> Result<(), StorageError> {
            *self.saves.lock().unwrap() += 1;
            if name.starts_with(self.broken) {
                return Err(StorageError::Io {
                    path: name.into(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            self.inner.save(tier, name, batch)
        }

        fn list(&self, tier: Tier) -> Result<Vec<String>, StorageError> {
            self.inner.list(tier)
        }
    }

    #[test]
    fn storage_failure_is_surfaced_after_other_cubes_finish() {
        let dir = tempdir().unwrap();
        let store = FlakyStore {
            inner: ParquetStore::new(dir.path()).unwrap(),
            broken: "returns",
            saves: Mutex::new(0),
        };
        let audit = MemoryAudit::new();
        let config = PipelineConfig::default();

        let err = Pipeline::new(&config, &store, &audit)
            .run(extracted(vec![("sales", sample()), ("returns", sample())]))
            .unwrap_err();

        let PipelineError::Storage { cube, stage, report, .. } = err;
        assert_eq!(cube, "returns");
        assert_eq!(stage, Tier::Bronze);
        assert!(report.cube("sales").unwrap().succeeded());
        assert!(store.inner.load(Tier::Gold, "sales").is_ok());
        assert_eq!(audit.count("pipeline_error"), 1);
    }
}

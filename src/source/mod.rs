//! Where raw cube tables come from, and the bounded, retrying fan-out that
//! pulls them in.

pub mod csv;

pub use self::csv::CsvSource;

use crate::config::ExtractConfig;
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("no data for `{unit}` at {}", path.display())]
    NotFound { unit: String, path: PathBuf },
    #[error("i/o error reading `{unit}`: {source}")]
    Io {
        unit: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse `{unit}`: {source}")]
    Parse {
        unit: String,
        #[source]
        source: ArrowError,
    },
    #[error("`{unit}` failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        unit: String,
        attempts: u32,
        last: Box<ExtractionError>,
    },
    #[error("extraction task for `{unit}` did not finish: {message}")]
    Task { unit: String, message: String },
}

/// Produces the raw table for one extraction unit (a cube).
pub trait Source: Send + Sync {
    fn extract(&self, unit: &str) -> Result<RecordBatch, ExtractionError>;
}

#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    /// Successfully extracted tables in request order.
    pub tables: Vec<(String, RecordBatch)>,
    pub failures: BTreeMap<String, ExtractionError>,
}

/// Extract every unit with at most `max_workers` in flight. Each unit gets
/// `max_retries` attempts with a linearly growing pause; a unit that keeps
/// failing is reported without affecting the others.
pub async fn extract_all(
    source: Arc<dyn Source>,
    units: Vec<String>,
    config: &ExtractConfig,
) -> ExtractionOutcome {
    let sem = Arc::new(Semaphore::new(config.max_workers.max(1)));
    let attempts = config.max_retries.max(1);
    let delay = Duration::from_millis(config.retry_delay_ms);

    let mut handles = Vec::with_capacity(units.len());
    for unit in units {
        let source = source.clone();
        let sem = sem.clone();
        let name = unit.clone();
        handles.push((
            name,
            tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.map_err(|e| ExtractionError::Task {
                    unit: unit.clone(),
                    message: e.to_string(),
                })?;
                extract_with_retry(source, unit, attempts, delay).await
            }),
        ));
    }

    let mut outcome = ExtractionOutcome::default();
    for (unit, handle) in handles {
        match handle.await {
            Ok(Ok(batch)) => outcome.tables.push((unit, batch)),
            Ok(Err(e)) => {
                error!(unit = %unit, error = %e, "extraction failed");
                outcome.failures.insert(unit, e);
            }
            Err(join) => {
                error!(unit = %unit, error = %join, "extraction task died");
                let message = join.to_string();
                outcome
                    .failures
                    .insert(unit.clone(), ExtractionError::Task { unit, message });
            }
        }
    }
    info!(
        extracted = outcome.tables.len(),
        failed = outcome.failures.len(),
        "extraction finished"
    );
    outcome
}

async fn extract_with_retry(
    source: Arc<dyn Source>,
    unit: String,
    attempts: u32,
    delay: Duration,
) -> Result<RecordBatch, ExtractionError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let start = Instant::now();
        let src = source.clone();
        let name = unit.clone();
        let result = tokio::task::spawn_blocking(move || src.extract(&name))
            .await
            .map_err(|e| ExtractionError::Task {
                unit: unit.clone(),
                message: e.to_string(),
            })?;

        match result {
            Ok(batch) => {
                info!(unit = %unit, rows = batch.num_rows(), elapsed = ?start.elapsed(), "extracted");
                return Ok(batch);
            }
            Err(e) if attempt < attempts => {
                let pause = delay * attempt;
                warn!(unit = %unit, attempt, delay_ms = pause.as_millis() as u64, error = %e, "retrying");
                sleep(pause).await;
            }
            Err(e) => {
                return Err(ExtractionError::RetriesExhausted {
                    unit,
                    attempts: attempt,
                    last: Box::new(e),
                })
            }
        }
    }
}

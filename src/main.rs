use anyhow::{Context, Result};
use medallion::{
    audit::{Audit, Fanout, JsonLinesAudit, TracingAudit},
    config::PipelineConfig,
    pipeline::{Pipeline, PipelineError, RunContext},
    source::{extract_all, CsvSource, Source},
    storage::ParquetStore,
};
use std::{env, path::PathBuf, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

fn init_tracing() {
    let env = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into())))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) logging + config ─────────────────────────────────────────
    init_tracing();
    let config = PipelineConfig::resolve(env::args_os().nth(1).map(PathBuf::from))?;
    info!(root = %config.storage.root.display(), "startup");

    let mut sinks: Vec<Arc<dyn Audit>> = vec![Arc::new(TracingAudit)];
    if let Some(path) = &config.audit.log_file {
        sinks.push(Arc::new(JsonLinesAudit::new(path)));
    }
    let audit = Fanout::new(sinks);

    let store = ParquetStore::new(&config.storage.root)
        .with_context(|| format!("opening store at {}", config.storage.root.display()))?;

    // ─── 2) extract ──────────────────────────────────────────────────
    let csv = CsvSource::new(&config.extract.landing_dir);
    let cubes = if config.extract.cubes.is_empty() {
        csv.discover()
    } else {
        config.extract.cubes.clone()
    };
    if cubes.is_empty() {
        warn!(landing = %config.extract.landing_dir.display(), "no cubes to process; exit");
        return Ok(());
    }
    info!("{} cubes to extract", cubes.len());
    let source: Arc<dyn Source> = Arc::new(csv);
    let extracted = extract_all(source, cubes, &config.extract).await;

    // ─── 3) cancel on ctrl-c ─────────────────────────────────────────
    let ctx = RunContext::default();
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight stages");
            cancel.cancel();
        }
    });

    // ─── 4) bronze → silver → gold ───────────────────────────────────
    let pipeline = Pipeline::new(&config, &store, &audit).with_context(ctx);
    let result = tokio::task::block_in_place(|| pipeline.run(extracted));

    match result {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            info!(succeeded = report.succeeded(), failed = report.failed(), "done");
            Ok(())
        }
        Err(err) => {
            let PipelineError::Storage { report, .. } = &err;
            println!("{}", serde_json::to_string_pretty(report)?);
            error!(error = %err, "pipeline aborted on storage failure");
            Err(err.into())
        }
    }
}

use anyhow::{bail, Context, Result};
use medallion::audit::TracingAudit;
use medallion::config::PipelineConfig;
use medallion::query::{GoldReader, TableQuery};
use medallion::storage::ParquetStore;
use std::env;
use tracing_subscriber::{fmt, EnvFilter};

const USAGE: &str = "Usage:
  query_gold tables
  query_gold query <TABLE> [--filter COL=VALUE]... [--columns A,B] [--offset N] [--limit N]
  query_gold metrics <TABLE>
  query_gold search <COLUMN> <VALUE> [--limit N]";

fn flag_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .with_context(|| format!("{} needs a value", flag))
}

fn parse_query(args: &[String]) -> Result<TableQuery> {
    let mut query = TableQuery::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--filter" => {
                let raw = flag_value(args, &mut i, "--filter")?;
                let (col, val) = raw
                    .split_once('=')
                    .with_context(|| format!("filter `{}` is not COL=VALUE", raw))?;
                query.filters.push((col.to_string(), val.to_string()));
            }
            "--columns" => {
                let raw = flag_value(args, &mut i, "--columns")?;
                query.columns = Some(raw.split(',').map(|c| c.trim().to_string()).collect());
            }
            "--offset" => query.offset = flag_value(args, &mut i, "--offset")?.parse()?,
            "--limit" => query.limit = flag_value(args, &mut i, "--limit")?.parse()?,
            other => bail!("unexpected argument `{}`\n{}", other, USAGE),
        }
        i += 1;
    }
    Ok(query)
}

fn main() -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_writer(std::io::stderr)
        .init();

    let config = PipelineConfig::resolve(None)?;
    let store = ParquetStore::new(&config.storage.root)?;
    let audit = TracingAudit;
    let reader = GoldReader::new(&store, &audit);

    let args: Vec<String> = env::args().skip(1).collect();
    let output = match args.first().map(String::as_str) {
        Some("tables") => serde_json::to_value(reader.list_tables()?)?,
        Some("query") => {
            let table = args.get(1).context(USAGE)?;
            let query = parse_query(&args[2..])?;
            serde_json::to_value(reader.query(table, &query)?)?
        }
        Some("metrics") => {
            let table = args.get(1).context(USAGE)?;
            serde_json::to_value(reader.kpi_summary(table)?)?
        }
        Some("search") => {
            let (Some(column), Some(value)) = (args.get(1), args.get(2)) else {
                bail!(USAGE);
            };
            let limit = match args.get(3).map(String::as_str) {
                Some("--limit") => args.get(4).context("--limit needs a value")?.parse()?,
                _ => 100,
            };
            serde_json::to_value(reader.search(column, value, limit)?)?
        }
        _ => bail!(USAGE),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

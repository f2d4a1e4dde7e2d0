//! Read-only access to Gold snapshots: listing, filtered/paginated row
//! queries, a KPI summary and a cross-table search.

use crate::audit::Audit;
use crate::kpi;
use crate::storage::{Storage, StorageError, Tier};
use crate::table::{self, TableSchema, Value};
use arrow::record_batch::RecordBatch;
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 1000;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

pub type Row = Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("limit must be between 1 and 1000, got {0}")]
    InvalidLimit(usize),
    #[error("columns not found: {0:?}")]
    UnknownColumns(Vec<String>),
}

/// Row selection over one Gold table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableQuery {
    /// `(column, value)` pairs; a row matches when every column's canonical
    /// value equals the given string.
    pub filters: Vec<(String, String)>,
    /// Projection; all columns when `None`.
    pub columns: Option<Vec<String>>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for TableQuery {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            columns: None,
            offset: 0,
            limit: DEFAULT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub table: String,
    pub rows: Vec<Row>,
}

pub struct GoldReader<'a> {
    storage: &'a dyn Storage,
    audit: &'a dyn Audit,
    ttl: Duration,
    cache: Mutex<HashMap<String, (Arc<RecordBatch>, Instant)>>,
}

impl<'a> GoldReader<'a> {
    pub fn new(storage: &'a dyn Storage, audit: &'a dyn Audit) -> Self {
        Self {
            storage,
            audit,
            ttl: DEFAULT_CACHE_TTL,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn list_tables(&self) -> Result<Vec<String>, QueryError> {
        Ok(self.storage.list(Tier::Gold)?)
    }

    /// Snapshot from the cache while fresh, else from storage.
    fn load(&self, name: &str) -> Result<Arc<RecordBatch>, QueryError> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((batch, loaded)) = cache.get(name) {
            if loaded.elapsed() < self.ttl {
                debug!(table = name, "cache hit");
                return Ok(batch.clone());
            }
        }
        let batch = Arc::new(self.storage.load(Tier::Gold, name)?);
        cache.insert(name.to_string(), (batch.clone(), Instant::now()));
        self.audit.info(
            "api_cache_miss",
            &format!("Table '{}' loaded from Gold layer", name),
            JsonValue::Null,
        );
        Ok(batch)
    }

    pub fn query(&self, name: &str, query: &TableQuery) -> Result<Vec<Row>, QueryError> {
        if query.limit == 0 || query.limit > MAX_LIMIT {
            return Err(QueryError::InvalidLimit(query.limit));
        }
        let batch = self.load(name)?;
        let desc = TableSchema::of(&batch);

        let mut wanted: Vec<String> = query.filters.iter().map(|(c, _)| c.clone()).collect();
        if let Some(cols) = &query.columns {
            wanted.extend(cols.iter().cloned());
        }
        let missing = desc.missing(&wanted);
        if !missing.is_empty() {
            return Err(QueryError::UnknownColumns(missing));
        }

        let schema = batch.schema();
        let filters: Vec<(usize, &str)> = query
            .filters
            .iter()
            .filter_map(|(c, v)| schema.index_of(c).ok().map(|i| (i, v.as_str())))
            .collect();

        let rows: Vec<Row> = (0..batch.num_rows())
            .filter(|&row| {
                filters.iter().all(|(idx, expected)| {
                    Value::from_array(batch.column(*idx).as_ref(), row)
                        .canonical()
                        .is_some_and(|v| v == *expected)
                })
            })
            .skip(query.offset)
            .take(query.limit)
            .map(|row| project(table::row_to_json(&batch, row), query.columns.as_deref()))
            .collect();

        self.audit.info(
            "api_query_table",
            &format!("Table '{}' queried", name),
            json!({ "rows_returned": rows.len() }),
        );
        Ok(rows)
    }

    /// Totals and averages of `Sales` and `Quantity`, plus `Sales` extremes,
    /// for whichever of the two the table has.
    pub fn kpi_summary(&self, name: &str) -> Result<BTreeMap<String, f64>, QueryError> {
        let batch = self.load(name)?;
        let desc = TableSchema::of(&batch);
        let mut metrics = BTreeMap::new();
        if desc.has("Sales") {
            metrics.insert("total_sales".to_string(), kpi::total(&batch, "Sales"));
            metrics.insert("avg_sales".to_string(), kpi::mean(&batch, "Sales"));
            metrics.insert("max_sales".to_string(), kpi::maximum(&batch, "Sales"));
            metrics.insert("min_sales".to_string(), kpi::minimum(&batch, "Sales"));
        }
        if desc.has("Quantity") {
            metrics.insert("total_quantity".to_string(), kpi::total(&batch, "Quantity"));
            metrics.insert("avg_quantity".to_string(), kpi::mean(&batch, "Quantity"));
        }
        self.audit.info(
            "api_metrics",
            &format!("Metrics calculated for table '{}'", name),
            json!({ "metrics": metrics }),
        );
        Ok(metrics)
    }

    /// Rows of every Gold table whose `column` contains `needle`, ignoring
    /// case; at most `limit` rows per table.
    pub fn search(&self, column: &str, needle: &str, limit: usize) -> Result<Vec<SearchHit>, QueryError> {
        let tables = self.list_tables()?;
        let needle = needle.to_lowercase();
        let mut hits = Vec::new();
        for name in &tables {
            let batch = self.load(name)?;
            let Some(values) = batch.column_by_name(column) else {
                continue;
            };
            let rows: Vec<Row> = (0..batch.num_rows())
                .filter(|&row| {
                    Value::from_array(values.as_ref(), row)
                        .canonical()
                        .is_some_and(|v| v.to_lowercase().contains(&needle))
                })
                .take(limit)
                .map(|row| table::row_to_json(&batch, row))
                .collect();
            if !rows.is_empty() {
                hits.push(SearchHit {
                    table: name.clone(),
                    rows,
                });
            }
        }
        self.audit.info(
            "api_search",
            &format!("Searched column '{}' for value '{}'", column, needle),
            json!({ "tables_searched": tables.len() }),
        );
        Ok(hits)
    }
}

fn project(row: Row, columns: Option<&[String]>) -> Row {
    match columns {
        None => row,
        Some(cols) => {
            let mut row = row;
            cols.iter()
                .map(|c| (c.clone(), row.remove(c).unwrap_or(JsonValue::Null)))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::storage::ParquetStore;
    use arrow::array::{ArrayRef, Float64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use tempfile::tempdir;

    fn gold(regions: Vec<&str>, sales: Vec<f64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("Region", DataType::Utf8, true),
            Field::new("Sales", DataType::Float64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(regions)) as ArrayRef,
                Arc::new(Float64Array::from(sales)) as ArrayRef,
            ],
        )
        .unwrap()
    }

    fn seeded() -> (tempfile::TempDir, ParquetStore) {
        let dir = tempdir().unwrap();
        let store = ParquetStore::new(dir.path()).unwrap();
        store
            .save(Tier::Gold, "sales", &gold(vec!["North", "South", "North"], vec![10.0, 20.0, 30.0]))
            .unwrap();
        store
            .save(Tier::Gold, "returns", &gold(vec!["East"], vec![1.0]))
            .unwrap();
        (dir, store)
    }

    #[test]
    fn filters_project_and_paginate() {
        let (_dir, store) = seeded();
        let audit = MemoryAudit::new();
        let reader = GoldReader::new(&store, &audit);

        let query = TableQuery {
            filters: vec![("Region".into(), "North".into())],
            columns: Some(vec!["Sales".into()]),
            offset: 1,
            limit: 10,
        };
        let rows = reader.query("sales", &query).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), 1);
        assert_eq!(rows[0]["Sales"], json!(30.0));
        assert_eq!(reader.list_tables().unwrap(), vec!["returns", "sales"]);
    }

    #[test]
    fn rejects_bad_limits_and_columns() {
        let (_dir, store) = seeded();
        let audit = MemoryAudit::new();
        let reader = GoldReader::new(&store, &audit);

        let too_many = TableQuery {
            limit: MAX_LIMIT + 1,
            ..Default::default()
        };
        assert!(matches!(reader.query("sales", &too_many), Err(QueryError::InvalidLimit(_))));

        let unknown = TableQuery {
            columns: Some(vec!["Nope".into()]),
            ..Default::default()
        };
        assert!(matches!(
            reader.query("sales", &unknown),
            Err(QueryError::UnknownColumns(cols)) if cols == vec!["Nope".to_string()]
        ));
        assert!(matches!(
            reader.query("missing", &TableQuery::default()),
            Err(QueryError::Storage(StorageError::NotFound { .. }))
        ));
    }

    #[test]
    fn kpi_summary_and_cache() {
        let (_dir, store) = seeded();
        let audit = MemoryAudit::new();
        let reader = GoldReader::new(&store, &audit);

        let metrics = reader.kpi_summary("sales").unwrap();
        assert_eq!(metrics["total_sales"], 60.0);
        assert_eq!(metrics["avg_sales"], 20.0);
        assert!(!metrics.contains_key("total_quantity"));

        reader.kpi_summary("sales").unwrap();
        assert_eq!(audit.count("api_cache_miss"), 1);
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let (_dir, store) = seeded();
        let audit = MemoryAudit::new();
        let reader = GoldReader::new(&store, &audit);

        let hits = reader.search("Region", "nor", 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].table, "sales");
        assert_eq!(hits[0].rows.len(), 1);
    }
}

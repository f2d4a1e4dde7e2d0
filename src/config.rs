//! Pipeline configuration, read from YAML. Every section has defaults, so an
//! empty file (or no file at all) yields a working setup.

use crate::kpi::AggFunction;
use crate::quality::Range;
use crate::table::ColumnKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const CONFIG_ENV: &str = "PIPELINE_CONFIG";
pub const DATA_ROOT_ENV: &str = "PIPELINE_DATA_ROOT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub audit: AuditConfig,
    pub extract: ExtractConfig,
    pub bronze: BronzeConfig,
    pub silver: SilverConfig,
    pub gold: GoldConfig,
    pub quality: QualityConfig,
}

impl PipelineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).context("parsing pipeline config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Config file from `explicit`, else `$PIPELINE_CONFIG`, else defaults;
    /// then `$PIPELINE_DATA_ROOT` overrides the storage root.
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self> {
        let path = explicit.or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from));
        let mut cfg = match path {
            Some(p) => Self::load(&p)?,
            None => Self::default(),
        };
        if let Some(root) = env::var_os(DATA_ROOT_ENV) {
            cfg.storage.root = PathBuf::from(root);
        }
        Ok(cfg)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON-lines audit log; `None` keeps events in tracing only.
    pub log_file: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_file: Some(PathBuf::from("./logs/pipeline.log")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Directory holding `<cube>.csv` drops.
    pub landing_dir: PathBuf,
    /// Cubes to extract; empty means every CSV in `landing_dir`.
    pub cubes: Vec<String>,
    pub max_retries: u32,
    pub max_workers: usize,
    pub retry_delay_ms: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            landing_dir: PathBuf::from("./data/landing"),
            cubes: Vec::new(),
            max_retries: 3,
            max_workers: 4,
            retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BronzeConfig {
    pub column_types: BTreeMap<String, ColumnKind>,
    pub partition_column: String,
    pub date_column: String,
    /// Period for rows without a usable date; the run's month when unset.
    pub fallback_partition: Option<String>,
}

impl Default for BronzeConfig {
    fn default() -> Self {
        let column_types = [
            ("Sales", ColumnKind::Float),
            ("Quantity", ColumnKind::Integer),
            ("Date", ColumnKind::Datetime),
            ("Region", ColumnKind::String),
            ("Country", ColumnKind::String),
            ("City", ColumnKind::String),
            ("Product", ColumnKind::String),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            column_types,
            partition_column: "partition_month".into(),
            date_column: "Date".into(),
            fallback_partition: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SilverConfig {
    /// Attributes whose change opens a new history version.
    pub tracked_attributes: Vec<String>,
    /// Extra columns identifying an entity. Empty keeps identity as
    /// (cube, tracked-attribute tuple).
    pub natural_key: Vec<String>,
    /// Attributes that get a dimension table with surrogate keys.
    pub dimensions: Vec<String>,
    /// Dimension that additionally gets an integer `CalendarKey` (`YYYYMMDD`).
    pub date_dimension: Option<String>,
}

impl Default for SilverConfig {
    fn default() -> Self {
        Self {
            tracked_attributes: vec!["Sales".into(), "Quantity".into()],
            natural_key: Vec::new(),
            dimensions: ["Date", "Region", "Country", "City", "Product"]
                .map(String::from)
                .to_vec(),
            date_dimension: Some("Date".into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasureAggregation {
    pub measure: String,
    pub functions: Vec<AggFunction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RatioConfig {
    pub name: String,
    pub numerator: String,
    pub denominator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoldConfig {
    /// Ordered candidate grouping columns; the present subset is used.
    pub group_columns: Vec<String>,
    pub aggregations: Vec<MeasureAggregation>,
    pub ratios: Vec<RatioConfig>,
    pub kpi_columns: Vec<String>,
    pub rolling_window: usize,
    /// Aggregate only rows with `CurrentFlag = true`.
    pub current_only: bool,
}

impl Default for GoldConfig {
    fn default() -> Self {
        use AggFunction::*;
        Self {
            group_columns: ["Region", "Country", "City", "Product", "partition_month"]
                .map(String::from)
                .to_vec(),
            aggregations: vec![
                MeasureAggregation {
                    measure: "Sales".into(),
                    functions: vec![Sum, Mean, Max, Min],
                },
                MeasureAggregation {
                    measure: "Quantity".into(),
                    functions: vec![Sum, Mean],
                },
            ],
            ratios: vec![RatioConfig {
                name: "SalesPerUnit".into(),
                numerator: "Sales".into(),
                denominator: "Quantity".into(),
            }],
            kpi_columns: vec!["Sales_sum".into(), "Quantity_sum".into()],
            rolling_window: 3,
            current_only: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Columns with a null ratio above this are reported.
    pub null_threshold: f64,
    pub ranges: BTreeMap<String, Range>,
    /// Columns compared for duplicates; whole rows when unset.
    pub duplicate_subset: Option<Vec<String>>,
}

pub mod parquet_store;

pub use parquet_store::ParquetStore;

use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::errors::ParquetError;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// The three persisted tiers of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Bronze,
    Silver,
    Gold,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Bronze, Tier::Silver, Tier::Gold];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Bronze => "bronze",
            Tier::Silver => "silver",
            Tier::Gold => "gold",
        }
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bronze" => Ok(Tier::Bronze),
            "silver" => Ok(Tier::Silver),
            "gold" => Ok(Tier::Gold),
            other => Err(format!("unknown tier `{}`", other)),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{tier} snapshot `{name}` not found")]
    NotFound { tier: Tier, name: String },
    #[error("i/o error on `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parquet error on `{}`: {source}", path.display())]
    Parquet {
        path: PathBuf,
        #[source]
        source: ParquetError,
    },
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
}

/// Load/save of named snapshots per tier.
///
/// `save` must be atomic: either the new snapshot fully replaces the old one
/// or the old one stays untouched.
pub trait Storage: Send + Sync {
    fn load(&self, tier: Tier, name: &str) -> Result<RecordBatch, StorageError>;

    fn save(&self, tier: Tier, name: &str, batch: &RecordBatch) -> Result<(), StorageError>;

    /// Names of every snapshot in `tier`, sorted.
    fn list(&self, tier: Tier) -> Result<Vec<String>, StorageError>;

    /// Like `load`, but a missing snapshot is `Ok(None)`.
    fn load_if_exists(&self, tier: Tier, name: &str) -> Result<Option<RecordBatch>, StorageError> {
        match self.load(tier, name) {
            Ok(batch) => Ok(Some(batch)),
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_parse_from_their_names() {
        assert_eq!("gold".parse::<Tier>(), Ok(Tier::Gold));
        assert_eq!(" Silver ".parse::<Tier>(), Ok(Tier::Silver));
        assert!("platinum".parse::<Tier>().is_err());
        for tier in Tier::ALL {
            assert_eq!(tier.as_str().parse::<Tier>(), Ok(tier));
        }
    }
}

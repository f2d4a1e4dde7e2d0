use super::{Storage, StorageError, Tier};
use arrow::compute::concat_batches;
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use glob::glob;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::debug;

/// Snapshots stored as `<root>/<tier>/<name>.parquet`.
///
/// The Arrow schema travels in the Parquet metadata, so datetime and
/// dictionary (categorical) columns come back exactly as written.
pub struct ParquetStore {
    root: PathBuf,
}

impl ParquetStore {
    /// Open a store at `root`, creating one directory per tier.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        for tier in Tier::ALL {
            let dir = root.join(tier.as_str());
            fs::create_dir_all(&dir).map_err(|source| StorageError::Io { path: dir, source })?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self, tier: Tier, name: &str) -> PathBuf {
        self.root
            .join(tier.as_str())
            .join(format!("{}.parquet", name))
    }
}

impl Storage for ParquetStore {
    fn load(&self, tier: Tier, name: &str) -> Result<RecordBatch, StorageError> {
        let path = self.snapshot_path(tier, name);
        if !path.is_file() {
            return Err(StorageError::NotFound {
                tier,
                name: name.to_string(),
            });
        }

        let file = File::open(&path).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;
        let builder =
            ParquetRecordBatchReaderBuilder::try_new(file).map_err(|source| {
                StorageError::Parquet {
                    path: path.clone(),
                    source,
                }
            })?;
        let schema = builder.schema().clone();
        let reader = builder
            .with_batch_size(8_192)
            .build()
            .map_err(|source| StorageError::Parquet {
                path: path.clone(),
                source,
            })?;
        let batches = reader.collect::<Result<Vec<_>, ArrowError>>()?;
        let batch = concat_batches(&schema, &batches)?;

        debug!(tier = %tier, name, rows = batch.num_rows(), "loaded snapshot");
        Ok(batch)
    }

    fn save(&self, tier: Tier, name: &str, batch: &RecordBatch) -> Result<(), StorageError> {
        let dir = self.root.join(tier.as_str());
        fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            path: dir.clone(),
            source,
        })?;
        let final_path = self.snapshot_path(tier, name);

        // Write next to the target, then rename over it.
        let tmp = NamedTempFile::new_in(&dir).map_err(|source| StorageError::Io {
            path: dir.clone(),
            source,
        })?;
        let file = tmp.reopen().map_err(|source| StorageError::Io {
            path: tmp.path().to_path_buf(),
            source,
        })?;

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let parquet_err = |source| StorageError::Parquet {
            path: final_path.clone(),
            source,
        };
        let mut writer =
            ArrowWriter::try_new(file, batch.schema(), Some(props)).map_err(parquet_err)?;
        writer.write(batch).map_err(parquet_err)?;
        writer.close().map_err(parquet_err)?;

        tmp.persist(&final_path).map_err(|e| StorageError::Io {
            path: final_path.clone(),
            source: e.error,
        })?;

        debug!(tier = %tier, name, rows = batch.num_rows(), path = %final_path.display(), "saved snapshot");
        Ok(())
    }

    fn list(&self, tier: Tier) -> Result<Vec<String>, StorageError> {
        let dir = self.root.join(tier.as_str());
        let pattern = format!("{}/*.parquet", dir.display());
        let entries = glob(&pattern).map_err(|e| StorageError::Io {
            path: dir.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;

        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|p| p.is_file())
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{
        Array, ArrayRef, BooleanArray, DictionaryArray, Float64Array, Int64Array, StringArray,
        TimestampMicrosecondArray,
    };
    use arrow::datatypes::{DataType, Field, Int32Type, Schema, TimeUnit};
    use crate::table::Value;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn every_kind() -> RecordBatch {
        let region: DictionaryArray<Int32Type> = vec!["A", "B", "A"].into_iter().collect();
        let schema = Arc::new(Schema::new(vec![
            Field::new("Name", DataType::Utf8, true),
            Field::new("Quantity", DataType::Int64, true),
            Field::new("Sales", DataType::Float64, true),
            Field::new(
                "Date",
                DataType::Timestamp(TimeUnit::Microsecond, None),
                true,
            ),
            Field::new("Region", region.data_type().clone(), true),
            Field::new("CurrentFlag", DataType::Boolean, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("x"), None, Some("z")])) as ArrayRef,
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(Float64Array::from(vec![Some(1.5), Some(2.5), None])),
                Arc::new(TimestampMicrosecondArray::from(vec![
                    Some(1_700_000_000_000_000),
                    None,
                    Some(1_700_000_000_000_001),
                ])),
                Arc::new(region),
                Arc::new(BooleanArray::from(vec![true, false, true])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn round_trips_every_column_kind() {
        let dir = tempdir().unwrap();
        let store = ParquetStore::new(dir.path()).unwrap();
        let batch = every_kind();

        store.save(Tier::Silver, "sales", &batch).unwrap();
        let loaded = store.load(Tier::Silver, "sales").unwrap();

        assert_eq!(loaded.schema(), batch.schema());
        assert_eq!(loaded.num_rows(), batch.num_rows());
        for col in 0..batch.num_columns() {
            for row in 0..batch.num_rows() {
                assert_eq!(
                    Value::from_array(loaded.column(col).as_ref(), row),
                    Value::from_array(batch.column(col).as_ref(), row)
                );
            }
        }
    }

    #[test]
    fn missing_snapshot_is_not_found() {
        let dir = tempdir().unwrap();
        let store = ParquetStore::new(dir.path()).unwrap();

        let err = store.load(Tier::Gold, "nope").unwrap_err();
        assert!(matches!(err, StorageError::NotFound { tier: Tier::Gold, .. }));
        assert!(store.load_if_exists(Tier::Gold, "nope").unwrap().is_none());
    }

    #[test]
    fn save_overwrites_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = ParquetStore::new(dir.path()).unwrap();
        let batch = every_kind();

        store.save(Tier::Bronze, "sales", &batch).unwrap();
        store.save(Tier::Bronze, "sales", &batch.slice(0, 1)).unwrap();

        assert_eq!(store.load(Tier::Bronze, "sales").unwrap().num_rows(), 1);
        let entries: Vec<_> = fs::read_dir(dir.path().join("bronze"))
            .unwrap()
            .filter_map(Result::ok)
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn empty_tables_keep_their_schema() {
        let dir = tempdir().unwrap();
        let store = ParquetStore::new(dir.path()).unwrap();
        let empty = every_kind().slice(0, 0);

        store.save(Tier::Gold, "empty", &empty).unwrap();
        let loaded = store.load(Tier::Gold, "empty").unwrap();
        assert_eq!(loaded.num_rows(), 0);
        assert_eq!(loaded.schema(), empty.schema());
    }

    #[test]
    fn lists_snapshots_per_tier() {
        let dir = tempdir().unwrap();
        let store = ParquetStore::new(dir.path()).unwrap();
        let batch = every_kind();
        store.save(Tier::Gold, "b", &batch).unwrap();
        store.save(Tier::Gold, "a", &batch).unwrap();
        store.save(Tier::Silver, "c", &batch).unwrap();

        assert_eq!(store.list(Tier::Gold).unwrap(), vec!["a", "b"]);
        assert_eq!(store.list(Tier::Silver).unwrap(), vec!["c"]);
        assert!(store.list(Tier::Bronze).unwrap().is_empty());
    }
}

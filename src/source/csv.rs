use super::{ExtractionError, Source};
use crate::table::date_parser::clean_str;
use arrow::compute::concat_batches;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use glob::glob;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const BATCH_SIZE: usize = 65_536;

/// Reads `<landing_dir>/<cube>.csv` drops. Every column comes in as a
/// string; typing is the raw stage's job.
#[derive(Debug, Clone)]
pub struct CsvSource {
    landing_dir: PathBuf,
}

impl CsvSource {
    pub fn new(landing_dir: impl Into<PathBuf>) -> Self {
        Self {
            landing_dir: landing_dir.into(),
        }
    }

    pub fn path_for(&self, cube: &str) -> PathBuf {
        self.landing_dir.join(format!("{}.csv", cube))
    }

    /// Cube names of every CSV in the landing directory, sorted.
    pub fn discover(&self) -> Vec<String> {
        let pattern = format!("{}/*.csv", self.landing_dir.display());
        let mut cubes: Vec<String> = match glob(&pattern) {
            Ok(paths) => paths
                .filter_map(Result::ok)
                .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
                .collect(),
            Err(_) => Vec::new(),
        };
        cubes.sort();
        cubes
    }
}

fn header_schema(line: &str) -> Schema {
    let fields: Vec<Field> = line
        .trim_end_matches(['\r', '\n'])
        .split(',')
        .map(|name| Field::new(clean_str(name), DataType::Utf8, true))
        .collect();
    Schema::new(fields)
}

fn read_csv(unit: &str, path: &Path) -> Result<RecordBatch, ExtractionError> {
    let io_err = |source| ExtractionError::Io {
        unit: unit.to_string(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    let mut reader = BufReader::new(file);

    let mut header = String::new();
    reader.read_line(&mut header).map_err(io_err)?;
    if header.trim().is_empty() {
        return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
    }
    let schema = Arc::new(header_schema(&header));
    reader.seek(SeekFrom::Start(0)).map_err(io_err)?;

    let parse_err = |source| ExtractionError::Parse {
        unit: unit.to_string(),
        source,
    };
    let csv = ReaderBuilder::new(schema.clone())
        .with_header(true)
        .with_batch_size(BATCH_SIZE)
        .build(reader)
        .map_err(parse_err)?;
    let batches = csv.collect::<Result<Vec<_>, _>>().map_err(parse_err)?;
    concat_batches(&schema, &batches).map_err(parse_err)
}

impl Source for CsvSource {
    fn extract(&self, unit: &str) -> Result<RecordBatch, ExtractionError> {
        let path = self.path_for(unit);
        if !path.is_file() {
            return Err(ExtractionError::NotFound {
                unit: unit.to_string(),
                path,
            });
        }
        let batch = read_csv(unit, &path)?;
        debug!(unit, rows = batch.num_rows(), path = %path.display(), "read csv");
        Ok(batch)
    }
}

use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Logical column kinds a table may carry between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    #[serde(alias = "str", alias = "utf8")]
    String,
    #[serde(alias = "int", alias = "int64")]
    Integer,
    #[serde(alias = "float64", alias = "double")]
    Float,
    #[serde(alias = "timestamp", alias = "datetime64[ns]")]
    Datetime,
    #[serde(alias = "category")]
    Categorical,
    #[serde(alias = "bool")]
    Boolean,
    /// Anything this pipeline does not interpret (binary, nested, ...).
    #[serde(skip)]
    Other,
}

impl ColumnKind {
    pub fn of(dt: &DataType) -> Self {
        match dt {
            DataType::Utf8 | DataType::LargeUtf8 => ColumnKind::String,
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => ColumnKind::Integer,
            DataType::Float16 | DataType::Float32 | DataType::Float64 => ColumnKind::Float,
            DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64 => {
                ColumnKind::Datetime
            }
            DataType::Dictionary(_, _) => ColumnKind::Categorical,
            DataType::Boolean => ColumnKind::Boolean,
            _ => ColumnKind::Other,
        }
    }

    /// Physical Arrow type a column of this kind is stored as.
    pub fn arrow_type(&self) -> DataType {
        match self {
            ColumnKind::String | ColumnKind::Other => DataType::Utf8,
            ColumnKind::Integer => DataType::Int64,
            ColumnKind::Float => DataType::Float64,
            ColumnKind::Datetime => DataType::Timestamp(TimeUnit::Microsecond, None),
            ColumnKind::Categorical => {
                DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8))
            }
            ColumnKind::Boolean => DataType::Boolean,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnKind::Integer | ColumnKind::Float)
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColumnKind::String => "string",
            ColumnKind::Integer => "integer",
            ColumnKind::Float => "float",
            ColumnKind::Datetime => "datetime",
            ColumnKind::Categorical => "categorical",
            ColumnKind::Boolean => "boolean",
            ColumnKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Declared column set of one table, computed once and consulted instead of
/// probing the batch for individual columns.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    columns: Vec<(Arc<str>, ColumnKind)>,
}

impl TableSchema {
    pub fn of(batch: &RecordBatch) -> Self {
        let columns = batch
            .schema()
            .fields()
            .iter()
            .map(|f| (Arc::from(f.name().as_str()), ColumnKind::of(f.data_type())))
            .collect();
        Self { columns }
    }

    pub fn kind(&self, name: &str) -> Option<ColumnKind> {
        self.columns
            .iter()
            .find(|(n, _)| n.as_ref() == name)
            .map(|(_, k)| *k)
    }

    pub fn has(&self, name: &str) -> bool {
        self.kind(name).is_some()
    }

    pub fn is_numeric(&self, name: &str) -> bool {
        self.kind(name).is_some_and(|k| k.is_numeric())
    }

    /// The subset of `wanted` present in this table, in `wanted` order.
    pub fn present(&self, wanted: &[String]) -> Vec<String> {
        wanted.iter().filter(|w| self.has(w)).cloned().collect()
    }

    pub fn missing(&self, wanted: &[String]) -> Vec<String> {
        wanted.iter().filter(|w| !self.has(w)).cloned().collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_ref())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Float64Array, StringArray};
    use arrow::datatypes::{Field, Schema};

    #[test]
    fn describes_columns_and_checks_capabilities() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("Region", DataType::Utf8, true),
            Field::new("Sales", DataType::Float64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["A"])) as ArrayRef,
                Arc::new(Float64Array::from(vec![1.0])) as ArrayRef,
            ],
        )
        .unwrap();

        let desc = TableSchema::of(&batch);
        assert_eq!(desc.kind("Region"), Some(ColumnKind::String));
        assert!(desc.is_numeric("Sales"));
        assert!(!desc.has("Quantity"));
        let wanted = vec!["Quantity".to_string(), "Sales".to_string()];
        assert_eq!(desc.present(&wanted), vec!["Sales".to_string()]);
        assert_eq!(desc.missing(&wanted), vec!["Quantity".to_string()]);
    }

    #[test]
    fn kinds_deserialize_from_config_spellings() {
        let kinds: Vec<ColumnKind> =
            serde_yaml::from_str("- float\n- int\n- datetime64[ns]\n- string\n- category\n")
                .unwrap();
        assert_eq!(
            kinds,
            vec![
                ColumnKind::Float,
                ColumnKind::Integer,
                ColumnKind::Datetime,
                ColumnKind::String,
                ColumnKind::Categorical
            ]
        );
    }
}

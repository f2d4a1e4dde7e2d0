//! Arrow `RecordBatch` is the table exchanged between every stage. This module
//! holds the column-level helpers the stages share.

pub mod date_parser;
pub mod schema;
pub mod value;

pub use schema::{ColumnKind, TableSchema};
pub use value::Value;

use arrow::array::{
    new_null_array, Array, ArrayRef, AsArray, Float64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Float64Type, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

/// Replace column `name` (or append it when absent). The new field is nullable.
pub fn with_column(
    batch: &RecordBatch,
    name: &str,
    column: ArrayRef,
) -> Result<RecordBatch, ArrowError> {
    let schema = batch.schema();
    let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
    let field = Field::new(name, column.data_type().clone(), true);

    match schema.index_of(name) {
        Ok(idx) => {
            fields[idx] = field;
            columns[idx] = column;
        }
        Err(_) => {
            fields.push(field);
            columns.push(column);
        }
    }

    let schema = Schema::new_with_metadata(fields, schema.metadata().clone());
    RecordBatch::try_new(Arc::new(schema), columns)
}

pub fn constant_utf8(value: &str, len: usize) -> ArrayRef {
    Arc::new(StringArray::from(vec![value; len]))
}

pub fn constant_timestamp(micros: i64, len: usize) -> ArrayRef {
    Arc::new(TimestampMicrosecondArray::from(vec![micros; len]))
}

pub fn constant_f64(value: f64, len: usize) -> ArrayRef {
    Arc::new(Float64Array::from(vec![value; len]))
}

/// Column `name` viewed as `f64`, unparsable or null cells as `None`.
/// Returns `None` when the column is missing or cannot be cast at all.
pub fn numeric_column(batch: &RecordBatch, name: &str) -> Option<Vec<Option<f64>>> {
    let column = batch.column_by_name(name)?;
    let floats = cast(column.as_ref(), &DataType::Float64).ok()?;
    Some(floats.as_primitive::<Float64Type>().iter().collect())
}

/// Values of the given column indices for one row.
pub fn row_values(batch: &RecordBatch, columns: &[usize], row: usize) -> Vec<Value> {
    columns
        .iter()
        .map(|&idx| Value::from_array(batch.column(idx).as_ref(), row))
        .collect()
}

/// One row as a JSON object, used for quality samples and read-side responses.
pub fn row_to_json(batch: &RecordBatch, row: usize) -> Map<String, JsonValue> {
    let schema = batch.schema();
    schema
        .fields()
        .iter()
        .zip(batch.columns())
        .map(|(field, column)| {
            let value = Value::from_array(column.as_ref(), row);
            let json = serde_json::to_value(&value).unwrap_or(JsonValue::Null);
            (field.name().clone(), json)
        })
        .collect()
}

/// Fields of `a` followed by those only `b` has, all nullable.
pub fn union_schema(a: &Schema, b: &Schema) -> Schema {
    let mut fields: Vec<Field> = a
        .fields()
        .iter()
        .map(|f| f.as_ref().clone().with_nullable(true))
        .collect();
    for f in b.fields() {
        if a.index_of(f.name()).is_err() {
            fields.push(f.as_ref().clone().with_nullable(true));
        }
    }
    Schema::new(fields)
}

/// Reshape `batch` onto `target`: columns are matched by name, cast when the
/// type differs, and filled with nulls when missing.
pub fn align_to(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch, ArrowError> {
    let rows = batch.num_rows();
    let columns = target
        .fields()
        .iter()
        .map(|field| match batch.column_by_name(field.name()) {
            Some(col) if col.data_type() == field.data_type() => Ok(col.clone()),
            Some(col) => cast(col.as_ref(), field.data_type()),
            None => Ok(new_null_array(field.data_type(), rows)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    RecordBatch::try_new(target.clone(), columns)
}

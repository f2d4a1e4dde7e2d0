use arrow::array::{Array, AsArray};
use arrow::datatypes::{
    DataType, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
    TimeUnit, TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow::util::display::array_value_to_string;
use chrono::DateTime;
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// One cell pulled out of an Arrow column.
///
/// Values of one column always share a variant, so the cross-variant ordering
/// only has to be total, not meaningful. Nulls sort last.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Microseconds since the Unix epoch, UTC-naive.
    Timestamp(i64),
}

impl Value {
    /// Read row `row` of `array`. Unknown physical types fall back to their
    /// display string.
    pub fn from_array(array: &dyn Array, row: usize) -> Value {
        if array.is_null(row) {
            return Value::Null;
        }
        match array.data_type() {
            DataType::Boolean => Value::Bool(array.as_boolean().value(row)),
            DataType::Int8 => Value::Int(array.as_primitive::<Int8Type>().value(row) as i64),
            DataType::Int16 => Value::Int(array.as_primitive::<Int16Type>().value(row) as i64),
            DataType::Int32 => Value::Int(array.as_primitive::<Int32Type>().value(row) as i64),
            DataType::Int64 => Value::Int(array.as_primitive::<Int64Type>().value(row)),
            DataType::UInt8 => Value::Int(array.as_primitive::<UInt8Type>().value(row) as i64),
            DataType::UInt16 => Value::Int(array.as_primitive::<UInt16Type>().value(row) as i64),
            DataType::UInt32 => Value::Int(array.as_primitive::<UInt32Type>().value(row) as i64),
            DataType::UInt64 => Value::Int(array.as_primitive::<UInt64Type>().value(row) as i64),
            DataType::Float32 => {
                Value::Float(array.as_primitive::<Float32Type>().value(row) as f64)
            }
            DataType::Float64 => Value::Float(array.as_primitive::<Float64Type>().value(row)),
            DataType::Utf8 => Value::Str(array.as_string::<i32>().value(row).to_string()),
            DataType::LargeUtf8 => Value::Str(array.as_string::<i64>().value(row).to_string()),
            DataType::Timestamp(unit, _) => {
                let micros = match unit {
                    TimeUnit::Second => {
                        array.as_primitive::<TimestampSecondType>().value(row) * 1_000_000
                    }
                    TimeUnit::Millisecond => {
                        array.as_primitive::<TimestampMillisecondType>().value(row) * 1_000
                    }
                    TimeUnit::Microsecond => {
                        array.as_primitive::<TimestampMicrosecondType>().value(row)
                    }
                    TimeUnit::Nanosecond => {
                        array.as_primitive::<TimestampNanosecondType>().value(row) / 1_000
                    }
                };
                Value::Timestamp(micros)
            }
            DataType::Dictionary(key, _) if key.as_ref() == &DataType::Int32 => {
                let dict = array.as_dictionary::<Int32Type>();
                let idx = dict.keys().value(row) as usize;
                Value::from_array(dict.values().as_ref(), idx)
            }
            _ => match array_value_to_string(array, row) {
                Ok(s) => Value::Str(s),
                Err(_) => Value::Null,
            },
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Canonical string form, `None` for null. Surrogate keys and identity
    /// keys are derived from this, so it must never change between releases.
    pub fn canonical(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Str(s) => Some(s.clone()),
            Value::Timestamp(us) => Some(format_micros(*us)),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) | Value::Float(_) => 1,
            Value::Timestamp(_) => 2,
            Value::Str(_) => 3,
            Value::Null => 4,
        }
    }
}

pub(crate) fn format_micros(us: i64) -> String {
    match DateTime::from_timestamp_micros(us) {
        Some(dt) => dt.naive_utc().to_string(),
        None => us.to_string(),
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Int(_), Value::Float(_))
            | (Value::Float(_), Value::Int(_))
            | (Value::Float(_), Value::Float(_)) => {
                let (a, b) = (self.as_f64().unwrap_or(0.0), other.as_f64().unwrap_or(0.0));
                a.total_cmp(&b)
            }
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(_) | Value::Float(_) => {
                self.as_f64().unwrap_or(0.0).to_bits().hash(state)
            }
            Value::Str(s) => s.hash(state),
            Value::Timestamp(us) => us.hash(state),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Timestamp(us) => serializer.serialize_str(&format_micros(*us)),
        }
    }
}

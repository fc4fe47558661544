use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{json, Value};

/// A literal bound to a named query parameter. The warehouse type is decided
/// by the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int64(i64),
    Float64(f64),
    Bool(bool),
    String(String),
    Timestamp(DateTime<Utc>),
    Datetime(NaiveDateTime),
    Date(NaiveDate),
    Int64Array(Vec<i64>),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Int64(_) => "INT64",
            ParamValue::Float64(_) => "FLOAT64",
            ParamValue::Bool(_) => "BOOL",
            ParamValue::String(_) => "STRING",
            ParamValue::Timestamp(_) => "TIMESTAMP",
            ParamValue::Datetime(_) => "DATETIME",
            ParamValue::Date(_) => "DATE",
            ParamValue::Int64Array(_) => "ARRAY",
        }
    }

    fn scalar_text(&self) -> Option<String> {
        match self {
            ParamValue::Int64(v) => Some(v.to_string()),
            ParamValue::Float64(v) => Some(v.to_string()),
            ParamValue::Bool(v) => Some(v.to_string()),
            ParamValue::String(v) => Some(v.clone()),
            ParamValue::Timestamp(v) => Some(v.format("%Y-%m-%d %H:%M:%S%.6f+00:00").to_string()),
            ParamValue::Datetime(v) => Some(v.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
            ParamValue::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
            ParamValue::Int64Array(_) => None,
        }
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int64(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int64(value.into())
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float64(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<DateTime<Utc>> for ParamValue {
    fn from(value: DateTime<Utc>) -> Self {
        ParamValue::Timestamp(value)
    }
}

impl From<NaiveDateTime> for ParamValue {
    fn from(value: NaiveDateTime) -> Self {
        ParamValue::Datetime(value)
    }
}

impl From<NaiveDate> for ParamValue {
    fn from(value: NaiveDate) -> Self {
        ParamValue::Date(value)
    }
}

impl From<Vec<i64>> for ParamValue {
    fn from(value: Vec<i64>) -> Self {
        ParamValue::Int64Array(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryParam {
    pub name: String,
    pub value: ParamValue,
}

impl QueryParam {
    pub fn new(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Shape expected by the `queryParameters` field of a jobs.query request.
    pub fn to_wire(&self) -> Value {
        match &self.value {
            ParamValue::Int64Array(values) => json!({
                "name": self.name,
                "parameterType": { "type": "ARRAY", "arrayType": { "type": "INT64" } },
                "parameterValue": {
                    "arrayValues": values
                        .iter()
                        .map(|v| json!({ "value": v.to_string() }))
                        .collect::<Vec<_>>()
                },
            }),
            scalar => json!({
                "name": self.name,
                "parameterType": { "type": scalar.type_name() },
                "parameterValue": { "value": scalar.scalar_text() },
            }),
        }
    }
}

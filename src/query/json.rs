use serde::Deserialize;
use serde_json::{Map, Value};

use super::{AggregateSpec, QuerySet, ResultSet};
use crate::error::QueryError;
use crate::warehouse::{ParamValue, Row};

/// Declarative query accepted by [`QuerySet::json_query`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonQuerySpec {
    #[serde(default)]
    pub filter: Option<Map<String, Value>>,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub by: Option<Vec<String>>,
    #[serde(default)]
    pub order: Option<Vec<String>>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub grouping_function: Option<GroupingFunction>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupingFunction {
    #[serde(default)]
    pub sum: Vec<String>,
    #[serde(default)]
    pub count: Vec<String>,
    #[serde(default)]
    pub avg: Vec<String>,
}

#[derive(Debug)]
pub enum QueryOutput {
    Rows(ResultSet),
    Aggregate(Row),
}

impl QueryOutput {
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryOutput::Rows(rows) => rows.collect(),
            QueryOutput::Aggregate(row) => vec![row],
        }
    }
}

impl JsonQuerySpec {
    pub fn parse(raw: &Value) -> Result<Self, QueryError> {
        Self::deserialize(raw).map_err(|e| QueryError::InvalidSpec(e.to_string()))
    }

    pub fn apply(&self, qs: &mut QuerySet) -> Result<(), QueryError> {
        if let Some(filter) = &self.filter {
            for (key, raw) in filter {
                qs.filter(key, literal(key, raw)?);
            }
        }
        if let Some(fields) = &self.fields {
            qs.select(fields.iter().cloned());
        }
        if let Some(by) = &self.by {
            qs.group_by(by.iter().cloned());
        }
        if let Some(order) = &self.order {
            qs.order_by(order.iter().cloned());
        }
        if let Some(limit) = self.limit {
            qs.limit_by(limit);
        }
        Ok(())
    }

    /// Aggregates requested by `grouping_function`, or `None` for a plain
    /// row query.
    pub fn aggregates(&self) -> Option<Vec<AggregateSpec>> {
        let grouping = self.grouping_function.as_ref()?;
        let mut specs = Vec::new();
        specs.extend(grouping.sum.iter().map(AggregateSpec::sum));
        specs.extend(grouping.count.iter().map(AggregateSpec::count));
        specs.extend(grouping.avg.iter().map(AggregateSpec::avg));
        Some(specs)
    }
}

fn literal(key: &str, raw: &Value) -> Result<ParamValue, QueryError> {
    match raw {
        Value::Bool(v) => Ok(ParamValue::Bool(*v)),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Ok(ParamValue::Int64(v))
            } else if let Some(v) = n.as_f64() {
                Ok(ParamValue::Float64(v))
            } else {
                Err(unsupported(key, raw))
            }
        }
        Value::String(v) => Ok(ParamValue::String(v.clone())),
        Value::Null | Value::Array(_) | Value::Object(_) => Err(unsupported(key, raw)),
    }
}

fn unsupported(key: &str, raw: &Value) -> QueryError {
    QueryError::UnsupportedLiteral {
        name: key.to_string(),
        value: raw.to_string(),
    }
}

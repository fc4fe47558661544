//! Fluent query builder rendering parameterized standard SQL for the
//! warehouse.
//!
//! ```text
//! QuerySet::new(warehouse, "activity")
//!     .filter("user_id__gte", 5)
//!     .select(["id"])
//!     .sql()
//! // SELECT id FROM `project.dataset.activity` WHERE user_id >= @x__user_id
//! ```

use std::sync::Arc;

use crate::error::QueryError;
use crate::warehouse::{ParamValue, QueryParam, Row, Warehouse};

pub mod filter;
pub mod json;

use filter::{upsert_predicate, Predicate};
pub use json::{JsonQuerySpec, QueryOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Count,
    Avg,
}

impl AggregateOp {
    fn keyword(self) -> &'static str {
        match self {
            AggregateOp::Sum => "SUM",
            AggregateOp::Count => "COUNT",
            AggregateOp::Avg => "AVG",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    pub op: AggregateOp,
    pub attribute: String,
}

impl AggregateSpec {
    pub fn sum(attribute: impl Into<String>) -> Self {
        Self {
            op: AggregateOp::Sum,
            attribute: attribute.into(),
        }
    }

    pub fn count(attribute: impl Into<String>) -> Self {
        Self {
            op: AggregateOp::Count,
            attribute: attribute.into(),
        }
    }

    pub fn avg(attribute: impl Into<String>) -> Self {
        Self {
            op: AggregateOp::Avg,
            attribute: attribute.into(),
        }
    }

    /// Column name the aggregate is exposed under, e.g. `sum__score`.
    pub fn alias(&self) -> String {
        format!(
            "{}__{}",
            self.op.keyword().to_lowercase(),
            self.attribute.replace('.', "__")
        )
    }

    fn render(&self) -> String {
        format!("{}({}) AS {}", self.op.keyword(), self.attribute, self.alias())
    }
}

/// Forward-only rows of one executed query. Run the query again to re-read.
#[derive(Debug)]
pub struct ResultSet {
    rows: std::vec::IntoIter<Row>,
}

impl ResultSet {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl Iterator for ResultSet {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for ResultSet {}

pub struct QuerySet {
    warehouse: Arc<dyn Warehouse>,
    table: String,
    predicates: Vec<Predicate>,
    fields: Option<Vec<String>>,
    group_by: Option<Vec<String>>,
    order_by: Option<Vec<String>>,
    limit: Option<u64>,
    aggregates: Vec<AggregateSpec>,
}

impl QuerySet {
    pub fn new(warehouse: Arc<dyn Warehouse>, table: impl Into<String>) -> Self {
        Self {
            warehouse,
            table: table.into(),
            predicates: Vec::new(),
            fields: None,
            group_by: None,
            order_by: None,
            limit: None,
            aggregates: Vec::new(),
        }
    }

    pub fn filter(&mut self, key: &str, value: impl Into<ParamValue>) -> &mut Self {
        upsert_predicate(&mut self.predicates, key, value.into());
        self
    }

    pub fn select<I, S>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn order_by<I, S>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order_by = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn group_by<I, S>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn limit_by(&mut self, limit: u64) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    pub fn sql(&self) -> String {
        let mut projection: Vec<String> = self.fields.clone().unwrap_or_default();
        projection.extend(self.aggregates.iter().map(AggregateSpec::render));
        let projection = if projection.is_empty() {
            "*".to_string()
        } else {
            projection.join(", ")
        };

        let mut sql = format!(
            "SELECT {projection} FROM `{}.{}.{}`",
            self.warehouse.project_id(),
            self.warehouse.dataset(),
            self.table
        );

        if !self.predicates.is_empty() {
            let clauses: Vec<String> = self.predicates.iter().map(Predicate::render).collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        if let Some(group_by) = self.group_by.as_ref().filter(|g| !g.is_empty()) {
            sql.push_str(" GROUP BY ");
            sql.push_str(&group_by.join(", "));
        }

        if let Some(order_by) = self.order_by.as_ref().filter(|o| !o.is_empty()) {
            let keys: Vec<String> = order_by.iter().map(|f| format!("{f} DESC")).collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        sql
    }

    pub fn params(&self) -> Vec<QueryParam> {
        self.predicates
            .iter()
            .map(|p| QueryParam::new(p.param_name.clone(), p.value.clone()))
            .collect()
    }

    pub async fn build(&self) -> Result<ResultSet, QueryError> {
        let rows = self.warehouse.query(&self.sql(), &self.params()).await?;
        Ok(ResultSet::new(rows))
    }

    /// Sets the aggregate projections, replacing any from an earlier call, and
    /// returns the single aggregate row.
    pub async fn aggregate<I>(&mut self, specs: I) -> Result<Row, QueryError>
    where
        I: IntoIterator<Item = AggregateSpec>,
    {
        self.aggregates = specs.into_iter().collect();
        self.build().await?.next().ok_or(QueryError::EmptyAggregate)
    }

    pub async fn json_query(&mut self, spec: &serde_json::Value) -> Result<QueryOutput, QueryError> {
        let spec = JsonQuerySpec::parse(spec)?;
        spec.apply(self)?;
        match spec.aggregates() {
            Some(aggregates) => Ok(QueryOutput::Aggregate(self.aggregate(aggregates).await?)),
            None => Ok(QueryOutput::Rows(self.build().await?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::testing::RecordingWarehouse;
    use serde_json::json;

    fn recording() -> Arc<RecordingWarehouse> {
        Arc::new(RecordingWarehouse::with_rows(vec![
            json!({"id": 1}),
            json!({"id": 2}),
        ]))
    }

    #[test]
    fn renders_filter_and_projection_exactly() {
        let sql = QuerySet::new(recording(), "activity")
            .filter("user_id__gte", 5)
            .select(["id"])
            .sql();
        assert_eq!(
            sql,
            "SELECT id FROM `PROJECT.DATASET.activity` WHERE user_id >= @x__user_id"
        );
    }

    #[test]
    fn no_fields_selects_everything() {
        let sql = QuerySet::new(recording(), "activity").sql();
        assert_eq!(sql, "SELECT * FROM `PROJECT.DATASET.activity`");
    }

    #[test]
    fn predicates_are_anded_without_trailing_conjunction() {
        let sql = QuerySet::new(recording(), "activity")
            .filter("kind", "login")
            .filter("meta__academy", 3)
            .sql();
        assert_eq!(
            sql,
            "SELECT * FROM `PROJECT.DATASET.activity` \
             WHERE kind = @x__kind AND meta.academy = @x__meta__academy"
        );
    }

    #[test]
    fn clause_order_is_group_order_limit() {
        let sql = QuerySet::new(recording(), "activity")
            .select(["kind"])
            .group_by(["kind"])
            .order_by(["kind"])
            .limit_by(10)
            .sql();
        assert_eq!(
            sql,
            "SELECT kind FROM `PROJECT.DATASET.activity` GROUP BY kind ORDER BY kind DESC LIMIT 10"
        );
    }

    #[test]
    fn params_carry_inferred_types() {
        let mut qs = QuerySet::new(recording(), "activity");
        qs.filter("user_id", 7).filter("score__gt", 0.5).filter("ok", true);
        let params = qs.params();
        assert_eq!(params.len(), 3);
        assert_eq!(params[0].value.type_name(), "INT64");
        assert_eq!(params[1].name, "x__score");
        assert_eq!(params[1].value.type_name(), "FLOAT64");
        assert_eq!(params[2].value.type_name(), "BOOL");
    }

    #[tokio::test]
    async fn build_executes_rendered_sql_with_params() {
        let warehouse = recording();
        let mut qs = QuerySet::new(warehouse.clone(), "activity");
        qs.filter("user_id__gte", 5);
        let rows: Vec<Row> = qs.build().await.expect("rows").collect();

        assert_eq!(rows.len(), 2);
        let calls = warehouse.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, qs.sql());
        assert_eq!(calls[0].1[0].name, "x__user_id");
    }

    #[tokio::test]
    async fn aggregate_appends_projections_and_returns_first_row() {
        let warehouse = Arc::new(RecordingWarehouse::with_rows(vec![json!({"sum__score": 10})]));
        let mut qs = QuerySet::new(warehouse.clone(), "activity");
        qs.select(["kind"]);
        let row = qs
            .aggregate([AggregateSpec::sum("score"), AggregateSpec::count("id")])
            .await
            .expect("aggregate");

        assert_eq!(row.get_i64("sum__score"), Some(10));
        assert_eq!(
            warehouse.calls()[0].0,
            "SELECT kind, SUM(score) AS sum__score, COUNT(id) AS count__id \
             FROM `PROJECT.DATASET.activity`"
        );
    }

    #[tokio::test]
    async fn repeated_aggregate_replaces_earlier_projections() {
        let warehouse = Arc::new(RecordingWarehouse::with_rows(vec![json!({"sum__score": 10})]));
        let mut qs = QuerySet::new(warehouse.clone(), "activity");
        qs.aggregate([AggregateSpec::sum("score")]).await.expect("first");
        qs.aggregate([AggregateSpec::sum("score")]).await.expect("second");

        let calls = warehouse.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, calls[1].0);
        assert_eq!(calls[1].0.matches("SUM(score)").count(), 1);
    }

    #[tokio::test]
    async fn empty_aggregate_result_is_an_error() {
        let warehouse = Arc::new(RecordingWarehouse::with_rows(vec![]));
        let err = QuerySet::new(warehouse, "activity")
            .aggregate([AggregateSpec::avg("score")])
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::EmptyAggregate));
    }

    #[tokio::test]
    async fn warehouse_errors_pass_through_unchanged() {
        let warehouse = Arc::new(RecordingWarehouse::failing("Unrecognized name: nope"));
        let err = QuerySet::new(warehouse, "activity")
            .filter("nope", 1)
            .build()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unrecognized name: nope"));
    }

    #[test]
    fn result_set_is_forward_only() {
        let mut rows = ResultSet::new(vec![Row::default(), Row::default()]);
        assert_eq!(rows.len(), 2);
        rows.next();
        rows.next();
        assert!(rows.next().is_none());
    }
}

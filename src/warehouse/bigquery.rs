use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::auth::TokenSource;
use super::{QueryParam, Row, Warehouse};
use crate::error::WarehouseError;

const QUERY_TIMEOUT_MS: u64 = 10_000;

/// BigQuery v2 REST client.
///
/// Queries go through `jobs.query` with named parameters; incomplete jobs and
/// extra pages are drained through `jobs.getQueryResults`.
pub struct BigQueryClient {
    http: Client,
    endpoint: String,
    project_id: String,
    dataset: String,
    tokens: TokenSource,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    schema: Option<Schema>,
    #[serde(default)]
    rows: Vec<WireRow>,
    #[serde(default)]
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct Schema {
    #[serde(default)]
    fields: Vec<Field>,
}

#[derive(Debug, Deserialize, Clone)]
struct Field {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireRow {
    #[serde(default)]
    f: Vec<WireCell>,
}

#[derive(Debug, Deserialize)]
struct WireCell {
    #[serde(default)]
    v: Value,
}

impl BigQueryClient {
    pub fn new(endpoint: &str, project_id: &str, dataset: &str, tokens: TokenSource) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            dataset: dataset.to_string(),
            tokens,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<QueryResponse, WarehouseError> {
        let request = match self.tokens.bearer(&self.http).await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WarehouseError::Status {
                status: status.as_u16(),
                body,
            });
        }

        resp.json()
            .await
            .map_err(|e| WarehouseError::Decode(e.to_string()))
    }

    async fn next_page(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse, WarehouseError> {
        let url = format!(
            "{}/bigquery/v2/projects/{}/queries/{}",
            self.endpoint, self.project_id, job.job_id
        );
        let mut query: Vec<(&str, String)> = vec![("timeoutMs", QUERY_TIMEOUT_MS.to_string())];
        if let Some(location) = &job.location {
            query.push(("location", location.clone()));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        self.send(self.http.get(url).query(&query)).await
    }
}

#[async_trait]
impl Warehouse for BigQueryClient {
    fn project_id(&self) -> &str {
        &self.project_id
    }

    fn dataset(&self) -> &str {
        &self.dataset
    }

    async fn query(&self, sql: &str, params: &[QueryParam]) -> Result<Vec<Row>, WarehouseError> {
        debug!(sql_len = sql.len(), params = params.len(), "dispatching warehouse query");

        let body = json!({
            "query": sql,
            "useLegacySql": false,
            "parameterMode": "NAMED",
            "queryParameters": params.iter().map(QueryParam::to_wire).collect::<Vec<_>>(),
            "timeoutMs": QUERY_TIMEOUT_MS,
        });
        let url = format!(
            "{}/bigquery/v2/projects/{}/queries",
            self.endpoint, self.project_id
        );
        let mut page = self.send(self.http.post(url).json(&body)).await?;

        let mut rows = Vec::new();
        let mut schema: Option<Schema> = None;
        loop {
            if page.job_complete {
                if page.schema.is_some() {
                    schema = page.schema.clone();
                }
                let fields = schema.as_ref().map(|s| s.fields.as_slice()).unwrap_or(&[]);
                for wire in &page.rows {
                    rows.push(decode_row(fields, wire)?);
                }
                if page.page_token.is_none() {
                    break;
                }
            }

            let job = page.job_reference.as_ref().ok_or_else(|| {
                WarehouseError::Decode("incomplete job without a job reference".to_string())
            })?;
            let token = if page.job_complete {
                page.page_token.as_deref()
            } else {
                None
            };
            page = self.next_page(job, token).await?;
        }

        debug!(rows = rows.len(), "warehouse query finished");
        Ok(rows)
    }
}

fn decode_row(fields: &[Field], wire: &WireRow) -> Result<Row, WarehouseError> {
    if fields.len() != wire.f.len() {
        return Err(WarehouseError::Decode(format!(
            "row has {} cells but schema has {} fields",
            wire.f.len(),
            fields.len()
        )));
    }

    let mut map = Map::new();
    for (field, cell) in fields.iter().zip(&wire.f) {
        let value = if field.mode.as_deref() == Some("REPEATED") {
            match &cell.v {
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .map(|item| decode_scalar(&field.kind, item.get("v").unwrap_or(item)))
                        .collect(),
                ),
                _ => Value::Array(Vec::new()),
            }
        } else {
            decode_scalar(&field.kind, &cell.v)
        };
        map.insert(field.name.clone(), value);
    }
    Ok(Row(map))
}

fn decode_scalar(kind: &str, raw: &Value) -> Value {
    let Value::String(text) = raw else {
        return raw.clone();
    };
    match kind {
        "INTEGER" | "INT64" => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| raw.clone()),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => text
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or_else(|| raw.clone()),
        "BOOLEAN" | "BOOL" => Value::Bool(text == "true"),
        _ => raw.clone(),
    }
}

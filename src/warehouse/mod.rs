//! Read-only access to the analytics warehouse.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::config::{WarehouseConfig, WarehouseMode};
use crate::credentials::CredentialResolver;
use crate::error::WarehouseError;

pub mod auth;
pub mod bigquery;
pub mod params;

pub use bigquery::BigQueryClient;
pub use params::{ParamValue, QueryParam};

/// One decoded result row, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Row(pub Map<String, Value>);

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column).filter(|v| !v.is_null())
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(|v| match v {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    pub fn get_f64(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }
}

impl From<Value> for Row {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Row(map),
            _ => Row::default(),
        }
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    fn project_id(&self) -> &str;
    fn dataset(&self) -> &str;

    /// Runs a parameterized standard-SQL query and returns every row.
    async fn query(&self, sql: &str, params: &[QueryParam]) -> Result<Vec<Row>, WarehouseError>;
}

/// Owns the lazily built warehouse client. Created once by the composition
/// root and shared from there.
pub struct WarehouseClient {
    config: WarehouseConfig,
    resolver: Arc<CredentialResolver>,
    client: Mutex<Option<Arc<BigQueryClient>>>,
}

impl WarehouseClient {
    pub fn new(config: WarehouseConfig, resolver: Arc<CredentialResolver>) -> Self {
        Self {
            config,
            resolver,
            client: Mutex::new(None),
        }
    }

    pub fn client(&self) -> Result<Arc<BigQueryClient>, WarehouseError> {
        if let Some(client) = self.lock().as_ref() {
            return Ok(Arc::clone(client));
        }

        // Built outside the lock; a concurrent first use may build twice and
        // keep whichever lands first.
        let built = Arc::new(self.build()?);
        let mut slot = self.lock();
        Ok(Arc::clone(slot.get_or_insert(built)))
    }

    #[cfg(test)]
    pub fn reset(&self) {
        *self.lock() = None;
    }

    fn build(&self) -> Result<BigQueryClient, WarehouseError> {
        let cfg = &self.config;
        let tokens = match &cfg.mode {
            WarehouseMode::Emulator { endpoint } => {
                info!(endpoint = %endpoint, "using warehouse emulator");
                auth::TokenSource::Anonymous
            }
            WarehouseMode::Cloud { .. } => {
                let resolved = self.resolver.resolve()?;
                if !resolved {
                    tracing::warn!("warehouse credentials unresolved, queries will fail on use");
                }
                let key_path = resolved
                    .then(|| std::env::var(crate::credentials::CREDENTIALS_PATH).ok())
                    .flatten()
                    .map(std::path::PathBuf::from);
                auth::TokenSource::service_account(key_path)
            }
        };
        Ok(BigQueryClient::new(
            cfg.mode.endpoint(),
            &cfg.project_id,
            &cfg.dataset,
            tokens,
        ))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<BigQueryClient>>> {
        self.client.lock().unwrap_or_else(|e| e.into_inner())
    }
}

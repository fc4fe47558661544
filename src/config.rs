pub const DEFAULT_EMULATOR_HOST: &str = "http://0.0.0.0:9050";
pub const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com";
pub const EMULATOR_PROJECT_ID: &str = "test";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub warehouse: WarehouseConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WarehouseConfig {
    pub mode: WarehouseMode,
    pub project_id: String,
    pub dataset: String,
    pub activity_table: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WarehouseMode {
    /// Talks to the real REST endpoint with service-account credentials.
    Cloud { endpoint: String },
    /// Local emulator with anonymous credentials.
    Emulator { endpoint: String },
}

impl WarehouseMode {
    pub fn endpoint(&self) -> &str {
        match self {
            WarehouseMode::Cloud { endpoint } | WarehouseMode::Emulator { endpoint } => endpoint,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let emulator_host = lookup("BIGQUERY_EMULATOR_HOST");
        let test_env = lookup("ENV").is_some_and(|v| v == "test");

        let mode = if test_env || emulator_host.is_some() {
            WarehouseMode::Emulator {
                endpoint: emulator_host.unwrap_or_else(|| DEFAULT_EMULATOR_HOST.to_string()),
            }
        } else {
            WarehouseMode::Cloud {
                endpoint: lookup("BIGQUERY_ENDPOINT")
                    .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            }
        };

        let project_id = match mode {
            WarehouseMode::Emulator { .. } => EMULATOR_PROJECT_ID.to_string(),
            WarehouseMode::Cloud { .. } => lookup("BIGQUERY_PROJECT_ID").unwrap_or_default(),
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL"),
            database_max_connections: lookup("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|| "5".to_string())
                .parse()
                .map_err(|e| format!("invalid DATABASE_MAX_CONNECTIONS: {e}"))?,
            warehouse: WarehouseConfig {
                mode,
                project_id,
                dataset: lookup("BIGQUERY_DATASET").unwrap_or_else(|| "4geeks".to_string()),
                activity_table: lookup("BIGQUERY_ACTIVITY_TABLE")
                    .unwrap_or_else(|| "activity".to_string()),
            },
        })
    }

    pub fn database_url(&self) -> Result<&str, String> {
        self.database_url
            .as_deref()
            .ok_or_else(|| "DATABASE_URL must be set to a Postgres instance".to_string())
    }
}

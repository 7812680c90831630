use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::{ImportError, ImportResult};
use crate::models::{ConfigSummary, ImportDirection, InfluxVersion};

pub const DEFAULT_QUERY_INTERVAL_MS: u64 = 100;
pub const DEFAULT_TARGET_BATCH_SIZE: u64 = 2000;

/// Source credentials. Kept in memory for the life of a run, never
/// serialized or persisted; resume takes a fresh copy from the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceCredentials {
    Token(String),
    Basic { username: String, password: String },
}

impl SourceCredentials {
    /// Applies the mutual-exclusion rules to the three raw fields: username
    /// and password only together, token and username/password never
    /// combined, at least one form present.
    pub fn from_parts(
        token: Option<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> ImportResult<Self> {
        let token = normalized(token);
        let username = normalized(username);
        let password = normalized(password);

        if username.is_some() || password.is_some() {
            let (username, password) = match (username, password) {
                (Some(username), Some(password)) => (username, password),
                _ => {
                    return Err(ImportError::config(
                        "Authentication error: source_username and source_password must be provided together",
                    ))
                }
            };
            if token.is_some() {
                return Err(ImportError::config(
                    "Authentication error: Cannot use both (source_username/source_password) and source_token. \
                     Please provide either (source_username and source_password) OR (source_token only)",
                ));
            }
            return Ok(SourceCredentials::Basic { username, password });
        }

        match token {
            Some(token) => Ok(SourceCredentials::Token(token)),
            None => Err(ImportError::config(
                "Authentication error: Must provide either (source_username and source_password) OR (source_token)",
            )),
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            SourceCredentials::Token(token) => Some(token),
            SourceCredentials::Basic { .. } => None,
        }
    }
}

fn normalized(value: Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// One configuration provider's contribution. All fields optional; later
/// overlays win field by field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigOverlay {
    pub source_url: Option<String>,
    pub source_token: Option<String>,
    pub source_username: Option<String>,
    pub source_password: Option<String>,
    pub source_database: Option<String>,
    pub dest_database: Option<String>,
    pub influxdb_version: Option<i64>,
    pub start_timestamp: Option<String>,
    pub end_timestamp: Option<String>,
    pub query_interval_ms: Option<u64>,
    pub import_direction: Option<String>,
    pub target_batch_size: Option<u64>,
    #[serde(deserialize_with = "deserialize_table_filter")]
    pub table_filter: Option<Vec<String>>,
    pub dry_run: Option<bool>,
    pub config_file_path: Option<String>,
}

/// Accepts a list of table names or a dot-separated string ("cpu.mem").
fn deserialize_table_filter<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(joined)) => Ok(Some(split_table_filter(&joined))),
        Some(Value::Array(entries)) => {
            let mut names = Vec::new();
            for entry in entries {
                match entry {
                    Value::String(name) => {
                        let name = name.trim();
                        if !name.is_empty() {
                            names.push(name.to_string());
                        }
                    }
                    other => {
                        return Err(serde::de::Error::custom(format!(
                            "invalid table_filter entry: {}",
                            other
                        )))
                    }
                }
            }
            Ok(Some(names))
        }
        Some(other) => Err(serde::de::Error::custom(format!(
            "invalid table_filter: {}",
            other
        ))),
    }
}

pub fn split_table_filter(joined: &str) -> Vec<String> {
    joined
        .split('.')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

impl ConfigOverlay {
    /// Environment provider: `IMPORT_*` variables, lowest priority.
    pub fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        ConfigOverlay {
            source_url: var("IMPORT_SOURCE_URL"),
            source_token: var("IMPORT_SOURCE_TOKEN"),
            source_username: var("IMPORT_SOURCE_USERNAME"),
            source_password: var("IMPORT_SOURCE_PASSWORD"),
            source_database: var("IMPORT_SOURCE_DATABASE"),
            dest_database: var("IMPORT_DEST_DATABASE"),
            start_timestamp: var("IMPORT_START_TIMESTAMP"),
            end_timestamp: var("IMPORT_END_TIMESTAMP"),
            ..ConfigOverlay::default()
        }
    }

    /// Static trigger-argument provider. All values arrive as strings;
    /// numeric and boolean fields are parsed here.
    pub fn from_args(args: &HashMap<String, String>) -> ImportResult<Self> {
        let get = |key: &str| {
            args.get(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let parse_u64 = |key: &str| -> ImportResult<Option<u64>> {
            get(key)
                .map(|value| {
                    value.parse::<u64>().map_err(|_| {
                        ImportError::config(format!("Invalid {}: {}", key, value))
                    })
                })
                .transpose()
        };
        let influxdb_version = get("influxdb_version")
            .map(|value| {
                value.parse::<i64>().map_err(|_| {
                    ImportError::config(format!("Invalid influxdb_version: {}", value))
                })
            })
            .transpose()?;

        Ok(ConfigOverlay {
            source_url: get("source_url"),
            source_token: get("source_token"),
            source_username: get("source_username"),
            source_password: get("source_password"),
            source_database: get("source_database"),
            dest_database: get("dest_database"),
            influxdb_version,
            start_timestamp: get("start_timestamp"),
            end_timestamp: get("end_timestamp"),
            query_interval_ms: parse_u64("query_interval_ms")?,
            import_direction: get("import_direction"),
            target_batch_size: parse_u64("target_batch_size")?,
            table_filter: get("table_filter").map(|joined| split_table_filter(&joined)),
            dry_run: get("dry_run")
                .map(|value| matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")),
            config_file_path: get("config_file_path"),
        })
    }

    /// Request-body provider, highest priority. Unknown keys (action,
    /// import_id) are ignored.
    pub fn from_json(body: &Value) -> ImportResult<Self> {
        serde_json::from_value(body.clone())
            .map_err(|e| ImportError::config(format!("Invalid request body: {}", e)))
    }

    /// TOML file provider. The path is resolved under `PLUGIN_DIR`; a
    /// missing file contributes nothing, an unreadable or unparseable file
    /// is fatal.
    pub fn from_toml_file(config_file_path: &str) -> ImportResult<Self> {
        let plugin_dir = std::env::var("PLUGIN_DIR")
            .map_err(|_| ImportError::config("PLUGIN_DIR environment variable not set"))?;
        let path = Path::new(&plugin_dir).join(config_file_path);

        if !path.exists() {
            log::debug!("Config file {} not found, skipping", path.display());
            return Ok(ConfigOverlay::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|e| {
            ImportError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let overlay = toml::from_str(&content).map_err(|e| {
            ImportError::config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(overlay)
    }

    /// Field-by-field merge, `higher` winning wherever it has a value.
    pub fn merged_with(self, higher: ConfigOverlay) -> ConfigOverlay {
        ConfigOverlay {
            source_url: higher.source_url.or(self.source_url),
            source_token: higher.source_token.or(self.source_token),
            source_username: higher.source_username.or(self.source_username),
            source_password: higher.source_password.or(self.source_password),
            source_database: higher.source_database.or(self.source_database),
            dest_database: higher.dest_database.or(self.dest_database),
            influxdb_version: higher.influxdb_version.or(self.influxdb_version),
            start_timestamp: higher.start_timestamp.or(self.start_timestamp),
            end_timestamp: higher.end_timestamp.or(self.end_timestamp),
            query_interval_ms: higher.query_interval_ms.or(self.query_interval_ms),
            import_direction: higher.import_direction.or(self.import_direction),
            target_batch_size: higher.target_batch_size.or(self.target_batch_size),
            table_filter: higher.table_filter.or(self.table_filter),
            dry_run: higher.dry_run.or(self.dry_run),
            config_file_path: higher.config_file_path.or(self.config_file_path),
        }
    }
}

/// The immutable merged run configuration. Built once by `resolve_config`,
/// validated once, then read-only for the life of the run.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub source_url: String,
    pub source_database: String,
    pub influxdb_version: InfluxVersion,
    pub credentials: SourceCredentials,
    pub dest_database: Option<String>,
    pub start_timestamp: Option<String>,
    pub end_timestamp: Option<String>,
    pub query_interval_ms: u64,
    pub import_direction: ImportDirection,
    pub target_batch_size: u64,
    pub table_filter: Option<Vec<String>>,
    pub dry_run: bool,
}

impl ImportConfig {
    /// Credential-free snapshot in the persisted layout. Unset optionals
    /// become empty strings, the table filter is dot-joined.
    pub fn to_summary(&self) -> ConfigSummary {
        ConfigSummary {
            source_url: self.source_url.clone(),
            source_database: self.source_database.clone(),
            dest_database: self.dest_database.clone().unwrap_or_default(),
            start_timestamp: self.start_timestamp.clone().unwrap_or_default(),
            end_timestamp: self.end_timestamp.clone().unwrap_or_default(),
            import_direction: self.import_direction.as_str().to_string(),
            table_filter: self
                .table_filter
                .as_ref()
                .map(|names| names.join("."))
                .unwrap_or_default(),
            influxdb_version: self.influxdb_version.as_number(),
            query_interval_ms: self.query_interval_ms as i64,
            target_batch_size: self.target_batch_size as i64,
        }
    }

    /// Rebuilds a runnable configuration from the persisted snapshot plus
    /// caller-supplied credentials (used on resume).
    pub fn from_summary(
        summary: &ConfigSummary,
        credentials: SourceCredentials,
    ) -> ImportResult<Self> {
        let optional = |value: &str| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        };
        Ok(ImportConfig {
            source_url: summary.source_url.clone(),
            source_database: summary.source_database.clone(),
            influxdb_version: InfluxVersion::from_number(summary.influxdb_version)?,
            credentials,
            dest_database: optional(&summary.dest_database),
            start_timestamp: optional(&summary.start_timestamp),
            end_timestamp: optional(&summary.end_timestamp),
            query_interval_ms: summary.query_interval_ms.max(0) as u64,
            import_direction: ImportDirection::from_db(&summary.import_direction)?,
            target_batch_size: summary.target_batch_size.max(1) as u64,
            table_filter: optional(&summary.table_filter).map(|joined| split_table_filter(&joined)),
            dry_run: false,
        })
    }
}

/// Merges overlays in ascending priority and validates the result once.
pub fn resolve_config(overlays: Vec<ConfigOverlay>) -> ImportResult<ImportConfig> {
    let mut merged = ConfigOverlay::default();
    for overlay in overlays {
        merged = merged.merged_with(overlay);
    }

    let source_url = normalized(merged.source_url)
        .ok_or_else(|| ImportError::config("source_url is required"))?;
    let source_database = normalized(merged.source_database)
        .ok_or_else(|| ImportError::config("source_database is required"))?;
    let influxdb_version = InfluxVersion::from_number(
        merged
            .influxdb_version
            .ok_or_else(|| ImportError::config("influxdb_version is required"))?,
    )?;

    let credentials = SourceCredentials::from_parts(
        merged.source_token,
        merged.source_username,
        merged.source_password,
    )?;
    if influxdb_version == InfluxVersion::V2 && credentials.token().is_none() {
        return Err(ImportError::config(
            "InfluxDB v2 requires source_token for authentication",
        ));
    }
    if influxdb_version == InfluxVersion::V3 && credentials.token().is_none() {
        return Err(ImportError::config(
            "InfluxDB v3 requires source_token for authentication",
        ));
    }

    let import_direction = match normalized(merged.import_direction) {
        Some(raw) => ImportDirection::from_db(&raw)?,
        None => ImportDirection::default(),
    };
    let target_batch_size = merged.target_batch_size.unwrap_or(DEFAULT_TARGET_BATCH_SIZE);
    if target_batch_size == 0 {
        return Err(ImportError::config("target_batch_size must be at least 1"));
    }

    Ok(ImportConfig {
        source_url,
        source_database,
        influxdb_version,
        credentials,
        dest_database: normalized(merged.dest_database),
        start_timestamp: normalized(merged.start_timestamp),
        end_timestamp: normalized(merged.end_timestamp),
        query_interval_ms: merged.query_interval_ms.unwrap_or(DEFAULT_QUERY_INTERVAL_MS),
        import_direction,
        target_batch_size,
        table_filter: merged.table_filter.filter(|names| !names.is_empty()),
        dry_run: merged.dry_run.unwrap_or(false),
    })
}

/// Full provider chain for one request: environment, then static args, then
/// the TOML file either names, then the request body.
pub fn load_config(
    args: Option<&HashMap<String, String>>,
    body: Option<&Value>,
) -> ImportResult<ImportConfig> {
    let env_overlay = ConfigOverlay::from_env();
    let args_overlay = match args {
        Some(args) => ConfigOverlay::from_args(args)?,
        None => ConfigOverlay::default(),
    };
    let body_overlay = match body {
        Some(body) => ConfigOverlay::from_json(body)?,
        None => ConfigOverlay::default(),
    };

    let config_file_path = args_overlay
        .config_file_path
        .clone()
        .or_else(|| body_overlay.config_file_path.clone());
    let file_overlay = match config_file_path {
        Some(path) => ConfigOverlay::from_toml_file(&path)?,
        None => ConfigOverlay::default(),
    };

    resolve_config(vec![env_overlay, args_overlay, file_overlay, body_overlay])
}

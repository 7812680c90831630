use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{ImportConfig, SourceCredentials};
use crate::error::{ImportError, ImportResult};
use crate::models::InfluxVersion;

pub const MAX_RETRIES: u32 = 5;
pub const INITIAL_BACKOFF_SECONDS: u64 = 1;
pub const MAX_BACKOFF_SECONDS: u64 = 16;
pub const REQUEST_TIMEOUT_SECONDS: u64 = 30;
const PING_TIMEOUT_SECONDS: u64 = 5;

/// One query's result: ordered columns, rows aligned to them, and the
/// out-of-band GROUP BY tag dictionary when the source returns one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub tags: Map<String, Value>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn time_column_index(&self) -> usize {
        self.columns
            .iter()
            .position(|name| name == "time")
            .unwrap_or(0)
    }
}

/// Abstraction over the source so schema discovery, estimation, and the
/// state machine can run against substitutable clients.
#[async_trait::async_trait]
pub trait SourceQueryExecutor: Send + Sync {
    async fn query(&self, query: &str) -> ImportResult<ResultSet>;
}

/// Owned HTTP client for the source API, built once per run. Wraps a single
/// pooled `reqwest::Client`; authentication is selected by API version.
pub struct SourceClient {
    http: reqwest::Client,
    query_url: String,
    database: String,
    version: InfluxVersion,
    credentials: SourceCredentials,
}

impl SourceClient {
    pub fn from_config(config: &ImportConfig) -> ImportResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS))
            .build()
            .map_err(|e| ImportError::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(SourceClient {
            http,
            query_url: format!("{}/query", normalize_base_url(&config.source_url)),
            database: config.source_database.clone(),
            version: config.influxdb_version,
            credentials: config.credentials.clone(),
        })
    }

    /// Runs one InfluxQL query with retry/backoff: 5 attempts, delays
    /// doubling from 1s and capped at 16s. Every non-2xx outcome consumes
    /// an attempt; exhaustion surfaces as a source-query error.
    async fn execute_with_retries(&self, query: &str) -> ImportResult<Value> {
        let auth = auth_header_value(self.version, &self.credentials)?;
        let mut retry_count = 0u32;
        let mut backoff = INITIAL_BACKOFF_SECONDS;

        loop {
            let mut request = self
                .http
                .get(&self.query_url)
                .query(&[("db", self.database.as_str()), ("q", query)])
                .header("Content-Type", "application/vnd.influxql");
            if let Some(value) = &auth {
                request = request.header("Authorization", value);
            }

            let attempt: Result<Value, String> = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        response
                            .json::<Value>()
                            .await
                            .map_err(|e| format!("Invalid JSON response: {}", e))
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        Err(format!("HTTP {}: {}", status, body))
                    }
                }
                Err(e) => Err(format!("HTTP request failed: {}", e)),
            };

            let error = match attempt {
                Ok(payload) => return Ok(payload),
                Err(error) => error,
            };

            retry_count += 1;
            if retry_count >= MAX_RETRIES {
                log::error!("Query failed after {} retries: {}", MAX_RETRIES, error);
                return Err(ImportError::source_query(error));
            }
            log::warn!(
                "Query failed (attempt {}/{}), retrying in {}s: {}",
                retry_count,
                MAX_RETRIES,
                backoff,
                error
            );
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF_SECONDS);
        }
    }
}

#[async_trait::async_trait]
impl SourceQueryExecutor for SourceClient {
    async fn query(&self, query: &str) -> ImportResult<ResultSet> {
        let payload = self.execute_with_retries(query).await?;
        Ok(parse_v1_result(&payload))
    }
}

/// Authorization header for the import path. Version decides the scheme:
/// v1 Basic or Bearer, v2 `Token`, v3 `Bearer`; v2/v3 without a token is a
/// fatal configuration error.
pub fn auth_header_value(
    version: InfluxVersion,
    credentials: &SourceCredentials,
) -> ImportResult<Option<String>> {
    match version {
        InfluxVersion::V1 => match credentials {
            SourceCredentials::Basic { username, password } => {
                let encoded = BASE64_STANDARD.encode(format!("{}:{}", username, password));
                Ok(Some(format!("Basic {}", encoded)))
            }
            SourceCredentials::Token(token) => Ok(Some(format!("Bearer {}", token))),
        },
        InfluxVersion::V2 => match credentials.token() {
            Some(token) => Ok(Some(format!("Token {}", token))),
            None => Err(ImportError::config(
                "InfluxDB v2 requires source_token for authentication",
            )),
        },
        InfluxVersion::V3 => match credentials.token() {
            Some(token) => Ok(Some(format!("Bearer {}", token))),
            None => Err(ImportError::config(
                "InfluxDB v3 requires source_token for authentication",
            )),
        },
    }
}

/// Strips trailing slashes and, when the URL has no explicit port, infers
/// one from the scheme (http 80, https 443, otherwise 80).
pub fn normalize_base_url(source_url: &str) -> String {
    let trimmed = source_url.trim_end_matches('/');
    let (scheme, rest) = match trimmed.split_once("://") {
        Some(parts) => parts,
        None => return trimmed.to_string(),
    };
    let (host, path) = match rest.find('/') {
        Some(index) => (&rest[..index], &rest[index..]),
        None => (rest, ""),
    };

    let has_port = host
        .rsplit_once(':')
        .map(|(_, candidate)| !candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false);
    if has_port || host.is_empty() {
        return trimmed.to_string();
    }

    let port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => 80,
    };
    format!("{}://{}:{}{}", scheme, host, port, path)
}

/// v1 JSON layout: `results[0].series[0]` carries columns, values, and the
/// optional GROUP BY tags. No series means an empty result, not an error.
pub fn parse_v1_result(payload: &Value) -> ResultSet {
    let series = payload
        .get("results")
        .and_then(|results| results.get(0))
        .and_then(|result| result.get("series"))
        .and_then(|series| series.get(0));
    let series = match series {
        Some(series) => series,
        None => return ResultSet::default(),
    };

    let columns = series
        .get("columns")
        .and_then(Value::as_array)
        .map(|columns| {
            columns
                .iter()
                .filter_map(|column| column.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let rows = series
        .get("values")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row.as_array().cloned())
                .collect()
        })
        .unwrap_or_default();
    let tags = series
        .get("tags")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    ResultSet { columns, rows, tags }
}

/// First-column string values, the shape of `SHOW MEASUREMENTS`,
/// `SHOW DATABASES`, and `SHOW TAG KEYS` results.
pub fn first_column_strings(result: &ResultSet) -> Vec<String> {
    result
        .rows
        .iter()
        .filter_map(|row| row.first().and_then(Value::as_str).map(str::to_string))
        .collect()
}

// --- Connection probe and listings ---

/// Raw parameters for the probe/listing operations. Credentials are
/// optional here and applied only when present; the server rejects what it
/// must.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SourceParams {
    pub source_url: Option<String>,
    pub influxdb_version: Option<i64>,
    pub source_token: Option<String>,
    pub source_username: Option<String>,
    pub source_password: Option<String>,
    pub source_database: Option<String>,
    pub source_org: Option<String>,
}

impl SourceParams {
    pub fn from_json(body: &Value) -> ImportResult<Self> {
        serde_json::from_value(body.clone())
            .map_err(|e| ImportError::invalid_request(format!("Invalid request body: {}", e)))
    }

    fn required_url(&self) -> ImportResult<String> {
        self.source_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ImportError::invalid_request("source_url is required"))
    }

    fn required_version(&self) -> ImportResult<InfluxVersion> {
        let raw = self
            .influxdb_version
            .ok_or_else(|| ImportError::invalid_request("influxdb_version is required"))?;
        InfluxVersion::from_number(raw).map_err(|_| {
            ImportError::invalid_request(format!(
                "Unsupported influxdb_version: {}. Must be 1, 2, or 3.",
                raw
            ))
        })
    }

    /// Version-appropriate Authorization header, silently absent when the
    /// relevant credentials were not supplied.
    fn lenient_auth_header(&self, version: InfluxVersion) -> Option<String> {
        match version {
            InfluxVersion::V1 => match (&self.source_username, &self.source_password) {
                (Some(username), Some(password)) => {
                    let encoded = BASE64_STANDARD.encode(format!("{}:{}", username, password));
                    Some(format!("Basic {}", encoded))
                }
                _ => self
                    .source_token
                    .as_ref()
                    .map(|token| format!("Bearer {}", token)),
            },
            InfluxVersion::V2 => self
                .source_token
                .as_ref()
                .map(|token| format!("Token {}", token)),
            InfluxVersion::V3 => self
                .source_token
                .as_ref()
                .map(|token| format!("Bearer {}", token)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionProbe {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ConnectionProbe {
    fn failure(message: impl Into<String>) -> Self {
        ConnectionProbe {
            success: false,
            version: None,
            build: None,
            message: Some(message.into()),
        }
    }
}

/// Probes `{base}/ping` without authentication and classifies the target
/// by its response headers.
pub async fn check_source_connection(source_url: &str) -> ConnectionProbe {
    let base_url = normalize_base_url(source_url);
    let client = reqwest::Client::new();
    let response = match client
        .get(format!("{}/ping", base_url))
        .timeout(Duration::from_secs(PING_TIMEOUT_SECONDS))
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => return ConnectionProbe::failure(e.to_string()),
    };

    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let version = header("X-Influxdb-Version");
    let build = header("X-Influxdb-Build");

    if version.is_some() || build.is_some() {
        return ConnectionProbe {
            success: true,
            version: Some(version.unwrap_or_default()),
            build: Some(build.unwrap_or_default()),
            message: None,
        };
    }

    // v3 omits the version headers on unauthenticated pings but exposes a
    // cluster id.
    if header("cluster-uuid").is_some() {
        return ConnectionProbe {
            success: true,
            version: Some("3.x.x".to_string()),
            build: Some(String::new()),
            message: None,
        };
    }

    let status = response.status().as_u16();
    if status == 401 || status == 403 {
        return ConnectionProbe::failure("Unable to determine InfluxDB version");
    }
    ConnectionProbe::failure("Not an InfluxDB instance")
}

async fn send_listing_request(request: reqwest::RequestBuilder) -> ImportResult<reqwest::Response> {
    let response = request
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS))
        .send()
        .await
        .map_err(|e| ImportError::source_query(format!("HTTP request failed: {}", e)))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ImportError::source_query(format!("HTTP {}: {}", status, body)));
    }
    Ok(response)
}

/// Lists databases on the source, version-dispatched. System databases are
/// excluded and the result is sorted.
pub async fn list_source_databases(params: &SourceParams) -> ImportResult<Vec<String>> {
    let base_url = normalize_base_url(&params.required_url()?);
    let version = params.required_version()?;
    let auth = params.lenient_auth_header(version);
    let client = reqwest::Client::new();

    let mut databases: Vec<String> = match version {
        InfluxVersion::V1 => {
            let mut request = client
                .get(format!("{}/query", base_url))
                .query(&[("q", "SHOW DATABASES")])
                .header("Content-Type", "application/json");
            if let Some(value) = &auth {
                request = request.header("Authorization", value);
            }
            let payload: Value = send_listing_request(request)
                .await?
                .json()
                .await
                .map_err(|e| ImportError::source_query(format!("Invalid JSON response: {}", e)))?;
            first_column_strings(&parse_v1_result(&payload))
                .into_iter()
                .filter(|name| name != "_internal")
                .collect()
        }
        InfluxVersion::V2 => {
            let mut request = client.get(format!("{}/api/v2/buckets", base_url));
            if let Some(value) = &auth {
                request = request.header("Authorization", value);
            }
            let payload: Value = send_listing_request(request)
                .await?
                .json()
                .await
                .map_err(|e| ImportError::source_query(format!("Invalid JSON response: {}", e)))?;
            payload
                .get("buckets")
                .and_then(Value::as_array)
                .map(|buckets| {
                    buckets
                        .iter()
                        .filter_map(|bucket| bucket.get("name").and_then(Value::as_str))
                        .filter(|name| !name.starts_with('_'))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        }
        InfluxVersion::V3 => {
            let mut request = client
                .get(format!("{}/api/v3/configure/database", base_url))
                .query(&[("format", "json")])
                .header("Content-Type", "application/json");
            if let Some(value) = &auth {
                request = request.header("Authorization", value);
            }
            let payload: Value = send_listing_request(request)
                .await?
                .json()
                .await
                .map_err(|e| ImportError::source_query(format!("Invalid JSON response: {}", e)))?;
            payload
                .as_array()
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| row.get("iox::database").and_then(Value::as_str))
                        .filter(|name| *name != "_internal")
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        }
    };

    databases.sort();
    Ok(databases)
}

/// Lists tables/measurements in one source database, version-dispatched.
pub async fn list_source_tables(params: &SourceParams) -> ImportResult<Vec<String>> {
    let base_url = normalize_base_url(&params.required_url()?);
    let version = params.required_version()?;
    let database = params
        .source_database
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ImportError::invalid_request("source_database is required"))?
        .to_string();
    let auth = params.lenient_auth_header(version);
    let client = reqwest::Client::new();

    let mut tables: Vec<String> = match version {
        InfluxVersion::V1 => {
            let mut request = client
                .get(format!("{}/query", base_url))
                .query(&[("db", database.as_str()), ("q", "SHOW MEASUREMENTS")])
                .header("Content-Type", "application/json");
            if let Some(value) = &auth {
                request = request.header("Authorization", value);
            }
            let payload: Value = send_listing_request(request)
                .await?
                .json()
                .await
                .map_err(|e| ImportError::source_query(format!("Invalid JSON response: {}", e)))?;
            first_column_strings(&parse_v1_result(&payload))
        }
        InfluxVersion::V2 => {
            let org = params
                .source_org
                .as_deref()
                .map(str::trim)
                .filter(|org| !org.is_empty())
                .ok_or_else(|| {
                    ImportError::invalid_request("source_org is required for InfluxDB v2")
                })?;
            let escaped_bucket = database.replace('"', "\\\"");
            let flux_query = format!(
                "import \"influxdata/influxdb/schema\" schema.measurements(bucket: \"{}\")",
                escaped_bucket
            );
            let mut request = client
                .post(format!("{}/api/v2/query", base_url))
                .query(&[("org", org)])
                .header("Content-Type", "application/vnd.flux")
                .header("Accept", "application/csv")
                .body(flux_query);
            if let Some(value) = &auth {
                request = request.header("Authorization", value);
            }
            let body = send_listing_request(request)
                .await?
                .text()
                .await
                .map_err(|e| ImportError::source_query(format!("Invalid response body: {}", e)))?;
            parse_flux_measurements_csv(&body)
        }
        InfluxVersion::V3 => {
            let mut request = client
                .get(format!("{}/api/v3/query_sql", base_url))
                .query(&[
                    ("db", database.as_str()),
                    ("q", "SHOW TABLES"),
                    ("format", "json"),
                ])
                .header("Content-Type", "application/json");
            if let Some(value) = &auth {
                request = request.header("Authorization", value);
            }
            let payload: Value = send_listing_request(request)
                .await?
                .json()
                .await
                .map_err(|e| ImportError::source_query(format!("Invalid JSON response: {}", e)))?;
            payload
                .as_array()
                .map(|rows| {
                    rows.iter()
                        .filter(|row| {
                            let schema = row.get("table_schema").and_then(Value::as_str);
                            !matches!(schema, Some("system") | Some("information_schema"))
                        })
                        .filter_map(|row| row.get("table_name").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        }
    };

    tables.sort();
    Ok(tables)
}

/// Annotated-CSV output of `schema.measurements`: the measurement name is
/// the fourth column of each data line.
fn parse_flux_measurements_csv(body: &str) -> Vec<String> {
    body.trim()
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty() && line.contains(','))
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').collect();
            parts.get(3).map(|name| name.trim().to_string())
        })
        .filter(|name| !name.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_port_inference() {
        assert_eq!(normalize_base_url("http://localhost"), "http://localhost:80");
        assert_eq!(
            normalize_base_url("https://influx.example.com/"),
            "https://influx.example.com:443"
        );
        assert_eq!(
            normalize_base_url("http://localhost:8086"),
            "http://localhost:8086"
        );
        assert_eq!(
            normalize_base_url("https://influx.example.com/api/"),
            "https://influx.example.com:443/api"
        );
        assert_eq!(normalize_base_url("localhost:8086"), "localhost:8086");
    }

    #[test]
    fn test_auth_header_per_version() {
        let basic = SourceCredentials::Basic {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        let token = SourceCredentials::Token("secret".to_string());

        assert_eq!(
            auth_header_value(InfluxVersion::V1, &basic).unwrap(),
            Some("Basic dXNlcjpwYXNz".to_string())
        );
        assert_eq!(
            auth_header_value(InfluxVersion::V1, &token).unwrap(),
            Some("Bearer secret".to_string())
        );
        assert_eq!(
            auth_header_value(InfluxVersion::V2, &token).unwrap(),
            Some("Token secret".to_string())
        );
        assert_eq!(
            auth_header_value(InfluxVersion::V3, &token).unwrap(),
            Some("Bearer secret".to_string())
        );

        let err = auth_header_value(InfluxVersion::V2, &basic).unwrap_err();
        assert_eq!(
            err.to_string(),
            "InfluxDB v2 requires source_token for authentication"
        );
        assert!(auth_header_value(InfluxVersion::V3, &basic).is_err());
    }

    #[test]
    fn test_parse_v1_result_with_tags() {
        let payload = json!({
            "results": [{
                "series": [{
                    "name": "cpu",
                    "tags": {"host": "server01"},
                    "columns": ["time", "usage"],
                    "values": [["2024-01-01T00:00:00Z", 0.5], ["2024-01-01T00:00:01Z", 0.6]]
                }]
            }]
        });
        let result = parse_v1_result(&payload);
        assert_eq!(result.columns, vec!["time", "usage"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.tags.get("host").and_then(Value::as_str), Some("server01"));
        assert_eq!(result.time_column_index(), 0);
    }

    #[test]
    fn test_parse_v1_result_without_series_is_empty() {
        let payload = json!({"results": [{"statement_id": 0}]});
        let result = parse_v1_result(&payload);
        assert!(result.is_empty());
        assert!(result.columns.is_empty());
        assert!(result.tags.is_empty());
    }

    #[test]
    fn test_first_column_strings() {
        let payload = json!({
            "results": [{
                "series": [{
                    "columns": ["name"],
                    "values": [["cpu"], ["mem"], ["disk"]]
                }]
            }]
        });
        let names = first_column_strings(&parse_v1_result(&payload));
        assert_eq!(names, vec!["cpu", "mem", "disk"]);
    }

    #[test]
    fn test_listing_param_validation() {
        let params = SourceParams::default();
        let err = params.required_url().unwrap_err();
        assert_eq!(err.to_string(), "source_url is required");

        let params = SourceParams {
            source_url: Some("http://localhost:8086".to_string()),
            influxdb_version: Some(9),
            ..SourceParams::default()
        };
        let err = params.required_version().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unsupported influxdb_version: 9. Must be 1, 2, or 3."
        );
    }

    #[test]
    fn test_lenient_auth_header() {
        let params = SourceParams {
            source_username: Some("user".to_string()),
            source_password: Some("pass".to_string()),
            ..SourceParams::default()
        };
        assert_eq!(
            params.lenient_auth_header(InfluxVersion::V1),
            Some("Basic dXNlcjpwYXNz".to_string())
        );
        assert_eq!(params.lenient_auth_header(InfluxVersion::V2), None);

        let params = SourceParams {
            source_token: Some("secret".to_string()),
            ..SourceParams::default()
        };
        assert_eq!(
            params.lenient_auth_header(InfluxVersion::V2),
            Some("Token secret".to_string())
        );
    }

    #[test]
    fn test_parse_flux_measurements_csv() {
        let body = ",result,table,_value\n,_result,0,cpu\n,_result,0,mem\n\n";
        assert_eq!(parse_flux_measurements_csv(body), vec!["cpu", "mem"]);
    }
}

use serde::{Deserialize, Serialize};

use crate::config::ImportConfig;
use crate::error::{ImportError, ImportResult};
use crate::estimator::{ImportEstimate, TableEstimate};

// --- Run identity ---

/// One migration attempt: the generated id plus the immutable merged
/// configuration. Credentials live only inside the config and are never
/// persisted with it.
#[derive(Debug, Clone)]
pub struct ImportRun {
    pub import_id: String,
    pub config: ImportConfig,
}

// --- Statuses ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Pending,
    InProgress,
    Paused,
    Cancelled,
    Completed,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Pending => "pending",
            TableStatus::InProgress => "in_progress",
            TableStatus::Paused => "paused",
            TableStatus::Cancelled => "cancelled",
            TableStatus::Completed => "completed",
        }
    }

    pub fn from_db(value: &str) -> ImportResult<Self> {
        match value {
            "pending" => Ok(TableStatus::Pending),
            "in_progress" => Ok(TableStatus::InProgress),
            "paused" => Ok(TableStatus::Paused),
            "cancelled" => Ok(TableStatus::Cancelled),
            "completed" => Ok(TableStatus::Completed),
            _ => Err(ImportError::state_store(format!(
                "Invalid import status in storage: {}",
                value
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TableStatus::Completed | TableStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportDirection {
    #[default]
    OldestFirst,
    NewestFirst,
}

impl ImportDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportDirection::OldestFirst => "oldest_first",
            ImportDirection::NewestFirst => "newest_first",
        }
    }

    pub fn from_db(value: &str) -> ImportResult<Self> {
        match value {
            "oldest_first" => Ok(ImportDirection::OldestFirst),
            "newest_first" => Ok(ImportDirection::NewestFirst),
            _ => Err(ImportError::config(format!(
                "Invalid import direction: {}",
                value
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfluxVersion {
    V1,
    V2,
    V3,
}

impl InfluxVersion {
    pub fn as_number(&self) -> i64 {
        match self {
            InfluxVersion::V1 => 1,
            InfluxVersion::V2 => 2,
            InfluxVersion::V3 => 3,
        }
    }

    pub fn from_number(value: i64) -> ImportResult<Self> {
        match value {
            1 => Ok(InfluxVersion::V1),
            2 => Ok(InfluxVersion::V2),
            3 => Ok(InfluxVersion::V3),
            _ => Err(ImportError::config(format!(
                "Unsupported InfluxDB version: {}",
                value
            ))),
        }
    }
}

/// Latest pause-flag reading for a run. `Cancelled` wins over `Paused`
/// whenever both flags are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseFlagState {
    NotFound,
    Cancelled,
    Paused,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Paused,
    Cancelled,
    Failed,
    ResumedAndCompleted,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Paused => "paused",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::Failed => "failed",
            RunOutcome::ResumedAndCompleted => "resumed_and_completed",
        }
    }
}

// --- Per-table outcomes ---

/// One window's recorded failure: the half-open time range it covered and
/// the error text. Window failures never abort the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowError {
    pub time_range: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaIssue {
    pub measurement: String,
    #[serde(rename = "type")]
    pub issue_type: String,
    pub conflicts: Vec<String>,
}

impl SchemaIssue {
    pub fn tag_field_conflict(measurement: &str, conflicts: Vec<String>) -> Self {
        SchemaIssue {
            measurement: measurement.to_string(),
            issue_type: "tag_field_conflict".to_string(),
            conflicts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableImportOutcome {
    pub measurement: String,
    pub status: TableStatus,
    pub rows_imported: u64,
    pub errors: Vec<WindowError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at_time: Option<String>,
}

// --- Reports ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeRangeSummary {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TableCounts {
    pub total: usize,
    pub completed: usize,
}

/// Terminal report for `start` and `resume`. Sections that do not apply to
/// the outcome are omitted from the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportReport {
    pub import_id: String,
    pub status: RunOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRangeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables: Option<TableCounts>,
    pub rows_imported: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_on_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_on_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub schema_issues: Vec<SchemaIssue>,
    pub error_count: usize,
    pub errors: Vec<WindowError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_estimate: Option<ImportEstimate>,
}

impl ImportReport {
    pub fn new(import_id: impl Into<String>, status: RunOutcome) -> Self {
        ImportReport {
            import_id: import_id.into(),
            status,
            start_time: None,
            duration_seconds: None,
            time_range: None,
            tables: None,
            rows_imported: 0,
            paused_on_table: None,
            paused_at_time: None,
            cancelled_on_table: None,
            cancelled_at_time: None,
            message: None,
            schema_issues: Vec::new(),
            error_count: 0,
            errors: Vec::new(),
            time_estimate: None,
        }
    }
}

// --- Dry-run plan ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSource {
    pub url: String,
    pub database: String,
    pub influxdb_version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanDestination {
    pub database: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanTimeRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSettings {
    pub direction: ImportDirection,
    pub target_batch_size: u64,
    pub query_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanTables {
    pub total: usize,
    pub list: Vec<String>,
    /// The filter list when one was given, or the string "all tables".
    pub filtered: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanEstimate {
    pub total_rows: u64,
    pub estimated_duration: String,
    pub estimated_duration_seconds: f64,
    pub per_table_estimates: Vec<TableEstimate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanConflict {
    pub measurement: String,
    pub conflicts: Vec<String>,
    pub resolution: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanConflicts {
    pub total: usize,
    pub details: Vec<PlanConflict>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportPlan {
    pub import_id: String,
    pub status: String,
    pub source: PlanSource,
    pub destination: PlanDestination,
    pub time_range: PlanTimeRange,
    pub import_settings: PlanSettings,
    pub tables: PlanTables,
    pub estimated_import: PlanEstimate,
    pub schema_conflicts: PlanConflicts,
}

/// What `start` hands back: a dry-run plan or a terminal report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StartOutcome {
    Plan(ImportPlan),
    Report(ImportReport),
}

// --- Status operation ---

/// Credential-free configuration snapshot, in exactly the shape persisted
/// to the checkpoint store. Unset optionals are stored as empty strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub source_url: String,
    pub source_database: String,
    pub dest_database: String,
    pub start_timestamp: String,
    pub end_timestamp: String,
    pub import_direction: String,
    pub table_filter: String,
    pub influxdb_version: i64,
    pub query_interval_ms: i64,
    pub target_batch_size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PauseFlags {
    pub is_paused: bool,
    pub is_cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSummary {
    pub total_tables: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub paused: usize,
    pub cancelled: usize,
    pub pending: usize,
    pub total_rows_imported: u64,
    pub progress_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsTiming {
    pub started_at: Option<String>,
    pub last_updated_at: Option<String>,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableDetail {
    pub table_name: String,
    pub status: TableStatus,
    pub rows_imported: u64,
    pub paused_at_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportStats {
    pub import_id: String,
    pub overall_status: String,
    pub summary: StatsSummary,
    pub timing: StatsTiming,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_state: Option<PauseFlags>,
    pub table_details: Vec<TableDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionAck {
    pub status: String,
    pub import_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_status_round_trip() {
        let statuses = [
            TableStatus::Pending,
            TableStatus::InProgress,
            TableStatus::Paused,
            TableStatus::Cancelled,
            TableStatus::Completed,
        ];
        for status in statuses {
            assert_eq!(TableStatus::from_db(status.as_str()).unwrap(), status);
        }
        assert!(TableStatus::from_db("exploded").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TableStatus::Completed.is_terminal());
        assert!(TableStatus::Cancelled.is_terminal());
        assert!(!TableStatus::Paused.is_terminal());
        assert!(!TableStatus::InProgress.is_terminal());
        assert!(!TableStatus::Pending.is_terminal());
    }

    #[test]
    fn test_direction_and_version_parsing() {
        assert_eq!(ImportDirection::default(), ImportDirection::OldestFirst);
        assert_eq!(
            ImportDirection::from_db("newest_first").unwrap(),
            ImportDirection::NewestFirst
        );
        assert!(ImportDirection::from_db("sideways").is_err());

        assert_eq!(InfluxVersion::from_number(3).unwrap(), InfluxVersion::V3);
        let err = InfluxVersion::from_number(4).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported InfluxDB version: 4");
    }

    #[test]
    fn test_report_serialization_omits_empty_sections() {
        let report = ImportReport::new("run-1", RunOutcome::Completed);
        let value = serde_json::to_value(&report).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object["status"], "completed");
        assert!(!object.contains_key("paused_on_table"));
        assert!(!object.contains_key("cancelled_at_time"));
        assert!(!object.contains_key("schema_issues"));
        assert!(object.contains_key("errors"));
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::checkpoint::{CheckpointStore, TableCheckpoint, RUN_MARKER_TABLE};
use crate::config::{load_config, ImportConfig, SourceCredentials};
use crate::engine::TableImportEngine;
use crate::error::{ImportError, ImportResult};
use crate::estimator::{estimate_import_time, ImportEstimate};
use crate::models::{
    ActionAck, ConfigSummary, ImportPlan, ImportReport, ImportStats, PauseFlagState,
    PlanConflict, PlanConflicts, PlanDestination, PlanEstimate, PlanSettings, PlanSource,
    PlanTables, PlanTimeRange, RunOutcome, SchemaIssue, StartOutcome, StatsSummary, StatsTiming,
    TableCounts, TableDetail, TableImportOutcome, TableStatus, TimeRangeSummary, WindowError,
};
use crate::schema::{discover_measurements, table_schema};
use crate::sink::{StateQuery, WriteSink};
use crate::source::{
    check_source_connection, list_source_databases, list_source_tables, SourceClient,
    SourceParams, SourceQueryExecutor,
};
use crate::timestamps::{format_rfc3339_nanos, nanos_to_rfc3339, parse_timestamp, tick};


/// Builds the source client for a run; replaced in tests with in-memory
/// executors.
pub type SourceFactory =
    Box<dyn Fn(&ImportConfig) -> ImportResult<Arc<dyn SourceQueryExecutor>> + Send + Sync>;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn parse_bound(raw: Option<&str>) -> ImportResult<Option<DateTime<Utc>>> {
    raw.map(parse_timestamp).transpose()
}

/// Coordinates whole runs: resolves tables, drives the per-table engine
/// sequentially, and owns every control-plane operation (pause, resume,
/// cancel, status).
pub struct Orchestrator {
    checkpoints: CheckpointStore,
    sink: Arc<dyn WriteSink>,
    source_factory: SourceFactory,
}

impl Orchestrator {
    pub fn new(sink: Arc<dyn WriteSink>, state: Arc<dyn StateQuery>) -> Self {
        Orchestrator {
            checkpoints: CheckpointStore::new(sink.clone(), state),
            sink,
            source_factory: Box::new(|config| {
                Ok(Arc::new(SourceClient::from_config(config)?) as Arc<dyn SourceQueryExecutor>)
            }),
        }
    }

    pub fn with_source_factory(mut self, factory: SourceFactory) -> Self {
        self.source_factory = factory;
        self
    }

    /// Starts a new run, or produces a plan without side effects when the
    /// configuration asks for a dry run. Configuration problems are fatal
    /// errors; everything after persistence begins is reported in-band as a
    /// failed report so the caller still learns the import id.
    pub async fn start_import(&self, config: ImportConfig) -> ImportResult<StartOutcome> {
        let import_id = uuid::Uuid::new_v4().to_string();
        let user_start = parse_bound(config.start_timestamp.as_deref())?;
        let user_end = parse_bound(config.end_timestamp.as_deref())?;
        let source = (self.source_factory)(&config)?;

        log::info!(
            "Starting import {} from {} database '{}' (dry_run={})",
            import_id,
            config.source_url,
            config.source_database,
            config.dry_run
        );

        if !config.dry_run {
            if let Err(e) = self
                .checkpoints
                .save_config(&import_id, &config.to_summary())
                .await
            {
                return Ok(StartOutcome::Report(failed_report(
                    &import_id,
                    format!("Failed to save import config: {}", e),
                )));
            }
            if let Err(e) = self
                .checkpoints
                .write_pause_flags(&import_id, false, false)
                .await
            {
                return Ok(StartOutcome::Report(failed_report(
                    &import_id,
                    format!("Failed to initialize pause state: {}", e),
                )));
            }
        }

        let tables =
            match discover_measurements(source.as_ref(), config.table_filter.as_deref()).await {
                Ok(tables) => tables,
                Err(e) => {
                    return Ok(StartOutcome::Report(failed_report(
                        &import_id,
                        format!("Failed to connect to source database: {}", e),
                    )))
                }
            };
        if tables.is_empty() {
            return Ok(StartOutcome::Report(failed_report(
                &import_id,
                "No tables found to import".to_string(),
            )));
        }

        let estimate =
            estimate_import_time(source.as_ref(), &config, &tables, user_start, user_end).await;

        if config.dry_run {
            let plan = self
                .build_plan(&import_id, &config, &tables, &estimate, source.as_ref())
                .await;
            return Ok(StartOutcome::Plan(plan));
        }

        for table in &tables {
            if let Err(e) = self
                .checkpoints
                .write_table_state(&import_id, table, TableStatus::Pending, 0, None)
                .await
            {
                log::warn!("Failed to record pending state for '{}': {}", table, e);
            }
        }

        let started_at = Utc::now();
        let mut schema_issues: Vec<SchemaIssue> = Vec::new();
        let mut outcomes: Vec<TableImportOutcome> = Vec::new();
        let mut setup_errors: Vec<WindowError> = Vec::new();

        for table in &tables {
            let engine = TableImportEngine {
                source: source.as_ref(),
                sink: self.sink.as_ref(),
                checkpoints: &self.checkpoints,
                config: &config,
                import_id: &import_id,
            };
            match engine
                .run(table, user_start, user_end, 0, &mut schema_issues)
                .await
            {
                Ok(outcome) => {
                    let interrupted = !matches!(outcome.status, TableStatus::Completed);
                    outcomes.push(outcome);
                    if interrupted {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("Failed to import '{}': {}", table, e);
                    setup_errors.push(WindowError {
                        time_range: table.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let mut report = build_run_report(
            &import_id,
            tables.len(),
            &outcomes,
            setup_errors,
            schema_issues,
        );
        report.start_time = Some(format_rfc3339_nanos(started_at));
        report.duration_seconds = Some(round2(
            (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0,
        ));
        report.time_range = Some(TimeRangeSummary {
            start: config.start_timestamp.clone(),
            end: config.end_timestamp.clone(),
        });
        report.time_estimate = Some(estimate);
        Ok(StartOutcome::Report(report))
    }

    async fn build_plan(
        &self,
        import_id: &str,
        config: &ImportConfig,
        tables: &[String],
        estimate: &ImportEstimate,
        source: &dyn SourceQueryExecutor,
    ) -> ImportPlan {
        let mut details: Vec<PlanConflict> = Vec::new();
        for table in tables {
            match table_schema(source, table).await {
                Ok(schema) => {
                    let conflicts = schema.conflicts();
                    if !conflicts.is_empty() {
                        let renames: Vec<String> = conflicts
                            .iter()
                            .map(|name| format!("{} -> {}_tag", name, name))
                            .collect();
                        details.push(PlanConflict {
                            measurement: table.clone(),
                            conflicts,
                            resolution: format!(
                                "Tags will be renamed with '_tag' suffix: {}",
                                renames.join(", ")
                            ),
                        });
                    }
                }
                Err(e) => log::warn!("Failed to inspect schema for '{}': {}", table, e),
            }
        }

        ImportPlan {
            import_id: import_id.to_string(),
            status: "dry_run".to_string(),
            source: PlanSource {
                url: config.source_url.clone(),
                database: config.source_database.clone(),
                influxdb_version: config.influxdb_version.as_number(),
            },
            destination: PlanDestination {
                database: config.dest_database.clone(),
            },
            time_range: PlanTimeRange {
                start: config
                    .start_timestamp
                    .clone()
                    .unwrap_or_else(|| "earliest available".to_string()),
                end: config
                    .end_timestamp
                    .clone()
                    .unwrap_or_else(|| "latest available".to_string()),
            },
            import_settings: PlanSettings {
                direction: config.import_direction,
                target_batch_size: config.target_batch_size,
                query_interval_ms: config.query_interval_ms,
            },
            tables: PlanTables {
                total: tables.len(),
                list: tables.to_vec(),
                filtered: match &config.table_filter {
                    Some(filter) => json!(filter),
                    None => json!("all tables"),
                },
            },
            estimated_import: PlanEstimate {
                total_rows: estimate.estimated_total_rows,
                estimated_duration: estimate.estimated_duration_human.clone(),
                estimated_duration_seconds: estimate.estimated_duration_seconds,
                per_table_estimates: estimate.per_table_estimates.clone(),
            },
            schema_conflicts: PlanConflicts {
                total: details.len(),
                details,
            },
        }
    }

    pub async fn pause_import(&self, import_id: &str) -> ImportResult<ActionAck> {
        match self.checkpoints.pause_flag_state(import_id).await? {
            PauseFlagState::NotFound => Err(ImportError::invalid_request(format!(
                "Import {} not found",
                import_id
            ))),
            PauseFlagState::Cancelled => Err(ImportError::invalid_request(format!(
                "Import {} is already cancelled and cannot be paused",
                import_id
            ))),
            PauseFlagState::Paused => Err(ImportError::invalid_request(format!(
                "Import {} is already paused",
                import_id
            ))),
            PauseFlagState::Running => {
                self.checkpoints
                    .write_pause_flags(import_id, true, false)
                    .await?;
                log::info!("Pause requested for import {}", import_id);
                Ok(ActionAck {
                    status: "paused".to_string(),
                    import_id: import_id.to_string(),
                })
            }
        }
    }

    pub async fn cancel_import(&self, import_id: &str) -> ImportResult<ActionAck> {
        match self.checkpoints.pause_flag_state(import_id).await? {
            PauseFlagState::NotFound => Err(ImportError::invalid_request(format!(
                "Import {} not found",
                import_id
            ))),
            PauseFlagState::Cancelled => Err(ImportError::invalid_request(format!(
                "Import {} is already cancelled",
                import_id
            ))),
            PauseFlagState::Paused | PauseFlagState::Running => {
                self.checkpoints
                    .write_pause_flags(import_id, true, true)
                    .await?;
                self.checkpoints
                    .write_table_state(
                        import_id,
                        RUN_MARKER_TABLE,
                        TableStatus::Cancelled,
                        0,
                        None,
                    )
                    .await?;
                log::info!("Cancel requested for import {}", import_id);
                Ok(ActionAck {
                    status: "cancelled".to_string(),
                    import_id: import_id.to_string(),
                })
            }
        }
    }

    /// Resumes a paused run using its persisted configuration snapshot plus
    /// freshly supplied credentials. Completed tables are skipped, the
    /// paused table continues one tick past its recorded cursor, and
    /// anything else restarts from the beginning of its range.
    pub async fn resume_import(
        &self,
        import_id: &str,
        credentials: SourceCredentials,
    ) -> ImportResult<ImportReport> {
        match self.checkpoints.pause_flag_state(import_id).await? {
            PauseFlagState::NotFound => {
                return Err(ImportError::invalid_request(format!(
                    "Import {} not found",
                    import_id
                )))
            }
            PauseFlagState::Cancelled => {
                return Err(ImportError::invalid_request(format!(
                    "Import {} was cancelled and cannot be resumed",
                    import_id
                )))
            }
            PauseFlagState::Running => {
                return Err(ImportError::invalid_request(format!(
                    "Import {} is already running",
                    import_id
                )))
            }
            PauseFlagState::Paused => {}
        }

        let states: Vec<TableCheckpoint> = self
            .checkpoints
            .latest_table_states(import_id)
            .await?
            .into_iter()
            .filter(|state| state.table_name != RUN_MARKER_TABLE)
            .collect();
        if states.is_empty() {
            return Err(ImportError::invalid_request(format!(
                "No import state found for {}",
                import_id
            )));
        }
        if states
            .iter()
            .all(|state| state.status == TableStatus::Completed)
        {
            return Err(ImportError::invalid_request(format!(
                "Import {} is already completed",
                import_id
            )));
        }

        let summary: ConfigSummary =
            self.checkpoints.load_config(import_id).await?.ok_or_else(|| {
                ImportError::state_store(format!(
                    "Import config not found for {}. Cannot resume import.",
                    import_id
                ))
            })?;
        let config = ImportConfig::from_summary(&summary, credentials)?;
        let source = (self.source_factory)(&config)?;
        let user_start = parse_bound(config.start_timestamp.as_deref())?;
        let user_end = parse_bound(config.end_timestamp.as_deref())?;

        self.checkpoints
            .write_pause_flags(import_id, false, false)
            .await?;
        log::info!("Resuming import {} ({} tables on record)", import_id, states.len());

        let started_at = Utc::now();
        let mut schema_issues: Vec<SchemaIssue> = Vec::new();
        let mut outcomes: Vec<TableImportOutcome> = Vec::new();
        let mut setup_errors: Vec<WindowError> = Vec::new();

        for state in &states {
            if state.status == TableStatus::Completed {
                outcomes.push(TableImportOutcome {
                    measurement: state.table_name.clone(),
                    status: TableStatus::Completed,
                    rows_imported: state.rows_imported,
                    errors: Vec::new(),
                    paused_at_time: None,
                    cancelled_at_time: None,
                });
                continue;
            }

            let (table_start, initial_rows) = match (&state.status, &state.paused_at_time) {
                (TableStatus::Paused, Some(cursor)) => match parse_timestamp(cursor) {
                    Ok(at) => (Some(at + tick()), state.rows_imported),
                    Err(e) => {
                        log::warn!(
                            "Unparseable pause cursor '{}' for '{}' ({}), restarting table",
                            cursor,
                            state.table_name,
                            e
                        );
                        (user_start, 0)
                    }
                },
                _ => (user_start, 0),
            };

            let engine = TableImportEngine {
                source: source.as_ref(),
                sink: self.sink.as_ref(),
                checkpoints: &self.checkpoints,
                config: &config,
                import_id,
            };
            match engine
                .run(
                    &state.table_name,
                    table_start,
                    user_end,
                    initial_rows,
                    &mut schema_issues,
                )
                .await
            {
                Ok(outcome) => {
                    let interrupted = !matches!(outcome.status, TableStatus::Completed);
                    outcomes.push(outcome);
                    if interrupted {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("Failed to resume '{}': {}", state.table_name, e);
                    setup_errors.push(WindowError {
                        time_range: state.table_name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let mut report = build_run_report(
            import_id,
            states.len(),
            &outcomes,
            setup_errors,
            schema_issues,
        );
        if report.status == RunOutcome::Completed {
            report.status = RunOutcome::ResumedAndCompleted;
        }
        report.start_time = Some(format_rfc3339_nanos(started_at));
        report.duration_seconds = Some(round2(
            (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0,
        ));
        report.time_range = Some(TimeRangeSummary {
            start: config.start_timestamp.clone(),
            end: config.end_timestamp.clone(),
        });
        Ok(report)
    }

    /// Read-only progress snapshot assembled from the latest checkpoint per
    /// table. Never touches the source.
    pub async fn import_stats(&self, import_id: &str) -> ImportResult<ImportStats> {
        let states = self.checkpoints.latest_table_states(import_id).await?;
        if states.is_empty() {
            return Err(ImportError::invalid_request(format!(
                "No import found with ID {}",
                import_id
            )));
        }

        let flags = self.checkpoints.pause_flags(import_id).await?;
        let config = match self.checkpoints.load_config(import_id).await {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Failed to load config snapshot for {}: {}", import_id, e);
                None
            }
        };

        let marker_cancelled = states
            .iter()
            .any(|state| state.table_name == RUN_MARKER_TABLE && state.status == TableStatus::Cancelled);
        let tables: Vec<&TableCheckpoint> = states
            .iter()
            .filter(|state| state.table_name != RUN_MARKER_TABLE)
            .collect();

        let count = |status: TableStatus| tables.iter().filter(|s| s.status == status).count();
        let completed = count(TableStatus::Completed);
        let summary = StatsSummary {
            total_tables: tables.len(),
            completed,
            in_progress: count(TableStatus::InProgress),
            paused: count(TableStatus::Paused),
            cancelled: count(TableStatus::Cancelled),
            pending: count(TableStatus::Pending),
            total_rows_imported: tables.iter().map(|s| s.rows_imported).sum(),
            progress_percent: if tables.is_empty() {
                0.0
            } else {
                round2(completed as f64 * 100.0 / tables.len() as f64)
            },
        };

        let is_cancelled =
            marker_cancelled || flags.map(|f| f.is_cancelled).unwrap_or(false);
        let is_paused = flags.map(|f| f.is_paused).unwrap_or(false);
        let overall_status = if is_cancelled {
            "cancelled"
        } else if is_paused {
            "paused"
        } else if !tables.is_empty() && completed == tables.len() {
            "completed"
        } else if summary.in_progress > 0 || summary.pending > 0 {
            "running"
        } else {
            "unknown"
        };

        let updates: Vec<i64> = states.iter().filter_map(|s| s.last_update_ns).collect();
        let earliest = updates.iter().min().copied();
        let latest = updates.iter().max().copied();
        let timing = StatsTiming {
            started_at: earliest.map(nanos_to_rfc3339),
            last_updated_at: latest.map(nanos_to_rfc3339),
            duration_seconds: match (earliest, latest) {
                (Some(first), Some(last)) => round2((last - first) as f64 / 1e9),
                _ => 0.0,
            },
        };

        Ok(ImportStats {
            import_id: import_id.to_string(),
            overall_status: overall_status.to_string(),
            summary,
            timing,
            config,
            pause_state: flags,
            table_details: tables
                .iter()
                .map(|state| TableDetail {
                    table_name: state.table_name.clone(),
                    status: state.status,
                    rows_imported: state.rows_imported,
                    paused_at_time: state.paused_at_time.clone(),
                })
                .collect(),
        })
    }
}

fn failed_report(import_id: &str, message: String) -> ImportReport {
    log::error!("Import {} failed: {}", import_id, message);
    let mut report = ImportReport::new(import_id, RunOutcome::Failed);
    report.message = Some(message);
    report
}

/// Folds per-table outcomes into one report. The overall status follows the
/// first interruption: a paused or cancelled table ends the run with that
/// status and its cursor; otherwise the run completed.
fn build_run_report(
    import_id: &str,
    total_tables: usize,
    outcomes: &[TableImportOutcome],
    setup_errors: Vec<WindowError>,
    schema_issues: Vec<SchemaIssue>,
) -> ImportReport {
    let completed = outcomes
        .iter()
        .filter(|o| o.status == TableStatus::Completed)
        .count();
    let rows_imported: u64 = outcomes.iter().map(|o| o.rows_imported).sum();
    let mut errors = setup_errors;
    errors.extend(outcomes.iter().flat_map(|o| o.errors.iter().cloned()));

    let mut report = ImportReport::new(import_id, RunOutcome::Completed);
    report.rows_imported = rows_imported;
    report.tables = Some(TableCounts {
        total: total_tables,
        completed,
    });
    report.error_count = errors.len();
    report.errors = errors;
    report.schema_issues = schema_issues;

    if let Some(paused) = outcomes.iter().find(|o| o.status == TableStatus::Paused) {
        report.status = RunOutcome::Paused;
        report.paused_on_table = Some(paused.measurement.clone());
        report.paused_at_time = paused.paused_at_time.clone();
        report.message = Some(format!(
            "Import paused by user. Completed {}/{} tables, {} rows imported.",
            completed, total_tables, rows_imported
        ));
    } else if let Some(cancelled) = outcomes.iter().find(|o| o.status == TableStatus::Cancelled) {
        report.status = RunOutcome::Cancelled;
        report.cancelled_on_table = Some(cancelled.measurement.clone());
        report.cancelled_at_time = cancelled.cancelled_at_time.clone();
        report.message = Some(format!(
            "Import cancelled by user. Completed {}/{} tables, {} rows imported.",
            completed, total_tables, rows_imported
        ));
    }
    report
}

// --- Request dispatch ---

const AVAILABLE_ACTIONS: [&str; 8] = [
    "start", "status", "pause", "resume", "cancel", "test_connection", "databases", "tables",
];

fn error_json(error: impl std::fmt::Display) -> Value {
    json!({"status": "error", "error": error.to_string()})
}

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| error_json(e))
}

fn body_str(body: Option<&Value>, key: &str) -> Option<String> {
    body.and_then(|body| body.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn param_str(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params
        .get(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required_import_id(
    params: &HashMap<String, String>,
    body: Option<&Value>,
) -> ImportResult<String> {
    param_str(params, "import_id")
        .or_else(|| body_str(body, "import_id"))
        .ok_or_else(|| ImportError::invalid_request("import_id is required"))
}

fn merged_source_params(
    params: &HashMap<String, String>,
    body: Option<&Value>,
) -> ImportResult<SourceParams> {
    let mut merged = match body {
        Some(body) => SourceParams::from_json(body)?,
        None => SourceParams::default(),
    };
    let version = match param_str(params, "influxdb_version") {
        Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
            ImportError::invalid_request(format!("Invalid influxdb_version: {}", raw))
        })?),
        None => None,
    };
    merged.source_url = merged.source_url.or_else(|| param_str(params, "source_url"));
    merged.influxdb_version = merged.influxdb_version.or(version);
    merged.source_token = merged.source_token.or_else(|| param_str(params, "source_token"));
    merged.source_username = merged
        .source_username
        .or_else(|| param_str(params, "source_username"));
    merged.source_password = merged
        .source_password
        .or_else(|| param_str(params, "source_password"));
    merged.source_database = merged
        .source_database
        .or_else(|| param_str(params, "source_database"));
    merged.source_org = merged.source_org.or_else(|| param_str(params, "source_org"));
    Ok(merged)
}

fn resume_credentials(
    params: &HashMap<String, String>,
    body: Option<&Value>,
) -> ImportResult<SourceCredentials> {
    SourceCredentials::from_parts(
        body_str(body, "source_token").or_else(|| param_str(params, "source_token")),
        body_str(body, "source_username").or_else(|| param_str(params, "source_username")),
        body_str(body, "source_password").or_else(|| param_str(params, "source_password")),
    )
}

/// Single request entry point. Every outcome, success or failure, comes
/// back as a JSON value; errors use `{"status": "error", "error": ...}`.
pub async fn process_request(
    orchestrator: &Orchestrator,
    action: Option<&str>,
    params: &HashMap<String, String>,
    body: Option<&Value>,
) -> Value {
    let action = action
        .map(str::trim)
        .filter(|action| !action.is_empty())
        .unwrap_or("start");
    log::debug!("Processing request action '{}'", action);

    match action {
        "start" => {
            let config = match load_config(Some(params), body) {
                Ok(config) => config,
                Err(e) => return error_json(format!("Configuration error: {}", e)),
            };
            match orchestrator.start_import(config).await {
                Ok(outcome) => to_json(&outcome),
                Err(e) => error_json(e),
            }
        }
        "status" => match required_import_id(params, body) {
            Ok(import_id) => match orchestrator.import_stats(&import_id).await {
                Ok(stats) => to_json(&stats),
                Err(e) => error_json(e),
            },
            Err(e) => error_json(e),
        },
        "pause" => match required_import_id(params, body) {
            Ok(import_id) => match orchestrator.pause_import(&import_id).await {
                Ok(ack) => to_json(&ack),
                Err(e) => error_json(e),
            },
            Err(e) => error_json(e),
        },
        "cancel" => match required_import_id(params, body) {
            Ok(import_id) => match orchestrator.cancel_import(&import_id).await {
                Ok(ack) => to_json(&ack),
                Err(e) => error_json(e),
            },
            Err(e) => error_json(e),
        },
        "resume" => {
            let import_id = match required_import_id(params, body) {
                Ok(import_id) => import_id,
                Err(e) => return error_json(e),
            };
            let credentials = match resume_credentials(params, body) {
                Ok(credentials) => credentials,
                Err(e) => return error_json(e),
            };
            match orchestrator.resume_import(&import_id, credentials).await {
                Ok(report) => to_json(&report),
                Err(e) => error_json(e),
            }
        }
        "test_connection" => {
            let source_url = param_str(params, "source_url")
                .or_else(|| body_str(body, "source_url"));
            match source_url {
                Some(source_url) => to_json(&check_source_connection(&source_url).await),
                None => error_json("source_url is required"),
            }
        }
        "databases" => match merged_source_params(params, body) {
            Ok(source_params) => match list_source_databases(&source_params).await {
                Ok(databases) => json!({"databases": databases}),
                Err(e) => error_json(e),
            },
            Err(e) => error_json(e),
        },
        "tables" => match merged_source_params(params, body) {
            Ok(source_params) => match list_source_tables(&source_params).await {
                Ok(tables) => json!({"tables": tables}),
                Err(e) => error_json(e),
            },
            Err(e) => error_json(e),
        },
        other => json!({
            "status": "error",
            "error": format!("Unknown action: {}", other),
            "available_actions": AVAILABLE_ACTIONS,
        }),
    }
}

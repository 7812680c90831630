use chrono::{DateTime, Duration, Utc};

use crate::checkpoint::CheckpointStore;
use crate::config::ImportConfig;
use crate::error::ImportResult;
use crate::estimator::{estimate_window_seconds, find_boundaries};
use crate::models::{
    ImportDirection, PauseFlagState, SchemaIssue, TableImportOutcome, TableStatus, WindowError,
};
use crate::sink::WriteSink;
use crate::source::{ResultSet, SourceQueryExecutor};
use crate::timestamps::{format_rfc3339_nanos, nanos_to_rfc3339, parse_value_to_nanos, tick};
use crate::transcoder::to_write_records;

/// Largest data timestamp in a fetched window, for the persisted pause
/// cursor.
fn max_observed_time(result: &ResultSet) -> Option<i64> {
    let time_idx = result.time_column_index();
    result
        .rows
        .iter()
        .filter_map(|row| row.get(time_idx))
        .filter_map(|cell| parse_value_to_nanos(cell).ok())
        .max()
}

/// Imports one table window by window: discovers its time boundaries,
/// sizes windows from sampled density, polls the pause flag before each
/// window, and checkpoints progress after each successful write. Window
/// failures are recorded and skipped, never aborting the table.
pub struct TableImportEngine<'a> {
    pub source: &'a dyn SourceQueryExecutor,
    pub sink: &'a dyn WriteSink,
    pub checkpoints: &'a CheckpointStore,
    pub config: &'a ImportConfig,
    pub import_id: &'a str,
}

impl<'a> TableImportEngine<'a> {
    /// Runs the table from `user_start` (or its first data point) to
    /// `user_end` (or just past its last). `initial_rows` seeds the row
    /// counter so resumed tables checkpoint cumulative totals. Errors
    /// returned here are pre-loop failures; once the window loop starts the
    /// table always ends in a checkpointed terminal or paused state.
    pub async fn run(
        &self,
        table: &str,
        user_start: Option<DateTime<Utc>>,
        user_end: Option<DateTime<Utc>>,
        initial_rows: u64,
        schema_issues: &mut Vec<SchemaIssue>,
    ) -> ImportResult<TableImportOutcome> {
        let bounds = find_boundaries(self.source, table, user_start, user_end).await;
        let (start, mut end) = match bounds {
            Some(bounds) => bounds,
            None => {
                log::info!("No data found in '{}', marking completed", table);
                self.checkpoint(table, TableStatus::Completed, initial_rows, None)
                    .await?;
                return Ok(self.outcome(table, TableStatus::Completed, initial_rows, Vec::new()));
            }
        };
        if start >= end {
            end = start + tick();
        }

        let window_seconds =
            estimate_window_seconds(self.source, table, start, end, self.config.target_batch_size)
                .await;
        let width = Duration::seconds(window_seconds);

        let schema = crate::schema::table_schema(self.source, table).await?;
        let conflicts = schema.conflicts();
        if !conflicts.is_empty() {
            log::warn!(
                "Tag/field name conflicts in '{}': {:?}. Conflicting tags will be renamed with a '_tag' suffix.",
                table,
                conflicts
            );
            schema_issues.push(SchemaIssue::tag_field_conflict(table, conflicts));
        }

        let ascending = self.config.import_direction == ImportDirection::OldestFirst;
        let order = if ascending { "ASC" } else { "DESC" };
        let mut cursor = if ascending { start } else { end };
        let mut rows_imported = initial_rows;
        let mut errors: Vec<WindowError> = Vec::new();
        let mut last_window: Option<ResultSet> = None;

        loop {
            match self.checkpoints.poll_pause_flag(self.import_id).await {
                PauseFlagState::Cancelled => {
                    let cancelled_at = format_rfc3339_nanos(cursor);
                    log::info!("Import {} cancelled during '{}'", self.import_id, table);
                    self.checkpoint(table, TableStatus::Cancelled, rows_imported, None)
                        .await?;
                    let mut outcome =
                        self.outcome(table, TableStatus::Cancelled, rows_imported, errors);
                    outcome.cancelled_at_time = Some(cancelled_at);
                    return Ok(outcome);
                }
                PauseFlagState::Paused => {
                    let paused_at = last_window
                        .as_ref()
                        .and_then(max_observed_time)
                        .map(nanos_to_rfc3339)
                        .unwrap_or_else(|| format_rfc3339_nanos(cursor));
                    log::info!(
                        "Import {} paused during '{}' at {}",
                        self.import_id,
                        table,
                        paused_at
                    );
                    self.checkpoint(table, TableStatus::Paused, rows_imported, Some(&paused_at))
                        .await?;
                    let mut outcome =
                        self.outcome(table, TableStatus::Paused, rows_imported, errors);
                    outcome.paused_at_time = Some(paused_at);
                    return Ok(outcome);
                }
                PauseFlagState::Running | PauseFlagState::NotFound => {}
            }

            let (window_start, window_end) = if ascending {
                (cursor, (cursor + width).min(end))
            } else {
                ((cursor - width).max(start), cursor)
            };
            let window_start_text = format_rfc3339_nanos(window_start);
            let window_end_text = format_rfc3339_nanos(window_end);

            let query = format!(
                "SELECT * FROM \"{}\" WHERE time >= '{}' AND time < '{}' ORDER BY time {}",
                table, window_start_text, window_end_text, order
            );
            match self.source.query(&query).await {
                Ok(result) if !result.is_empty() => {
                    let (records, dropped) = to_write_records(table, &result, &schema);
                    if dropped > 0 {
                        log::warn!(
                            "Dropped {} row(s) without usable fields in '{}' window {} to {}",
                            dropped,
                            table,
                            window_start_text,
                            window_end_text
                        );
                    }
                    if !records.is_empty() {
                        match self
                            .sink
                            .write_batch(self.config.dest_database.as_deref(), &records)
                            .await
                        {
                            Ok(()) => {
                                rows_imported += records.len() as u64;
                                if let Err(e) = self
                                    .checkpoints
                                    .write_table_state(
                                        self.import_id,
                                        table,
                                        TableStatus::InProgress,
                                        rows_imported,
                                        None,
                                    )
                                    .await
                                {
                                    log::warn!(
                                        "Failed to checkpoint progress for '{}': {}",
                                        table,
                                        e
                                    );
                                }
                            }
                            Err(e) => {
                                log::error!(
                                    "Write failed for '{}' window {} to {}: {}",
                                    table,
                                    window_start_text,
                                    window_end_text,
                                    e
                                );
                                errors.push(WindowError {
                                    time_range: format!(
                                        "{} to {}",
                                        window_start_text, window_end_text
                                    ),
                                    error: e.to_string(),
                                });
                            }
                        }
                    }
                    last_window = Some(result);
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!(
                        "Query failed for '{}' window {} to {}: {}",
                        table,
                        window_start_text,
                        window_end_text,
                        e
                    );
                    errors.push(WindowError {
                        time_range: format!("{} to {}", window_start_text, window_end_text),
                        error: e.to_string(),
                    });
                }
            }

            if ascending {
                cursor = window_end;
                if cursor >= end {
                    break;
                }
            } else {
                cursor = window_start;
                if cursor <= start {
                    break;
                }
            }

            tokio::time::sleep(std::time::Duration::from_millis(self.config.query_interval_ms))
                .await;
        }

        self.checkpoint(table, TableStatus::Completed, rows_imported, None)
            .await?;
        log::info!(
            "Completed '{}': {} rows imported, {} window error(s)",
            table,
            rows_imported,
            errors.len()
        );
        Ok(self.outcome(table, TableStatus::Completed, rows_imported, errors))
    }

    async fn checkpoint(
        &self,
        table: &str,
        status: TableStatus,
        rows_imported: u64,
        paused_at: Option<&str>,
    ) -> ImportResult<()> {
        self.checkpoints
            .write_table_state(self.import_id, table, status, rows_imported, paused_at)
            .await
    }

    fn outcome(
        &self,
        table: &str,
        status: TableStatus,
        rows_imported: u64,
        errors: Vec<WindowError>,
    ) -> TableImportOutcome {
        TableImportOutcome {
            measurement: table.to_string(),
            status,
            rows_imported,
            errors,
            paused_at_time: None,
            cancelled_at_time: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve_config, ConfigOverlay};
    use crate::sink::{StateQuery, WriteRecord};
    use crate::timestamps::parse_timestamp;
    use serde_json::{json, Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const BASE_NS: i64 = 1_704_067_200_000_000_000; // 2024-01-01T00:00:00Z

    fn test_config() -> ImportConfig {
        resolve_config(vec![ConfigOverlay {
            source_url: Some("http://localhost:8086".to_string()),
            source_database: Some("telemetry".to_string()),
            influxdb_version: Some(1),
            source_token: Some("secret".to_string()),
            query_interval_ms: Some(0),
            ..ConfigOverlay::default()
        }])
        .unwrap()
    }

    /// Source fake with rows at fixed nanosecond offsets, answering
    /// boundary, metadata, and window queries.
    struct FakeSource {
        offsets_ns: Vec<i64>,
    }

    impl FakeSource {
        fn result(&self, rows: Vec<Vec<Value>>) -> ResultSet {
            ResultSet {
                columns: vec!["time".to_string(), "host".to_string(), "usage".to_string()],
                rows,
                tags: Map::new(),
            }
        }

        fn row(&self, offset_ns: i64) -> Vec<Value> {
            vec![json!(BASE_NS + offset_ns), json!("server01"), json!(0.5)]
        }

        fn bound(query: &str, marker: &str) -> i64 {
            let tail = &query[query.find(marker).unwrap() + marker.len()..];
            let literal = &tail[..tail.find('\'').unwrap()];
            parse_timestamp(literal)
                .unwrap()
                .timestamp_nanos_opt()
                .unwrap()
        }
    }

    #[async_trait::async_trait]
    impl SourceQueryExecutor for FakeSource {
        async fn query(&self, query: &str) -> ImportResult<ResultSet> {
            if query.starts_with("SHOW TAG KEYS") {
                return Ok(ResultSet {
                    columns: vec!["tagKey".to_string()],
                    rows: vec![vec![json!("host")]],
                    tags: Map::new(),
                });
            }
            if query.starts_with("SHOW FIELD KEYS") {
                return Ok(ResultSet {
                    columns: vec!["fieldKey".to_string(), "fieldType".to_string()],
                    rows: vec![vec![json!("usage"), json!("float")]],
                    tags: Map::new(),
                });
            }
            if query.contains("LIMIT 1") {
                let offset = if query.contains("ASC") {
                    self.offsets_ns.first()
                } else {
                    self.offsets_ns.last()
                };
                return Ok(match offset {
                    Some(offset) => {
                        let row = self.row(*offset);
                        self.result(vec![row])
                    }
                    None => self.result(vec![]),
                });
            }

            let start = Self::bound(query, "time >= '");
            let end = Self::bound(query, "time < '");
            let in_range: Vec<i64> = self
                .offsets_ns
                .iter()
                .copied()
                .filter(|offset| BASE_NS + offset >= start && BASE_NS + offset < end)
                .collect();
            if query.contains("COUNT") {
                return Ok(ResultSet {
                    columns: vec!["time".to_string(), "count".to_string()],
                    rows: vec![vec![json!(0), json!(in_range.len() as u64)]],
                    tags: Map::new(),
                });
            }
            let rows = in_range.into_iter().map(|offset| self.row(offset)).collect();
            Ok(self.result(rows))
        }
    }

    struct RecordingSink {
        batches: Mutex<Vec<(Option<String>, Vec<WriteRecord>)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(RecordingSink {
                batches: Mutex::new(Vec::new()),
            })
        }

        fn data_rows(&self, table: &str) -> usize {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flat_map(|(_, records)| records.iter())
                .filter(|record| record.table == table)
                .count()
        }

        fn state_rows(&self) -> Vec<WriteRecord> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flat_map(|(_, records)| records.iter())
                .filter(|record| record.table == crate::checkpoint::STATE_SERIES)
                .cloned()
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl WriteSink for RecordingSink {
        async fn write_batch(
            &self,
            database: Option<&str>,
            records: &[WriteRecord],
        ) -> ImportResult<()> {
            self.batches
                .lock()
                .unwrap()
                .push((database.map(str::to_string), records.to_vec()));
            Ok(())
        }
    }

    /// Reports running for the first `running_polls` flag reads, then the
    /// configured flags.
    struct FlagAfter {
        running_polls: usize,
        polls: AtomicUsize,
        paused: bool,
        cancelled: bool,
    }

    impl FlagAfter {
        fn running() -> Arc<Self> {
            Arc::new(FlagAfter {
                running_polls: usize::MAX,
                polls: AtomicUsize::new(0),
                paused: false,
                cancelled: false,
            })
        }

        fn flags_after(running_polls: usize, paused: bool, cancelled: bool) -> Arc<Self> {
            Arc::new(FlagAfter {
                running_polls,
                polls: AtomicUsize::new(0),
                paused,
                cancelled,
            })
        }
    }

    #[async_trait::async_trait]
    impl StateQuery for FlagAfter {
        async fn query(&self, _query: &str) -> ImportResult<Vec<Map<String, Value>>> {
            let seen = self.polls.fetch_add(1, Ordering::SeqCst);
            let (paused, cancelled) = if seen < self.running_polls {
                (false, false)
            } else {
                (self.paused, self.cancelled)
            };
            let row = json!({"paused": paused, "canceled": cancelled, "time": 1i64});
            Ok(vec![row.as_object().unwrap().clone()])
        }
    }

    fn engine_parts(
        state: Arc<dyn StateQuery>,
    ) -> (Arc<RecordingSink>, CheckpointStore, ImportConfig) {
        let sink = RecordingSink::new();
        let checkpoints = CheckpointStore::new(sink.clone(), state);
        (sink, checkpoints, test_config())
    }

    #[tokio::test]
    async fn test_empty_table_checkpoints_completed() {
        let source = FakeSource { offsets_ns: vec![] };
        let (sink, checkpoints, config) = engine_parts(FlagAfter::running());
        let engine = TableImportEngine {
            source: &source,
            sink: sink.as_ref(),
            checkpoints: &checkpoints,
            config: &config,
            import_id: "run-1",
        };
        let mut issues = Vec::new();
        let outcome = engine.run("cpu", None, None, 0, &mut issues).await.unwrap();
        assert_eq!(outcome.status, TableStatus::Completed);
        assert_eq!(outcome.rows_imported, 0);
        assert_eq!(sink.data_rows("cpu"), 0);

        let states = sink.state_rows();
        assert_eq!(states.len(), 1);
        assert_eq!(
            states[0].fields[0],
            ("status".to_string(), crate::sink::FieldValue::Text("completed".to_string()))
        );
    }

    #[tokio::test]
    async fn test_full_run_imports_all_rows() {
        let second = 1_000_000_000i64;
        let source = FakeSource {
            offsets_ns: vec![0, 100 * second, 200 * second, 300 * second],
        };
        let (sink, checkpoints, config) = engine_parts(FlagAfter::running());
        let engine = TableImportEngine {
            source: &source,
            sink: sink.as_ref(),
            checkpoints: &checkpoints,
            config: &config,
            import_id: "run-1",
        };
        let mut issues = Vec::new();
        let outcome = engine.run("cpu", None, None, 0, &mut issues).await.unwrap();
        assert_eq!(outcome.status, TableStatus::Completed);
        assert_eq!(outcome.rows_imported, 4);
        assert!(outcome.errors.is_empty());
        assert_eq!(sink.data_rows("cpu"), 4);
        assert!(issues.is_empty());
    }

    #[tokio::test]
    async fn test_pause_checkpoints_last_observed_timestamp() {
        // 300s span gives a whole-span window plus the final 1-tick window;
        // the flag flips to paused after the first poll.
        let second = 1_000_000_000i64;
        let source = FakeSource {
            offsets_ns: vec![0, 100 * second, 200 * second, 300 * second],
        };
        let (sink, checkpoints, config) = engine_parts(FlagAfter::flags_after(1, true, false));
        let engine = TableImportEngine {
            source: &source,
            sink: sink.as_ref(),
            checkpoints: &checkpoints,
            config: &config,
            import_id: "run-1",
        };
        let mut issues = Vec::new();
        let outcome = engine.run("cpu", None, None, 0, &mut issues).await.unwrap();
        assert_eq!(outcome.status, TableStatus::Paused);
        assert_eq!(outcome.rows_imported, 3);
        // Pause cursor is the newest data timestamp actually written.
        assert_eq!(
            outcome.paused_at_time.as_deref(),
            Some("2024-01-01T00:03:20.000000000Z")
        );

        let paused_rows: Vec<_> = sink
            .state_rows()
            .into_iter()
            .filter(|record| {
                record.fields[0]
                    == ("status".to_string(), crate::sink::FieldValue::Text("paused".to_string()))
            })
            .collect();
        assert_eq!(paused_rows.len(), 1);
        assert_eq!(
            paused_rows[0].fields[2],
            (
                "paused_at_time".to_string(),
                crate::sink::FieldValue::Text("2024-01-01T00:03:20.000000000Z".to_string())
            )
        );
    }

    #[tokio::test]
    async fn test_cancel_wins_and_writes_nothing() {
        let second = 1_000_000_000i64;
        let source = FakeSource {
            offsets_ns: vec![0, 100 * second],
        };
        // Both flags raised before the first window; cancel must win.
        let (sink, checkpoints, config) = engine_parts(FlagAfter::flags_after(0, true, true));
        let engine = TableImportEngine {
            source: &source,
            sink: sink.as_ref(),
            checkpoints: &checkpoints,
            config: &config,
            import_id: "run-1",
        };
        let mut issues = Vec::new();
        let outcome = engine.run("cpu", None, None, 0, &mut issues).await.unwrap();
        assert_eq!(outcome.status, TableStatus::Cancelled);
        assert_eq!(outcome.rows_imported, 0);
        assert!(outcome.cancelled_at_time.is_some());
        assert_eq!(sink.data_rows("cpu"), 0);
    }

    #[tokio::test]
    async fn test_conflict_reported_as_schema_issue() {
        struct ConflictedSource {
            inner: FakeSource,
        }

        #[async_trait::async_trait]
        impl SourceQueryExecutor for ConflictedSource {
            async fn query(&self, query: &str) -> ImportResult<ResultSet> {
                if query.starts_with("SHOW TAG KEYS") {
                    return Ok(ResultSet {
                        columns: vec!["tagKey".to_string()],
                        rows: vec![vec![json!("host")], vec![json!("usage")]],
                        tags: Map::new(),
                    });
                }
                self.inner.query(query).await
            }
        }

        let source = ConflictedSource {
            inner: FakeSource {
                offsets_ns: vec![0],
            },
        };
        let (sink, checkpoints, config) = engine_parts(FlagAfter::running());
        let engine = TableImportEngine {
            source: &source,
            sink: sink.as_ref(),
            checkpoints: &checkpoints,
            config: &config,
            import_id: "run-1",
        };
        let mut issues = Vec::new();
        engine.run("cpu", None, None, 0, &mut issues).await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, "tag_field_conflict");
        assert_eq!(issues[0].conflicts, vec!["usage"]);
    }

    #[tokio::test]
    async fn test_initial_rows_carry_into_checkpoints() {
        let source = FakeSource {
            offsets_ns: vec![0],
        };
        let (sink, checkpoints, config) = engine_parts(FlagAfter::running());
        let engine = TableImportEngine {
            source: &source,
            sink: sink.as_ref(),
            checkpoints: &checkpoints,
            config: &config,
            import_id: "run-1",
        };
        let mut issues = Vec::new();
        let outcome = engine.run("cpu", None, None, 6000, &mut issues).await.unwrap();
        assert_eq!(outcome.rows_imported, 6001);
    }
}

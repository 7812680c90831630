use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::ImportResult;
use crate::models::{ConfigSummary, PauseFlagState, PauseFlags, TableStatus};
use crate::sink::{FieldValue, StateQuery, WriteRecord, WriteSink};
use crate::timestamps::now_nanos;

/// Append-only per-table progress rows; the newest row per table wins.
pub const STATE_SERIES: &str = "import_state";
/// Append-only pause/cancel flag rows; the newest row per run wins.
pub const PAUSE_SERIES: &str = "import_pause_state";
/// Credential-free configuration snapshots, one row per started run.
pub const CONFIG_SERIES: &str = "import_config";
/// Run-scoped marker row written on cancel so status reporting sees a
/// cancellation even when no table was mid-flight.
pub const RUN_MARKER_TABLE: &str = "all";

/// Latest recorded progress for one table of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TableCheckpoint {
    pub table_name: String,
    pub status: TableStatus,
    pub rows_imported: u64,
    pub paused_at_time: Option<String>,
    pub last_update_ns: Option<i64>,
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "\\'")
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => text.eq_ignore_ascii_case("true"),
        Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0) != 0.0,
        _ => false,
    }
}

fn string_field(row: &Map<String, Value>, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn integer_field(row: &Map<String, Value>, key: &str, default: i64) -> i64 {
    row.get(key)
        .and_then(|cell| {
            cell.as_i64()
                .or_else(|| cell.as_f64().map(|value| value as i64))
        })
        .unwrap_or(default)
}

/// Progress and control-flag persistence over the destination's own write
/// and query paths. All writes go to the default database; all series are
/// append-only with newest-row-wins reads, so resume never needs a prior
/// process to have shut down cleanly.
pub struct CheckpointStore {
    sink: Arc<dyn WriteSink>,
    state: Arc<dyn StateQuery>,
}

impl CheckpointStore {
    pub fn new(sink: Arc<dyn WriteSink>, state: Arc<dyn StateQuery>) -> Self {
        CheckpointStore { sink, state }
    }

    pub async fn write_table_state(
        &self,
        import_id: &str,
        table_name: &str,
        status: TableStatus,
        rows_imported: u64,
        paused_at_time: Option<&str>,
    ) -> ImportResult<()> {
        let record = WriteRecord::new(STATE_SERIES)
            .tag("import_id", import_id)
            .tag("table_name", table_name)
            .field("status", FieldValue::Text(status.as_str().to_string()))
            .field("rows_imported", FieldValue::Integer(rows_imported as i64))
            .field(
                "paused_at_time",
                FieldValue::Text(paused_at_time.unwrap_or_default().to_string()),
            )
            .timestamp_ns(now_nanos());
        self.sink.write_batch(None, &[record]).await
    }

    pub async fn write_pause_flags(
        &self,
        import_id: &str,
        paused: bool,
        cancelled: bool,
    ) -> ImportResult<()> {
        let record = WriteRecord::new(PAUSE_SERIES)
            .tag("import_id", import_id)
            .field("paused", FieldValue::Boolean(paused))
            .field("canceled", FieldValue::Boolean(cancelled))
            .timestamp_ns(now_nanos());
        self.sink.write_batch(None, &[record]).await
    }

    pub async fn save_config(&self, import_id: &str, summary: &ConfigSummary) -> ImportResult<()> {
        let record = WriteRecord::new(CONFIG_SERIES)
            .tag("import_id", import_id)
            .field("source_url", FieldValue::Text(summary.source_url.clone()))
            .field(
                "source_database",
                FieldValue::Text(summary.source_database.clone()),
            )
            .field(
                "dest_database",
                FieldValue::Text(summary.dest_database.clone()),
            )
            .field(
                "start_timestamp",
                FieldValue::Text(summary.start_timestamp.clone()),
            )
            .field(
                "end_timestamp",
                FieldValue::Text(summary.end_timestamp.clone()),
            )
            .field(
                "import_direction",
                FieldValue::Text(summary.import_direction.clone()),
            )
            .field("table_filter", FieldValue::Text(summary.table_filter.clone()))
            .field(
                "influxdb_version",
                FieldValue::Integer(summary.influxdb_version),
            )
            .field(
                "query_interval_ms",
                FieldValue::Integer(summary.query_interval_ms),
            )
            .field(
                "target_batch_size",
                FieldValue::Integer(summary.target_batch_size),
            )
            .timestamp_ns(now_nanos());
        self.sink.write_batch(None, &[record]).await
    }

    /// Newest persisted configuration snapshot for the run, or None when no
    /// run with this id ever saved one.
    pub async fn load_config(&self, import_id: &str) -> ImportResult<Option<ConfigSummary>> {
        let query = format!(
            "SELECT * FROM \"{}\" WHERE \"import_id\" = '{}' ORDER BY time DESC LIMIT 1",
            CONFIG_SERIES,
            escape_literal(import_id)
        );
        let rows = self.state.query(&query).await?;
        let row = match rows.first() {
            Some(row) => row,
            None => return Ok(None),
        };
        Ok(Some(ConfigSummary {
            source_url: string_field(row, "source_url"),
            source_database: string_field(row, "source_database"),
            dest_database: string_field(row, "dest_database"),
            start_timestamp: string_field(row, "start_timestamp"),
            end_timestamp: string_field(row, "end_timestamp"),
            import_direction: string_field(row, "import_direction"),
            table_filter: string_field(row, "table_filter"),
            influxdb_version: integer_field(row, "influxdb_version", 1),
            query_interval_ms: integer_field(row, "query_interval_ms", 100),
            target_batch_size: integer_field(row, "target_batch_size", 2000),
        }))
    }

    /// Raw flag values from the newest pause row, or None when the run has
    /// never written one.
    pub async fn pause_flags(&self, import_id: &str) -> ImportResult<Option<PauseFlags>> {
        let query = format!(
            "SELECT \"paused\", \"canceled\", time FROM \"{}\" WHERE \"import_id\" = '{}' \
             ORDER BY time DESC LIMIT 1",
            PAUSE_SERIES,
            escape_literal(import_id)
        );
        let rows = self.state.query(&query).await?;
        Ok(rows.first().map(|row| PauseFlags {
            is_paused: truthy(row.get("paused")),
            is_cancelled: truthy(row.get("canceled")),
        }))
    }

    /// Strict flag read for control transitions: storage errors propagate
    /// and a missing row is reported as NotFound. Cancelled wins whenever
    /// both flags are set.
    pub async fn pause_flag_state(&self, import_id: &str) -> ImportResult<PauseFlagState> {
        Ok(match self.pause_flags(import_id).await? {
            None => PauseFlagState::NotFound,
            Some(flags) if flags.is_cancelled => PauseFlagState::Cancelled,
            Some(flags) if flags.is_paused => PauseFlagState::Paused,
            Some(_) => PauseFlagState::Running,
        })
    }

    /// Lenient flag read for the per-window poll: an unreadable or missing
    /// flag never stalls an import in flight.
    pub async fn poll_pause_flag(&self, import_id: &str) -> PauseFlagState {
        match self.pause_flag_state(import_id).await {
            Ok(PauseFlagState::NotFound) => PauseFlagState::Running,
            Ok(state) => state,
            Err(e) => {
                log::warn!("Failed to check pause state for {}: {}", import_id, e);
                PauseFlagState::Running
            }
        }
    }

    /// Latest checkpoint per table of the run, sorted by table name. Rows
    /// arrive newest first; the first row seen per table wins.
    pub async fn latest_table_states(&self, import_id: &str) -> ImportResult<Vec<TableCheckpoint>> {
        let query = format!(
            "SELECT \"table_name\", \"status\", \"rows_imported\", \"paused_at_time\", time \
             FROM \"{}\" WHERE \"import_id\" = '{}' ORDER BY time DESC",
            STATE_SERIES,
            escape_literal(import_id)
        );
        let rows = self.state.query(&query).await?;

        let mut latest: BTreeMap<String, TableCheckpoint> = BTreeMap::new();
        for row in &rows {
            let table_name = string_field(row, "table_name");
            if table_name.is_empty() || latest.contains_key(&table_name) {
                continue;
            }
            let status = TableStatus::from_db(&string_field(row, "status"))?;
            let paused_at = string_field(row, "paused_at_time");
            latest.insert(
                table_name.clone(),
                TableCheckpoint {
                    table_name,
                    status,
                    rows_imported: integer_field(row, "rows_imported", 0).max(0) as u64,
                    paused_at_time: if paused_at.is_empty() {
                        None
                    } else {
                        Some(paused_at)
                    },
                    last_update_ns: row.get("time").and_then(|cell| cell.as_i64()),
                },
            );
        }
        Ok(latest.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ImportError;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingSink {
        batches: Mutex<Vec<(Option<String>, Vec<WriteRecord>)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(RecordingSink {
                batches: Mutex::new(Vec::new()),
            })
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

    struct CannedState {
        rows: Vec<Map<String, Value>>,
        fail: bool,
    }

    impl CannedState {
        fn with_rows(rows: Vec<Value>) -> Arc<Self> {
            Arc::new(CannedState {
                rows: rows
                    .into_iter()
                    .map(|row| row.as_object().unwrap().clone())
                    .collect(),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(CannedState {
                rows: Vec::new(),
                fail: true,
            })
        }
    }

    #[async_trait::async_trait]
    impl StateQuery for CannedState {
        async fn query(&self, _query: &str) -> ImportResult<Vec<Map<String, Value>>> {
            if self.fail {
                return Err(ImportError::state_store("connection refused"));
            }
            Ok(self.rows.clone())
        }
    }

    fn store(sink: Arc<RecordingSink>, state: Arc<CannedState>) -> CheckpointStore {
        CheckpointStore::new(sink, state)
    }

    #[tokio::test]
    async fn test_table_state_record_shape() {
        let sink = RecordingSink::new();
        let checkpoints = store(sink.clone(), CannedState::with_rows(vec![]));
        checkpoints
            .write_table_state("run-1", "cpu", TableStatus::InProgress, 4000, None)
            .await
            .unwrap();

        let batches = sink.batches.lock().unwrap();
        let (database, records) = &batches[0];
        assert_eq!(database.as_deref(), None);
        let record = &records[0];
        assert_eq!(record.table, STATE_SERIES);
        assert_eq!(
            record.tags,
            vec![
                ("import_id".to_string(), "run-1".to_string()),
                ("table_name".to_string(), "cpu".to_string()),
            ]
        );
        assert_eq!(
            record.fields[0],
            ("status".to_string(), FieldValue::Text("in_progress".to_string()))
        );
        assert_eq!(
            record.fields[1],
            ("rows_imported".to_string(), FieldValue::Integer(4000))
        );
        assert_eq!(
            record.fields[2],
            ("paused_at_time".to_string(), FieldValue::Text(String::new()))
        );
        assert!(record.timestamp_ns.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_wins_over_paused() {
        let state = CannedState::with_rows(vec![json!({
            "paused": true,
            "canceled": true,
            "time": 10i64
        })]);
        let checkpoints = store(RecordingSink::new(), state);
        assert_eq!(
            checkpoints.pause_flag_state("run-1").await.unwrap(),
            PauseFlagState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_flag_values_accept_storage_variants() {
        for (paused, expected) in [
            (json!(true), PauseFlagState::Paused),
            (json!("TRUE"), PauseFlagState::Paused),
            (json!(1), PauseFlagState::Paused),
            (json!(false), PauseFlagState::Running),
            (json!("false"), PauseFlagState::Running),
            (json!(0), PauseFlagState::Running),
        ] {
            let state = CannedState::with_rows(vec![json!({
                "paused": paused,
                "canceled": false,
                "time": 10i64
            })]);
            let checkpoints = store(RecordingSink::new(), state);
            assert_eq!(checkpoints.pause_flag_state("run-1").await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_strict_read_reports_not_found() {
        let checkpoints = store(RecordingSink::new(), CannedState::with_rows(vec![]));
        assert_eq!(
            checkpoints.pause_flag_state("run-1").await.unwrap(),
            PauseFlagState::NotFound
        );
        assert!(store(RecordingSink::new(), CannedState::failing())
            .pause_flag_state("run-1")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_poll_is_lenient() {
        let checkpoints = store(RecordingSink::new(), CannedState::failing());
        assert_eq!(
            checkpoints.poll_pause_flag("run-1").await,
            PauseFlagState::Running
        );

        let checkpoints = store(RecordingSink::new(), CannedState::with_rows(vec![]));
        assert_eq!(
            checkpoints.poll_pause_flag("run-1").await,
            PauseFlagState::Running
        );
    }

    #[tokio::test]
    async fn test_latest_table_states_newest_row_wins() {
        // Rows arrive newest first, as the query orders them.
        let state = CannedState::with_rows(vec![
            json!({"table_name": "cpu", "status": "completed", "rows_imported": 36000, "paused_at_time": "", "time": 30i64}),
            json!({"table_name": "mem", "status": "paused", "rows_imported": 6000, "paused_at_time": "2024-01-01T00:33:19.900000000Z", "time": 20i64}),
            json!({"table_name": "cpu", "status": "in_progress", "rows_imported": 2000, "paused_at_time": "", "time": 10i64}),
        ]);
        let checkpoints = store(RecordingSink::new(), state);
        let states = checkpoints.latest_table_states("run-1").await.unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].table_name, "cpu");
        assert_eq!(states[0].status, TableStatus::Completed);
        assert_eq!(states[0].rows_imported, 36000);
        assert_eq!(states[0].paused_at_time, None);
        assert_eq!(states[1].table_name, "mem");
        assert_eq!(states[1].status, TableStatus::Paused);
        assert_eq!(
            states[1].paused_at_time.as_deref(),
            Some("2024-01-01T00:33:19.900000000Z")
        );
        assert_eq!(states[1].last_update_ns, Some(20));
    }

    #[tokio::test]
    async fn test_config_snapshot_round_trip() {
        let sink = RecordingSink::new();
        let summary = ConfigSummary {
            source_url: "http://localhost:8086".to_string(),
            source_database: "telemetry".to_string(),
            dest_database: String::new(),
            start_timestamp: "2024-01-01T00:00:00Z".to_string(),
            end_timestamp: String::new(),
            import_direction: "oldest_first".to_string(),
            table_filter: "cpu.mem".to_string(),
            influxdb_version: 1,
            query_interval_ms: 100,
            target_batch_size: 2000,
        };
        store(sink.clone(), CannedState::with_rows(vec![]))
            .save_config("run-1", &summary)
            .await
            .unwrap();

        // No credential field is ever part of the snapshot record.
        let batches = sink.batches.lock().unwrap();
        let record = &batches[0].1[0];
        assert_eq!(record.table, CONFIG_SERIES);
        assert!(record
            .fields
            .iter()
            .all(|(name, _)| !name.contains("token") && !name.contains("password")));

        let state = CannedState::with_rows(vec![json!({
            "source_url": "http://localhost:8086",
            "source_database": "telemetry",
            "dest_database": "",
            "start_timestamp": "2024-01-01T00:00:00Z",
            "end_timestamp": "",
            "import_direction": "oldest_first",
            "table_filter": "cpu.mem",
            "influxdb_version": 1,
            "query_interval_ms": 100,
            "target_batch_size": 2000,
            "time": 5i64
        })]);
        let loaded = store(RecordingSink::new(), state)
            .load_config("run-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, summary);
    }

    #[tokio::test]
    async fn test_load_config_missing_run() {
        let checkpoints = store(RecordingSink::new(), CannedState::with_rows(vec![]));
        assert!(checkpoints.load_config("ghost").await.unwrap().is_none());
    }
}

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::ImportConfig;
use crate::source::{ResultSet, SourceQueryExecutor};
use crate::timestamps::{format_rfc3339_nanos, parse_value_to_nanos, tick};

/// Window width clamp: 1 second to 30.5 days.
pub const MIN_WINDOW_SECONDS: i64 = 1;
pub const MAX_WINDOW_SECONDS: i64 = 2_635_200;

/// Advisory throughput assumption for dry-run estimates: rows per second,
/// plus a flat per-table overhead. Never gates execution.
const ESTIMATE_ROWS_PER_SECOND: f64 = 1000.0;
const TABLE_OVERHEAD_SECONDS: f64 = 2.0;

/// Candidate probe widths for density sampling, in seconds.
const PROBE_WIDTHS: [(&str, i64); 4] = [
    ("1h", 3_600),
    ("10h", 36_000),
    ("1d", 86_400),
    ("5d", 432_000),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableEstimate {
    pub measurement: String,
    pub estimated_rows: u64,
    pub estimated_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportEstimate {
    pub estimated_total_rows: u64,
    pub estimated_duration_seconds: f64,
    pub estimated_duration_human: String,
    pub per_table_estimates: Vec<TableEstimate>,
}

fn first_time_cell(result: &ResultSet) -> Option<DateTime<Utc>> {
    let time_idx = result.time_column_index();
    let cell = result.rows.first()?.get(time_idx)?;
    let nanos = parse_value_to_nanos(cell).ok()?;
    Some(DateTime::from_timestamp_nanos(nanos))
}

fn range_clause(user_start: Option<DateTime<Utc>>, user_end: Option<DateTime<Utc>>) -> String {
    match (user_start, user_end) {
        (None, None) => String::new(),
        (Some(start), None) => format!(" WHERE time >= '{}'", format_rfc3339_nanos(start)),
        (None, Some(end)) => format!(" WHERE time <= '{}'", format_rfc3339_nanos(end)),
        (Some(start), Some(end)) => format!(
            " WHERE time >= '{}' AND time <= '{}'",
            format_rfc3339_nanos(start),
            format_rfc3339_nanos(end)
        ),
    }
}

/// Finds the real data boundaries inside the requested range. The returned
/// upper bound is the newest timestamp plus one tick, so it is exclusive
/// under half-open window queries. `None` means no rows in range, which is
/// not an error; probe failures are logged and reported the same way.
pub async fn find_boundaries(
    executor: &dyn SourceQueryExecutor,
    table: &str,
    user_start: Option<DateTime<Utc>>,
    user_end: Option<DateTime<Utc>>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let clause = range_clause(user_start, user_end);
    let start_query = format!(
        "SELECT * FROM \"{}\"{} ORDER BY time ASC LIMIT 1",
        table, clause
    );
    let end_query = format!(
        "SELECT * FROM \"{}\"{} ORDER BY time DESC LIMIT 1",
        table, clause
    );

    let actual_start = match executor.query(&start_query).await {
        Ok(result) => first_time_cell(&result),
        Err(e) => {
            log::warn!("Error finding data boundaries for '{}': {}", table, e);
            return None;
        }
    };
    let actual_end = match executor.query(&end_query).await {
        Ok(result) => first_time_cell(&result),
        Err(e) => {
            log::warn!("Error finding data boundaries for '{}': {}", table, e);
            return None;
        }
    };

    match (actual_start, actual_end) {
        (Some(start), Some(end)) => Some((start, end + tick())),
        _ => None,
    }
}

async fn count_rows(
    executor: &dyn SourceQueryExecutor,
    table: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> crate::error::ImportResult<u64> {
    let query = format!(
        "SELECT COUNT(*) FROM \"{}\" WHERE time >= '{}' AND time < '{}'",
        table,
        format_rfc3339_nanos(start),
        format_rfc3339_nanos(end)
    );
    let result = executor.query(&query).await?;
    let count = result
        .rows
        .first()
        .and_then(|row| row.get(1))
        .and_then(|cell| cell.as_u64())
        .unwrap_or(0);
    Ok(count)
}

/// Samples row density to size query windows for the target batch row
/// count. Probes up to four widths at three points along the range, averages
/// rows/sec over the samples that returned data, and clamps the resulting
/// window to [1s, 30.5 days]. No samples means 1-hour windows; a range too
/// short for any probe means the whole span.
pub async fn estimate_window_seconds(
    executor: &dyn SourceQueryExecutor,
    table: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    target_batch_size: u64,
) -> i64 {
    let total_seconds = (end - start).num_milliseconds() as f64 / 1000.0;

    let viable: Vec<(&str, i64)> = PROBE_WIDTHS
        .iter()
        .copied()
        .filter(|(_, secs)| *secs as f64 <= total_seconds)
        .collect();
    if viable.is_empty() {
        log::warn!(
            "Time range too short for sampling '{}', using entire duration: {:.1}s",
            table,
            total_seconds
        );
        return (total_seconds as i64).max(MIN_WINDOW_SECONDS);
    }

    let third = Duration::seconds((total_seconds / 3.0) as i64);
    let mut samples: Vec<f64> = Vec::new();

    for (name, width_seconds) in viable {
        let probe_points = [start, start + third, start + third + third];
        for probe_start in probe_points {
            let probe_end = probe_start + Duration::seconds(width_seconds);
            if probe_end > end {
                continue;
            }
            match count_rows(executor, table, probe_start, probe_end).await {
                Ok(count) if count > 0 => {
                    let rows_per_second = count as f64 / width_seconds as f64;
                    samples.push(rows_per_second);
                    log::debug!(
                        "Sample {} for '{}': {} rows, {:.2} rows/sec",
                        name,
                        table,
                        count,
                        rows_per_second
                    );
                }
                Ok(_) => {}
                Err(e) => log::warn!("Error sampling {} for '{}': {}", name, table, e),
            }
        }
    }

    if samples.is_empty() {
        log::warn!(
            "No samples obtained for '{}', defaulting to 1-hour windows",
            table
        );
        return 3_600;
    }

    let avg_rows_per_second = samples.iter().sum::<f64>() / samples.len() as f64;
    if avg_rows_per_second == 0.0 {
        log::warn!("Average rows per second is 0 for '{}', defaulting to 1-day windows", table);
        return 86_400;
    }

    let window = (target_batch_size as f64 / avg_rows_per_second) as i64;
    let window = window.clamp(MIN_WINDOW_SECONDS, MAX_WINDOW_SECONDS);
    log::info!(
        "Measurement '{}': {:.2} rows/sec ({} samples), optimal window: {}s",
        table,
        avg_rows_per_second,
        samples.len(),
        window
    );
    window
}

pub fn human_duration(total_seconds: f64) -> String {
    if total_seconds < 60.0 {
        format!("{:.1} seconds", total_seconds)
    } else if total_seconds < 3_600.0 {
        format!("{:.1} minutes", total_seconds / 60.0)
    } else if total_seconds < 86_400.0 {
        format!("{:.1} hours", total_seconds / 3_600.0)
    } else {
        format!("{:.1} days", total_seconds / 86_400.0)
    }
}

/// Advisory dry-run estimate: per table, real boundaries plus a full-range
/// COUNT(*), at an assumed 1000 rows/sec with 2s of per-table overhead and
/// the configured inter-batch delay. Per-table failures are recorded on the
/// estimate, never fatal.
pub async fn estimate_import_time(
    executor: &dyn SourceQueryExecutor,
    config: &ImportConfig,
    tables: &[String],
    user_start: Option<DateTime<Utc>>,
    user_end: Option<DateTime<Utc>>,
) -> ImportEstimate {
    let mut total_rows: u64 = 0;
    let mut per_table: Vec<TableEstimate> = Vec::new();

    for table in tables {
        let bounds = find_boundaries(executor, table, user_start, user_end).await;
        let (start, end) = match bounds {
            Some(bounds) => bounds,
            None => {
                per_table.push(TableEstimate {
                    measurement: table.clone(),
                    estimated_rows: 0,
                    estimated_seconds: 0.0,
                    error: None,
                });
                continue;
            }
        };

        match count_rows(executor, table, start, end).await {
            Ok(rows) => {
                let seconds = rows as f64 / ESTIMATE_ROWS_PER_SECOND + TABLE_OVERHEAD_SECONDS;
                total_rows = total_rows.saturating_add(rows);
                per_table.push(TableEstimate {
                    measurement: table.clone(),
                    estimated_rows: rows,
                    estimated_seconds: seconds,
                    error: None,
                });
            }
            Err(e) => {
                log::warn!("Could not estimate for '{}': {}", table, e);
                per_table.push(TableEstimate {
                    measurement: table.clone(),
                    estimated_rows: 0,
                    estimated_seconds: 0.0,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    let mut total_seconds: f64 = per_table.iter().map(|t| t.estimated_seconds).sum();
    if total_rows > 0 {
        let batches = total_rows as f64 / config.target_batch_size as f64;
        total_seconds += batches * (config.query_interval_ms as f64 / 1000.0);
    }

    ImportEstimate {
        estimated_total_rows: total_rows,
        estimated_duration_seconds: (total_seconds * 10.0).round() / 10.0,
        estimated_duration_human: human_duration(total_seconds),
        per_table_estimates: per_table,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ImportResult;
    use crate::timestamps::parse_timestamp;
    use serde_json::json;

    /// Simulates one measurement with evenly spaced rows: answers boundary,
    /// COUNT(*), and window queries from the (start, step, rows) triple.
    struct DenseTable {
        first_ns: i64,
        step_ns: i64,
        rows: u64,
    }

    impl DenseTable {
        fn last_ns(&self) -> i64 {
            self.first_ns + self.step_ns * (self.rows as i64 - 1)
        }

        fn rows_between(&self, start_ns: i64, end_ns: i64) -> u64 {
            fn div_ceil(a: i128, b: i128) -> i128 {
                (a + b - 1).div_euclid(b)
            }
            let step = self.step_ns as i128;
            let lo = div_ceil(start_ns as i128 - self.first_ns as i128, step)
                .clamp(0, self.rows as i128);
            let hi = div_ceil(end_ns as i128 - self.first_ns as i128, step)
                .clamp(0, self.rows as i128);
            (hi - lo).max(0) as u64
        }
    }

    fn quoted_bound(query: &str, marker: &str) -> Option<i64> {
        let at = query.find(marker)? + marker.len();
        let rest = &query[at..];
        let end = rest.find('\'')?;
        parse_timestamp(&rest[..end])
            .ok()
            .and_then(|dt| dt.timestamp_nanos_opt())
    }

    #[async_trait::async_trait]
    impl SourceQueryExecutor for DenseTable {
        async fn query(&self, query: &str) -> ImportResult<ResultSet> {
            if query.contains("ORDER BY time ASC LIMIT 1") {
                return Ok(ResultSet {
                    columns: vec!["time".to_string(), "value".to_string()],
                    rows: vec![vec![json!(self.first_ns), json!(1.0)]],
                    tags: Default::default(),
                });
            }
            if query.contains("ORDER BY time DESC LIMIT 1") {
                return Ok(ResultSet {
                    columns: vec!["time".to_string(), "value".to_string()],
                    rows: vec![vec![json!(self.last_ns()), json!(1.0)]],
                    tags: Default::default(),
                });
            }
            if query.contains("COUNT(*)") {
                let start_ns = quoted_bound(query, "time >= '").unwrap_or(i64::MIN);
                let end_ns = quoted_bound(query, "time < '").unwrap_or(i64::MAX);
                let count = self.rows_between(start_ns, end_ns);
                return Ok(ResultSet {
                    columns: vec!["time".to_string(), "count".to_string()],
                    rows: vec![vec![json!(0), json!(count)]],
                    tags: Default::default(),
                });
            }
            Ok(ResultSet::default())
        }
    }

    fn at(raw: &str) -> DateTime<Utc> {
        parse_timestamp(raw).unwrap()
    }

    #[tokio::test]
    async fn test_boundaries_add_one_tick_to_upper_bound() {
        // 10 rows/sec for one hour, last row at 00:59:59.9.
        let table = DenseTable {
            first_ns: at("2024-01-01T00:00:00Z").timestamp_nanos_opt().unwrap(),
            step_ns: 100_000_000,
            rows: 36_000,
        };
        let (start, end) = find_boundaries(&table, "cpu", None, None).await.unwrap();
        assert_eq!(format_rfc3339_nanos(start), "2024-01-01T00:00:00.000000000Z");
        assert_eq!(format_rfc3339_nanos(end), "2024-01-01T00:59:59.900000001Z");
    }

    #[tokio::test]
    async fn test_window_targets_batch_size_at_sampled_density() {
        // One hour at 10 rows/sec, target 2000 -> ~200s windows.
        let table = DenseTable {
            first_ns: at("2024-01-01T00:00:00Z").timestamp_nanos_opt().unwrap(),
            step_ns: 100_000_000,
            rows: 36_000,
        };
        let start = at("2024-01-01T00:00:00Z");
        let end = at("2024-01-01T01:00:00Z");
        let window = estimate_window_seconds(&table, "cpu", start, end, 2_000).await;
        assert_eq!(window, 200);

        // ceil(3600 / 200) = 18 windows to cover the hour.
        assert_eq!((3_600 + window - 1) / window, 18);
    }

    #[tokio::test]
    async fn test_window_clamp_invariant() {
        // Extremely dense: one row per nanosecond pushes the window below 1s.
        let dense = DenseTable {
            first_ns: 0,
            step_ns: 1,
            rows: 4_000_000_000,
        };
        let window =
            estimate_window_seconds(&dense, "cpu", at("1970-01-01T00:00:00Z"), at("1970-01-01T02:00:00Z"), 10).await;
        assert_eq!(window, MIN_WINDOW_SECONDS);

        // Extremely sparse over a decade clamps at the 30.5-day ceiling.
        let sparse = DenseTable {
            first_ns: 0,
            step_ns: 86_400_000_000_000 * 365,
            rows: 10,
        };
        let window = estimate_window_seconds(
            &sparse,
            "cpu",
            at("1970-01-01T00:00:00Z"),
            at("1979-12-31T00:00:00Z"),
            u64::MAX / 2,
        )
        .await;
        assert_eq!(window, MAX_WINDOW_SECONDS);
    }

    #[tokio::test]
    async fn test_range_shorter_than_any_probe_uses_entire_span() {
        let table = DenseTable {
            first_ns: 0,
            step_ns: 1_000_000_000,
            rows: 60,
        };
        let window = estimate_window_seconds(
            &table,
            "cpu",
            at("1970-01-01T00:00:00Z"),
            at("1970-01-01T00:01:00Z"),
            2_000,
        )
        .await;
        assert_eq!(window, 60);
    }

    #[tokio::test]
    async fn test_no_data_defaults_to_one_hour_windows() {
        struct EmptyCounts;

        #[async_trait::async_trait]
        impl SourceQueryExecutor for EmptyCounts {
            async fn query(&self, _query: &str) -> ImportResult<ResultSet> {
                Ok(ResultSet {
                    columns: vec!["time".to_string(), "count".to_string()],
                    rows: vec![vec![json!(0), json!(0)]],
                    tags: Default::default(),
                })
            }
        }

        let window = estimate_window_seconds(
            &EmptyCounts,
            "cpu",
            at("2024-01-01T00:00:00Z"),
            at("2024-02-01T00:00:00Z"),
            2_000,
        )
        .await;
        assert_eq!(window, 3_600);
    }

    #[tokio::test]
    async fn test_import_time_estimate_is_advisory() {
        let table = DenseTable {
            first_ns: at("2024-01-01T00:00:00Z").timestamp_nanos_opt().unwrap(),
            step_ns: 100_000_000,
            rows: 36_000,
        };
        let config = crate::config::resolve_config(vec![crate::config::ConfigOverlay {
            source_url: Some("http://localhost:8086".to_string()),
            source_database: Some("telemetry".to_string()),
            influxdb_version: Some(1),
            source_token: Some("secret".to_string()),
            ..Default::default()
        }])
        .unwrap();

        let estimate =
            estimate_import_time(&table, &config, &["cpu".to_string()], None, None).await;
        assert_eq!(estimate.estimated_total_rows, 36_000);
        // 36000 rows / 1000 rows/sec + 2s overhead + 18 batches * 0.1s delay.
        assert_eq!(estimate.estimated_duration_seconds, 39.8);
        assert_eq!(estimate.estimated_duration_human, "39.8 seconds");
        assert_eq!(estimate.per_table_estimates.len(), 1);
        assert_eq!(estimate.per_table_estimates[0].estimated_rows, 36_000);
    }

    #[test]
    fn test_human_duration_scales() {
        assert_eq!(human_duration(42.0), "42.0 seconds");
        assert_eq!(human_duration(192.0), "3.2 minutes");
        assert_eq!(human_duration(26_640.0), "7.4 hours");
        assert_eq!(human_duration(181_440.0), "2.1 days");
    }
}

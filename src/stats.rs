//! Fleet statistics and response-time history.
//!
//! All aggregates come out of SQL; nothing here scans samples in memory.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{DbError, Store};

/// Overall statistics across unpaused monitors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub overall_uptime: f64,
    pub services_up: i64,
    pub services_down: i64,
    pub avg_response_time: i64,
}

/// Compute fleet stats from the store.
///
/// `overall_uptime` is the unweighted mean of the unpaused monitors' cached
/// 24 h uptime percentages. The average response time prefers the trailing
/// 24 h of up-samples with positive latency and falls back to the monitors'
/// current response times when no such history exists.
pub fn fleet_stats(store: &Store, now: DateTime<Utc>) -> Result<StatsResponse, DbError> {
    let counts = store.fleet_counts()?;

    let (sample_count, sample_avg) = store.avg_sample_response_time_24h(now)?;
    let mut avg_response_time = if sample_count > 0 {
        sample_avg.unwrap_or(0.0) as i64
    } else {
        0
    };

    if sample_count == 0 || avg_response_time == 0 {
        if let Some(fallback) = store.avg_monitor_response_time()? {
            avg_response_time = fallback as i64;
        }
    }

    let overall_uptime = if counts.unpaused_count > 0 {
        counts.sum_uptime / counts.unpaused_count as f64
    } else {
        0.0
    };

    Ok(StatsResponse {
        overall_uptime,
        services_up: counts.up_count,
        services_down: counts.down_count,
        avg_response_time,
    })
}

/// Trailing window selected for a response-time history query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRange {
    Hour1,
    Hour12,
    Hour24,
    Week1,
    Year1,
}

impl HistoryRange {
    /// Parse a query-string range value. Unknown values fall back to 24h.
    pub fn parse(s: &str) -> Self {
        match s {
            "1h" => HistoryRange::Hour1,
            "12h" => HistoryRange::Hour12,
            "1w" => HistoryRange::Week1,
            "1y" => HistoryRange::Year1,
            _ => HistoryRange::Hour24,
        }
    }

    pub fn window(self) -> Duration {
        match self {
            HistoryRange::Hour1 => Duration::hours(1),
            HistoryRange::Hour12 => Duration::hours(12),
            HistoryRange::Hour24 => Duration::hours(24),
            HistoryRange::Week1 => Duration::days(7),
            HistoryRange::Year1 => Duration::days(365),
        }
    }

    /// Maximum number of points returned for this range.
    pub fn limit(self) -> i64 {
        match self {
            HistoryRange::Hour1 => 60,
            HistoryRange::Hour12 => 144,
            HistoryRange::Hour24 => 288,
            HistoryRange::Week1 => 168,
            HistoryRange::Year1 => 365,
        }
    }

    /// Format string for the fallback display label.
    fn label_format(self) -> &'static str {
        match self {
            HistoryRange::Hour1 | HistoryRange::Hour12 | HistoryRange::Hour24 => "%I:%M %p",
            HistoryRange::Week1 => "%a %I:%M %p",
            HistoryRange::Year1 => "%b %-d",
        }
    }
}

/// One chart point: a preformatted label, the raw timestamp, and latency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseTimePoint {
    /// Fallback display label (UTC); clients format `timestamp` themselves.
    pub time: String,
    /// ISO 8601 UTC timestamp.
    pub timestamp: String,
    pub response_time: f64,
}

/// Response-time history for a monitor over the trailing range.
///
/// The 1y range reads hourly buckets because raw samples older than the
/// retention horizon no longer exist; shorter ranges read raw samples.
pub fn response_time_history(
    store: &Store,
    monitor_id: i64,
    range: HistoryRange,
    now: DateTime<Utc>,
) -> Result<Vec<ResponseTimePoint>, DbError> {
    let cutoff = now - range.window();

    if range == HistoryRange::Year1 {
        let from_hour = cutoff.timestamp() - cutoff.timestamp() % 3600;
        let buckets = store.buckets_in_range(monitor_id, from_hour, range.limit())?;
        let points = buckets
            .iter()
            .filter_map(|b| {
                let at = DateTime::<Utc>::from_timestamp(b.bucket_hour, 0)?;
                Some(ResponseTimePoint {
                    time: at.format(range.label_format()).to_string(),
                    timestamp: at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    response_time: b.avg_response_time.unwrap_or(0.0),
                })
            })
            .collect();
        return Ok(points);
    }

    let samples = store.samples_in_range(monitor_id, cutoff, now, range.limit())?;
    let points = samples
        .iter()
        .map(|s| ResponseTimePoint {
            time: s.created_at.format(range.label_format()).to_string(),
            timestamp: s.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            response_time: s.response_time as f64,
        })
        .collect();

    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MonitorPatch, MonitorStatus, NewMonitor};
    use tempfile::NamedTempFile;

    fn open_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn add_monitor(store: &Store, name: &str, status: MonitorStatus, rt: i64, uptime: f64) -> i64 {
        let monitor = store
            .create_monitor(&NewMonitor {
                name: name.to_string(),
                url: format!("https://{}.example", name),
                ..Default::default()
            })
            .unwrap();
        store
            .update_monitor(
                monitor.id,
                MonitorPatch::Runtime {
                    status,
                    response_time: rt,
                    uptime,
                    last_check: "just now".to_string(),
                    updated_at: Utc::now(),
                },
            )
            .unwrap();
        monitor.id
    }

    #[test]
    fn test_range_parsing_defaults_to_24h() {
        assert_eq!(HistoryRange::parse("1h"), HistoryRange::Hour1);
        assert_eq!(HistoryRange::parse("12h"), HistoryRange::Hour12);
        assert_eq!(HistoryRange::parse("24h"), HistoryRange::Hour24);
        assert_eq!(HistoryRange::parse("1w"), HistoryRange::Week1);
        assert_eq!(HistoryRange::parse("1y"), HistoryRange::Year1);
        assert_eq!(HistoryRange::parse("bogus"), HistoryRange::Hour24);
        assert_eq!(HistoryRange::parse(""), HistoryRange::Hour24);
    }

    #[test]
    fn test_range_limits() {
        assert_eq!(HistoryRange::Hour1.limit(), 60);
        assert_eq!(HistoryRange::Hour12.limit(), 144);
        assert_eq!(HistoryRange::Hour24.limit(), 288);
        assert_eq!(HistoryRange::Week1.limit(), 168);
        assert_eq!(HistoryRange::Year1.limit(), 365);
    }

    #[test]
    fn test_fleet_stats_empty_fleet_is_all_zero() {
        let (_tmp, store) = open_store();
        let stats = fleet_stats(&store, Utc::now()).unwrap();
        assert_eq!(
            stats,
            StatsResponse {
                overall_uptime: 0.0,
                services_up: 0,
                services_down: 0,
                avg_response_time: 0,
            }
        );
    }

    #[test]
    fn test_fleet_stats_averages_unpaused_uptime() {
        let (_tmp, store) = open_store();
        let up_id = add_monitor(&store, "up", MonitorStatus::Up, 80, 100.0);
        add_monitor(&store, "down", MonitorStatus::Down, 0, 50.0);
        let paused_id = add_monitor(&store, "paused", MonitorStatus::Up, 10, 100.0);
        store
            .update_monitor(paused_id, MonitorPatch::Pause(true))
            .unwrap();

        let now = Utc::now();
        store
            .insert_sample(up_id, MonitorStatus::Up, 120, now)
            .unwrap();
        store
            .insert_sample(up_id, MonitorStatus::Up, 80, now)
            .unwrap();

        let stats = fleet_stats(&store, now).unwrap();
        assert_eq!(stats.services_up, 1);
        assert_eq!(stats.services_down, 1);
        assert!((stats.overall_uptime - 75.0).abs() < 1e-6);
        assert_eq!(stats.avg_response_time, 100);
    }

    #[test]
    fn test_fleet_stats_falls_back_to_monitor_rows() {
        let (_tmp, store) = open_store();
        add_monitor(&store, "a", MonitorStatus::Up, 100, 100.0);
        add_monitor(&store, "b", MonitorStatus::Up, 300, 100.0);

        // No samples at all, so the monitor-row fallback applies.
        let stats = fleet_stats(&store, Utc::now()).unwrap();
        assert_eq!(stats.avg_response_time, 200);
    }

    #[test]
    fn test_history_points_carry_timestamps() {
        let (_tmp, store) = open_store();
        let id = add_monitor(&store, "hist", MonitorStatus::Up, 100, 100.0);
        let now = Utc::now();
        store
            .insert_sample(id, MonitorStatus::Up, 150, now - Duration::minutes(5))
            .unwrap();

        let points = response_time_history(&store, id, HistoryRange::Hour24, now).unwrap();
        assert_eq!(points.len(), 1);
        assert!((points[0].response_time - 150.0).abs() < 1e-6);
        assert!(points[0].timestamp.ends_with('Z'));
        assert!(!points[0].time.is_empty());
    }

    #[test]
    fn test_year_history_reads_buckets() {
        let (_tmp, store) = open_store();
        let id = add_monitor(&store, "yearly", MonitorStatus::Up, 100, 100.0);

        let hour = Utc::now().timestamp() - Utc::now().timestamp() % 3600 - 48 * 3600;
        store
            .upsert_buckets(&[crate::db::CheckBucket {
                monitor_id: id,
                bucket_hour: hour,
                total_checks: 60,
                up_checks: 59,
                avg_response_time: Some(222.0),
                min_response_time: Some(100),
                max_response_time: Some(400),
            }])
            .unwrap();

        let points = response_time_history(&store, id, HistoryRange::Year1, Utc::now()).unwrap();
        assert_eq!(points.len(), 1);
        assert!((points[0].response_time - 222.0).abs() < 1e-6);
    }
}

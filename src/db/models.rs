//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounds for a monitor's check interval, in seconds.
pub const MIN_CHECK_INTERVAL: i64 = 10;
pub const MAX_CHECK_INTERVAL: i64 = 3600;
pub const DEFAULT_CHECK_INTERVAL: i64 = 60;

/// Clamp a check interval into the supported range.
///
/// Applied on every write path and again in the scheduler, so an
/// out-of-range value that slips through one layer cannot crash the other.
pub fn clamp_check_interval(secs: i64) -> i64 {
    secs.clamp(MIN_CHECK_INTERVAL, MAX_CHECK_INTERVAL)
}

/// Health classification of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Unknown,
    Up,
    Down,
}

impl MonitorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MonitorStatus::Unknown => "unknown",
            MonitorStatus::Up => "up",
            MonitorStatus::Down => "down",
        }
    }

    /// Parse a status column value. Anything unrecognized reads as unknown.
    pub fn from_db(s: &str) -> Self {
        match s {
            "up" => MonitorStatus::Up,
            "down" => MonitorStatus::Down,
            _ => MonitorStatus::Unknown,
        }
    }
}

/// A monitored target plus its cached runtime state.
///
/// Runtime fields (`status`, `response_time`, `uptime`, `last_check`) are
/// overwritten by the probe executor; the sample history is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Monitor {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub uptime: f64,
    pub status: MonitorStatus,
    pub response_time: i64,
    pub last_check: String,
    #[serde(default)]
    pub is_third_party: bool,
    #[serde(default)]
    pub icon: String,
    pub check_interval: i64,
    pub paused: bool,
    /// Non-empty iff this monitor is owned by the YAML config reconciler.
    #[serde(skip)]
    pub config_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a monitor. The store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewMonitor {
    pub name: String,
    pub url: String,
    pub icon: String,
    pub check_interval: i64,
    pub is_third_party: bool,
    pub paused: bool,
    pub config_hash: String,
    pub status: MonitorStatus,
    pub uptime: f64,
    pub response_time: i64,
    pub last_check: String,
}

impl Default for NewMonitor {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            icon: String::new(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            is_third_party: false,
            paused: false,
            config_hash: String::new(),
            status: MonitorStatus::Unknown,
            uptime: 0.0,
            response_time: 0,
            last_check: "never".to_string(),
        }
    }
}

/// A partial update to a monitor row.
///
/// Each variant touches a disjoint field set: a full edit from the API, a
/// pause toggle, or the runtime state written after a probe.
#[derive(Debug, Clone)]
pub enum MonitorPatch {
    Edit {
        name: String,
        url: String,
        icon: String,
        check_interval: i64,
        is_third_party: bool,
    },
    Pause(bool),
    Runtime {
        status: MonitorStatus,
        response_time: i64,
        uptime: f64,
        last_check: String,
        updated_at: DateTime<Utc>,
    },
}

/// A single persisted probe outcome. Immutable after insert.
#[derive(Debug, Clone)]
pub struct CheckSample {
    pub monitor_id: i64,
    pub status: MonitorStatus,
    pub response_time: i64,
    pub created_at: DateTime<Utc>,
}

/// An hourly aggregate of samples, produced by the retention pipeline.
///
/// `avg`/`min`/`max` only consider samples with a positive response time,
/// so an all-down hour carries counts but no latency figures.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckBucket {
    pub monitor_id: i64,
    pub bucket_hour: i64,
    pub total_checks: i64,
    pub up_checks: i64,
    pub avg_response_time: Option<f64>,
    pub min_response_time: Option<i64>,
    pub max_response_time: Option<i64>,
}

/// Counts of up/total samples for a monitor over a trailing window.
#[derive(Debug, Clone, Copy, Default)]
pub struct UptimeCounts {
    pub total: i64,
    pub up: i64,
}

/// Fleet-wide aggregates over unpaused monitors.
#[derive(Debug, Clone, Copy, Default)]
pub struct FleetCounts {
    pub unpaused_count: i64,
    pub up_count: i64,
    pub down_count: i64,
    pub sum_uptime: f64,
}

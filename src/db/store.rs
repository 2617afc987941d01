//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use super::models::*;

/// Timestamp format used for all persisted datetimes (UTC).
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
///
/// The connection lives behind a mutex, so there is exactly one writer at a
/// time; WAL mode lets readers proceed alongside it and the busy timeout
/// absorbs lock contention.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        conn.execute_batch(include_str!("../../migrations/000002_indexes.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 2 failed: {}", e)))?;

        Ok(())
    }

    // --- Monitor CRUD ---

    /// Get all monitors.
    pub fn list_monitors(&self) -> Result<Vec<Monitor>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, url, uptime, status, response_time, last_check, is_third_party,
                    icon, check_interval, paused, config_hash, created_at, updated_at
             FROM monitors ORDER BY id ASC",
        )?;

        let monitors = stmt
            .query_map([], map_monitor_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(monitors)
    }

    /// Get a monitor by ID.
    pub fn get_monitor(&self, id: i64) -> Result<Monitor, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, url, uptime, status, response_time, last_check, is_third_party,
                    icon, check_interval, paused, config_hash, created_at, updated_at
             FROM monitors WHERE id = ?1",
            params![id],
            map_monitor_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Create a monitor and return it with its assigned ID and timestamps.
    pub fn create_monitor(&self, new: &NewMonitor) -> Result<Monitor, DbError> {
        if new.name.is_empty() || new.url.is_empty() {
            return Err(DbError::Invalid("name and url are required".to_string()));
        }

        let now = format_ts(Utc::now());
        let interval = clamp_check_interval(new.check_interval);

        let id = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO monitors (name, url, uptime, status, response_time, last_check,
                                       is_third_party, icon, check_interval, paused, config_hash,
                                       created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    new.name,
                    new.url,
                    new.uptime,
                    new.status.as_str(),
                    new.response_time,
                    new.last_check,
                    new.is_third_party,
                    new.icon,
                    interval,
                    new.paused,
                    new.config_hash,
                    now,
                    now,
                ],
            )?;
            conn.last_insert_rowid()
        };

        self.get_monitor(id)
    }

    /// Apply a partial update to a monitor and return the refreshed row.
    pub fn update_monitor(&self, id: i64, patch: MonitorPatch) -> Result<Monitor, DbError> {
        let changed = {
            let conn = self.conn.lock().unwrap();
            match patch {
                MonitorPatch::Edit {
                    name,
                    url,
                    icon,
                    check_interval,
                    is_third_party,
                } => {
                    if name.is_empty() || url.is_empty() {
                        return Err(DbError::Invalid("name and url are required".to_string()));
                    }
                    conn.execute(
                        "UPDATE monitors SET name = ?1, url = ?2, icon = ?3, check_interval = ?4,
                                is_third_party = ?5, updated_at = ?6 WHERE id = ?7",
                        params![
                            name,
                            url,
                            icon,
                            clamp_check_interval(check_interval),
                            is_third_party,
                            format_ts(Utc::now()),
                            id,
                        ],
                    )?
                }
                MonitorPatch::Pause(paused) => conn.execute(
                    "UPDATE monitors SET paused = ?1, updated_at = ?2 WHERE id = ?3",
                    params![paused, format_ts(Utc::now()), id],
                )?,
                MonitorPatch::Runtime {
                    status,
                    response_time,
                    uptime,
                    last_check,
                    updated_at,
                } => conn.execute(
                    "UPDATE monitors SET status = ?1, response_time = ?2, uptime = ?3,
                            last_check = ?4, updated_at = ?5 WHERE id = ?6",
                    params![
                        status.as_str(),
                        response_time,
                        uptime,
                        last_check,
                        format_ts(updated_at),
                        id,
                    ],
                )?,
            }
        };

        if changed == 0 {
            return Err(DbError::NotFound);
        }
        self.get_monitor(id)
    }

    /// Update YAML-managed fields in place, preserving runtime state.
    ///
    /// Used by the config reconciler when an entry's hash changed: target
    /// fields and the hash come from YAML while status, uptime, response
    /// time, last check and created_at stay untouched.
    pub fn update_monitor_config(&self, id: i64, new: &NewMonitor) -> Result<Monitor, DbError> {
        let changed = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE monitors SET name = ?1, url = ?2, icon = ?3, check_interval = ?4,
                        is_third_party = ?5, paused = ?6, config_hash = ?7, updated_at = ?8
                 WHERE id = ?9",
                params![
                    new.name,
                    new.url,
                    new.icon,
                    clamp_check_interval(new.check_interval),
                    new.is_third_party,
                    new.paused,
                    new.config_hash,
                    format_ts(Utc::now()),
                    id,
                ],
            )?
        };

        if changed == 0 {
            return Err(DbError::NotFound);
        }
        self.get_monitor(id)
    }

    /// Delete a monitor. Its samples stay behind for retention to expire.
    pub fn delete_monitor(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM monitors WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Find a monitor by exact name and URL.
    pub fn find_monitor_by_target(&self, name: &str, url: &str) -> Result<Option<Monitor>, DbError> {
        let conn = self.conn.lock().unwrap();
        let monitor = conn
            .query_row(
                "SELECT id, name, url, uptime, status, response_time, last_check, is_third_party,
                        icon, check_interval, paused, config_hash, created_at, updated_at
                 FROM monitors WHERE name = ?1 AND url = ?2",
                params![name, url],
                map_monitor_row,
            )
            .optional()?;
        Ok(monitor)
    }

    // --- Check samples ---

    /// Record a probe outcome.
    pub fn insert_sample(
        &self,
        monitor_id: i64,
        status: MonitorStatus,
        response_time: i64,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO check_samples (monitor_id, status, response_time, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![monitor_id, status.as_str(), response_time, format_ts(at)],
        )?;
        Ok(())
    }

    /// Get samples for a monitor within a time range, oldest first.
    pub fn samples_in_range(
        &self,
        monitor_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CheckSample>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT monitor_id, status, response_time, created_at FROM check_samples
             WHERE monitor_id = ?1 AND created_at > ?2 AND created_at <= ?3
             ORDER BY created_at ASC LIMIT ?4",
        )?;

        let samples = stmt
            .query_map(
                params![monitor_id, format_ts(from), format_ts(to), limit],
                |row| {
                    let status: String = row.get(1)?;
                    let time_str: String = row.get(3)?;
                    Ok(CheckSample {
                        monitor_id: row.get(0)?,
                        status: MonitorStatus::from_db(&status),
                        response_time: row.get(2)?,
                        created_at: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    /// Count samples and up-samples for a monitor over the trailing 24 hours.
    pub fn uptime_24h(&self, monitor_id: i64, now: DateTime<Utc>) -> Result<UptimeCounts, DbError> {
        let cutoff = format_ts(now - chrono::Duration::hours(24));
        let conn = self.conn.lock().unwrap();
        let counts = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'up' THEN 1 ELSE 0 END), 0)
             FROM check_samples WHERE monitor_id = ?1 AND created_at > ?2",
            params![monitor_id, cutoff],
            |row| {
                Ok(UptimeCounts {
                    total: row.get(0)?,
                    up: row.get(1)?,
                })
            },
        )?;
        Ok(counts)
    }

    /// Delete samples older than the cutoff and return how many went.
    pub fn delete_samples_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM check_samples WHERE created_at < ?1",
            params![format_ts(cutoff)],
        )?;
        Ok(deleted)
    }

    // --- Fleet aggregates ---

    /// Aggregate counts over unpaused monitors.
    pub fn fleet_counts(&self) -> Result<FleetCounts, DbError> {
        let conn = self.conn.lock().unwrap();
        let counts = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'up' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'down' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(uptime), 0.0)
             FROM monitors WHERE paused = 0",
            [],
            |row| {
                Ok(FleetCounts {
                    unpaused_count: row.get(0)?,
                    up_count: row.get(1)?,
                    down_count: row.get(2)?,
                    sum_uptime: row.get(3)?,
                })
            },
        )?;
        Ok(counts)
    }

    /// Average response time over up-samples with positive latency in the
    /// trailing 24 hours. Returns the matching sample count alongside.
    pub fn avg_sample_response_time_24h(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(i64, Option<f64>), DbError> {
        let cutoff = format_ts(now - chrono::Duration::hours(24));
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT COUNT(*), AVG(response_time) FROM check_samples
             WHERE created_at > ?1 AND response_time > 0 AND status = 'up'",
            params![cutoff],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<f64>>(1)?)),
        )?;
        Ok(result)
    }

    /// Fallback average from the monitors' current response times, used when
    /// there is no sample history yet.
    pub fn avg_monitor_response_time(&self) -> Result<Option<f64>, DbError> {
        let conn = self.conn.lock().unwrap();
        let avg = conn.query_row(
            "SELECT AVG(response_time) FROM monitors
             WHERE paused = 0 AND status = 'up' AND response_time > 0",
            [],
            |row| row.get::<_, Option<f64>>(0),
        )?;
        Ok(avg)
    }

    // --- Hourly buckets ---

    /// Aggregate samples in `[from, to)` into per-(monitor, hour) buckets.
    ///
    /// Grouping happens in SQL: the stored timestamp text is truncated to
    /// its hour (`substr` to "YYYY-MM-DD HH") and converted to a unix
    /// timestamp, and avg/min/max ignore non-positive response times.
    pub fn aggregate_samples_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CheckBucket>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT monitor_id,
                    CAST(strftime('%s', substr(created_at, 1, 13) || ':00:00') AS INTEGER) AS bucket_hour,
                    COUNT(*) AS total_checks,
                    SUM(CASE WHEN status = 'up' THEN 1 ELSE 0 END) AS up_checks,
                    AVG(CASE WHEN response_time > 0 THEN response_time END) AS avg_response_time,
                    MIN(CASE WHEN response_time > 0 THEN response_time END) AS min_response_time,
                    MAX(CASE WHEN response_time > 0 THEN response_time END) AS max_response_time
             FROM check_samples
             WHERE created_at >= ?1 AND created_at < ?2
             GROUP BY monitor_id, bucket_hour
             ORDER BY monitor_id, bucket_hour",
        )?;

        let buckets = stmt
            .query_map(params![format_ts(from), format_ts(to)], |row| {
                Ok(CheckBucket {
                    monitor_id: row.get(0)?,
                    bucket_hour: row.get(1)?,
                    total_checks: row.get(2)?,
                    up_checks: row.get(3)?,
                    avg_response_time: row.get(4)?,
                    min_response_time: row.get(5)?,
                    max_response_time: row.get(6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(buckets)
    }

    /// Upsert a batch of buckets in one transaction.
    pub fn upsert_buckets(&self, buckets: &[CheckBucket]) -> Result<(), DbError> {
        if buckets.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO check_buckets (monitor_id, bucket_hour, total_checks, up_checks,
                        avg_response_time, min_response_time, max_response_time, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(monitor_id, bucket_hour) DO UPDATE SET
                        total_checks = excluded.total_checks,
                        up_checks = excluded.up_checks,
                        avg_response_time = excluded.avg_response_time,
                        min_response_time = excluded.min_response_time,
                        max_response_time = excluded.max_response_time",
            )?;

            for b in buckets {
                stmt.execute(params![
                    b.monitor_id,
                    b.bucket_hour,
                    b.total_checks,
                    b.up_checks,
                    b.avg_response_time,
                    b.min_response_time,
                    b.max_response_time,
                    format_ts(Utc::now()),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get hourly buckets for a monitor starting at `from_hour`, oldest first.
    pub fn buckets_in_range(
        &self,
        monitor_id: i64,
        from_hour: i64,
        limit: i64,
    ) -> Result<Vec<CheckBucket>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT monitor_id, bucket_hour, total_checks, up_checks,
                    avg_response_time, min_response_time, max_response_time
             FROM check_buckets
             WHERE monitor_id = ?1 AND bucket_hour >= ?2
             ORDER BY bucket_hour ASC LIMIT ?3",
        )?;

        let buckets = stmt
            .query_map(params![monitor_id, from_hour, limit], |row| {
                Ok(CheckBucket {
                    monitor_id: row.get(0)?,
                    bucket_hour: row.get(1)?,
                    total_checks: row.get(2)?,
                    up_checks: row.get(3)?,
                    avg_response_time: row.get(4)?,
                    min_response_time: row.get(5)?,
                    max_response_time: row.get(6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(buckets)
    }
}

fn map_monitor_row(row: &rusqlite::Row<'_>) -> SqlResult<Monitor> {
    let status: String = row.get(4)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;
    Ok(Monitor {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        uptime: row.get(3)?,
        status: MonitorStatus::from_db(&status),
        response_time: row.get(5)?,
        last_check: row.get(6)?,
        is_third_party: row.get(7)?,
        icon: row.get(8)?,
        check_interval: row.get(9)?,
        paused: row.get(10)?,
        config_hash: row.get(11)?,
        created_at: parse_db_time(&created_at).unwrap_or_else(Utc::now),
        updated_at: parse_db_time(&updated_at).unwrap_or_else(Utc::now),
    })
}

/// Format a datetime for storage.
pub fn format_ts(dt: DateTime<Utc>) -> String {
    dt.format(TS_FORMAT).to_string()
}

/// Parse a datetime string from the database.
pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    // Try various formats
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Try ISO 8601
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

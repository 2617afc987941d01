//! Probe executor: runs a single health check end to end.
//!
//! Classifies the target by URL prefix, measures latency to first response
//! headers, persists the sample, refreshes the monitor's cached runtime
//! state, and publishes the update.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db::{DbError, MonitorPatch, MonitorStatus, Store};
use crate::events::EventBus;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;
const PROBE_USER_AGENT: &str = "NanoStatus/1.0";

/// Synthetic latency reported for the `ping://` stub.
const PING_LATENCY_MS: i64 = 10;

/// Pause between probes during the boot sweep, to avoid a burst.
const SWEEP_PAUSE: Duration = Duration::from_millis(500);

/// How a monitor URL is probed, decided by a prefix match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// HTTP(S) GET against the resolved URL.
    Http(String),
    /// `ping://` stub: reported up with synthetic latency, no network I/O.
    Ping,
}

impl ProbeTarget {
    /// Resolve the effective target. Schemeless URLs default to https.
    pub fn classify(raw: &str) -> Self {
        if raw.starts_with("ping://") {
            ProbeTarget::Ping
        } else if raw.starts_with("http://") || raw.starts_with("https://") {
            ProbeTarget::Http(raw.to_string())
        } else {
            ProbeTarget::Http(format!("https://{}", raw))
        }
    }
}

/// Executes probes against monitors using one shared pooled HTTP client.
pub struct Checker {
    store: Arc<Store>,
    bus: EventBus,
    client: reqwest::Client,
}

impl Checker {
    /// Build the checker and its shared HTTP client.
    pub fn new(store: Arc<Store>, bus: EventBus) -> Result<Arc<Self>, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()?;

        Ok(Arc::new(Self { store, bus, client }))
    }

    /// Run one health check for a monitor.
    ///
    /// Missing or paused monitors return silently. Database failures are
    /// logged and the cycle continues; the next probe overwrites whatever
    /// this one could not persist.
    pub async fn check(&self, monitor_id: i64) {
        let monitor = match self.store.get_monitor(monitor_id) {
            Ok(m) => m,
            Err(DbError::NotFound) => return,
            Err(e) => {
                tracing::error!("Checker: failed to load monitor {}: {}", monitor_id, e);
                return;
            }
        };

        if monitor.paused {
            tracing::debug!("Checker: skipping check for paused monitor {}", monitor_id);
            return;
        }

        let now = Utc::now();
        let (status, response_time) = match ProbeTarget::classify(&monitor.url) {
            ProbeTarget::Ping => (MonitorStatus::Up, PING_LATENCY_MS),
            ProbeTarget::Http(url) => self.probe_http(&url).await,
        };

        if let Err(e) = self
            .store
            .insert_sample(monitor_id, status, response_time, now)
        {
            tracing::error!("Checker: failed to save sample for monitor {}: {}", monitor_id, e);
        }

        let last_check = relative_label(now.signed_duration_since(monitor.updated_at));
        let uptime = self.uptime_percent(monitor_id, status, now);

        let refreshed = match self.store.update_monitor(
            monitor_id,
            MonitorPatch::Runtime {
                status,
                response_time,
                uptime,
                last_check,
                updated_at: now,
            },
        ) {
            Ok(m) => m,
            // Deleted while the probe was in flight; nothing to report.
            Err(DbError::NotFound) => return,
            Err(e) => {
                tracing::error!("Checker: failed to update monitor {}: {}", monitor_id, e);
                return;
            }
        };

        tracing::debug!(
            "Checker: monitor {} is {} ({} ms)",
            monitor_id,
            status.as_str(),
            response_time
        );

        self.bus.publish("monitor_update", &refreshed);
        self.bus.publish_stats_debounced();
    }

    /// Sequentially probe every unpaused monitor, with a pause between
    /// probes. Used once at boot before the scheduler's steady loop.
    pub async fn check_all(&self) {
        let monitors = match self.store.list_monitors() {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("Checker: failed to list monitors for sweep: {}", e);
                return;
            }
        };

        for monitor in monitors {
            if monitor.paused {
                continue;
            }
            self.check(monitor.id).await;
            tokio::time::sleep(SWEEP_PAUSE).await;
        }
    }

    /// GET the URL and classify the outcome.
    ///
    /// Latency is wall-clock from request start to headers received; the
    /// body is dropped unread. Any transport error reads as down with zero
    /// latency, as does a URL without a host.
    async fn probe_http(&self, url: &str) -> (MonitorStatus, i64) {
        let parsed = match reqwest::Url::parse(url) {
            Ok(u) => u,
            Err(_) => return (MonitorStatus::Down, 0),
        };
        if parsed.host_str().map_or(true, str::is_empty) {
            return (MonitorStatus::Down, 0);
        }

        let start = Instant::now();
        let result = self
            .client
            .get(parsed)
            .header(header::USER_AGENT, PROBE_USER_AGENT)
            .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
            .header(header::PRAGMA, "no-cache")
            .header(header::EXPIRES, "0")
            .send()
            .await;

        match result {
            Ok(response) => {
                let elapsed_ms = start.elapsed().as_millis() as i64;
                let code = response.status().as_u16();
                drop(response);
                if (200..400).contains(&code) {
                    (MonitorStatus::Up, elapsed_ms)
                } else {
                    (MonitorStatus::Down, 0)
                }
            }
            Err(e) => {
                tracing::info!("Checker: probe failed for {}: {}", url, e);
                (MonitorStatus::Down, 0)
            }
        }
    }

    /// Uptime over the trailing 24 h of samples, or the current status when
    /// no samples exist yet.
    fn uptime_percent(&self, monitor_id: i64, status: MonitorStatus, now: DateTime<Utc>) -> f64 {
        let from_status = || match status {
            MonitorStatus::Up => 100.0,
            _ => 0.0,
        };

        match self.store.uptime_24h(monitor_id, now) {
            Ok(counts) if counts.total > 0 => counts.up as f64 / counts.total as f64 * 100.0,
            Ok(_) => from_status(),
            Err(e) => {
                tracing::error!("Checker: failed to compute uptime for {}: {}", monitor_id, e);
                from_status()
            }
        }
    }
}

/// Human-readable age of the previous check.
pub fn relative_label(since: ChronoDuration) -> String {
    let minutes = since.num_minutes();
    if since.num_seconds() < 60 {
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 24 * 60 {
        format!("{}h ago", minutes / 60)
    } else {
        format!("{}d ago", minutes / (24 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewMonitor;
    use tempfile::NamedTempFile;

    fn open_checker() -> (NamedTempFile, Arc<Store>, Arc<Checker>) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let bus = EventBus::new(store.clone());
        let checker = Checker::new(store.clone(), bus).unwrap();
        (tmp, store, checker)
    }

    fn add_monitor(store: &Store, url: &str) -> i64 {
        store
            .create_monitor(&NewMonitor {
                name: "Probe".to_string(),
                url: url.to_string(),
                ..Default::default()
            })
            .unwrap()
            .id
    }

    #[test]
    fn test_classify_by_prefix() {
        assert_eq!(ProbeTarget::classify("ping://gateway"), ProbeTarget::Ping);
        assert_eq!(
            ProbeTarget::classify("http://example.com"),
            ProbeTarget::Http("http://example.com".to_string())
        );
        assert_eq!(
            ProbeTarget::classify("https://example.com"),
            ProbeTarget::Http("https://example.com".to_string())
        );
        assert_eq!(
            ProbeTarget::classify("example.com"),
            ProbeTarget::Http("https://example.com".to_string())
        );
    }

    #[test]
    fn test_relative_label_boundaries() {
        assert_eq!(relative_label(ChronoDuration::seconds(0)), "just now");
        assert_eq!(relative_label(ChronoDuration::seconds(59)), "just now");
        assert_eq!(relative_label(ChronoDuration::seconds(60)), "1m ago");
        assert_eq!(relative_label(ChronoDuration::minutes(59)), "59m ago");
        assert_eq!(relative_label(ChronoDuration::minutes(60)), "1h ago");
        assert_eq!(relative_label(ChronoDuration::hours(23)), "23h ago");
        assert_eq!(relative_label(ChronoDuration::hours(24)), "1d ago");
        assert_eq!(relative_label(ChronoDuration::days(3)), "3d ago");
    }

    #[tokio::test]
    async fn test_ping_stub_is_up_without_network() {
        let (_tmp, store, checker) = open_checker();
        let id = add_monitor(&store, "ping://core-switch");

        checker.check(id).await;

        let now = Utc::now();
        let samples = store
            .samples_in_range(id, now - ChronoDuration::hours(1), now, 10)
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].status, MonitorStatus::Up);
        assert_eq!(samples[0].response_time, 10);

        let monitor = store.get_monitor(id).unwrap();
        assert_eq!(monitor.status, MonitorStatus::Up);
        assert_eq!(monitor.response_time, 10);
        assert!((monitor.uptime - 100.0).abs() < 1e-6);
        assert_eq!(monitor.last_check, "just now");
    }

    #[tokio::test]
    async fn test_malformed_url_classifies_down() {
        let (_tmp, store, checker) = open_checker();
        // A schemeless URL with spaces fails to parse, so no request is made.
        let id = add_monitor(&store, "not a real url");

        checker.check(id).await;

        let now = Utc::now();
        let samples = store
            .samples_in_range(id, now - ChronoDuration::hours(1), now, 10)
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].status, MonitorStatus::Down);
        assert_eq!(samples[0].response_time, 0);

        let monitor = store.get_monitor(id).unwrap();
        assert_eq!(monitor.status, MonitorStatus::Down);
        assert!((monitor.uptime - 0.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_paused_monitor_is_not_probed() {
        let (_tmp, store, checker) = open_checker();
        let id = add_monitor(&store, "ping://ignored");
        store
            .update_monitor(id, MonitorPatch::Pause(true))
            .unwrap();

        checker.check(id).await;

        let now = Utc::now();
        let samples = store
            .samples_in_range(id, now - ChronoDuration::hours(1), now, 10)
            .unwrap();
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn test_uptime_recomputed_from_samples() {
        let (_tmp, store, checker) = open_checker();
        let id = add_monitor(&store, "ping://router");

        // One old down sample plus the probe's fresh up sample: 50%.
        store
            .insert_sample(
                id,
                MonitorStatus::Down,
                0,
                Utc::now() - ChronoDuration::minutes(10),
            )
            .unwrap();

        checker.check(id).await;

        let monitor = store.get_monitor(id).unwrap();
        assert!((monitor.uptime - 50.0).abs() < 1e-6);
    }
}

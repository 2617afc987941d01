//! Per-monitor probe scheduling.
//!
//! One recurring job per unpaused monitor, kept in line with the monitor
//! table by a periodic reconciliation pass.

mod retention;

pub use retention::*;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::time::MissedTickBehavior;

use crate::db::{clamp_check_interval, Store};
use crate::probe::Checker;

/// How often the job map is reconciled against the monitor table.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Settle time between stopping a job and starting its replacement.
const REPLACE_QUIESCE: Duration = Duration::from_millis(100);

struct MonitorJob {
    stop: broadcast::Sender<()>,
    interval_secs: i64,
}

/// Owns the monitor-id → job map and the reconciliation loop.
pub struct Scheduler {
    store: Arc<Store>,
    checker: Arc<Checker>,
    jobs: RwLock<HashMap<i64, MonitorJob>>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, checker: Arc<Checker>) -> Arc<Self> {
        Arc::new(Self {
            store,
            checker,
            jobs: RwLock::new(HashMap::new()),
        })
    }

    /// Run the boot sweep, then keep the job map reconciled every 30 s.
    pub fn start(self: Arc<Self>) {
        tokio::spawn(async move {
            self.checker.check_all().await;
            self.reconcile().await;

            let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.reconcile().await;
            }
        });
    }

    /// Bring the job map in line with the monitor table.
    ///
    /// Unpaused monitors get a job at their clamped interval; paused and
    /// deleted monitors lose theirs; an interval change replaces the job.
    /// Matching jobs are left untouched, which is the steady state.
    pub async fn reconcile(&self) {
        let monitors = match self.store.list_monitors() {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("Scheduler: failed to load monitors for reconcile: {}", e);
                return;
            }
        };

        let mut desired: HashMap<i64, i64> = HashMap::new();
        for monitor in &monitors {
            if !monitor.paused {
                desired.insert(monitor.id, clamp_check_interval(monitor.check_interval));
            }
        }

        // Snapshot so the lock is never held across job churn or probes.
        let current: HashMap<i64, i64> = {
            let jobs = self.jobs.read().await;
            jobs.iter().map(|(id, j)| (*id, j.interval_secs)).collect()
        };

        for (&id, &interval) in &desired {
            match current.get(&id) {
                Some(&active) if active == interval => {}
                Some(&active) => {
                    tracing::info!(
                        "Scheduler: interval for monitor {} changed {}s -> {}s, replacing job",
                        id,
                        active,
                        interval
                    );
                    self.stop_job(id).await;
                    tokio::time::sleep(REPLACE_QUIESCE).await;
                    self.start_job(id, interval).await;
                }
                None => self.start_job(id, interval).await,
            }
        }

        for &id in current.keys() {
            if !desired.contains_key(&id) {
                self.stop_job(id).await;
            }
        }
    }

    async fn start_job(&self, monitor_id: i64, interval_secs: i64) {
        let (stop_tx, stop_rx) = broadcast::channel(1);

        {
            let mut jobs = self.jobs.write().await;
            if let Some(old) = jobs.insert(
                monitor_id,
                MonitorJob {
                    stop: stop_tx,
                    interval_secs,
                },
            ) {
                // One job per monitor, always.
                let _ = old.stop.send(());
            }
        }

        tracing::info!(
            "Scheduler: added job for monitor {} every {}s",
            monitor_id,
            interval_secs
        );

        let checker = self.checker.clone();
        tokio::spawn(run_probe_loop(
            checker,
            monitor_id,
            interval_secs as u64,
            stop_rx,
        ));
    }

    async fn stop_job(&self, monitor_id: i64) {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.remove(&monitor_id) {
            let _ = job.stop.send(());
            tracing::info!("Scheduler: removed job for monitor {}", monitor_id);
        }
    }
}

/// Drive probes for one monitor until told to stop.
///
/// The first tick fires immediately. Each probe runs in its own task so a
/// panic cannot take the loop down, and awaiting it keeps probes for this
/// monitor strictly serial.
async fn run_probe_loop(
    checker: Arc<Checker>,
    monitor_id: i64,
    interval_secs: u64,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {
                let checker = checker.clone();
                let probe = tokio::spawn(async move { checker.check(monitor_id).await });
                if let Err(e) = probe.await {
                    tracing::error!("Scheduler: probe task for monitor {} failed: {}", monitor_id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MonitorPatch, NewMonitor};
    use crate::events::EventBus;
    use tempfile::NamedTempFile;

    fn open_scheduler() -> (NamedTempFile, Arc<Store>, Arc<Scheduler>) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let bus = EventBus::new(store.clone());
        let checker = Checker::new(store.clone(), bus).unwrap();
        let scheduler = Scheduler::new(store.clone(), checker);
        (tmp, store, scheduler)
    }

    // ping:// targets keep these tests off the network.
    fn add_monitor(store: &Store, name: &str, interval: i64, paused: bool) -> i64 {
        store
            .create_monitor(&NewMonitor {
                name: name.to_string(),
                url: format!("ping://{}", name),
                check_interval: interval,
                paused,
                ..Default::default()
            })
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_reconcile_creates_jobs_for_unpaused_only() {
        let (_tmp, store, scheduler) = open_scheduler();
        let active = add_monitor(&store, "active", 60, false);
        add_monitor(&store, "asleep", 60, true);

        scheduler.reconcile().await;

        let jobs = scheduler.jobs.read().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs.get(&active).unwrap().interval_secs, 60);
    }

    #[tokio::test]
    async fn test_reconcile_replaces_job_on_interval_change() {
        let (_tmp, store, scheduler) = open_scheduler();
        let id = add_monitor(&store, "edited", 60, false);

        scheduler.reconcile().await;
        assert_eq!(scheduler.jobs.read().await.get(&id).unwrap().interval_secs, 60);

        store
            .update_monitor(
                id,
                MonitorPatch::Edit {
                    name: "edited".to_string(),
                    url: "ping://edited".to_string(),
                    icon: String::new(),
                    check_interval: 15,
                    is_third_party: false,
                },
            )
            .unwrap();
        scheduler.reconcile().await;

        let jobs = scheduler.jobs.read().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs.get(&id).unwrap().interval_secs, 15);
    }

    #[tokio::test]
    async fn test_reconcile_drops_paused_and_deleted_jobs() {
        let (_tmp, store, scheduler) = open_scheduler();
        let paused = add_monitor(&store, "pausing", 60, false);
        let doomed = add_monitor(&store, "doomed", 60, false);

        scheduler.reconcile().await;
        assert_eq!(scheduler.jobs.read().await.len(), 2);

        store
            .update_monitor(paused, MonitorPatch::Pause(true))
            .unwrap();
        store.delete_monitor(doomed).unwrap();
        scheduler.reconcile().await;

        assert!(scheduler.jobs.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_steady_state_keeps_jobs_untouched() {
        let (_tmp, store, scheduler) = open_scheduler();
        let id = add_monitor(&store, "steady", 3600, false);

        scheduler.reconcile().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // A second pass with no changes must not replace the job; a
        // replacement would fire another immediate first tick.
        scheduler.reconcile().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let now = chrono::Utc::now();
        let samples = store
            .samples_in_range(id, now - chrono::Duration::hours(1), now, 10)
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(scheduler.jobs.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_job_probes_immediately_on_start() {
        let (_tmp, store, scheduler) = open_scheduler();
        let id = add_monitor(&store, "immediate", 3600, false);

        scheduler.reconcile().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let now = chrono::Utc::now();
        let samples = store
            .samples_in_range(id, now - chrono::Duration::hours(1), now, 10)
            .unwrap();
        assert_eq!(samples.len(), 1);
    }
}

//! Retention pipeline: purges ancient samples and compacts old ones into
//! hourly buckets. Runs once a day at local midnight.

use chrono::{DateTime, Duration as ChronoDuration, Local, LocalResult, NaiveTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::db::Store;

/// Raw samples older than this are deleted outright.
const PURGE_HORIZON_DAYS: i64 = 365;

/// Samples older than this are eligible for compaction.
const RAW_HORIZON_HOURS: i64 = 24;

/// Raw samples are kept for this long; beyond it only buckets remain.
const COMPACT_WINDOW_DAYS: i64 = 7;

/// Bucket upserts per transaction.
const UPSERT_BATCH_SIZE: usize = 25;

/// Spawn the daily retention task.
pub fn start_retention(store: Arc<Store>) {
    tokio::spawn(async move {
        loop {
            let wait = duration_until_local_midnight(Local::now());
            tokio::time::sleep(wait).await;
            tracing::info!("Retention: running scheduled purge and compaction");
            run_retention(&store, Utc::now());
        }
    });
}

/// Run both retention phases against a single captured `now`, so the purge
/// cutoff and the compaction window cannot drift within a run.
pub fn run_retention(store: &Store, now: DateTime<Utc>) {
    // Phase 1: purge samples past the yearly horizon.
    let purge_cutoff = now - ChronoDuration::days(PURGE_HORIZON_DAYS);
    match store.delete_samples_older_than(purge_cutoff) {
        Ok(n) => tracing::info!("Retention: purged {} samples older than {} days", n, PURGE_HORIZON_DAYS),
        Err(e) => tracing::error!("Retention: purge failed: {}", e),
    }

    // Phase 2: compact everything between the raw horizon and the seven-day
    // window into hourly buckets, then drop the raw rows past that window.
    let raw_cutoff = now - ChronoDuration::hours(RAW_HORIZON_HOURS);
    let window_start = now - ChronoDuration::days(COMPACT_WINDOW_DAYS);

    let buckets = match store.aggregate_samples_between(window_start, raw_cutoff) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!("Retention: failed to aggregate samples: {}", e);
            return;
        }
    };

    if buckets.is_empty() {
        tracing::info!("Retention: no old samples to compact");
    } else {
        let mut compacted = 0usize;
        for batch in buckets.chunks(UPSERT_BATCH_SIZE) {
            // A failing batch is skipped; the rest still land.
            if let Err(e) = store.upsert_buckets(batch) {
                tracing::error!("Retention: failed to upsert bucket batch: {}", e);
                continue;
            }
            compacted += batch.len();
        }
        tracing::info!("Retention: compacted samples into {} hourly buckets", compacted);
    }

    match store.delete_samples_older_than(window_start) {
        Ok(n) => tracing::debug!("Retention: deleted {} raw samples past the window", n),
        Err(e) => tracing::error!("Retention: failed to delete old raw samples: {}", e),
    }
}

/// Time to sleep until the next local midnight.
fn duration_until_local_midnight(now: DateTime<Local>) -> Duration {
    let next_midnight = (now.date_naive() + chrono::Days::new(1)).and_time(NaiveTime::MIN);
    match Local.from_local_datetime(&next_midnight) {
        LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => {
            (t - now).to_std().unwrap_or(Duration::from_secs(60))
        }
        // A DST jump can skip midnight entirely.
        LocalResult::None => Duration::from_secs(24 * 3600),
    }
}

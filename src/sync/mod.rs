//! Declarative monitor configuration.
//!
//! Synchronizes the `monitors.yaml` file against the database using
//! per-entry content hashes. Monitors created through the API carry an
//! empty hash and are never touched by the reconciler.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

use crate::db::{Monitor, NewMonitor, Store, DEFAULT_CHECK_INTERVAL};
use crate::events::EventBus;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Root of the monitors.yaml document. Also the export shape.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MonitorsFile {
    #[serde(default)]
    pub monitors: Vec<MonitorEntry>,
}

/// A single YAML monitor entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorEntry {
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub check_interval: i64,
    #[serde(skip_serializing_if = "is_false")]
    pub is_third_party: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub paused: bool,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// SHA-256 over the entry's declared fields, delimiter-joined in a fixed
/// order. Depends on nothing but these six fields, so reordering the file
/// never changes a hash.
pub fn config_hash(entry: &MonitorEntry) -> String {
    let joined = format!(
        "{}|{}|{}|{}|{}|{}",
        entry.name,
        entry.url,
        entry.icon,
        entry.check_interval,
        entry.is_third_party,
        entry.paused
    );
    format!("{:x}", Sha256::digest(joined.as_bytes()))
}

/// Read and parse the monitors file. `Ok(None)` means the file is absent.
pub fn load_monitors_file(path: &Path) -> Result<Option<MonitorsFile>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let file: MonitorsFile = serde_yaml::from_str(&data)?;
    Ok(Some(file))
}

/// Build the export document from the current monitor set.
pub fn export_monitors(monitors: &[Monitor]) -> MonitorsFile {
    MonitorsFile {
        monitors: monitors
            .iter()
            .map(|m| MonitorEntry {
                name: m.name.clone(),
                url: m.url.clone(),
                icon: m.icon.clone(),
                check_interval: m.check_interval,
                is_third_party: m.is_third_party,
                paused: m.paused,
            })
            .collect(),
    }
}

/// What a sync pass changed. The caller fires immediate probes for these.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub created: Vec<i64>,
    pub updated: Vec<i64>,
}

/// Synchronize monitors from `<data_dir>/monitors.yaml` into the store.
///
/// Entries are matched by content hash, then by `(name, url)`. A parse
/// error leaves the database untouched; a missing file with an empty
/// database seeds the two default monitors.
pub fn sync_monitors_file(store: &Store, bus: &EventBus, data_dir: &Path) -> SyncOutcome {
    let config_path = data_dir.join("monitors.yaml");
    let mut outcome = SyncOutcome::default();

    let loaded = match load_monitors_file(&config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::error!(
                "Sync: failed to load YAML config from {}: {}",
                config_path.display(),
                e
            );
            return outcome;
        }
    };

    let existing = match store.list_monitors() {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("Sync: failed to load existing monitors: {}", e);
            return outcome;
        }
    };

    let Some(file) = loaded else {
        if existing.is_empty() {
            tracing::info!("Sync: no YAML config and empty database, seeding defaults");
            seed_defaults(store, bus, &mut outcome);
        }
        return outcome;
    };

    let entries: Vec<(MonitorEntry, String)> = file
        .monitors
        .into_iter()
        .filter(|e| {
            if e.name.is_empty() || e.url.is_empty() {
                tracing::warn!("Sync: skipping monitor entry with missing name or url");
                return false;
            }
            true
        })
        .map(|e| {
            let hash = config_hash(&e);
            (e, hash)
        })
        .collect();

    tracing::info!("Sync: syncing {} monitors from YAML configuration", entries.len());

    let by_hash: HashMap<&str, &Monitor> = existing
        .iter()
        .filter(|m| !m.config_hash.is_empty())
        .map(|m| (m.config_hash.as_str(), m))
        .collect();

    let mut processed: HashSet<&str> = HashSet::new();

    for (entry, hash) in &entries {
        processed.insert(hash.as_str());

        if by_hash.contains_key(hash.as_str()) {
            tracing::debug!("Sync: monitor {} ({}) unchanged", entry.name, entry.url);
            continue;
        }

        match store.find_monitor_by_target(&entry.name, &entry.url) {
            Ok(Some(current)) => {
                if current.config_hash.is_empty() {
                    // Created through the API; YAML must not adopt it.
                    tracing::info!(
                        "Sync: skipping monitor {} ({}), already exists (created via API)",
                        entry.name,
                        entry.url
                    );
                    continue;
                }

                let new = entry_to_new_monitor(entry, hash.clone());
                match store.update_monitor_config(current.id, &new) {
                    Ok(updated) => {
                        tracing::info!(
                            "Sync: updated monitor {} ({}), config changed",
                            updated.name,
                            updated.url
                        );
                        bus.publish("monitor_update", &updated);
                        if !updated.paused {
                            outcome.updated.push(updated.id);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Sync: failed to update monitor {}: {}", entry.name, e)
                    }
                }
            }
            Ok(None) => {
                let new = entry_to_new_monitor(entry, hash.clone());
                match store.create_monitor(&new) {
                    Ok(created) => {
                        tracing::info!(
                            "Sync: created monitor {} ({})",
                            created.name,
                            created.url
                        );
                        bus.publish("monitor_added", &created);
                        outcome.created.push(created.id);
                    }
                    Err(e) => {
                        tracing::error!("Sync: failed to create monitor {}: {}", entry.name, e)
                    }
                }
            }
            Err(e) => {
                tracing::error!("Sync: lookup failed for monitor {}: {}", entry.name, e);
            }
        }
    }

    // YAML-owned monitors whose entry disappeared are removed.
    for (hash, monitor) in &by_hash {
        if processed.contains(hash) {
            continue;
        }
        match store.delete_monitor(monitor.id) {
            Ok(()) => {
                tracing::info!(
                    "Sync: deleted monitor {} ({}), no longer in YAML config",
                    monitor.name,
                    monitor.url
                );
                bus.publish("monitor_deleted", &serde_json::json!({ "id": monitor.id }));
            }
            Err(e) => tracing::error!("Sync: failed to delete monitor {}: {}", monitor.name, e),
        }
    }

    bus.publish_stats_debounced();
    tracing::info!("Sync: YAML configuration synchronized");
    outcome
}

fn entry_to_new_monitor(entry: &MonitorEntry, hash: String) -> NewMonitor {
    let check_interval = if entry.check_interval <= 0 {
        DEFAULT_CHECK_INTERVAL
    } else {
        entry.check_interval
    };

    NewMonitor {
        name: entry.name.clone(),
        url: entry.url.clone(),
        icon: entry.icon.clone(),
        check_interval,
        is_third_party: entry.is_third_party,
        paused: entry.paused,
        config_hash: hash,
        ..Default::default()
    }
}

fn seed_defaults(store: &Store, bus: &EventBus, outcome: &mut SyncOutcome) {
    let defaults = [
        NewMonitor {
            name: "Example.com".to_string(),
            url: "https://example.com".to_string(),
            ..Default::default()
        },
        NewMonitor {
            name: "Google".to_string(),
            url: "https://google.com".to_string(),
            is_third_party: true,
            ..Default::default()
        },
    ];

    for new in defaults {
        match store.create_monitor(&new) {
            Ok(created) => {
                tracing::info!("Sync: created default monitor {} ({})", created.name, created.url);
                bus.publish("monitor_added", &created);
                outcome.created.push(created.id);
            }
            Err(e) => tracing::error!("Sync: failed to seed default monitor {}: {}", new.name, e),
        }
    }
}

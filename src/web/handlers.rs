//! HTTP request handlers.

use super::AppState;
use crate::db::{DbError, MonitorPatch, NewMonitor, DEFAULT_CHECK_INTERVAL};
use crate::stats::{self, HistoryRange};
use crate::sync;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::StreamExt;

/// Interval between `: keepalive` comment frames on the event stream.
const SSE_KEEPALIVE: Duration = Duration::from_secs(30);

// ============================================================================
// Shared request shapes
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub id: Option<String>,
    pub range: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub is_third_party: bool,
    #[serde(default)]
    pub check_interval: Option<i64>,
}

impl MonitorRequest {
    fn effective_interval(&self) -> i64 {
        match self.check_interval {
            Some(i) if i > 0 => i,
            _ => DEFAULT_CHECK_INTERVAL,
        }
    }
}

fn parse_id(raw: &Option<String>) -> Result<i64, (StatusCode, &'static str)> {
    let raw = raw
        .as_deref()
        .ok_or((StatusCode::BAD_REQUEST, "Missing id parameter"))?;
    raw.parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or((StatusCode::BAD_REQUEST, "Invalid id parameter"))
}

fn db_error_response(err: DbError) -> axum::response::Response {
    match err {
        DbError::NotFound => (StatusCode::NOT_FOUND, "Monitor not found").into_response(),
        DbError::Invalid(cause) => (StatusCode::BAD_REQUEST, cause).into_response(),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
    }
}

// ============================================================================
// API: Monitors
// ============================================================================

pub async fn handle_list_monitors(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_monitors() {
        Ok(monitors) => Json(monitors).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_create_monitor(
    State(state): State<AppState>,
    Json(req): Json<MonitorRequest>,
) -> impl IntoResponse {
    if req.name.is_empty() || req.url.is_empty() {
        return (StatusCode::BAD_REQUEST, "Name and URL are required").into_response();
    }

    let new = NewMonitor {
        name: req.name.clone(),
        url: req.url.clone(),
        icon: req.icon.clone(),
        is_third_party: req.is_third_party,
        check_interval: req.effective_interval(),
        ..Default::default()
    };

    let monitor = match state.store.create_monitor(&new) {
        Ok(m) => m,
        Err(e) => return db_error_response(e),
    };

    tracing::info!(
        "API: created monitor {} ({}) every {}s",
        monitor.id,
        monitor.name,
        monitor.check_interval
    );

    // Probe right away so the dashboard has data before the first
    // scheduled tick.
    let checker = state.checker.clone();
    let monitor_id = monitor.id;
    tokio::spawn(async move { checker.check(monitor_id).await });

    state.bus.publish("monitor_added", &monitor);
    state.bus.publish_stats_debounced();

    (StatusCode::CREATED, Json(monitor)).into_response()
}

pub async fn handle_get_monitor(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
) -> impl IntoResponse {
    let id = match parse_id(&query.id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    match state.store.get_monitor(id) {
        Ok(monitor) => Json(monitor).into_response(),
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_update_monitor(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let id = match parse_id(&query.id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    // A body carrying `paused` is a pause toggle and touches nothing else.
    if let Some(paused) = body.get("paused").and_then(serde_json::Value::as_bool) {
        return match state.store.update_monitor(id, MonitorPatch::Pause(paused)) {
            Ok(monitor) => {
                tracing::info!("API: monitor {} paused={}", id, paused);
                state.bus.publish("monitor_update", &monitor);
                state.bus.publish_stats_debounced();
                Json(monitor).into_response()
            }
            Err(e) => db_error_response(e),
        };
    }

    let req: MonitorRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid request body").into_response(),
    };
    if req.name.is_empty() || req.url.is_empty() {
        return (StatusCode::BAD_REQUEST, "Name and URL are required").into_response();
    }

    let patch = MonitorPatch::Edit {
        name: req.name.clone(),
        url: req.url.clone(),
        icon: req.icon.clone(),
        check_interval: req.effective_interval(),
        is_third_party: req.is_third_party,
    };

    match state.store.update_monitor(id, patch) {
        Ok(monitor) => {
            tracing::info!("API: updated monitor {} ({})", id, monitor.name);
            state.bus.publish("monitor_update", &monitor);
            state.bus.publish_stats_debounced();
            Json(monitor).into_response()
        }
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_delete_monitor(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
) -> impl IntoResponse {
    let id = match parse_id(&query.id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    match state.store.delete_monitor(id) {
        Ok(()) => {
            tracing::info!("API: deleted monitor {}", id);
            state
                .bus
                .publish("monitor_deleted", &serde_json::json!({ "id": id }));
            state.bus.publish_stats_debounced();
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => db_error_response(e),
    }
}

// ============================================================================
// API: Stats and history
// ============================================================================

pub async fn handle_stats(State(state): State<AppState>) -> impl IntoResponse {
    match stats::fleet_stats(&state.store, Utc::now()) {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_response_time(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let id = match query.id.as_deref().unwrap_or("1").parse::<i64>() {
        Ok(id) => id,
        Err(_) => return Json(Vec::<stats::ResponseTimePoint>::new()).into_response(),
    };
    let range = HistoryRange::parse(query.range.as_deref().unwrap_or("24h"));

    match stats::response_time_history(&state.store, id, range, Utc::now()) {
        Ok(points) => Json(points).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Export
// ============================================================================

pub async fn handle_export_monitors(State(state): State<AppState>) -> impl IntoResponse {
    let monitors = match state.store.list_monitors() {
        Ok(m) => m,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let document = sync::export_monitors(&monitors);
    match serde_yaml::to_string(&document) {
        Ok(yaml) => {
            tracing::info!("API: exported {} monitors as YAML", monitors.len());
            (
                [
                    (header::CONTENT_TYPE, "application/x-yaml; charset=utf-8"),
                    (
                        header::CONTENT_DISPOSITION,
                        "attachment; filename=monitors.yaml",
                    ),
                ],
                yaml,
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("API: failed to generate YAML export: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to generate YAML").into_response()
        }
    }
}

// ============================================================================
// API: Event stream
// ============================================================================

pub async fn handle_events(State(state): State<AppState>) -> impl IntoResponse {
    // Dropping the subscription (client gone) removes it from the bus.
    let stream = state
        .bus
        .subscribe()
        .map(|message| Ok::<Event, Infallible>(Event::default().data(message)));

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEPALIVE)
            .text("keepalive"),
    )
}

//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::events::EventBus;
use crate::probe::Checker;

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub bus: EventBus,
    pub checker: Arc<Checker>,
}

/// Web server for NanoStatus.
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ServerConfig,
        store: Arc<Store>,
        bus: EventBus,
        checker: Arc<Checker>,
    ) -> Self {
        Self {
            config,
            state: AppState {
                store,
                bus,
                checker,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/api/monitors", get(handlers::handle_list_monitors))
            .route("/api/monitors/create", post(handlers::handle_create_monitor))
            .route("/api/monitors/export", get(handlers::handle_export_monitors))
            .route(
                "/api/monitor",
                get(handlers::handle_get_monitor)
                    .put(handlers::handle_update_monitor)
                    .delete(handlers::handle_delete_monitor),
            )
            .route("/api/stats", get(handlers::handle_stats))
            .route("/api/response-time", get(handlers::handle_response_time))
            .route("/api/events", get(handlers::handle_events))
            .layer(cors)
            .layer(CompressionLayer::new())
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

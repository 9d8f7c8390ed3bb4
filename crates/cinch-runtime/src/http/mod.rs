mod auth;
mod jobs;
mod repos;
mod tokens;
mod webhook;
mod ws;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use cinch_core::config::CinchConfig;
use cinch_core::crypto::Cipher;

use crate::dispatcher::Dispatcher;
use crate::forge::ForgeRegistry;
use crate::hub::Hub;
use crate::log_mux::LogMultiplexer;
use crate::logstore::FsLogStore;
use crate::status_reconciler::StatusReconciler;
use crate::storage::Storage;

/// Everything a request handler needs, shared behind `Arc` across
/// connections. Cloning `AppState` is cheap (all fields are `Arc`s).
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub hub: Arc<Hub>,
    pub dispatcher: Arc<Dispatcher>,
    pub forges: Arc<ForgeRegistry>,
    pub cipher: Arc<Cipher>,
    pub log_mux: Arc<LogMultiplexer<FsLogStore>>,
    pub status_reconciler: Arc<StatusReconciler>,
    pub config: Arc<CinchConfig>,
}

pub fn router(state: AppState) -> Router {
    let cors = match state.config.server.cors_origins.is_empty() {
        true => CorsLayer::permissive(),
        false => {
            let origins: Vec<_> = state
                .config
                .server
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new().allow_origin(AllowOrigin::list(origins))
        }
    };

    let api = Router::new()
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/logs", get(jobs::get_logs))
        .route("/jobs/:id/logs/tail", get(jobs::tail_logs))
        .route("/jobs/:id/approve", post(jobs::approve_job))
        .route("/jobs/:id/cancel", post(jobs::cancel_job))
        .route("/jobs/:id/run", post(jobs::run_job))
        .route("/repos", get(repos::list_repos))
        .route("/repos/:id", get(repos::get_repo))
        .route("/repos/:id/secrets", post(repos::update_repo_secrets))
        .route("/tokens", post(tokens::create_token))
        .route("/tokens/:id", axum::routing::delete(tokens::revoke_token))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_token));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhooks", post(webhook::handle_webhook))
        .route("/ws/worker", get(ws::handle_upgrade))
        .nest("/api", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

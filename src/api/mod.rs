// API module - the authenticated HTTP surface of the fetch pipeline

pub mod auth;
pub mod error;
pub mod routes;

use axum::routing::{get, post, put};
use axum::{middleware, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::services::case_search::CaseSearchService;
use crate::services::credential_store::CredentialStore;
use crate::services::export::ExportService;
use crate::services::name_search::NameSearchService;
use crate::services::status::StatusService;

pub struct AppState {
    pub case_search: Arc<CaseSearchService>,
    pub name_search: Arc<NameSearchService>,
    pub status: Arc<StatusService>,
    pub export: Arc<ExportService>,
    pub credentials: Arc<CredentialStore>,
    pub jwt_secret: String,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/search", post(routes::submit_search))
        .route("/name-search", post(routes::submit_name_search))
        .route("/name-search/:search_id", get(routes::get_name_search))
        .route("/status", post(routes::get_status))
        .route("/case/:case_number", get(routes::get_case))
        .route("/export", post(routes::export_cases))
        .route("/credentials", put(routes::save_credentials))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/health", get(routes::health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

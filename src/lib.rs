pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod services;

use axum::{
    http::{header::HeaderName, HeaderValue, Method, Request},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::GatewayConfig;
use crate::middleware::{
    admin_auth_middleware, request_id_middleware, security_headers_middleware,
};
use crate::services::providers::ChatProvider;
use crate::services::{
    AdmissionController, PlanManager, QuotaCache, QuotaStore, UsageReconciler,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub plan_manager: PlanManager,
    pub admission: AdmissionController,
    pub reconciler: UsageReconciler,
    pub cache: Arc<dyn QuotaCache>,
    pub store: Arc<dyn QuotaStore>,
    pub provider: Arc<dyn ChatProvider>,
}

impl AppState {
    /// Wire the quota services around the given cache, store, and provider
    /// implementations. Tests inject in-memory fakes here.
    pub fn new(
        config: GatewayConfig,
        cache: Arc<dyn QuotaCache>,
        store: Arc<dyn QuotaStore>,
        provider: Arc<dyn ChatProvider>,
    ) -> Self {
        let plan_manager = PlanManager::new(store.clone(), cache.clone(), config.quota);
        let admission = AdmissionController::new(cache.clone(), config.quota);
        let reconciler = UsageReconciler::new(cache.clone(), store.clone());

        Self {
            config: Arc::new(config),
            plan_manager,
            admission,
            reconciler,
            cache,
            store,
            provider,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/admin/plans", post(handlers::plans::create_plan))
        .route(
            "/admin/plans/:entity_type/:entity_id",
            get(handlers::plans::get_plan),
        )
        .route(
            "/admin/plans/:entity_type/:entity_id",
            delete(handlers::plans::revoke_plan),
        )
        .layer(from_fn_with_state(state.clone(), admin_auth_middleware));

    let cors = CorsLayer::new()
        .allow_origin(
            state
                .config
                .security
                .allowed_origins
                .iter()
                .filter_map(|o| match o.parse::<HeaderValue>() {
                    Ok(v) => Some(v),
                    Err(e) => {
                        tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e);
                        None
                    }
                })
                .collect::<Vec<HeaderValue>>(),
        )
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-entity-id"),
            HeaderName::from_static("x-entity-type"),
            HeaderName::from_static("x-admin-api-key"),
            HeaderName::from_static("x-request-id"),
        ]);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/converse", post(handlers::converse::converse))
        .merge(admin_routes)
        .with_state(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors)
}

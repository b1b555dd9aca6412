pub mod converse;
pub mod plans;

use crate::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Liveness plus dependency health. The gateway stays up through a cache or
/// store outage, so dependency failures degrade the report instead of
/// failing it.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let cache_ok = state.cache.health_check().await.is_ok();
    let store_ok = state.store.health_check().await.is_ok();
    let provider_ok = state.provider.health_check().await.is_ok();

    let healthy = cache_ok && store_ok && provider_ok;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "service": state.config.service_name,
            "version": state.config.service_version,
            "dependencies": {
                "cache": if cache_ok { "up" } else { "down" },
                "store": if store_ok { "up" } else { "down" },
                "provider": if provider_ok { "up" } else { "down" },
            }
        })),
    )
}

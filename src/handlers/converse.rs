//! The gated model-invocation endpoint: resolve the caller's plan, run the
//! admission check, forward to the provider, reconcile actual usage.

use crate::config::FailurePolicy;
use crate::dtos::{AdmissionDeniedResponse, ConverseRequest, ConverseResponse, TokenUsage};
use crate::error::AppError;
use crate::middleware::REQUEST_ID_HEADER;
use crate::models::{DenyReason, EntityType, RateLimitResult, UsagePlan};
use crate::services::{storage_entity_id, ServiceError, TokenCounts};
use crate::AppState;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use validator::Validate;

/// The principal a request is accounted against.
struct Caller {
    entity_id: String,
    entity_type: EntityType,
}

/// Callers identify themselves with `X-Api-Key`, or with an explicit
/// `X-Entity-Id` / `X-Entity-Type` pair for pre-authenticated internal
/// traffic.
fn resolve_caller(headers: &HeaderMap) -> Result<Caller, AppError> {
    if let Some(key) = headers.get("X-Api-Key").and_then(|v| v.to_str().ok()) {
        if !key.is_empty() {
            return Ok(Caller {
                entity_id: key.to_string(),
                entity_type: EntityType::ApiKey,
            });
        }
    }

    let entity_id = headers
        .get("X-Entity-Id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    let entity_type = headers
        .get("X-Entity-Type")
        .and_then(|v| v.to_str().ok());

    match (entity_id, entity_type) {
        (Some(id), Some(t)) => Ok(Caller {
            entity_id: id.to_string(),
            entity_type: t
                .parse()
                .map_err(|_: String| ServiceError::InvalidEntityType(t.to_string()))?,
        }),
        _ => Err(AppError::Unauthorized(anyhow::anyhow!(
            "Missing X-Api-Key or X-Entity-Id/X-Entity-Type headers"
        ))),
    }
}

/// Input-token estimate for admission: total prompt characters over four.
/// The reconciler corrects the counters once the provider reports truth.
fn estimate_input_tokens(request: &ConverseRequest) -> i64 {
    let chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
    (chars as i64) / 4
}

pub async fn converse(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ConverseRequest>,
) -> Result<Response, AppError> {
    request.validate()?;
    let caller = resolve_caller(&headers)?;

    let plan = match state
        .plan_manager
        .get_or_create_usage_plan(&caller.entity_id, caller.entity_type)
        .await
    {
        Ok(plan) => plan,
        Err(e) if is_store_failure(&e) => {
            if state.config.quota.failure_policy == FailurePolicy::Open {
                // Serve the request on an unpersisted default plan rather
                // than turning a store outage into a gateway outage.
                tracing::warn!(error = %e, "Plan store unavailable, using transient default plan");
                UsagePlan::new_default(
                    storage_entity_id(&caller.entity_id, caller.entity_type),
                    caller.entity_type,
                    state.config.quota.default_limits(),
                )
            } else {
                return Err(e.into());
            }
        }
        Err(e) => return Err(e.into()),
    };

    let estimated = TokenCounts {
        input_tokens: estimate_input_tokens(&request),
        output_tokens: request
            .max_tokens
            .unwrap_or(state.config.quota.default_output_estimate),
    };

    let outcome = state
        .admission
        .check(
            &plan,
            &request.model,
            estimated.input_tokens,
            estimated.output_tokens,
        )
        .await?;

    if !outcome.result.allowed {
        return denial(&state, outcome.result);
    }

    let completion = state
        .provider
        .complete(&request.model, &request.messages, request.max_tokens)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, model = %request.model, "Provider call failed");
            AppError::BadGateway(e.to_string())
        })?;

    let mut metadata = HashMap::new();
    if let Some(request_id) = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        metadata.insert("request_id".to_string(), request_id.to_string());
    }

    let actual = TokenCounts {
        input_tokens: completion.input_tokens,
        output_tokens: completion.output_tokens,
    };
    // A degraded admission never booked the estimate, so there is nothing to
    // correct: subtracting it would strip tokens other callers booked. The
    // audit record is still appended.
    let booked = if outcome.degraded { actual } else { estimated };

    // The call already succeeded; a reconciliation failure costs accounting
    // accuracy, not the response.
    if let Err(e) = state
        .reconciler
        .reconcile(
            &plan.entity_id,
            plan.entity_type,
            &plan.tenant_id,
            &request.model,
            outcome.window_id,
            booked,
            actual,
            metadata,
        )
        .await
    {
        tracing::error!(error = %e, "Usage reconciliation failed");
    }

    Ok(Json(ConverseResponse {
        model: request.model,
        text: completion.text,
        usage: TokenUsage {
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
        },
    })
    .into_response())
}

fn is_store_failure(err: &ServiceError) -> bool {
    matches!(
        err,
        ServiceError::StoreUnavailable(_) | ServiceError::Database(_)
    )
}

/// Every denial carries the machine-readable reason and the post-increment
/// usage snapshot. Quota denials get a 429 with `Retry-After` pointing at the
/// next window; plan and permission denials are 403s.
fn denial(state: &AppState, result: RateLimitResult) -> Result<Response, AppError> {
    let reason = result.reason.unwrap_or(DenyReason::QuotaExceeded);
    let body = AdmissionDeniedResponse {
        error: "Request denied by usage policy".to_string(),
        reason: reason.as_str(),
        result,
    };

    match reason {
        DenyReason::QuotaExceeded => {
            let window = state.config.quota.window_seconds;
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            Err(AppError::TooManyRequests {
                body: serde_json::to_value(&body)
                    .map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?,
                retry_after: Some(window - now % window),
            })
        }
        DenyReason::PlanInactive | DenyReason::ModelNotPermitted => {
            Ok((StatusCode::FORBIDDEN, Json(body)).into_response())
        }
    }
}

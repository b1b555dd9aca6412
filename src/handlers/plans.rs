//! Administrative plan lifecycle: explicit create, read, revoke.

use crate::dtos::{CreatePlanRequest, PlanResponse};
use crate::error::AppError;
use crate::models::{EntityType, UsagePlan, NO_TENANT, WILDCARD_MODEL};
use crate::services::ServiceError;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

fn parse_entity_type(raw: &str) -> Result<EntityType, AppError> {
    raw.parse()
        .map_err(|_: String| ServiceError::InvalidEntityType(raw.to_string()).into())
}

pub async fn create_plan(
    State(state): State<AppState>,
    Json(request): Json<CreatePlanRequest>,
) -> Result<(StatusCode, Json<PlanResponse>), AppError> {
    request.validate()?;
    let entity_type = parse_entity_type(&request.entity_type)?;

    let plan = UsagePlan {
        usage_id: Uuid::new_v4(),
        entity_id: request.entity_id,
        entity_type,
        tenant_id: request.tenant_id.unwrap_or_else(|| NO_TENANT.to_string()),
        model_permissions: request
            .model_permissions
            .unwrap_or_else(|| vec![WILDCARD_MODEL.to_string()]),
        default_limits: request
            .limits
            .unwrap_or_else(|| state.config.quota.default_limits()),
        model_limits: request.model_limits,
        active: true,
        created_at: Utc::now(),
    };

    let submitted_id = plan.usage_id;
    let stored = state.plan_manager.create_usage_plan(plan).await?;

    // The store's create is first-write-wins; getting a different document
    // back means the entity already had a plan.
    if stored.usage_id != submitted_id {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "A usage plan already exists for this entity"
        )));
    }
    tracing::info!(entity_type = %stored.entity_type, "Usage plan created");

    Ok((StatusCode::CREATED, Json(stored.into())))
}

pub async fn get_plan(
    State(state): State<AppState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<PlanResponse>, AppError> {
    let entity_type = parse_entity_type(&entity_type)?;

    let plan = state
        .plan_manager
        .get_usage_plan(&entity_id, entity_type)
        .await?;

    Ok(Json(plan.into()))
}

pub async fn revoke_plan(
    State(state): State<AppState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let entity_type = parse_entity_type(&entity_type)?;

    if state
        .plan_manager
        .revoke_usage_plan(&entity_id, entity_type)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(anyhow::anyhow!("Usage plan not found")))
    }
}

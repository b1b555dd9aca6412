//! Request/response bodies for the gateway's HTTP surface.

use crate::models::{RateLimitResult, RateLimits, UsagePlan};
use crate::services::providers::ChatMessage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

/// Inbound model-invocation request.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ConverseRequest {
    #[validate(length(min = 1, max = 256))]
    pub model: String,

    #[validate(length(min = 1))]
    pub messages: Vec<ChatMessage>,

    pub max_tokens: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ConverseResponse {
    pub model: String,
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Serialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Body attached to every admission denial: a machine-readable reason plus
/// the usage snapshot, so clients can decide when to retry.
#[derive(Debug, Serialize)]
pub struct AdmissionDeniedResponse {
    pub error: String,
    pub reason: &'static str,
    #[serde(flatten)]
    pub result: RateLimitResult,
}

/// Administrative request to create a usage plan explicitly.
#[derive(Debug, Deserialize, Validate)]
pub struct CreatePlanRequest {
    #[validate(length(min = 1, max = 512))]
    pub entity_id: String,

    pub entity_type: String,

    pub tenant_id: Option<String>,

    /// Defaults to the wildcard permission when omitted.
    pub model_permissions: Option<Vec<String>>,

    /// Defaults to the configured default limits when omitted.
    pub limits: Option<RateLimits>,

    #[serde(default)]
    pub model_limits: HashMap<String, RateLimits>,
}

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub usage_id: uuid::Uuid,
    /// Storage form: hashed for API keys, never the raw credential.
    pub entity_id: String,
    pub entity_type: String,
    pub tenant_id: String,
    pub model_permissions: Vec<String>,
    pub default_limits: RateLimits,
    pub model_limits: HashMap<String, RateLimits>,
    pub active: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<UsagePlan> for PlanResponse {
    fn from(plan: UsagePlan) -> Self {
        Self {
            usage_id: plan.usage_id,
            entity_id: plan.entity_id,
            entity_type: plan.entity_type.as_str().to_string(),
            tenant_id: plan.tenant_id,
            model_permissions: plan.model_permissions,
            default_limits: plan.default_limits,
            model_limits: plan.model_limits,
            active: plan.active,
            created_at: plan.created_at,
        }
    }
}

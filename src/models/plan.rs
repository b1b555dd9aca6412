//! Usage plan model - the quota contract for one entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Sentinel tenant id for plans created outside any tenancy.
pub const NO_TENANT: &str = "-";

/// Wildcard entry in `model_permissions` granting access to every model.
pub const WILDCARD_MODEL: &str = "*";

/// The kind of principal a usage plan applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    User,
    Service,
    ApiKey,
    Department,
    Project,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::User => "USER",
            EntityType::Service => "SERVICE",
            EntityType::ApiKey => "API_KEY",
            EntityType::Department => "DEPARTMENT",
            EntityType::Project => "PROJECT",
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "USER" => Ok(EntityType::User),
            "SERVICE" => Ok(EntityType::Service),
            "API_KEY" => Ok(EntityType::ApiKey),
            "DEPARTMENT" => Ok(EntityType::Department),
            "PROJECT" => Ok(EntityType::Project),
            _ => Err(format!("Invalid entity type: {}", s)),
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-minute limits applied to one model for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    /// Input tokens per minute.
    pub input_tpm: i64,

    /// Output tokens per minute.
    pub output_tpm: i64,

    /// Requests per minute.
    pub rpm: i64,
}

/// The quota contract for one `(entity_id, entity_type)` pair.
///
/// `(entity_id, entity_type)` is unique across the store. For `API_KEY`
/// entities `entity_id` holds a one-way hash of the key, never the raw value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsagePlan {
    pub usage_id: Uuid,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub tenant_id: String,
    pub model_permissions: Vec<String>,
    pub default_limits: RateLimits,
    #[serde(default)]
    pub model_limits: HashMap<String, RateLimits>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl UsagePlan {
    /// Build the implicit first-use plan: wildcard permissions, default
    /// limits, active.
    pub fn new_default(entity_id: String, entity_type: EntityType, limits: RateLimits) -> Self {
        Self {
            usage_id: Uuid::new_v4(),
            entity_id,
            entity_type,
            tenant_id: NO_TENANT.to_string(),
            model_permissions: vec![WILDCARD_MODEL.to_string()],
            default_limits: limits,
            model_limits: HashMap::new(),
            active: true,
            created_at: Utc::now(),
        }
    }

    /// Resolve the limits applied to `model`: the per-model override as a
    /// whole struct, or the defaults. Individual fields are never merged.
    pub fn limits_for(&self, model: &str) -> RateLimits {
        self.model_limits
            .get(model)
            .copied()
            .unwrap_or(self.default_limits)
    }

    /// Whether the plan permits `model` (wildcard or explicit entry).
    pub fn allows_model(&self, model: &str) -> bool {
        self.model_permissions
            .iter()
            .any(|m| m == WILDCARD_MODEL || m == model)
    }
}

//! Plan manager: create / get-or-create / revoke of usage plans across the
//! cache and the store.

use crate::config::QuotaConfig;
use crate::models::{EntityType, RateLimits, UsagePlan};
use crate::services::cache::QuotaCache;
use crate::services::error::ServiceError;
use crate::services::store::QuotaStore;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// One-way hash applied to API-key entity ids before any cache or store
/// access. The raw key value never leaves the process boundary.
pub fn hash_api_key(raw_key: &str) -> String {
    let digest = Sha256::digest(raw_key.as_bytes());
    hex::encode(digest)
}

/// The storage form of an entity id: hashed for API keys, verbatim otherwise.
pub fn storage_entity_id(entity_id: &str, entity_type: EntityType) -> String {
    match entity_type {
        EntityType::ApiKey => hash_api_key(entity_id),
        _ => entity_id.to_string(),
    }
}

#[derive(Clone)]
pub struct PlanManager {
    store: Arc<dyn QuotaStore>,
    cache: Arc<dyn QuotaCache>,
    settings: QuotaConfig,
}

impl PlanManager {
    pub fn new(store: Arc<dyn QuotaStore>, cache: Arc<dyn QuotaCache>, settings: QuotaConfig) -> Self {
        Self {
            store,
            cache,
            settings,
        }
    }

    pub fn default_limits(&self) -> RateLimits {
        self.settings.default_limits()
    }

    /// Cache-aside lookup: cache hit returns immediately; a store hit is
    /// written back through to the cache before returning.
    pub async fn get_usage_plan(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<UsagePlan, ServiceError> {
        let entity_id = storage_entity_id(entity_id, entity_type);

        match self.cache.get_plan(&entity_id, entity_type).await {
            Ok(Some(plan)) => return Ok(plan),
            Ok(None) => {}
            Err(e) => {
                // A cache miss and a cache outage read the same here; the
                // store remains authoritative either way.
                tracing::warn!(error = %e, "Plan cache read failed, falling through to store");
            }
        }

        let plan = self
            .store
            .find_plan(&entity_id, entity_type)
            .await?
            .ok_or(ServiceError::PlanNotFound)?;

        self.write_through(&plan).await;
        Ok(plan)
    }

    /// Resolve the plan for an entity, implicitly creating the default plan
    /// on first use. Safe under concurrent first-use: the store's
    /// conditional create makes the first writer win and hands everyone the
    /// same stored document.
    pub async fn get_or_create_usage_plan(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<UsagePlan, ServiceError> {
        match self.get_usage_plan(entity_id, entity_type).await {
            Ok(plan) => Ok(plan),
            Err(ServiceError::PlanNotFound) => {
                let default_plan = UsagePlan::new_default(
                    storage_entity_id(entity_id, entity_type),
                    entity_type,
                    self.settings.default_limits(),
                );
                tracing::info!(
                    entity_type = %entity_type,
                    "Creating default usage plan on first use"
                );
                self.create_prepared_plan(default_plan).await
            }
            Err(e) => Err(e),
        }
    }

    /// Persist a plan built by the administrative surface. `entity_id` is
    /// hashed here for API keys, so callers always pass the raw identifier.
    pub async fn create_usage_plan(&self, mut plan: UsagePlan) -> Result<UsagePlan, ServiceError> {
        plan.entity_id = storage_entity_id(&plan.entity_id, plan.entity_type);
        self.create_prepared_plan(plan).await
    }

    async fn create_prepared_plan(&self, plan: UsagePlan) -> Result<UsagePlan, ServiceError> {
        let stored = self.store.create_plan(&plan).await?;
        self.write_through(&stored).await;
        Ok(stored)
    }

    /// Deactivate a plan and evict its cache entry. The eviction is what
    /// guarantees no stale `active=true` copy is served after this returns;
    /// a failed eviction therefore fails the whole operation.
    pub async fn revoke_usage_plan(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<bool, ServiceError> {
        let entity_id = storage_entity_id(entity_id, entity_type);

        let existed = self.store.set_active(&entity_id, entity_type, false).await?;
        if existed {
            self.cache.delete_plan(&entity_id, entity_type).await?;
            tracing::info!(entity_type = %entity_type, "Usage plan revoked");
        }
        Ok(existed)
    }

    /// Write-through is best effort on the read path: a cache outage must
    /// not fail a lookup the store already answered.
    async fn write_through(&self, plan: &UsagePlan) {
        if let Err(e) = self
            .cache
            .put_plan(plan, self.settings.plan_cache_ttl_seconds)
            .await
        {
            tracing::warn!(error = %e, "Failed to write plan through to cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_hash_is_deterministic() {
        let a = hash_api_key("sk-live-abcd");
        let b = hash_api_key("sk-live-abcd");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(!a.contains("sk-live"));
        assert_ne!(a, hash_api_key("sk-live-abce"));
    }

    #[test]
    fn test_only_api_keys_are_hashed() {
        assert_eq!(
            storage_entity_id("user-42", EntityType::User),
            "user-42"
        );
        assert_ne!(
            storage_entity_id("sk-live-abcd", EntityType::ApiKey),
            "sk-live-abcd"
        );
    }
}

//! Quota store: the system of record for usage plans, plus the append-only
//! usage audit log. Backed by MongoDB.

use crate::config::MongoConfig;
use crate::models::{EntityType, UsagePlan, UsageRecord};
use crate::services::error::ServiceError;
use async_trait::async_trait;
use mongodb::{
    bson::doc,
    options::{FindOneAndUpdateOptions, IndexOptions, ReturnDocument},
    Client as MongoClient, Collection, Database, IndexModel,
};

#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn find_plan(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Option<UsagePlan>, ServiceError>;

    /// Persist `plan` unless a plan already exists for its entity key. The
    /// stored plan is returned either way: the first writer wins and every
    /// concurrent creator reads the winner's document back.
    async fn create_plan(&self, plan: &UsagePlan) -> Result<UsagePlan, ServiceError>;

    /// Flip the `active` flag. Returns whether a plan existed. The record is
    /// never deleted so audit history survives revocation.
    async fn set_active(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        active: bool,
    ) -> Result<bool, ServiceError>;

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), ServiceError>;

    async fn health_check(&self) -> Result<(), ServiceError>;
}

#[derive(Clone)]
pub struct MongoQuotaStore {
    db: Database,
}

impl MongoQuotaStore {
    pub async fn connect(config: &MongoConfig) -> Result<Self, ServiceError> {
        tracing::info!(uri = %config.uri, "Connecting to MongoDB");
        let client = MongoClient::with_uri_str(&config.uri).await.map_err(|e| {
            tracing::error!("Failed to connect to MongoDB at {}: {}", config.uri, e);
            ServiceError::StoreUnavailable(e.to_string())
        })?;
        let db = client.database(&config.database);
        tracing::info!(database = %config.database, "Successfully connected to MongoDB database");
        Ok(Self { db })
    }

    fn plans(&self) -> Collection<UsagePlan> {
        self.db.collection("usage_plans")
    }

    fn usage_records(&self) -> Collection<UsageRecord> {
        self.db.collection("usage_records")
    }

    pub async fn initialize_indexes(&self) -> Result<(), ServiceError> {
        tracing::info!("Creating MongoDB indexes for llm-gateway");

        // The entity key is unique across the store; the unique index is what
        // makes concurrent first-use creates collapse to a single document.
        let entity_key_index = IndexModel::builder()
            .keys(doc! { "entity_id": 1, "entity_type": 1 })
            .options(
                IndexOptions::builder()
                    .name("entity_key_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        self.plans()
            .create_index(entity_key_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create entity key index: {}", e);
                ServiceError::Database(e)
            })?;

        let usage_time_index = IndexModel::builder()
            .keys(doc! { "tenant_id": 1, "timestamp": -1 })
            .options(
                IndexOptions::builder()
                    .name("tenant_time_idx".to_string())
                    .build(),
            )
            .build();

        self.usage_records()
            .create_index(usage_time_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create usage record index: {}", e);
                ServiceError::Database(e)
            })?;

        tracing::info!("Successfully created all MongoDB indexes");
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for MongoQuotaStore {
    async fn find_plan(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Option<UsagePlan>, ServiceError> {
        self.plans()
            .find_one(
                doc! { "entity_id": entity_id, "entity_type": entity_type.as_str() },
                None,
            )
            .await
            .map_err(ServiceError::Database)
    }

    async fn create_plan(&self, plan: &UsagePlan) -> Result<UsagePlan, ServiceError> {
        let plan_doc = mongodb::bson::to_document(plan).map_err(|e| {
            ServiceError::Internal(anyhow::anyhow!("Failed to encode plan: {}", e))
        })?;

        // Conditional create-if-absent: $setOnInsert with upsert never
        // overwrites an existing plan's configured limits.
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        let stored = self
            .plans()
            .find_one_and_update(
                doc! {
                    "entity_id": &plan.entity_id,
                    "entity_type": plan.entity_type.as_str(),
                },
                doc! { "$setOnInsert": plan_doc },
                options,
            )
            .await
            .map_err(ServiceError::Database)?;

        stored.ok_or_else(|| {
            ServiceError::Internal(anyhow::anyhow!("Upsert returned no document for plan"))
        })
    }

    async fn set_active(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        active: bool,
    ) -> Result<bool, ServiceError> {
        let result = self
            .plans()
            .update_one(
                doc! { "entity_id": entity_id, "entity_type": entity_type.as_str() },
                doc! { "$set": { "active": active } },
                None,
            )
            .await
            .map_err(ServiceError::Database)?;

        Ok(result.matched_count > 0)
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), ServiceError> {
        self.usage_records()
            .insert_one(record, None)
            .await
            .map_err(ServiceError::Database)?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        self.db
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                tracing::error!("MongoDB health check failed: {}", e);
                ServiceError::StoreUnavailable(e.to_string())
            })?;
        Ok(())
    }
}

/// In-memory store with the same first-write-wins semantics, for tests.
pub struct MemoryQuotaStore {
    plans: std::sync::Mutex<std::collections::HashMap<(String, EntityType), UsagePlan>>,
    usage_records: std::sync::Mutex<Vec<UsageRecord>>,
    failing: std::sync::atomic::AtomicBool,
}

impl Default for MemoryQuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self {
            plans: std::sync::Mutex::new(std::collections::HashMap::new()),
            usage_records: std::sync::Mutex::new(Vec::new()),
            failing: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ServiceError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ServiceError::StoreUnavailable(
                "Simulated store outage".to_string(),
            ));
        }
        Ok(())
    }

    /// Snapshot of appended usage records, for assertions.
    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage_records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn plan_count(&self) -> usize {
        self.plans.lock().map(|plans| plans.len()).unwrap_or(0)
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn find_plan(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Option<UsagePlan>, ServiceError> {
        self.check_available()?;
        let plans = self
            .plans
            .lock()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Store mutex poisoned: {}", e)))?;
        Ok(plans.get(&(entity_id.to_string(), entity_type)).cloned())
    }

    async fn create_plan(&self, plan: &UsagePlan) -> Result<UsagePlan, ServiceError> {
        self.check_available()?;
        let mut plans = self
            .plans
            .lock()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Store mutex poisoned: {}", e)))?;
        let stored = plans
            .entry((plan.entity_id.clone(), plan.entity_type))
            .or_insert_with(|| plan.clone());
        Ok(stored.clone())
    }

    async fn set_active(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        active: bool,
    ) -> Result<bool, ServiceError> {
        self.check_available()?;
        let mut plans = self
            .plans
            .lock()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Store mutex poisoned: {}", e)))?;
        match plans.get_mut(&(entity_id.to_string(), entity_type)) {
            Some(plan) => {
                plan.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), ServiceError> {
        self.check_available()?;
        self.usage_records
            .lock()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Store mutex poisoned: {}", e)))?
            .push(record.clone());
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RateLimits;

    fn limits() -> RateLimits {
        RateLimits {
            input_tpm: 100,
            output_tpm: 100,
            rpm: 10,
        }
    }

    #[tokio::test]
    async fn test_create_plan_first_write_wins() {
        let store = MemoryQuotaStore::new();

        let first = UsagePlan::new_default("svc-1".to_string(), EntityType::Service, limits());
        let second = UsagePlan::new_default(
            "svc-1".to_string(),
            EntityType::Service,
            RateLimits {
                input_tpm: 1,
                output_tpm: 1,
                rpm: 1,
            },
        );

        let stored_first = store.create_plan(&first).await.unwrap();
        let stored_second = store.create_plan(&second).await.unwrap();

        assert_eq!(stored_first.usage_id, stored_second.usage_id);
        assert_eq!(stored_second.default_limits, limits());
        assert_eq!(store.plan_count(), 1);
    }

    #[tokio::test]
    async fn test_set_active_reports_existence() {
        let store = MemoryQuotaStore::new();
        assert!(!store
            .set_active("ghost", EntityType::User, false)
            .await
            .unwrap());

        let plan = UsagePlan::new_default("u-1".to_string(), EntityType::User, limits());
        store.create_plan(&plan).await.unwrap();
        assert!(store
            .set_active("u-1", EntityType::User, false)
            .await
            .unwrap());

        let found = store.find_plan("u-1", EntityType::User).await.unwrap().unwrap();
        assert!(!found.active);
    }
}

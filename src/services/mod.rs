//! Services layer: the admission-control and usage-accounting core, plus the
//! model-provider collaborator boundary.

pub mod admission;
pub mod cache;
pub mod error;
pub mod plan_manager;
pub mod providers;
pub mod reconciler;
pub mod store;

pub use admission::{AdmissionController, AdmissionOutcome};
pub use cache::{MemoryQuotaCache, QuotaCache, RedisQuotaCache, WindowKey};
pub use error::ServiceError;
pub use plan_manager::{hash_api_key, storage_entity_id, PlanManager};
pub use reconciler::{TokenCounts, UsageReconciler};
pub use store::{MemoryQuotaStore, MongoQuotaStore, QuotaStore};

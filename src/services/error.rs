use crate::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    /// No plan stored for the entity. Recovered locally by get-or-create;
    /// surfaced only on explicit admin reads.
    #[error("Usage plan not found")]
    PlanNotFound,

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid entity type: {0}")]
    InvalidEntityType(String),

    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Whether this failure came from the cache layer and is therefore
    /// eligible for the fail-open/fail-closed degradation path.
    pub fn is_cache_failure(&self) -> bool {
        matches!(
            self,
            ServiceError::CacheUnavailable(_) | ServiceError::Redis(_)
        )
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::PlanNotFound => {
                AppError::NotFound(anyhow::anyhow!("Usage plan not found"))
            }
            ServiceError::CacheUnavailable(e) => {
                AppError::ServiceUnavailable(format!("Cache unavailable: {}", e))
            }
            ServiceError::StoreUnavailable(e) => {
                AppError::ServiceUnavailable(format!("Store unavailable: {}", e))
            }
            ServiceError::InvalidEntityType(e) => {
                AppError::BadRequest(anyhow::anyhow!("Invalid entity type: {}", e))
            }
            ServiceError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            ServiceError::Redis(e) => AppError::CacheError(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}

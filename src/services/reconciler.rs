//! Usage reconciler: corrects window counters from estimate to actual once a
//! call completes, and appends the immutable audit record.

use crate::models::{EntityType, UsageRecord};
use crate::services::cache::{QuotaCache, WindowKey};
use crate::services::error::ServiceError;
use crate::services::store::QuotaStore;
use std::collections::HashMap;
use std::sync::Arc;

/// Token counts for one call, estimated at admission or reported by the
/// provider afterwards.
#[derive(Debug, Clone, Copy)]
pub struct TokenCounts {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[derive(Clone)]
pub struct UsageReconciler {
    cache: Arc<dyn QuotaCache>,
    store: Arc<dyn QuotaStore>,
}

impl UsageReconciler {
    pub fn new(cache: Arc<dyn QuotaCache>, store: Arc<dyn QuotaStore>) -> Self {
        Self { cache, store }
    }

    /// Apply `actual - estimated` to the window the admission check booked
    /// against, so tracked usage converges to truth without double-counting
    /// the estimate. An expired window is left alone; the audit record is
    /// appended either way. Returns whether the counters were adjusted.
    #[allow(clippy::too_many_arguments)]
    pub async fn reconcile(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        tenant_id: &str,
        model: &str,
        window_id: u64,
        estimated: TokenCounts,
        actual: TokenCounts,
        metadata: HashMap<String, String>,
    ) -> Result<bool, ServiceError> {
        let input_delta = actual.input_tokens - estimated.input_tokens;
        let output_delta = actual.output_tokens - estimated.output_tokens;

        let key = WindowKey {
            entity_id: entity_id.to_string(),
            entity_type,
            model: model.to_string(),
            window_id,
        };

        let adjusted = if input_delta == 0 && output_delta == 0 {
            true
        } else {
            match self.cache.adjust_window(&key, input_delta, output_delta).await {
                Ok(applied) => {
                    if !applied {
                        tracing::debug!(
                            model = %model,
                            window_id,
                            "Window expired before reconciliation; dropping counter delta"
                        );
                    }
                    applied
                }
                Err(e) if e.is_cache_failure() => {
                    // The counters stay at the estimate; the audit record
                    // below still captures the truth.
                    tracing::warn!(error = %e, "Cache unavailable during reconciliation");
                    false
                }
                Err(e) => return Err(e),
            }
        };

        let record = UsageRecord::new(
            tenant_id.to_string(),
            entity_id.to_string(),
            model.to_string(),
            actual.input_tokens,
            actual.output_tokens,
            metadata,
        );
        self.store.append_usage(&record).await?;

        Ok(adjusted)
    }
}

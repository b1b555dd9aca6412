//! Admission controller: the hot-path allow/deny decision for one model call.
//!
//! Quotas are enforced against fixed one-minute windows rather than a sliding
//! window: one counter key per entity/model/minute bounds cache key
//! cardinality and keeps the check to a single atomic round trip, at the cost
//! of allowing up to a 2x burst straddling a window boundary. That tradeoff
//! is deliberate; this is a best-effort check, not a hard SLA.

use crate::config::{FailurePolicy, QuotaConfig};
use crate::models::{DenyReason, RateLimitResult, UsagePlan, WindowUsage};
use crate::services::cache::{QuotaCache, WindowKey};
use crate::services::error::ServiceError;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Decision plus the window it was booked against, so the reconciler can
/// correct the same counters later.
#[derive(Debug, Clone)]
pub struct AdmissionOutcome {
    pub result: RateLimitResult,
    pub window_id: u64,
    /// True when the decision was made without the cache, meaning the
    /// estimate was never booked into the window counters.
    pub degraded: bool,
}

#[derive(Clone)]
pub struct AdmissionController {
    cache: Arc<dyn QuotaCache>,
    settings: QuotaConfig,
}

impl AdmissionController {
    pub fn new(cache: Arc<dyn QuotaCache>, settings: QuotaConfig) -> Self {
        Self { cache, settings }
    }

    /// The fixed window covering the current instant.
    pub fn current_window(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        now / self.settings.window_seconds
    }

    pub fn window_seconds(&self) -> u64 {
        self.settings.window_seconds
    }

    /// Check whether `plan` admits one call to `model` costing the estimated
    /// tokens. Counters are bumped atomically before the comparison, so a
    /// denied call is still recorded; the post-increment snapshot is returned
    /// on allow and deny alike.
    pub async fn check(
        &self,
        plan: &UsagePlan,
        model: &str,
        estimated_input_tokens: i64,
        estimated_output_tokens: i64,
    ) -> Result<AdmissionOutcome, ServiceError> {
        self.check_in_window(
            plan,
            model,
            estimated_input_tokens,
            estimated_output_tokens,
            self.current_window(),
        )
        .await
    }

    /// Same as [`check`](Self::check) with an explicit window, used directly
    /// by tests that pin window boundaries.
    pub async fn check_in_window(
        &self,
        plan: &UsagePlan,
        model: &str,
        estimated_input_tokens: i64,
        estimated_output_tokens: i64,
        window_id: u64,
    ) -> Result<AdmissionOutcome, ServiceError> {
        let applied_limits = plan.limits_for(model);
        let model_limits = plan.model_limits.get(model).copied();

        // Inactive plans and unpermitted models deny without touching
        // counters.
        if !plan.active {
            return Ok(AdmissionOutcome {
                result: RateLimitResult {
                    allowed: false,
                    reason: Some(DenyReason::PlanInactive),
                    current_usage: WindowUsage::default(),
                    model_usage: WindowUsage::default(),
                    applied_limits,
                    model_limits,
                },
                window_id,
                degraded: false,
            });
        }

        if !plan.allows_model(model) {
            return Ok(AdmissionOutcome {
                result: RateLimitResult {
                    allowed: false,
                    reason: Some(DenyReason::ModelNotPermitted),
                    current_usage: WindowUsage::default(),
                    model_usage: WindowUsage::default(),
                    applied_limits,
                    model_limits,
                },
                window_id,
                degraded: false,
            });
        }

        let key = WindowKey {
            entity_id: plan.entity_id.clone(),
            entity_type: plan.entity_type,
            model: model.to_string(),
            window_id,
        };
        let deltas = WindowUsage {
            requests: 1,
            input_tokens: estimated_input_tokens,
            output_tokens: estimated_output_tokens,
        };

        let (model_usage, entity_usage) = match self
            .cache
            .incr_window(&key, deltas, self.settings.window_seconds)
            .await
        {
            Ok(counts) => counts,
            Err(e) if e.is_cache_failure() => {
                return Ok(self.degrade(e, window_id, applied_limits, model_limits))
            }
            Err(e) => return Err(e),
        };

        let allowed = model_usage.within(&applied_limits);

        Ok(AdmissionOutcome {
            result: RateLimitResult {
                allowed,
                reason: (!allowed).then_some(DenyReason::QuotaExceeded),
                current_usage: entity_usage,
                model_usage,
                applied_limits,
                model_limits,
            },
            window_id,
            degraded: false,
        })
    }

    /// Cache outage handling per the configured policy. Fail-open admits the
    /// call; fail-closed denies it. Either way the gateway keeps serving.
    fn degrade(
        &self,
        cause: ServiceError,
        window_id: u64,
        applied_limits: crate::models::RateLimits,
        model_limits: Option<crate::models::RateLimits>,
    ) -> AdmissionOutcome {
        let fail_open = self.settings.failure_policy == FailurePolicy::Open;
        tracing::warn!(
            error = %cause,
            policy = if fail_open { "open" } else { "closed" },
            "Quota cache unavailable during admission check"
        );

        AdmissionOutcome {
            result: RateLimitResult {
                allowed: fail_open,
                reason: (!fail_open).then_some(DenyReason::QuotaExceeded),
                current_usage: WindowUsage::default(),
                model_usage: WindowUsage::default(),
                applied_limits,
                model_limits,
            },
            window_id,
            degraded: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, RateLimits};
    use crate::services::cache::MemoryQuotaCache;

    fn settings(policy: FailurePolicy) -> QuotaConfig {
        QuotaConfig {
            window_seconds: 60,
            plan_cache_ttl_seconds: 300,
            cache_timeout_ms: 200,
            failure_policy: policy,
            default_rpm: 2,
            default_input_tpm: 100,
            default_output_tpm: 100,
            default_output_estimate: 10,
        }
    }

    fn plan(rpm: i64) -> UsagePlan {
        UsagePlan::new_default(
            "user-1".to_string(),
            EntityType::User,
            RateLimits {
                input_tpm: 100,
                output_tpm: 100,
                rpm,
            },
        )
    }

    fn controller(policy: FailurePolicy) -> (AdmissionController, Arc<MemoryQuotaCache>) {
        let cache = Arc::new(MemoryQuotaCache::new());
        (
            AdmissionController::new(cache.clone(), settings(policy)),
            cache,
        )
    }

    #[tokio::test]
    async fn test_three_checks_against_rpm_two() {
        let (controller, _) = controller(FailurePolicy::Open);
        let plan = plan(2);

        let first = controller
            .check_in_window(&plan, "claude-3", 10, 10, 1)
            .await
            .unwrap();
        assert!(first.result.allowed);
        assert_eq!(first.result.current_usage.requests, 1);

        let second = controller
            .check_in_window(&plan, "claude-3", 10, 10, 1)
            .await
            .unwrap();
        assert!(second.result.allowed);
        assert_eq!(second.result.current_usage.requests, 2);

        // Denied, but the request is still recorded in the snapshot.
        let third = controller
            .check_in_window(&plan, "claude-3", 10, 10, 1)
            .await
            .unwrap();
        assert!(!third.result.allowed);
        assert_eq!(third.result.reason, Some(DenyReason::QuotaExceeded));
        assert_eq!(third.result.current_usage.requests, 3);
        assert_eq!(third.result.model_usage.requests, 3);
    }

    #[tokio::test]
    async fn test_window_rollover_resets_counters() {
        let (controller, _) = controller(FailurePolicy::Open);
        let plan = plan(1);

        assert!(controller
            .check_in_window(&plan, "claude-3", 1, 1, 7)
            .await
            .unwrap()
            .result
            .allowed);
        assert!(!controller
            .check_in_window(&plan, "claude-3", 1, 1, 7)
            .await
            .unwrap()
            .result
            .allowed);

        // Next window starts from zero regardless of the previous one.
        let next = controller
            .check_in_window(&plan, "claude-3", 1, 1, 8)
            .await
            .unwrap();
        assert!(next.result.allowed);
        assert_eq!(next.result.model_usage.requests, 1);
    }

    #[tokio::test]
    async fn test_token_limit_denies_even_when_rpm_holds() {
        let (controller, _) = controller(FailurePolicy::Open);
        let plan = plan(100);

        assert!(controller
            .check_in_window(&plan, "claude-3", 80, 10, 1)
            .await
            .unwrap()
            .result
            .allowed);

        let denied = controller
            .check_in_window(&plan, "claude-3", 30, 10, 1)
            .await
            .unwrap();
        assert!(!denied.result.allowed);
        assert_eq!(denied.result.model_usage.input_tokens, 110);
    }

    #[tokio::test]
    async fn test_inactive_plan_denies_without_counting() {
        let (controller, cache) = controller(FailurePolicy::Open);
        let mut plan = plan(10);
        plan.active = false;

        let outcome = controller
            .check_in_window(&plan, "claude-3", 10, 10, 1)
            .await
            .unwrap();
        assert!(!outcome.result.allowed);
        assert_eq!(outcome.result.reason, Some(DenyReason::PlanInactive));

        // Counters were never touched.
        let key = WindowKey {
            entity_id: "user-1".to_string(),
            entity_type: EntityType::User,
            model: "claude-3".to_string(),
            window_id: 1,
        };
        assert!(!cache.adjust_window(&key, 0, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_unpermitted_model_denies() {
        let (controller, _) = controller(FailurePolicy::Open);
        let mut plan = plan(10);
        plan.model_permissions = vec!["claude-3".to_string()];

        let outcome = controller
            .check_in_window(&plan, "gpt-4o", 10, 10, 1)
            .await
            .unwrap();
        assert!(!outcome.result.allowed);
        assert_eq!(outcome.result.reason, Some(DenyReason::ModelNotPermitted));
    }

    #[tokio::test]
    async fn test_per_model_override_applies_whole_struct() {
        let (controller, _) = controller(FailurePolicy::Open);
        let mut plan = plan(100);
        plan.model_limits.insert(
            "claude-3".to_string(),
            RateLimits {
                input_tpm: 100,
                output_tpm: 100,
                rpm: 1,
            },
        );

        assert!(controller
            .check_in_window(&plan, "claude-3", 1, 1, 1)
            .await
            .unwrap()
            .result
            .allowed);
        let denied = controller
            .check_in_window(&plan, "claude-3", 1, 1, 1)
            .await
            .unwrap();
        assert!(!denied.result.allowed);
        assert_eq!(denied.result.applied_limits.rpm, 1);
        assert!(denied.result.model_limits.is_some());
    }

    #[tokio::test]
    async fn test_cache_outage_fails_open() {
        let (controller, cache) = controller(FailurePolicy::Open);
        cache.set_failing(true);

        let outcome = controller
            .check_in_window(&plan(1), "claude-3", 10, 10, 1)
            .await
            .unwrap();
        assert!(outcome.result.allowed);
        assert!(outcome.degraded);
        assert_eq!(outcome.result.current_usage, WindowUsage::default());
    }

    #[tokio::test]
    async fn test_cache_outage_fails_closed_when_configured() {
        let (controller, cache) = controller(FailurePolicy::Closed);
        cache.set_failing(true);

        let outcome = controller
            .check_in_window(&plan(1000), "claude-3", 10, 10, 1)
            .await
            .unwrap();
        assert!(!outcome.result.allowed);
    }
}

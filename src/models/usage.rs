//! Usage tracking models: window counters, admission results, audit records.

use crate::models::plan::RateLimits;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Counter snapshot for one fixed window: requests plus input/output tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowUsage {
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl WindowUsage {
    /// Whether every accumulator is within `limits`. All three must hold.
    pub fn within(&self, limits: &RateLimits) -> bool {
        self.requests <= limits.rpm
            && self.input_tokens <= limits.input_tpm
            && self.output_tokens <= limits.output_tpm
    }
}

/// Machine-readable reason attached to every denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    QuotaExceeded,
    PlanInactive,
    ModelNotPermitted,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::QuotaExceeded => "quota_exceeded",
            DenyReason::PlanInactive => "plan_inactive",
            DenyReason::ModelNotPermitted => "model_not_permitted",
        }
    }
}

/// Outcome of one admission check. A value returned to the caller, not
/// stored anywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitResult {
    pub allowed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,

    /// Entity-wide counters for the current window, post-increment.
    pub current_usage: WindowUsage,

    /// Counters for the requested model in the current window, post-increment.
    pub model_usage: WindowUsage,

    /// The limits the decision was made against.
    pub applied_limits: RateLimits,

    /// The per-model override, if one exists on the plan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_limits: Option<RateLimits>,
}

/// An immutable historical fact: token usage for one completed call.
/// Appended once for audit/analytics, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub tenant_id: String,
    pub entity_id: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl UsageRecord {
    pub fn new(
        tenant_id: String,
        entity_id: String,
        model: String,
        input_tokens: i64,
        output_tokens: i64,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            tenant_id,
            entity_id,
            model,
            input_tokens,
            output_tokens,
            timestamp: Utc::now(),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_requires_all_three() {
        let limits = RateLimits {
            input_tpm: 100,
            output_tpm: 100,
            rpm: 2,
        };

        let ok = WindowUsage {
            requests: 2,
            input_tokens: 100,
            output_tokens: 100,
        };
        assert!(ok.within(&limits));

        // Partial compliance is still a denial.
        let over_requests = WindowUsage {
            requests: 3,
            ..ok
        };
        assert!(!over_requests.within(&limits));

        let over_input = WindowUsage {
            input_tokens: 101,
            ..ok
        };
        assert!(!over_input.within(&limits));

        let over_output = WindowUsage {
            output_tokens: 101,
            ..ok
        };
        assert!(!over_output.within(&limits));
    }

    #[test]
    fn test_deny_reason_wire_form() {
        assert_eq!(
            serde_json::to_string(&DenyReason::QuotaExceeded).unwrap(),
            "\"quota_exceeded\""
        );
        assert_eq!(DenyReason::ModelNotPermitted.as_str(), "model_not_permitted");
    }
}

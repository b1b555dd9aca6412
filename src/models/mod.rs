//! Data models for the gateway's quota subsystem.

pub mod plan;
pub mod usage;

pub use plan::{EntityType, RateLimits, UsagePlan, NO_TENANT, WILDCARD_MODEL};
pub use usage::{DenyReason, RateLimitResult, UsageRecord, WindowUsage};

//! Quota cache: write-through plan entries and atomic window counters.
//!
//! Backed by Redis in production. Counter updates go through a single Lua
//! script so concurrent callers across gateway instances never observe a
//! read-then-write gap, and so expiry is set exactly once per window key.

use crate::config::RedisConfig;
use crate::models::{EntityType, UsagePlan, WindowUsage};
use crate::services::error::ServiceError;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Script};
use std::time::Duration;

/// Identifies one counter window: entity, model, and the fixed-window id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub model: String,
    pub window_id: u64,
}

impl WindowKey {
    /// Cache key for the per-model counters.
    pub fn model_key(&self) -> String {
        format!(
            "usage:{}:{}:{}:{}",
            self.entity_type, self.entity_id, self.model, self.window_id
        )
    }

    /// Cache key for the entity-wide aggregate counters.
    pub fn entity_key(&self) -> String {
        format!(
            "usage:{}:{}:_all:{}",
            self.entity_type, self.entity_id, self.window_id
        )
    }
}

fn plan_key(entity_id: &str, entity_type: EntityType) -> String {
    format!("plan:{}:{}", entity_type, entity_id)
}

#[async_trait]
pub trait QuotaCache: Send + Sync {
    async fn get_plan(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Option<UsagePlan>, ServiceError>;

    async fn put_plan(&self, plan: &UsagePlan, ttl_seconds: u64) -> Result<(), ServiceError>;

    async fn delete_plan(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<(), ServiceError>;

    /// Atomically add `deltas` to the model and entity counters for `key`,
    /// setting expiry only when a key is first created. Returns the
    /// post-increment snapshots as `(model_usage, entity_usage)`.
    async fn incr_window(
        &self,
        key: &WindowKey,
        deltas: WindowUsage,
        ttl_seconds: u64,
    ) -> Result<(WindowUsage, WindowUsage), ServiceError>;

    /// Apply a signed token correction to a still-live window. Returns
    /// `false` without touching anything when the window has expired; an
    /// expired window is never re-created.
    async fn adjust_window(
        &self,
        key: &WindowKey,
        input_delta: i64,
        output_delta: i64,
    ) -> Result<bool, ServiceError>;

    async fn health_check(&self) -> Result<(), ServiceError>;
}

/// Atomic increment of both window hashes. EXPIRE runs only on creation so a
/// window's lifetime is fixed at first touch.
const INCR_SCRIPT: &str = r#"
local function bump(key)
  local created = redis.call('EXISTS', key) == 0
  local r = redis.call('HINCRBY', key, 'requests', ARGV[1])
  local i = redis.call('HINCRBY', key, 'input_tokens', ARGV[2])
  local o = redis.call('HINCRBY', key, 'output_tokens', ARGV[3])
  if created then
    redis.call('EXPIRE', key, ARGV[4])
  end
  return {r, i, o}
end
local m = bump(KEYS[1])
local e = bump(KEYS[2])
return {m[1], m[2], m[3], e[1], e[2], e[3]}
"#;

/// Reconciliation delta, guarded so an expired window is never re-created.
const ADJUST_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HINCRBY', KEYS[1], 'input_tokens', ARGV[1])
redis.call('HINCRBY', KEYS[1], 'output_tokens', ARGV[2])
if redis.call('EXISTS', KEYS[2]) == 1 then
  redis.call('HINCRBY', KEYS[2], 'input_tokens', ARGV[1])
  redis.call('HINCRBY', KEYS[2], 'output_tokens', ARGV[2])
end
return 1
"#;

pub struct RedisQuotaCache {
    manager: ConnectionManager,
    timeout: Duration,
    incr_script: Script,
    adjust_script: Script,
}

impl RedisQuotaCache {
    pub async fn new(config: &RedisConfig, timeout_ms: u64) -> Result<Self, ServiceError> {
        tracing::info!(url = %config.url, "Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // ConnectionManager reconnects automatically after transient drops.
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            ServiceError::CacheUnavailable(format!("Failed to connect to Redis: {}", e))
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            manager,
            timeout: Duration::from_millis(timeout_ms),
            incr_script: Script::new(INCR_SCRIPT),
            adjust_script: Script::new(ADJUST_SCRIPT),
        })
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, redis::RedisError>>,
    ) -> Result<T, ServiceError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(val)) => Ok(val),
            Ok(Err(e)) => Err(ServiceError::CacheUnavailable(e.to_string())),
            Err(_) => Err(ServiceError::CacheUnavailable(format!(
                "Cache operation timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl QuotaCache for RedisQuotaCache {
    async fn get_plan(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Option<UsagePlan>, ServiceError> {
        let mut conn = self.manager.clone();
        let key = plan_key(entity_id, entity_type);

        let raw: Option<String> = self
            .bounded(redis::cmd("GET").arg(&key).query_async(&mut conn))
            .await?;

        match raw {
            Some(json) => match serde_json::from_str(&json) {
                Ok(plan) => Ok(Some(plan)),
                Err(e) => {
                    // A corrupt entry behaves like a miss; the store copy wins.
                    tracing::warn!(key = %key, error = %e, "Discarding undecodable cached plan");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn put_plan(&self, plan: &UsagePlan, ttl_seconds: u64) -> Result<(), ServiceError> {
        let mut conn = self.manager.clone();
        let key = plan_key(&plan.entity_id, plan.entity_type);
        let json = serde_json::to_string(plan)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to encode plan: {}", e)))?;

        self.bounded(
            redis::cmd("SET")
                .arg(&key)
                .arg(json)
                .arg("EX")
                .arg(ttl_seconds)
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn delete_plan(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<(), ServiceError> {
        let mut conn = self.manager.clone();
        let key = plan_key(entity_id, entity_type);

        self.bounded(redis::cmd("DEL").arg(&key).query_async::<_, ()>(&mut conn))
            .await
    }

    async fn incr_window(
        &self,
        key: &WindowKey,
        deltas: WindowUsage,
        ttl_seconds: u64,
    ) -> Result<(WindowUsage, WindowUsage), ServiceError> {
        let mut conn = self.manager.clone();

        let counts: Vec<i64> = self
            .bounded(
                self.incr_script
                    .key(key.model_key())
                    .key(key.entity_key())
                    .arg(deltas.requests)
                    .arg(deltas.input_tokens)
                    .arg(deltas.output_tokens)
                    .arg(ttl_seconds)
                    .invoke_async(&mut conn),
            )
            .await?;

        if counts.len() != 6 {
            return Err(ServiceError::Internal(anyhow::anyhow!(
                "Counter script returned {} values, expected 6",
                counts.len()
            )));
        }

        let model_usage = WindowUsage {
            requests: counts[0],
            input_tokens: counts[1],
            output_tokens: counts[2],
        };
        let entity_usage = WindowUsage {
            requests: counts[3],
            input_tokens: counts[4],
            output_tokens: counts[5],
        };

        Ok((model_usage, entity_usage))
    }

    async fn adjust_window(
        &self,
        key: &WindowKey,
        input_delta: i64,
        output_delta: i64,
    ) -> Result<bool, ServiceError> {
        let mut conn = self.manager.clone();

        let applied: i64 = self
            .bounded(
                self.adjust_script
                    .key(key.model_key())
                    .key(key.entity_key())
                    .arg(input_delta)
                    .arg(output_delta)
                    .invoke_async(&mut conn),
            )
            .await?;

        Ok(applied == 1)
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        let mut conn = self.manager.clone();
        self.bounded(redis::cmd("PING").query_async::<_, ()>(&mut conn))
            .await
    }
}

/// In-memory cache with the same semantics, for tests and local runs.
pub struct MemoryQuotaCache {
    entries: std::sync::Mutex<std::collections::HashMap<String, MemoryEntry>>,
    failing: std::sync::atomic::AtomicBool,
}

enum MemoryValue {
    Plan(UsagePlan),
    Counters(WindowUsage),
}

struct MemoryEntry {
    value: MemoryValue,
    expires_at: std::time::Instant,
}

impl Default for MemoryQuotaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQuotaCache {
    pub fn new() -> Self {
        Self {
            entries: std::sync::Mutex::new(std::collections::HashMap::new()),
            failing: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Make every subsequent operation fail, to exercise the degradation path.
    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ServiceError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ServiceError::CacheUnavailable(
                "Simulated cache outage".to_string(),
            ));
        }
        Ok(())
    }

    fn lock(
        &self,
    ) -> Result<
        std::sync::MutexGuard<'_, std::collections::HashMap<String, MemoryEntry>>,
        ServiceError,
    > {
        self.entries
            .lock()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Cache mutex poisoned: {}", e)))
    }
}

#[async_trait]
impl QuotaCache for MemoryQuotaCache {
    async fn get_plan(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Option<UsagePlan>, ServiceError> {
        self.check_available()?;
        let entries = self.lock()?;
        let entry = entries.get(&plan_key(entity_id, entity_type));
        Ok(match entry {
            Some(e) if e.expires_at > std::time::Instant::now() => match &e.value {
                MemoryValue::Plan(plan) => Some(plan.clone()),
                MemoryValue::Counters(_) => None,
            },
            _ => None,
        })
    }

    async fn put_plan(&self, plan: &UsagePlan, ttl_seconds: u64) -> Result<(), ServiceError> {
        self.check_available()?;
        let mut entries = self.lock()?;
        entries.insert(
            plan_key(&plan.entity_id, plan.entity_type),
            MemoryEntry {
                value: MemoryValue::Plan(plan.clone()),
                expires_at: std::time::Instant::now() + Duration::from_secs(ttl_seconds),
            },
        );
        Ok(())
    }

    async fn delete_plan(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<(), ServiceError> {
        self.check_available()?;
        let mut entries = self.lock()?;
        entries.remove(&plan_key(entity_id, entity_type));
        Ok(())
    }

    async fn incr_window(
        &self,
        key: &WindowKey,
        deltas: WindowUsage,
        ttl_seconds: u64,
    ) -> Result<(WindowUsage, WindowUsage), ServiceError> {
        self.check_available()?;
        let mut entries = self.lock()?;
        let now = std::time::Instant::now();

        let mut bump = |cache_key: String| -> Result<WindowUsage, ServiceError> {
            let entry = entries.entry(cache_key).or_insert_with(|| MemoryEntry {
                value: MemoryValue::Counters(WindowUsage::default()),
                expires_at: now + Duration::from_secs(ttl_seconds),
            });
            if entry.expires_at <= now {
                entry.value = MemoryValue::Counters(WindowUsage::default());
                entry.expires_at = now + Duration::from_secs(ttl_seconds);
            }
            match &mut entry.value {
                MemoryValue::Counters(usage) => {
                    usage.requests += deltas.requests;
                    usage.input_tokens += deltas.input_tokens;
                    usage.output_tokens += deltas.output_tokens;
                    Ok(*usage)
                }
                MemoryValue::Plan(_) => Err(ServiceError::Internal(anyhow::anyhow!(
                    "Counter key holds a plan entry"
                ))),
            }
        };

        let model_usage = bump(key.model_key())?;
        let entity_usage = bump(key.entity_key())?;
        Ok((model_usage, entity_usage))
    }

    async fn adjust_window(
        &self,
        key: &WindowKey,
        input_delta: i64,
        output_delta: i64,
    ) -> Result<bool, ServiceError> {
        self.check_available()?;
        let mut entries = self.lock()?;
        let now = std::time::Instant::now();

        let live = entries
            .get(&key.model_key())
            .map(|e| e.expires_at > now)
            .unwrap_or(false);
        if !live {
            return Ok(false);
        }

        for cache_key in [key.model_key(), key.entity_key()] {
            if let Some(entry) = entries.get_mut(&cache_key) {
                if let MemoryValue::Counters(usage) = &mut entry.value {
                    usage.input_tokens += input_delta;
                    usage.output_tokens += output_delta;
                }
            }
        }
        Ok(true)
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_key(model: &str, window_id: u64) -> WindowKey {
        WindowKey {
            entity_id: "user-1".to_string(),
            entity_type: EntityType::User,
            model: model.to_string(),
            window_id,
        }
    }

    #[test]
    fn test_key_shapes() {
        let key = window_key("claude-3", 12345);
        assert_eq!(key.model_key(), "usage:USER:user-1:claude-3:12345");
        assert_eq!(key.entity_key(), "usage:USER:user-1:_all:12345");
        assert_eq!(plan_key("user-1", EntityType::User), "plan:USER:user-1");
    }

    #[tokio::test]
    async fn test_incr_accumulates_both_scopes() {
        let cache = MemoryQuotaCache::new();
        let deltas = WindowUsage {
            requests: 1,
            input_tokens: 10,
            output_tokens: 5,
        };

        let (model_usage, _) = cache
            .incr_window(&window_key("claude-3", 1), deltas, 60)
            .await
            .unwrap();
        assert_eq!(model_usage.requests, 1);

        // A second model shares the entity aggregate but not the model counters.
        let (model_usage, entity_usage) = cache
            .incr_window(&window_key("gpt-4o", 1), deltas, 60)
            .await
            .unwrap();
        assert_eq!(model_usage.requests, 1);
        assert_eq!(entity_usage.requests, 2);
        assert_eq!(entity_usage.input_tokens, 20);
    }

    #[tokio::test]
    async fn test_new_window_starts_from_zero() {
        let cache = MemoryQuotaCache::new();
        let deltas = WindowUsage {
            requests: 1,
            input_tokens: 50,
            output_tokens: 50,
        };

        cache
            .incr_window(&window_key("claude-3", 1), deltas, 60)
            .await
            .unwrap();
        let (model_usage, _) = cache
            .incr_window(&window_key("claude-3", 2), deltas, 60)
            .await
            .unwrap();
        assert_eq!(model_usage.requests, 1);
        assert_eq!(model_usage.input_tokens, 50);
    }

    #[tokio::test]
    async fn test_adjust_refuses_expired_window() {
        let cache = MemoryQuotaCache::new();
        let key = window_key("claude-3", 1);

        // Never-created window behaves like an expired one.
        assert!(!cache.adjust_window(&key, 5, -3).await.unwrap());

        cache
            .incr_window(
                &key,
                WindowUsage {
                    requests: 1,
                    input_tokens: 10,
                    output_tokens: 10,
                },
                60,
            )
            .await
            .unwrap();
        assert!(cache.adjust_window(&key, 5, -3).await.unwrap());

        let (model_usage, entity_usage) = cache
            .incr_window(&key, WindowUsage::default(), 60)
            .await
            .unwrap();
        assert_eq!(model_usage.input_tokens, 15);
        assert_eq!(model_usage.output_tokens, 7);
        assert_eq!(entity_usage.input_tokens, 15);
    }

    #[tokio::test]
    async fn test_failing_cache_reports_unavailable() {
        let cache = MemoryQuotaCache::new();
        cache.set_failing(true);
        let err = cache
            .get_plan("user-1", EntityType::User)
            .await
            .unwrap_err();
        assert!(err.is_cache_failure());
    }
}

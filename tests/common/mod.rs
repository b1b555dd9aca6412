//! Shared test harness: the full router wired to in-memory fakes, so tests
//! run without Redis, MongoDB, or an upstream provider.

use llm_gateway::config::{
    CommonConfig, Environment, FailurePolicy, GatewayConfig, MongoConfig, ProviderConfig,
    QuotaConfig, RedisConfig, SecurityConfig,
};
use llm_gateway::services::providers::mock::MockChatProvider;
use llm_gateway::services::{MemoryQuotaCache, MemoryQuotaStore};
use llm_gateway::{build_router, AppState};
use std::sync::Arc;

pub const TEST_ADMIN_KEY: &str = "test-admin-key";

pub struct TestApp {
    pub router: axum::Router,
    pub state: AppState,
    pub cache: Arc<MemoryQuotaCache>,
    pub store: Arc<MemoryQuotaStore>,
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        common: CommonConfig { port: 8080 },
        environment: Environment::Dev,
        service_name: "llm-gateway-test".to_string(),
        service_version: "0.0.0".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: "http://localhost:4317".to_string(),
        mongodb: MongoConfig {
            uri: "mongodb://unused".to_string(),
            database: "unused".to_string(),
        },
        redis: RedisConfig {
            url: "redis://unused".to_string(),
        },
        quota: QuotaConfig {
            window_seconds: 60,
            plan_cache_ttl_seconds: 300,
            cache_timeout_ms: 200,
            failure_policy: FailurePolicy::Open,
            default_rpm: 100,
            default_input_tpm: 100_000,
            default_output_tpm: 100_000,
            default_output_estimate: 256,
        },
        provider: ProviderConfig {
            base_url: "http://unused".to_string(),
            api_key: String::new(),
            use_mock: true,
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            admin_api_key: TEST_ADMIN_KEY.to_string(),
        },
    }
}

pub fn build_test_app(config: GatewayConfig) -> TestApp {
    let cache = Arc::new(MemoryQuotaCache::new());
    let store = Arc::new(MemoryQuotaStore::new());
    let provider = Arc::new(MockChatProvider::new(true));

    let state = AppState::new(config, cache.clone(), store.clone(), provider);
    let router = build_router(state.clone());

    TestApp {
        router,
        state,
        cache,
        store,
    }
}

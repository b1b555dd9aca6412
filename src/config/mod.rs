use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: String,
    pub mongodb: MongoConfig,
    pub redis: RedisConfig,
    pub quota: QuotaConfig,
    pub provider: ProviderConfig,
    pub security: SecurityConfig,
}

/// Settings shared with every service via a file-based `configuration` source
/// plus `APP__`-prefixed environment overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct CommonConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

impl CommonConfig {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// What an admission check does when the cache is unreachable or times out.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Allow the call and log the degradation. A quota overrun is
    /// recoverable; a full gateway outage is not.
    Open,
    /// Deny the call while the cache is down.
    Closed,
}

/// Quota enforcement settings, immutable after startup and injected into the
/// plan manager, admission controller, and reconciler.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QuotaConfig {
    /// Fixed window length. Counters expire with their window; there is no
    /// cross-window carryover.
    pub window_seconds: u64,

    /// TTL for write-through plan entries in the cache.
    pub plan_cache_ttl_seconds: u64,

    /// Bound on any single cache round trip before the failure policy kicks in.
    pub cache_timeout_ms: u64,

    pub failure_policy: FailurePolicy,

    /// Limits applied to implicitly created plans.
    pub default_rpm: i64,
    pub default_input_tpm: i64,
    pub default_output_tpm: i64,

    /// Output-token estimate used when a request does not set `max_tokens`.
    pub default_output_estimate: i64,
}

impl QuotaConfig {
    pub fn default_limits(&self) -> crate::models::RateLimits {
        crate::models::RateLimits {
            input_tpm: self.default_input_tpm,
            output_tpm: self.default_output_tpm,
            rpm: self.default_rpm,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// OpenAI-compatible completions endpoint base, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: String,
    /// Serve canned responses instead of calling the upstream provider.
    pub use_mock: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub admin_api_key: String,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = CommonConfig::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let is_prod = environment == Environment::Prod;

        let config = GatewayConfig {
            common,
            environment,
            service_name: get_env("SERVICE_NAME", Some("llm-gateway"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: get_env("OTLP_ENDPOINT", Some("http://tempo:4317"), is_prod)?,
            mongodb: MongoConfig {
                uri: get_env("MONGODB_URI", None, is_prod)?,
                database: get_env("MONGODB_DATABASE", Some("llm_gateway"), is_prod)?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", None, is_prod)?,
            },
            quota: QuotaConfig {
                window_seconds: parse_env("QUOTA_WINDOW_SECONDS", "60", is_prod)?,
                plan_cache_ttl_seconds: parse_env("QUOTA_PLAN_CACHE_TTL_SECONDS", "300", is_prod)?,
                cache_timeout_ms: parse_env("QUOTA_CACHE_TIMEOUT_MS", "200", is_prod)?,
                failure_policy: match get_env("QUOTA_FAILURE_POLICY", Some("open"), is_prod)?
                    .to_lowercase()
                    .as_str()
                {
                    "open" => FailurePolicy::Open,
                    "closed" => FailurePolicy::Closed,
                    other => {
                        return Err(AppError::ConfigError(anyhow::anyhow!(
                            "Invalid QUOTA_FAILURE_POLICY: {}",
                            other
                        )))
                    }
                },
                default_rpm: parse_env("QUOTA_DEFAULT_RPM", "60", is_prod)?,
                default_input_tpm: parse_env("QUOTA_DEFAULT_INPUT_TPM", "10000", is_prod)?,
                default_output_tpm: parse_env("QUOTA_DEFAULT_OUTPUT_TPM", "10000", is_prod)?,
                default_output_estimate: parse_env("QUOTA_DEFAULT_OUTPUT_ESTIMATE", "256", is_prod)?,
            },
            provider: ProviderConfig {
                base_url: get_env(
                    "PROVIDER_BASE_URL",
                    Some("https://api.openai.com/v1"),
                    is_prod,
                )?,
                api_key: get_env("PROVIDER_API_KEY", Some(""), is_prod)?,
                use_mock: get_env("PROVIDER_USE_MOCK", Some("false"), is_prod)?
                    .parse()
                    .unwrap_or(false),
            },
            security: SecurityConfig {
                allowed_origins: get_env("ALLOWED_ORIGINS", Some("http://localhost:3000"), is_prod)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
                admin_api_key: get_env("ADMIN_API_KEY", None, true)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.quota.window_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "QUOTA_WINDOW_SECONDS must be positive"
            )));
        }

        if self.quota.default_rpm <= 0
            || self.quota.default_input_tpm <= 0
            || self.quota.default_output_tpm <= 0
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Default quota limits must be positive"
            )));
        }

        if self.environment == Environment::Prod
            && self.security.allowed_origins.iter().any(|o| o == "*")
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Wildcard CORS origin not allowed in production"
            )));
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?.parse().map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("{} is not a valid value for {}", e, key))
    })
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

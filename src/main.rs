use llm_gateway::{
    build_router,
    config::GatewayConfig,
    error::AppError,
    observability::init_tracing,
    services::providers::{mock::MockChatProvider, openai::OpenAiChatProvider, ChatProvider},
    services::{MongoQuotaStore, RedisQuotaCache},
    AppState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = GatewayConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        &config.otlp_endpoint,
    );

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting LLM gateway"
    );

    let store = MongoQuotaStore::connect(&config.mongodb)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
    store
        .initialize_indexes()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
    tracing::info!("Quota store initialized");

    let cache = RedisQuotaCache::new(&config.redis, config.quota.cache_timeout_ms)
        .await
        .map_err(|e| AppError::ServiceUnavailable(e.to_string()))?;
    tracing::info!("Quota cache initialized");

    let provider: Arc<dyn ChatProvider> = if config.provider.use_mock {
        tracing::warn!("Serving canned completions from the mock provider");
        Arc::new(MockChatProvider::new(true))
    } else {
        Arc::new(OpenAiChatProvider::new(config.provider.clone()))
    };

    let port = config.common.port;
    let state = AppState::new(config, Arc::new(cache), Arc::new(store), provider);
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to install signal handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}

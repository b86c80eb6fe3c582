mod config;
mod db;
mod errors;
mod insights;
mod llm_client;
mod models;
mod routes;
mod state;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::db::create_pool;
use crate::insights::clock::SystemClock;
use crate::insights::cooldown::PgCooldownStore;
use crate::insights::coordinator::{CoordinatorParts, CoordinatorSettings, GenerationCoordinator};
use crate::insights::lock::RedisGenerationLock;
use crate::insights::policy::CategoryPolicyRegistry;
use crate::insights::providers::{LlmInsightGenerator, PgSnapshotProvider};
use crate::insights::store::PgInsightStore;
use crate::llm_client::LlmClient;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails fast on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Insight API v{}", env!("CARGO_PKG_VERSION"));

    // Category policies are fixed for the life of the process
    let registry = CategoryPolicyRegistry::load(config.insights.policy_file.as_deref())?;

    // Initialize PostgreSQL
    let db = create_pool(&config.database_url).await?;

    // Initialize Redis (generation leases)
    let redis = redis::Client::open(config.redis_url.clone())?;
    info!("Redis client initialized");

    // Initialize LLM client; its HTTP timeout never outlives a generation attempt
    let llm = LlmClient::new(
        config.anthropic_api_key.clone(),
        config.insights.generation_timeout,
    )?;
    info!("LLM client initialized (model: {})", llm_client::MODEL);

    let generator = LlmInsightGenerator::new(llm, &registry);

    let coordinator = GenerationCoordinator::new(CoordinatorParts {
        registry,
        cooldowns: Arc::new(PgCooldownStore::new(db.clone())),
        insights: Arc::new(PgInsightStore::new(db.clone())),
        lock: Arc::new(RedisGenerationLock::new(redis)),
        snapshots: Arc::new(PgSnapshotProvider::new(db)),
        generator: Arc::new(generator),
        clock: Arc::new(SystemClock),
        settings: CoordinatorSettings {
            generation_timeout: config.insights.generation_timeout,
            lock_wait: config.insights.lock_wait,
            recent_limit: config.insights.recent_limit,
        },
    });

    // Expired insights are never served; the sweeper only reclaims rows
    coordinator.spawn_expiry_sweeper(config.insights.purge_interval);

    // Build app state
    let state = AppState { coordinator };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict origins once the web client domain is fixed

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

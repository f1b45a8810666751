//! Flowforge orchestration server.
//!
//! Wires the durable store, adapter registry, engine, and HTTP control
//! API together, then runs until interrupted.

mod api;
mod config;

use api::AppState;
use config::ServerConfig;
use flowforge_agent::claude::ClaudeConfig;
use flowforge_agent::codex::CodexConfig;
use flowforge_agent::{
    AdapterRegistry, ClaudeCodeAdapter, CodexAdapter, CombinedAdapter, DockerExecutor,
    MockAdapter, PromptBuilder,
};
use flowforge_engine::{EventBus, FlowExecutor};
use flowforge_store::PgStore;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stock roles mapped at boot. Database-configured roles refine these
/// at dispatch time.
const STOCK_ROLES: [&str; 4] = [
    "requirement-analyst",
    "general-developer",
    "code-reviewer",
    "qa-engineer",
];

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    // Database pool + migrations.
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .expect("failed to run migrations");

    let store = Arc::new(PgStore::new(db_pool));
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(build_registry(&config));

    let engine = Arc::new(
        FlowExecutor::new(store, bus.clone(), registry)
            .with_workers(config.workers)
            .with_poll_interval(Duration::from_millis(config.poll_interval_ms)),
    );

    let shutdown = CancellationToken::new();
    engine
        .clone()
        .start(shutdown.clone())
        .await
        .expect("failed to start engine");
    tracing::info!(workers = config.workers, "Engine started");

    let app = api::router(AppState {
        engine: engine.clone(),
        bus,
    })
    .layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind to address");
    tracing::info!("listening on http://{}", config.listen_addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for ctrl-c");
            tracing::info!("Shutting down...");
            server_shutdown.cancel();
        })
        .await
        .expect("server error");

    shutdown.cancel();
    tracing::info!("Server stopped");
}

/// Builds the adapter registry: the mock adapter is always present, and
/// the container-backed adapters are wired when Docker and credentials
/// are available.
fn build_registry(config: &ServerConfig) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(MockAdapter::new()));

    let prompt_builder = Arc::new(PromptBuilder::new());
    let timeout = Duration::from_secs(config.agent.timeout_secs);

    let mut provider = "mock";

    match DockerExecutor::new(config.agent.claude_image.clone().unwrap_or_default()) {
        Ok(executor) => {
            let executor = Arc::new(executor.with_default_timeout(timeout));

            let claude = ClaudeCodeAdapter::new(
                prompt_builder.clone(),
                ClaudeConfig {
                    model: config.agent.claude_model.clone().unwrap_or_default(),
                    image: config.agent.claude_image.clone().unwrap_or_default(),
                    timeout: Some(timeout),
                    ..Default::default()
                },
            );
            registry.register(Arc::new(CombinedAdapter::new(
                Arc::new(claude),
                executor.clone(),
            )));

            let codex = CodexAdapter::new(
                prompt_builder,
                CodexConfig {
                    model: config.agent.codex_model.clone().unwrap_or_default(),
                    image: config.agent.codex_image.clone().unwrap_or_default(),
                    timeout: Some(timeout),
                    ..Default::default()
                },
            );
            registry.register(Arc::new(CombinedAdapter::new(Arc::new(codex), executor)));

            let has_anthropic = std::env::var("ANTHROPIC_API_KEY").is_ok()
                || std::env::var("ANTHROPIC_AUTH_TOKEN").is_ok();
            let has_openai = std::env::var("OPENAI_API_KEY").is_ok();

            provider = if has_anthropic {
                tracing::info!("Claude Code adapter enabled");
                "claude-code"
            } else if has_openai {
                tracing::info!("Codex adapter enabled");
                "codex"
            } else {
                tracing::warn!("no agent credentials set, using mock adapter");
                "mock"
            };
        }
        Err(e) => {
            tracing::warn!(error = %e, "Docker not available, using mock adapter only");
        }
    }

    for role in STOCK_ROLES {
        registry.map_role(role, provider, None);
    }

    registry
}

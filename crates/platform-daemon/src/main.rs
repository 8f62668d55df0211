//! `platform-daemon` entry point.
//!
//! Intentionally thin: it loads configuration and secrets, builds the
//! shared state, wires the background workers (relay, sweeper, fast-path
//! pool, inbox reaper), and starts the HTTP server. All route handlers
//! live in `routes.rs`; all shared state types live in `state.rs` —
//! matching the teacher's `mqk-daemon::main` split.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use platform_daemon::{routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use platform_broker::memory::MemoryBroker;
use platform_broker::router::BrokerRouter;
use platform_execution::CommandBus;
use platform_handlers::Registry;
use platform_inbox::reaper::ReaperWorker;
use platform_inbox::ConsumerConfig;
use platform_process::manager::{ManagerConfig, ProcessManager};
use platform_relay::{FastPathWorkerPool, RelayConfig, RelayWorker, SweeperWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Dev convenience; silent if the file does not exist. Production
    // injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let loaded = load_config()?;
    let config = platform_config::PlatformConfig::from_loaded(&loaded).context("parse platform config")?;
    info!(config_hash = %loaded.config_hash, "loaded configuration");

    let secrets = platform_config::secrets::resolve_secrets(&loaded.config_json)
        .context("resolve secrets: daemon cannot start without a database DSN")?;

    let pool = platform_db::connect(&secrets.database_url).await?;
    platform_db::migrate(&pool).await?;

    let broker = Arc::new(MemoryBroker::new());
    let router = Arc::new(BrokerRouter::new(broker.clone(), broker.clone(), broker.clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let relay_config = RelayConfig {
        sweep_interval: config.sweep_interval(),
        batch_size: config.outbox_batch_size,
        stuck_threshold: config.stuck_threshold(),
        backoff_max: config.max_backoff(),
        ..RelayConfig::default()
    };
    let caps = platform_db::Capabilities::detect_postgres();
    RelayWorker::spawn(pool.clone(), caps, router.clone(), relay_config.clone(), shutdown_rx.clone());
    SweeperWorker::spawn(pool.clone(), Duration::from_secs(5), config.stuck_threshold(), shutdown_rx.clone());

    if let Some(fastpath_rx) = broker.take_fastpath_receiver() {
        FastPathWorkerPool::spawn(
            fastpath_rx,
            pool.clone(),
            router.clone(),
            relay_config.claimer.clone(),
            config.fastpath_concurrency,
            relay_config.backoff_base,
            relay_config.backoff_max,
            shutdown_rx.clone(),
        );
    }

    ReaperWorker::spawn(pool.clone(), Duration::from_secs(5), 100, shutdown_rx.clone());

    let command_bus = Arc::new(CommandBus::new(pool.clone(), broker.clone()));

    // Domain process configurations register from outside this workspace
    // (spec §1 Non-goals); the daemon boots with none registered, so
    // `executeStep` against an unknown process_type fails fast rather than
    // silently no-opping.
    let process_manager = Arc::new(ProcessManager::new(
        pool.clone(),
        command_bus.clone(),
        Vec::new(),
        platform_inbox::TransientClassifier::default(),
        ManagerConfig::default(),
    )?);

    let shared = Arc::new(state::AppState::new(pool.clone(), config.clone(), command_bus, process_manager.clone()));

    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));
    state::spawn_reply_bridge(
        &broker,
        shared.bus.clone(),
        process_manager,
        platform_inbox::DEFAULT_REPLY_TOPIC,
    );

    // Same Non-goals boundary as the process configurations above: this
    // registry is empty in-tree. `spawn_command_consumers` is wired
    // unconditionally so an embedding binary only has to supply a populated
    // `Registry` to get a live C7 pipeline, without touching this function.
    state::spawn_command_consumers(
        pool,
        &broker,
        Arc::new(Registry::new()),
        platform_inbox::TransientClassifier::default(),
        ConsumerConfig {
            handler_lease: config.handler_lease(),
            max_retries_default: config.max_retries_default,
        },
        shutdown_rx.clone(),
    );

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!("platform-daemon listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("PLATFORM_DAEMON_ADDR").ok()?.parse().ok()
}

/// Layer `PLATFORM_CONFIG_FILES` (colon-separated YAML paths) over the
/// built-in defaults; with no override the daemon boots on
/// `PlatformConfig::default()` alone.
fn load_config() -> anyhow::Result<platform_config::LoadedConfig> {
    match std::env::var("PLATFORM_CONFIG_FILES") {
        Ok(paths) if !paths.trim().is_empty() => {
            let paths: Vec<&str> = paths.split(':').collect();
            platform_config::load_layered_yaml(&paths)
        }
        _ => platform_config::load_layered_yaml_from_strings(&["{}"]),
    }
}

fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
    ];

    let origins: Vec<HeaderValue> = allowed_origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}

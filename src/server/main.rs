// src/server/main.rs
// Entry point for the huddle server
use std::sync::Arc;

use huddle::server::agent::{ConversationAgent, LyzrAgent};
use huddle::server::config::ServerConfig;
use huddle::server::connection::Server;
use huddle::server::database::Database;
use huddle::server::embedding::{EmbeddingProvider, OpenAiEmbeddings};
use huddle::server::geo::{GeoResolver, IpWhoisResolver};
use huddle::server::messages::MessageRouter;
use huddle::server::rooms::RoomRegistry;
use huddle::server::scheduler;
use huddle::server::search::SearchService;
use huddle::server::websocket::PodSocketManager;
use huddle::utils::performance;
use log::{error, info};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    std::env::set_var("RUST_LOG", &log_level);
    env_logger::init();

    let config = ServerConfig::from_env();

    if config.enable_tls {
        info!("TLS is enabled; set TLS_CERT_PATH and TLS_KEY_PATH env vars to point to cert and key PEM files.");
    } else {
        info!("TLS is disabled; connections will be plain TCP.");
    }

    // Initialize database and run migrations
    let database = Arc::new(Database::connect(&config.database_url).await?);
    database.migrate().await.map_err(|e| {
        error!("Database migration failed: {}", e);
        e
    })?;

    // External collaborators. Each degrades to a documented fallback, so a
    // missing key or a dead endpoint never takes the server down.
    let geo: Arc<dyn GeoResolver> = Arc::new(IpWhoisResolver::new());
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(OpenAiEmbeddings::from_env());
    let agent: Arc<dyn ConversationAgent> = Arc::new(LyzrAgent::from_env());

    // Room state lives here for the lifetime of the process; the router and
    // both sweepers all work against this one registry.
    let registry = Arc::new(RoomRegistry::new(
        database.clone(),
        config.pod_min_duration_hours,
        config.pod_max_duration_hours,
    ));
    registry.hydrate().await?;

    let sockets = Arc::new(PodSocketManager::new());
    let router = Arc::new(MessageRouter::new(
        registry.clone(),
        sockets.clone(),
        database.clone(),
    ));
    let search = Arc::new(SearchService::new(
        database.clone(),
        geo.clone(),
        embedder.clone(),
        agent.clone(),
        config.search_radius_m,
    ));

    // Start performance logger in background
    let perf_log_path = std::env::var("PERFORMANCE_LOG_PATH")
        .unwrap_or_else(|_| "data/huddle_performance.log".to_string());
    let perf_db = database.clone();
    tokio::spawn(async move {
        performance::start_performance_logger(perf_db, &perf_log_path).await;
    });

    // Background sweeps: room expiry, icebreakers, trending recompute
    tokio::spawn(scheduler::run_expiry_sweeper(
        registry.clone(),
        config.sweep_interval_secs,
    ));
    tokio::spawn(scheduler::run_icebreaker_scheduler(
        registry.clone(),
        router.clone(),
        database.clone(),
        agent.clone(),
        config.clone(),
    ));
    tokio::spawn(scheduler::run_activity_recompute(
        database.clone(),
        config.activity_recompute_secs,
    ));

    // WebSocket server for live rooms, one port above the command server
    let ws_addr = format!("{}:{}", config.host, config.port + 1);
    let ws_sockets = sockets.clone();
    let ws_registry = registry.clone();
    let ws_router = router.clone();
    let ws_config = config.clone();
    tokio::spawn(async move {
        if let Err(e) =
            start_websocket_server(&ws_addr, ws_sockets, ws_registry, ws_router, ws_config).await
        {
            error!("WebSocket server error: {}", e);
        }
    });
    info!("WebSocket server started on {}:{}", config.host, config.port + 1);

    let server = Arc::new(Server::new(
        database,
        config.clone(),
        registry,
        search,
        geo,
        embedder,
    ));
    server.run(&format!("{}:{}", config.host, config.port)).await?;
    Ok(())
}

async fn start_websocket_server(
    addr: &str,
    sockets: Arc<PodSocketManager>,
    registry: Arc<RoomRegistry>,
    router: Arc<MessageRouter>,
    config: ServerConfig,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on {}", addr);

    while let Ok((stream, addr)) = listener.accept().await {
        info!("New WebSocket connection from {}", addr);
        let sockets = sockets.clone();
        let registry = registry.clone();
        let router = router.clone();
        let config = config.clone();

        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws_stream) => {
                    if let Err(e) = sockets
                        .handle_authenticated_connection(ws_stream, registry, router, config)
                        .await
                    {
                        error!("Error handling WebSocket connection: {}", e);
                    }
                }
                Err(e) => {
                    error!("Error during WebSocket handshake: {}", e);
                }
            }
        });
    }

    Ok(())
}

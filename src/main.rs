//! Chess Arena Server
//!
//! Runs both tiers in one process: the matchmaking lobby and the game
//! session server share a listener and talk through the in-process room
//! service.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use chess_arena::{
    game::record::MemoryRepository,
    matchmaking::rpc::LocalRoomService,
    network::auth::AuthConfig,
    GameServer, Matchmaker, MatchmakingConfig, RegistryConfig, ServerConfig, SessionRegistry,
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    info!("Chess Arena Server v{}", VERSION);

    let auth = AuthConfig::from_env();
    if !auth.is_configured() {
        warn!("No AUTH_SECRET or AUTH_PUBLIC_KEY_PEM set; every connection will be refused");
    }

    let repository = Arc::new(MemoryRepository::new());
    let registry = Arc::new(SessionRegistry::new(
        RegistryConfig::default(),
        repository.clone(),
        repository.clone(),
    ));
    let matchmaker = Arc::new(Matchmaker::new(
        MatchmakingConfig::default(),
        Arc::new(LocalRoomService::new(registry.clone())),
    ));

    let config = ServerConfig::from_env();
    info!("Binding {} (max {} connections)", config.bind_addr, config.max_connections);
    let server = GameServer::new(config, auth, registry, matchmaker, repository);

    let run = server.run();
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
            server.shutdown();
            run.await?;
        }
    }

    Ok(())
}

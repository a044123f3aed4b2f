//! WebSocket Server
//!
//! Accepts TCP connections, verifies the caller's token during the WebSocket
//! handshake, and routes the socket by path:
//! - `/game`: attached to the caller's Player Session
//! - `/matchmaking`: served by the matchmaking lobby
//!
//! Also owns the matchmaker's background tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, instrument, warn};

use crate::game::record::{UserRecord, UserRepository};
use crate::game::registry::SessionRegistry;
use crate::matchmaking::lobby;
use crate::matchmaking::manager::Matchmaker;
use crate::network::auth::{authenticate, AuthConfig, Identity};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Handshake deadline.
    pub handshake_timeout: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            handshake_timeout: Duration::from_secs(10),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `BIND_ADDR` and `MAX_CONNECTIONS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            ..defaults
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Which handler a socket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Game,
    Matchmaking,
}

impl Route {
    fn from_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "/game" => Some(Route::Game),
            "/matchmaking" => Some(Route::Matchmaking),
            _ => None,
        }
    }
}

fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

fn reject(status: StatusCode, message: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message));
    *response.status_mut() = status;
    response
}

struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The chess server.
pub struct GameServer {
    config: ServerConfig,
    auth: Arc<AuthConfig>,
    registry: Arc<SessionRegistry>,
    matchmaker: Arc<Matchmaker>,
    users: Arc<dyn UserRepository>,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a server over an existing registry and matchmaker.
    pub fn new(
        config: ServerConfig,
        auth: AuthConfig,
        registry: Arc<SessionRegistry>,
        matchmaker: Arc<Matchmaker>,
        users: Arc<dyn UserRepository>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            auth: Arc::new(auth),
            registry,
            matchmaker,
            users,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!(
            "Chess server v{} listening on {}",
            self.config.version,
            listener.local_addr()?
        );

        let pairing = tokio::spawn(self.matchmaker.clone().run_pairing_loop());
        let listener_task = tokio::spawn(self.matchmaker.clone().run_event_listener());

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connections.load(Ordering::SeqCst) >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        pairing.abort();
        listener_task.abort();
        self.registry.shutdown_all("Server shutting down").await;

        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let guard = ConnectionGuard(self.connections.clone());

        let auth = self.auth.clone();
        let registry = self.registry.clone();
        let matchmaker = self.matchmaker.clone();
        let users = self.users.clone();
        let handshake_timeout = self.config.handshake_timeout;

        tokio::spawn(async move {
            let _guard = guard;
            let mut admitted: Option<(Route, Identity)> = None;

            let callback = |request: &Request, response: Response| {
                let Some(route) = Route::from_path(request.uri().path()) else {
                    return Err(reject(StatusCode::NOT_FOUND, "unknown endpoint".into()));
                };
                match authenticate(query_param(request.uri().query(), "token"), &auth) {
                    Ok(identity) => {
                        admitted = Some((route, identity));
                        Ok(response)
                    }
                    Err(e) => Err(reject(StatusCode::UNAUTHORIZED, e.to_string())),
                }
            };

            let ws = match tokio::time::timeout(handshake_timeout, accept_hdr_async(stream, callback)).await {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => {
                    debug!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
                Err(_) => {
                    debug!("WebSocket handshake timed out for {}", addr);
                    return;
                }
            };

            let Some((route, identity)) = admitted else {
                return;
            };
            info!("{} authenticated as {} ({:?})", addr, identity.player_id, route);

            let user = UserRecord {
                id: identity.player_id,
                username: identity.username.clone(),
            };
            if let Err(e) = users.upsert_user(user).await {
                warn!("Failed to record user {}: {}", identity.player_id, e);
            }

            match route {
                Route::Game => {
                    let player = registry
                        .get_or_create_player(identity.player_id, &identity.username)
                        .await;
                    let exit = player.update_connection(ws, registry.clone()).await;
                    debug!("Game connection {} ended: {:?}", addr, exit);
                }
                Route::Matchmaking => {
                    let exit = lobby::serve(matchmaker, identity.player_id, ws).await;
                    debug!("Lobby connection {} ended: {:?}", addr, exit);
                }
            }
        });
    }

    /// Stop accepting connections and close every Player Session.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Open sockets.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Resident Player Sessions.
    pub async fn player_count(&self) -> usize {
        self.registry.player_count().await
    }

    /// Live games.
    pub async fn game_count(&self) -> usize {
        self.registry.game_count().await
    }

    /// Matchmaking queue size.
    pub async fn queue_size(&self) -> usize {
        self.matchmaker.queue_len().await
    }
}

//! Test helpers: in-memory WebSocket pairs and message assertions.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, client_async, WebSocketStream};

use crate::game::record::MemoryRepository;
use crate::game::registry::{RegistryConfig, SessionRegistry};
use crate::network::connection::ConnectionConfig;
use crate::network::protocol::{ClientMessage, ServerMessage};

pub(crate) type Socket = WebSocketStream<DuplexStream>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Connected (server, client) WebSocket pair over an in-memory pipe.
pub(crate) async fn ws_pair() -> (Socket, Socket) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (server, client) = tokio::join!(accept_async(a), client_async("ws://localhost/game", b));
    let (client, _) = client.unwrap();
    (server.unwrap(), client)
}

/// Registry timings short enough for tests, with heartbeats out of the way.
pub(crate) fn fast_config() -> RegistryConfig {
    RegistryConfig {
        user_lookup_timeout: Duration::from_secs(1),
        persist_timeout: Duration::from_secs(1),
        end_grace: Duration::from_millis(20),
        connection: ConnectionConfig {
            outbound_capacity: 32,
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(120),
            init_grace: Duration::from_secs(30),
            send_timeout: Duration::from_millis(200),
        },
    }
}

pub(crate) async fn registry_with(
    config: RegistryConfig,
) -> (Arc<SessionRegistry>, Arc<MemoryRepository>) {
    let repo = Arc::new(MemoryRepository::new());
    let registry = Arc::new(SessionRegistry::new(config, repo.clone(), repo.clone()));
    (registry, repo)
}

pub(crate) async fn send<S>(socket: &mut WebSocketStream<S>, message: &ClientMessage)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    socket
        .send(Message::Text(message.to_json().unwrap()))
        .await
        .unwrap();
}

/// Next server message, or None once the transport closes.
pub(crate) async fn recv_any<S>(socket: &mut WebSocketStream<S>) -> Option<ServerMessage>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for a frame");
        match frame {
            Some(Ok(Message::Text(text))) => return Some(ServerMessage::from_json(&text).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// Next non-ping server message.
pub(crate) async fn recv<S>(socket: &mut WebSocketStream<S>) -> ServerMessage
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match recv_any(socket).await {
            Some(ServerMessage::Ping {}) => continue,
            Some(message) => return message,
            None => panic!("transport closed"),
        }
    }
}

/// Skip to the `quit`, returning its reason.
pub(crate) async fn quit_reason<S>(socket: &mut WebSocketStream<S>) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match recv_any(socket).await {
            Some(ServerMessage::Quit { reason }) => return reason,
            Some(_) => continue,
            None => panic!("transport closed without quit"),
        }
    }
}

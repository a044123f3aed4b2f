//! Matchmaking Connection
//!
//! A client's `/matchmaking` socket. Carries `joinQueue` / `leaveQueue` /
//! `ping` inbound and `matchFound` / `ping` / `quit` outbound. One task reads
//! and probes liveness; the outbound queue has its own writer.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{Sink, Stream, StreamExt};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::core::ids::PlayerId;
use crate::matchmaking::manager::Matchmaker;
use crate::network::outbox::{self, run_writer, WriterExit};
use crate::network::protocol::{ClientMessage, ServerMessage};

enum Closed {
    Writer(WriterExit),
    Reader(&'static str),
}

/// Serve one matchmaking connection until it closes.
pub async fn serve<S, E>(matchmaker: Arc<Matchmaker>, player: PlayerId, socket: S) -> WriterExit
where
    S: Stream<Item = Result<Message, E>> + Sink<Message> + Send + 'static,
    <S as Sink<Message>>::Error: Display + Send,
    E: Display + Send + 'static,
{
    let config = matchmaker.config().clone();
    let (outbox, receiver) = outbox::channel(config.outbound_capacity, config.send_timeout);

    if let Some(previous) = matchmaker.register_connection(player, outbox.clone()).await {
        previous.terminate("New connection");
    }
    info!("Player {} joined the lobby", player);

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(run_writer(sink, receiver));

    let mut ticker = interval(config.lobby_heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut last_ping_sent = Instant::now();
    let mut last_ping_received = last_ping_sent;

    let closed = loop {
        tokio::select! {
            exit = &mut writer => {
                break Closed::Writer(exit.unwrap_or(WriterExit::Abandoned));
            }
            _ = ticker.tick() => {
                if last_ping_sent.saturating_duration_since(last_ping_received) > config.lobby_heartbeat_timeout {
                    break Closed::Reader("No ping response");
                }
                if !outbox.send(ServerMessage::Ping {}).await {
                    break Closed::Reader("WS closed");
                }
                last_ping_sent = Instant::now();
            }
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break Closed::Reader("WS closed"),
                    Some(Err(e)) => {
                        debug!("Lobby read error for {}: {}", player, e);
                        break Closed::Reader("WS closed");
                    }
                    Some(Ok(_)) => continue,
                };

                match ClientMessage::from_json(&text) {
                    Ok(ClientMessage::JoinQueue) => {
                        if !matchmaker.enqueue(player, outbox.clone()).await {
                            debug!("Ignoring joinQueue from {}", player);
                        }
                    }
                    Ok(ClientMessage::LeaveQueue) => {
                        matchmaker.leave_queue(player).await;
                    }
                    Ok(ClientMessage::Ping) => last_ping_received = Instant::now(),
                    Ok(other) => debug!("Ignoring {:?} on the lobby connection", other),
                    Err(e) => {
                        warn!("Player {} sent a malformed lobby message: {}", player, e);
                        break Closed::Reader("Malformed message");
                    }
                }
            }
        }
    };

    let exit = match closed {
        Closed::Writer(exit) => exit,
        Closed::Reader(reason) => {
            outbox.terminate(reason);
            writer.await.unwrap_or(WriterExit::Abandoned)
        }
    };

    if matchmaker.on_disconnect(player, &outbox).await {
        info!("Player {} left the lobby", player);
    }
    exit
}

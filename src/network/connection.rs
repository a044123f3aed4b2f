//! Player Session
//!
//! One per user, resident across reconnects. Owns at most one live
//! transport at a time: attaching a new one terminates the previous one.
//!
//! Each transport runs four tasks:
//! - writer: drains the outbound queue; its exit tears the others down
//! - reader: decodes frames and dispatches them
//! - heartbeat: probes liveness and kills silent peers
//! - init grace: kills transports that never send `init`

use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures_util::{Sink, Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::core::ids::{GameId, PlayerId};
use crate::game::registry::SessionRegistry;
use crate::game::session::{GameSession, MoveOutcome};
use crate::network::outbox::{self, run_writer, Delivery, Outbox, WriterExit};
use crate::network::protocol::{ClientMessage, InitRequest, ServerMessage};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Per-transport timings and limits.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Outbound queue capacity.
    pub outbound_capacity: usize,
    /// How often the heartbeat runs.
    pub heartbeat_interval: Duration,
    /// Silence after a probe before the transport is killed.
    pub heartbeat_timeout: Duration,
    /// How long a fresh transport may wait before sending `init`.
    pub init_grace: Duration,
    /// How long an ordinary send waits for queue space.
    pub send_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 100,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(12),
            init_grace: Duration::from_secs(3),
            send_timeout: Duration::from_secs(2),
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Handler failures. Each one terminates the transport that caused it.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// `init` named a room that does not exist.
    #[error("unknown room: {0}")]
    UnknownRoom(String),

    /// A game instruction arrived before `init`.
    #[error("{0} before init")]
    NotInitialized(&'static str),

    /// The attached game is gone.
    #[error("attached game no longer exists")]
    NoGame,
}

// =============================================================================
// SESSION
// =============================================================================

pub(crate) struct PlayerState {
    pub(crate) connected: bool,
    /// Bumped on every attach; tasks of older transports check it and stand down.
    pub(crate) generation: u64,
    pub(crate) outbox: Option<Outbox>,
    pub(crate) last_ping_sent: Instant,
    pub(crate) last_ping_received: Instant,
    pub(crate) init_received: bool,
    /// Game this transport's `init` attached to, seat or spectator.
    pub(crate) attached_game: Option<Weak<GameSession>>,
    /// Game this player is seated in.
    pub(crate) ongoing_game: Option<Weak<GameSession>>,
}

impl PlayerState {
    /// Seated in a game that has not ended.
    pub(crate) fn in_unfinished_game(&self) -> bool {
        self.ongoing_game
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|game| !game.is_ended())
    }
}

/// A connected (or recently connected) user.
pub struct PlayerSession {
    id: PlayerId,
    display_name: String,
    config: ConnectionConfig,
    state: Mutex<PlayerState>,
}

enum Beat {
    Probe,
    Wait,
    Expired,
}

impl PlayerSession {
    /// Create a session with no transport.
    pub fn new(id: PlayerId, display_name: impl Into<String>, config: ConnectionConfig) -> Self {
        let now = Instant::now();
        Self {
            id,
            display_name: display_name.into(),
            config,
            state: Mutex::new(PlayerState {
                connected: false,
                generation: 0,
                outbox: None,
                last_ping_sent: now,
                last_ping_received: now,
                init_received: false,
                attached_game: None,
                ongoing_game: None,
            }),
        }
    }

    /// Player identifier.
    pub fn id(&self) -> PlayerId {
        self.id
    }

    /// Display name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, PlayerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a transport is attached.
    pub fn is_connected(&self) -> bool {
        self.lock_state().connected
    }

    /// The unfinished game this player is seated in. An ended game is
    /// cleared on sight.
    pub fn ongoing_game(&self) -> Option<Arc<GameSession>> {
        let mut state = self.lock_state();
        match state.ongoing_game.as_ref().and_then(Weak::upgrade) {
            Some(game) if !game.is_ended() => Some(game),
            _ => {
                state.ongoing_game = None;
                None
            }
        }
    }

    /// Id of the game this player is seated in, ended or not.
    pub fn seated_game_id(&self) -> Option<GameId> {
        self.lock_state()
            .ongoing_game
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|game| game.id())
    }

    pub(crate) fn clear_ongoing_game(&self, id: GameId) -> bool {
        let mut state = self.lock_state();
        let seated = state
            .ongoing_game
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|game| game.id() == id);
        if seated {
            state.ongoing_game = None;
        }
        seated
    }

    /// Current outbound queue, if connected.
    pub fn outbox(&self) -> Option<Outbox> {
        self.lock_state().outbox.clone()
    }

    /// Queue a message on the live transport.
    ///
    /// Returns false when disconnected or when the queue stayed full.
    pub async fn send(&self, message: ServerMessage) -> bool {
        let outbox = self.outbox();
        match outbox {
            Some(outbox) => outbox.send(message).await,
            None => false,
        }
    }

    /// Queue a message on the live transport without waiting for space.
    pub fn try_send(&self, message: ServerMessage) -> Delivery {
        match self.outbox() {
            Some(outbox) => outbox.try_send(message),
            None => Delivery::Closed,
        }
    }

    /// Queue a `quit` and close the live transport. Returns false when
    /// nothing was attached.
    pub fn terminate(&self, reason: impl Into<String>) -> bool {
        match self.outbox() {
            Some(outbox) => {
                outbox.terminate(reason);
                true
            }
            None => false,
        }
    }

    /// Attach a new transport, terminating the previous one.
    ///
    /// The returned handle resolves when the transport's writer stops, after
    /// the other per-transport tasks have been cancelled.
    pub fn update_connection<S, E>(
        self: &Arc<Self>,
        socket: S,
        registry: Arc<SessionRegistry>,
    ) -> JoinHandle<WriterExit>
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message> + Send + 'static,
        <S as Sink<Message>>::Error: Display + Send,
        E: Display + Send + 'static,
    {
        let (outbox, receiver) =
            outbox::channel(self.config.outbound_capacity, self.config.send_timeout);

        let generation = {
            let mut state = self.lock_state();
            if let Some(previous) = state.outbox.take() {
                previous.terminate("New connection");
            }

            let now = Instant::now();
            state.generation += 1;
            state.connected = true;
            state.init_received = false;
            state.attached_game = None;
            state.last_ping_sent = now;
            state.last_ping_received = now;
            state.outbox = Some(outbox.clone());
            state.generation
        };
        info!("Player {} connected (transport {})", self.id, generation);

        let (sink, stream) = socket.split();

        let reader = tokio::spawn(self.clone().run_reader(
            generation,
            stream,
            outbox.clone(),
            registry,
        ));
        let heartbeat = tokio::spawn(self.clone().run_heartbeat(generation, outbox.clone()));
        let grace = tokio::spawn(self.clone().enforce_init_grace(generation, outbox));

        let session = self.clone();
        tokio::spawn(async move {
            let exit = run_writer(sink, receiver).await;
            reader.abort();
            heartbeat.abort();
            grace.abort();
            session.mark_disconnected(generation);
            debug!("Player {} transport {} closed: {:?}", session.id, generation, exit);
            exit
        })
    }

    fn mark_disconnected(&self, generation: u64) {
        let mut state = self.lock_state();
        if state.generation == generation {
            state.connected = false;
            state.outbox = None;
            state.attached_game = None;
        }
    }

    fn record_activity(&self, generation: u64) {
        let mut state = self.lock_state();
        if state.generation == generation {
            state.last_ping_received = Instant::now();
        }
    }

    async fn run_reader<St, E>(
        self: Arc<Self>,
        generation: u64,
        mut stream: St,
        outbox: Outbox,
        registry: Arc<SessionRegistry>,
    ) where
        St: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let reason = loop {
            let frame = match stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!("Player {} read error: {}", self.id, e);
                    break "WS closed";
                }
                None => break "WS closed",
            };

            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => break "WS closed",
                Message::Binary(_) => {
                    warn!("Player {} sent a binary frame", self.id);
                    break "Malformed message";
                }
                _ => continue,
            };

            let message = match ClientMessage::from_json(&text) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Player {} sent a malformed message: {}", self.id, e);
                    break "Malformed message";
                }
            };

            match self.dispatch(generation, message, &registry).await {
                Ok(()) => self.record_activity(generation),
                Err(e) => {
                    warn!("Player {}: {}", self.id, e);
                    break "Connection killed by handler";
                }
            }
        };

        outbox.terminate(reason);
    }

    async fn run_heartbeat(self: Arc<Self>, generation: u64, outbox: Outbox) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if outbox.is_closed() {
                return;
            }

            let beat = {
                let mut state = self.lock_state();
                if state.generation != generation {
                    return;
                }
                let now = Instant::now();
                if state.last_ping_received >= state.last_ping_sent {
                    state.last_ping_sent = now;
                    Beat::Probe
                } else if now.duration_since(state.last_ping_sent) > self.config.heartbeat_timeout {
                    Beat::Expired
                } else {
                    Beat::Wait
                }
            };

            match beat {
                Beat::Probe => {
                    if !outbox.send(ServerMessage::Ping {}).await {
                        return;
                    }
                }
                Beat::Expired => {
                    info!("Player {} stopped answering pings", self.id);
                    outbox.terminate("No ping response");
                    return;
                }
                Beat::Wait => {}
            }
        }
    }

    async fn enforce_init_grace(self: Arc<Self>, generation: u64, outbox: Outbox) {
        tokio::time::sleep(self.config.init_grace).await;

        let missing = {
            let state = self.lock_state();
            state.generation == generation && !state.init_received
        };
        if missing {
            info!("Player {} never sent init", self.id);
            outbox.terminate("No init message");
        }
    }

    fn attached_game(&self, generation: u64, kind: &'static str) -> Result<Arc<GameSession>, DispatchError> {
        let state = self.lock_state();
        if state.generation != generation || !state.init_received {
            return Err(DispatchError::NotInitialized(kind));
        }
        state
            .attached_game
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(DispatchError::NoGame)
    }

    async fn dispatch(
        self: &Arc<Self>,
        generation: u64,
        message: ClientMessage,
        registry: &Arc<SessionRegistry>,
    ) -> Result<(), DispatchError> {
        match message {
            ClientMessage::Init(request) => self.handle_init(generation, request, registry).await,
            ClientMessage::PlayerMoved(mv) => {
                let game = self.attached_game(generation, "player_moved")?;
                match game.send_move(self, &mv).await {
                    Ok(MoveOutcome::Continue) => {}
                    Ok(MoveOutcome::Ended(conclusion)) => {
                        registry.finish_game(game, conclusion);
                    }
                    Err(rejection) => {
                        warn!("Player {} move {} rejected: {}", self.id, mv.move_notation, rejection);
                    }
                }
                Ok(())
            }
            ClientMessage::Resign => {
                let game = self.attached_game(generation, "resign")?;
                match game.resign(self).await {
                    Ok(conclusion) => {
                        registry.finish_game(game, conclusion);
                    }
                    Err(rejection) => warn!("Player {} resign rejected: {}", self.id, rejection),
                }
                Ok(())
            }
            ClientMessage::Ping => Ok(()),
            ClientMessage::JoinQueue | ClientMessage::LeaveQueue => {
                debug!("Player {} sent a queue instruction on a game connection", self.id);
                Ok(())
            }
        }
    }

    async fn handle_init(
        self: &Arc<Self>,
        generation: u64,
        request: InitRequest,
        registry: &Arc<SessionRegistry>,
    ) -> Result<(), DispatchError> {
        let game = match self.ongoing_game() {
            Some(game) => game,
            None => {
                let id = GameId::parse(&request.room_id)
                    .ok_or_else(|| DispatchError::UnknownRoom(request.room_id.clone()))?;
                registry
                    .game(id)
                    .await
                    .ok_or_else(|| DispatchError::UnknownRoom(request.room_id.clone()))?
            }
        };

        {
            let mut state = self.lock_state();
            if state.generation != generation {
                return Ok(());
            }
            state.init_received = true;
            state.attached_game = Some(Arc::downgrade(&game));
        }

        debug!("Player {} attaching to game {}", self.id, game.id());
        game.add_player(self.clone()).await;
        Ok(())
    }
}

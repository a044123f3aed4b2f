//! Session Registry
//!
//! Process-wide directory of resident players and live games. Creates games
//! for the matchmaker, and winds them down once they end: persist, announce,
//! wait out the grace period, close every participant, evict.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::ids::{GameId, PlayerId};
use crate::game::record::{GameRepository, RepositoryError, UserRepository};
use crate::game::session::{GameConclusion, GameSession};
use crate::network::connection::{ConnectionConfig, PlayerSession};
use crate::network::protocol::{GameEndedInfo, ServerMessage};

/// Events kept while nobody is subscribed.
const EVENT_BACKLOG: usize = 1024;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Bound on a user repository lookup.
    pub user_lookup_timeout: Duration,
    /// Bound on persisting a finished game.
    pub persist_timeout: Duration,
    /// Delay between `game_ended` and closing the participants.
    pub end_grace: Duration,
    /// Settings for every player transport.
    pub connection: ConnectionConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            user_lookup_timeout: Duration::from_secs(5),
            persist_timeout: Duration::from_secs(5),
            end_grace: Duration::from_secs(1),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Both seats name the same player.
    #[error("cannot pair player {0} with themselves")]
    SamePlayer(PlayerId),

    /// The player is seated in an unfinished game.
    #[error("player {0} is already in a game")]
    AlreadyInGame(PlayerId),

    /// The user could not be loaded.
    #[error("user lookup failed: {0}")]
    UserLookup(#[from] RepositoryError),

    /// The user repository did not answer in time.
    #[error("user lookup timed out for {0}")]
    LookupTimeout(PlayerId),
}

/// A finished game, as reported to the matchmaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameEndedEvent {
    /// White seat.
    pub player1: PlayerId,
    /// Black seat.
    pub player2: PlayerId,
}

#[derive(Default)]
struct EventFeed {
    subscriber: Option<mpsc::Sender<GameEndedEvent>>,
    backlog: VecDeque<GameEndedEvent>,
}

/// Directory of players and games.
pub struct SessionRegistry {
    config: RegistryConfig,
    players: RwLock<HashMap<PlayerId, Arc<PlayerSession>>>,
    games: RwLock<HashMap<GameId, Arc<GameSession>>>,
    users: Arc<dyn UserRepository>,
    records: Arc<dyn GameRepository>,
    feed: Mutex<EventFeed>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new(
        config: RegistryConfig,
        users: Arc<dyn UserRepository>,
        records: Arc<dyn GameRepository>,
    ) -> Self {
        Self {
            config,
            players: RwLock::new(HashMap::new()),
            games: RwLock::new(HashMap::new()),
            users,
            records,
            feed: Mutex::new(EventFeed::default()),
        }
    }

    /// Registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // =========================================================================
    // PLAYERS
    // =========================================================================

    /// Return the resident session for `id`, creating it if absent.
    pub async fn get_or_create_player(&self, id: PlayerId, display_name: &str) -> Arc<PlayerSession> {
        if let Some(player) = self.players.read().await.get(&id) {
            return player.clone();
        }

        let mut players = self.players.write().await;
        players
            .entry(id)
            .or_insert_with(|| {
                debug!("Player {} is now resident", id);
                Arc::new(PlayerSession::new(id, display_name, self.config.connection.clone()))
            })
            .clone()
    }

    /// Resident session for `id`.
    pub async fn player(&self, id: PlayerId) -> Option<Arc<PlayerSession>> {
        self.players.read().await.get(&id).cloned()
    }

    /// Number of resident players.
    pub async fn player_count(&self) -> usize {
        self.players.read().await.len()
    }

    async fn resolve_player(&self, id: PlayerId) -> Result<Arc<PlayerSession>, RegistryError> {
        if let Some(player) = self.player(id).await {
            return Ok(player);
        }

        let user = tokio::time::timeout(self.config.user_lookup_timeout, self.users.find_user(id))
            .await
            .map_err(|_| RegistryError::LookupTimeout(id))??;
        Ok(self.get_or_create_player(id, &user.username).await)
    }

    // =========================================================================
    // GAMES
    // =========================================================================

    /// Live game by id.
    pub async fn game(&self, id: GameId) -> Option<Arc<GameSession>> {
        self.games.read().await.get(&id).cloned()
    }

    /// Number of live games.
    pub async fn game_count(&self) -> usize {
        self.games.read().await.len()
    }

    /// Create a game with `white` and `black` seated.
    ///
    /// Fails if either player is seated in an unfinished game. Any transport
    /// either player currently has is closed with `NewGameStarted`.
    pub async fn create_game(
        &self,
        white: PlayerId,
        black: PlayerId,
    ) -> Result<Arc<GameSession>, RegistryError> {
        if white == black {
            return Err(RegistryError::SamePlayer(white));
        }

        let white = self.resolve_player(white).await?;
        let black = self.resolve_player(black).await?;

        let id = GameId::random();
        let game = Arc::new(GameSession::new(id, white.clone(), black.clone()));

        {
            // Lock order: ascending player id.
            let (first, second) = if white.id() < black.id() {
                (&white, &black)
            } else {
                (&black, &white)
            };
            let mut first_state = first.lock_state();
            let mut second_state = second.lock_state();

            if first_state.in_unfinished_game() {
                return Err(RegistryError::AlreadyInGame(first.id()));
            }
            if second_state.in_unfinished_game() {
                return Err(RegistryError::AlreadyInGame(second.id()));
            }

            let reason = format!("NewGameStarted: {}", id);
            for state in [&mut first_state, &mut second_state] {
                if let Some(outbox) = &state.outbox {
                    outbox.terminate(reason.clone());
                }
                state.ongoing_game = Some(Arc::downgrade(&game));
            }
        }

        self.games.write().await.insert(id, game.clone());
        info!("Created game {} ({} vs {})", id, white.id(), black.id());
        Ok(game)
    }

    /// Wind down an ended game.
    ///
    /// Persists the record, announces the result to every participant, then
    /// after the grace period closes them, publishes the event, and evicts
    /// the game and its seats. Runs on its own task, so it completes even if
    /// the transport that ended the game goes away meanwhile.
    pub fn finish_game(
        self: &Arc<Self>,
        game: Arc<GameSession>,
        conclusion: GameConclusion,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move { registry.wind_down(game, conclusion).await })
    }

    async fn wind_down(&self, game: Arc<GameSession>, conclusion: GameConclusion) {
        let GameConclusion {
            record,
            winner,
            seats,
            participants,
        } = conclusion;

        match tokio::time::timeout(self.config.persist_timeout, self.records.upsert_game(record)).await {
            Ok(Ok(())) => debug!("Persisted game {}", game.id()),
            Ok(Err(e)) => error!("Failed to persist game {}: {}", game.id(), e),
            Err(_) => error!("Timed out persisting game {}", game.id()),
        }

        let ended = ServerMessage::GameEnded(GameEndedInfo { winner: winner.to_wire() });
        join_all(participants.iter().map(|p| p.send(ended.clone()))).await;

        tokio::time::sleep(self.config.end_grace).await;

        for participant in game.participants().await {
            participant.terminate("Game ended");
        }

        self.publish_game_ended(GameEndedEvent {
            player1: seats.0,
            player2: seats.1,
        });
        self.evict(&game, [seats.0, seats.1]).await;
    }

    async fn evict(&self, game: &GameSession, seats: [PlayerId; 2]) {
        self.games.write().await.remove(&game.id());

        let mut players = self.players.write().await;
        for id in seats {
            let seated_here = players
                .get(&id)
                .is_some_and(|player| player.clear_ongoing_game(game.id()));
            if seated_here {
                if let Some(player) = players.remove(&id) {
                    player.terminate("Game ended");
                }
            }
        }
        info!("Game {} removed", game.id());
    }

    /// Close every transport.
    pub async fn shutdown_all(&self, reason: &str) {
        for player in self.players.read().await.values() {
            player.terminate(reason);
        }
    }

    // =========================================================================
    // GAME-ENDED FEED
    // =========================================================================

    /// Subscribe to game-ended events. Replaces any previous subscriber and
    /// first delivers what was published while nobody was listening.
    pub fn subscribe_game_ended(&self) -> mpsc::Receiver<GameEndedEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BACKLOG);
        let mut feed = self.feed.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(event) = feed.backlog.pop_front() {
            if tx.try_send(event).is_err() {
                break;
            }
        }
        feed.subscriber = Some(tx);
        rx
    }

    /// Publish a game-ended event.
    pub fn publish_game_ended(&self, event: GameEndedEvent) {
        let mut feed = self.feed.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(tx) = &feed.subscriber {
            match tx.try_send(event) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Game-ended subscriber is lagging; dropping event");
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => feed.subscriber = None,
            }
        }

        if feed.backlog.len() == EVENT_BACKLOG {
            feed.backlog.pop_front();
        }
        feed.backlog.push_back(event);
    }
}

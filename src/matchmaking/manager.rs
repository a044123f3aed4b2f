//! Matchmaking Manager
//!
//! FIFO queue of player ids plus a status per id:
//! - `idle`: connected, not queued
//! - `searching`: queued, exactly once
//! - `playing`: paired, waiting for the game to end
//!
//! A periodic tick pairs the two oldest searching players and asks the
//! session tier for a room. The queue lock is never held across that call.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::core::ids::{GameId, PlayerId};
use crate::matchmaking::rpc::{RoomResponse, RoomService, RoomServiceError};
use crate::network::outbox::Outbox;
use crate::network::protocol::{MatchFoundInfo, ServerMessage};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Matchmaking configuration.
#[derive(Debug, Clone)]
pub struct MatchmakingConfig {
    /// Pairing loop period.
    pub tick: Duration,
    /// Deadline for a room request.
    pub room_request_timeout: Duration,
    /// First delay before reopening a dropped event stream.
    pub stream_retry_initial: Duration,
    /// Ceiling for the reopen delay.
    pub stream_retry_max: Duration,
    /// Lobby ping period.
    pub lobby_heartbeat_interval: Duration,
    /// Lobby silence allowed after a ping.
    pub lobby_heartbeat_timeout: Duration,
    /// Lobby outbound queue capacity.
    pub outbound_capacity: usize,
    /// How long a lobby send waits for queue space.
    pub send_timeout: Duration,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(300),
            room_request_timeout: Duration::from_secs(15),
            stream_retry_initial: Duration::from_secs(1),
            stream_retry_max: Duration::from_secs(30),
            lobby_heartbeat_interval: Duration::from_secs(1),
            lobby_heartbeat_timeout: Duration::from_secs(3),
            outbound_capacity: 100,
            send_timeout: Duration::from_secs(2),
        }
    }
}

// =============================================================================
// QUEUE STATE
// =============================================================================

/// Matchmaking status of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// Connected, not queued.
    Idle,
    /// Waiting in the queue.
    Searching,
    /// Paired.
    Playing,
}

/// Result of one pairing tick.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// Fewer than two entries queued.
    Idle,
    /// Not enough valid entries; the survivors went back to the front.
    Requeued,
    /// A room was created and both players notified.
    Matched {
        /// The new room.
        room_id: GameId,
        /// The pair.
        players: (PlayerId, PlayerId),
    },
    /// The session tier refused the pair; both players are idle again.
    Refused {
        /// The pair.
        players: (PlayerId, PlayerId),
        /// Refusal reason.
        message: String,
    },
    /// The room request failed; both players are searching again.
    Failed {
        /// The pair.
        players: (PlayerId, PlayerId),
        /// Transport error.
        error: RoomServiceError,
    },
}

enum Pairing {
    Idle,
    Requeued,
    Pair(PlayerId, PlayerId),
}

#[derive(Default)]
struct Lobby {
    statuses: HashMap<PlayerId, QueueStatus>,
    queue: VecDeque<PlayerId>,
    outboxes: HashMap<PlayerId, Outbox>,
}

impl Lobby {
    fn dequeue(&mut self, id: PlayerId) {
        self.queue.retain(|queued| *queued != id);
    }

    fn register(&mut self, id: PlayerId, outbox: Outbox) -> Option<Outbox> {
        let previous = self.outboxes.insert(id, outbox);
        let status = self.statuses.entry(id).or_insert(QueueStatus::Idle);
        if *status == QueueStatus::Searching {
            *status = QueueStatus::Idle;
            self.dequeue(id);
        }
        previous
    }

    fn enqueue(&mut self, id: PlayerId, outbox: Outbox) -> bool {
        match self.statuses.get(&id) {
            None | Some(QueueStatus::Idle) => {}
            Some(status) => {
                debug!("Player {} cannot queue while {:?}", id, status);
                return false;
            }
        }

        self.statuses.insert(id, QueueStatus::Searching);
        self.outboxes.insert(id, outbox);
        self.queue.push_back(id);
        true
    }

    fn leave(&mut self, id: PlayerId) -> bool {
        if self.statuses.get(&id) != Some(&QueueStatus::Searching) {
            return false;
        }
        self.statuses.insert(id, QueueStatus::Idle);
        self.dequeue(id);
        true
    }

    fn release(&mut self, id: PlayerId) {
        if let Some(status) = self.statuses.get_mut(&id) {
            if *status == QueueStatus::Searching {
                self.queue.retain(|queued| *queued != id);
            }
            *status = QueueStatus::Idle;
        }
        self.forget_if_offline(id);
    }

    /// Drop the entry of a player with no lobby connection, unless a game
    /// still has to release them.
    fn forget_if_offline(&mut self, id: PlayerId) {
        if self.outboxes.contains_key(&id) {
            return;
        }
        if self.statuses.get(&id) != Some(&QueueStatus::Playing) {
            self.statuses.remove(&id);
            self.dequeue(id);
        }
    }

    fn disconnect(&mut self, id: PlayerId, outbox: &Outbox) -> bool {
        let current = self
            .outboxes
            .get(&id)
            .is_some_and(|registered| registered.same_channel(outbox));
        if !current {
            return false;
        }
        self.outboxes.remove(&id);
        self.leave(id);
        self.forget_if_offline(id);
        true
    }

    fn take_pair(&mut self) -> Pairing {
        if self.queue.len() < 2 {
            return Pairing::Idle;
        }

        let mut picked: Vec<PlayerId> = Vec::with_capacity(2);
        while picked.len() < 2 {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            if self.statuses.get(&id) != Some(&QueueStatus::Searching) {
                debug!("Discarding stale queue entry {}", id);
                continue;
            }
            if picked.contains(&id) {
                warn!("Player {} queued twice; not pairing with itself", id);
                break;
            }
            picked.push(id);
        }

        if let [first, second] = picked[..] {
            self.statuses.insert(first, QueueStatus::Playing);
            self.statuses.insert(second, QueueStatus::Playing);
            return Pairing::Pair(first, second);
        }

        for id in picked.into_iter().rev() {
            if !self.queue.contains(&id) {
                self.queue.push_front(id);
            }
        }
        Pairing::Requeued
    }

    /// Put a pair whose room request failed back at the front.
    fn requeue_pair(&mut self, pair: [PlayerId; 2]) {
        for id in pair.into_iter().rev() {
            if self.statuses.get(&id) != Some(&QueueStatus::Playing) {
                continue;
            }
            let reachable = self.outboxes.get(&id).is_some_and(|outbox| !outbox.is_closed());
            if reachable {
                self.statuses.insert(id, QueueStatus::Searching);
                if !self.queue.contains(&id) {
                    self.queue.push_front(id);
                }
            } else {
                self.statuses.insert(id, QueueStatus::Idle);
                self.forget_if_offline(id);
            }
        }
    }

    fn release_pair(&mut self, pair: [PlayerId; 2]) {
        for id in pair {
            if self.statuses.get(&id) == Some(&QueueStatus::Playing) {
                self.statuses.insert(id, QueueStatus::Idle);
                self.forget_if_offline(id);
            }
        }
    }
}

// =============================================================================
// MATCHMAKER
// =============================================================================

/// Queue, status map, and the tasks that drive them.
pub struct Matchmaker {
    config: MatchmakingConfig,
    rooms: Arc<dyn RoomService>,
    lobby: Mutex<Lobby>,
}

impl Matchmaker {
    /// Create a matchmaker that requests rooms from `rooms`.
    pub fn new(config: MatchmakingConfig, rooms: Arc<dyn RoomService>) -> Self {
        Self {
            config,
            rooms,
            lobby: Mutex::new(Lobby::default()),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &MatchmakingConfig {
        &self.config
    }

    /// Record a new lobby connection. Returns the connection it replaces.
    pub async fn register_connection(&self, id: PlayerId, outbox: Outbox) -> Option<Outbox> {
        self.lobby.lock().await.register(id, outbox)
    }

    /// Queue an idle player. Returns false if the player is already
    /// searching or playing.
    pub async fn enqueue(&self, id: PlayerId, outbox: Outbox) -> bool {
        let queued = self.lobby.lock().await.enqueue(id, outbox);
        if queued {
            info!("Player {} joined the queue", id);
        }
        queued
    }

    /// Take a searching player out of the queue.
    pub async fn leave_queue(&self, id: PlayerId) -> bool {
        let left = self.lobby.lock().await.leave(id);
        if left {
            info!("Player {} left the queue", id);
        }
        left
    }

    /// Release both players of a finished game.
    pub async fn on_game_ended(&self, player1: PlayerId, player2: PlayerId) {
        let mut lobby = self.lobby.lock().await;
        lobby.release(player1);
        lobby.release(player2);
        debug!("Released {} and {} after their game", player1, player2);
    }

    /// A lobby connection closed. Only the player's current connection counts.
    pub async fn on_disconnect(&self, id: PlayerId, outbox: &Outbox) -> bool {
        self.lobby.lock().await.disconnect(id, outbox)
    }

    /// Status of a known player.
    pub async fn status(&self, id: PlayerId) -> Option<QueueStatus> {
        self.lobby.lock().await.statuses.get(&id).copied()
    }

    /// Number of queued entries.
    pub async fn queue_len(&self) -> usize {
        self.lobby.lock().await.queue.len()
    }

    /// Run one pairing attempt.
    pub async fn run_tick(&self) -> TickOutcome {
        let (player1, player2) = match self.lobby.lock().await.take_pair() {
            Pairing::Idle => return TickOutcome::Idle,
            Pairing::Requeued => return TickOutcome::Requeued,
            Pairing::Pair(player1, player2) => (player1, player2),
        };
        info!("Pairing {} with {}", player1, player2);

        let request = self.rooms.request_room(player1, player2);
        let response = match tokio::time::timeout(self.config.room_request_timeout, request).await {
            Ok(response) => response,
            Err(_) => Err(RoomServiceError::Timeout),
        };
        let players = (player1, player2);

        match response {
            Ok(RoomResponse {
                room_id: Some(room_id),
                ..
            }) => {
                self.notify_match(room_id, [player1, player2]).await;
                info!("Match {} created for {} and {}", room_id, player1, player2);
                TickOutcome::Matched { room_id, players }
            }
            Ok(RoomResponse { error_message, .. }) => {
                let message = error_message.unwrap_or_else(|| "no room returned".to_string());
                warn!("Room refused for {} and {}: {}", player1, player2, message);
                self.lobby.lock().await.release_pair([player1, player2]);
                TickOutcome::Refused { players, message }
            }
            Err(error) => {
                error!("Room request for {} and {} failed: {}", player1, player2, error);
                self.lobby.lock().await.requeue_pair([player1, player2]);
                TickOutcome::Failed { players, error }
            }
        }
    }

    async fn notify_match(&self, room_id: GameId, players: [PlayerId; 2]) {
        let outboxes: Vec<(PlayerId, Option<Outbox>)> = {
            let lobby = self.lobby.lock().await;
            players
                .iter()
                .map(|id| (*id, lobby.outboxes.get(id).cloned()))
                .collect()
        };

        let notice = ServerMessage::MatchFound(MatchFoundInfo { room_id });
        for (id, outbox) in outboxes {
            let delivered = match outbox {
                Some(outbox) => outbox.send(notice.clone()).await,
                None => false,
            };
            if !delivered {
                warn!("Could not deliver match {} to {}", room_id, id);
            }
        }
    }

    /// Pair players forever.
    #[instrument(skip(self))]
    pub async fn run_pairing_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.run_tick().await;
        }
    }

    /// Follow the session tier's game-ended stream forever, reopening it
    /// with exponential backoff when it drops.
    #[instrument(skip(self))]
    pub async fn run_event_listener(self: Arc<Self>) {
        let mut backoff = self.config.stream_retry_initial;

        loop {
            match self.rooms.game_ended_events().await {
                Ok(mut events) => {
                    info!("Game-ended stream opened");
                    backoff = self.config.stream_retry_initial;

                    while let Some(event) = events.next().await {
                        match event {
                            Ok(event) => self.on_game_ended(event.player1, event.player2).await,
                            Err(e) => {
                                warn!("Game-ended stream error: {}", e);
                                break;
                            }
                        }
                    }
                    warn!("Game-ended stream closed");
                }
                Err(e) => error!("Failed to open game-ended stream: {}", e),
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.stream_retry_max);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::registry::GameEndedEvent;
    use crate::matchmaking::rpc::{GameEndedStream, LocalRoomService};
    use crate::network::outbox::{self, OutboxReceiver};
    use crate::network::testing::{fast_config, registry_with};
    use async_trait::async_trait;
    use futures_util::stream;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lobby_outbox() -> (Outbox, OutboxReceiver) {
        outbox::channel(8, Duration::from_millis(50))
    }

    /// Fails the first `failures` room requests, then hands out fresh ids.
    struct FlakyRooms {
        failures: AtomicUsize,
        refuse: bool,
    }

    #[async_trait]
    impl RoomService for FlakyRooms {
        async fn request_room(
            &self,
            _player1: PlayerId,
            _player2: PlayerId,
        ) -> Result<RoomResponse, RoomServiceError> {
            if self.refuse {
                return Ok(RoomResponse::refused("player is already in a game"));
            }
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(RoomServiceError::Unavailable("connection refused".into()));
            }
            Ok(RoomResponse::created(GameId::random()))
        }

        async fn game_ended_events(&self) -> Result<GameEndedStream, RoomServiceError> {
            Ok(Box::pin(stream::empty()))
        }
    }

    fn flaky(failures: usize) -> Arc<dyn RoomService> {
        Arc::new(FlakyRooms {
            failures: AtomicUsize::new(failures),
            refuse: false,
        })
    }

    async fn drain_match_found(receiver: &mut OutboxReceiver) -> GameId {
        loop {
            match receiver.recv().await {
                Some(ServerMessage::MatchFound(info)) => return info.room_id,
                Some(_) => continue,
                None => panic!("outbox closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_enqueue_rejects_non_idle() {
        let mm = Matchmaker::new(MatchmakingConfig::default(), flaky(0));
        let id = PlayerId::random();
        let (outbox, _rx) = lobby_outbox();

        assert!(mm.enqueue(id, outbox.clone()).await);
        assert!(!mm.enqueue(id, outbox.clone()).await);
        assert_eq!(mm.queue_len().await, 1);
        assert_eq!(mm.status(id).await, Some(QueueStatus::Searching));

        assert!(mm.leave_queue(id).await);
        assert!(!mm.leave_queue(id).await);
        assert_eq!(mm.queue_len().await, 0);
        assert_eq!(mm.status(id).await, Some(QueueStatus::Idle));

        assert!(mm.enqueue(id, outbox).await);
    }

    #[tokio::test]
    async fn test_pairing_round_trip() {
        let (registry, _repo) = registry_with(fast_config()).await;
        let a = registry.get_or_create_player(PlayerId::random(), "a").await.id();
        let b = registry.get_or_create_player(PlayerId::random(), "b").await.id();
        let mm = Matchmaker::new(
            MatchmakingConfig::default(),
            Arc::new(LocalRoomService::new(registry.clone())),
        );

        let (outbox_a, mut rx_a) = lobby_outbox();
        let (outbox_b, mut rx_b) = lobby_outbox();
        assert!(mm.enqueue(a, outbox_a).await);
        assert!(matches!(mm.run_tick().await, TickOutcome::Idle));
        assert!(mm.enqueue(b, outbox_b).await);

        let TickOutcome::Matched { room_id, players } = mm.run_tick().await else {
            panic!("expected a match");
        };
        assert_eq!(players, (a, b));
        assert_eq!(drain_match_found(&mut rx_a).await, room_id);
        assert_eq!(drain_match_found(&mut rx_b).await, room_id);
        assert_eq!(mm.status(a).await, Some(QueueStatus::Playing));
        assert_eq!(mm.status(b).await, Some(QueueStatus::Playing));
        assert_eq!(mm.queue_len().await, 0);

        let game = registry.game(room_id).await.unwrap();
        assert_eq!((game.white_id(), game.black_id()), (a, b));

        // Playing players cannot queue again until the game ends.
        let (outbox_a, _rx) = lobby_outbox();
        assert!(!mm.enqueue(a, outbox_a.clone()).await);
        mm.on_game_ended(a, b).await;
        assert_eq!(mm.status(a).await, Some(QueueStatus::Idle));
        assert!(mm.enqueue(a, outbox_a).await);
    }

    #[tokio::test]
    async fn test_failed_request_requeues_at_front() {
        let mm = Matchmaker::new(MatchmakingConfig::default(), flaky(1));
        let (a, b, c) = (PlayerId::random(), PlayerId::random(), PlayerId::random());
        let (outbox, _rx) = lobby_outbox();
        for id in [a, b, c] {
            mm.enqueue(id, outbox.clone()).await;
        }

        assert!(matches!(mm.run_tick().await, TickOutcome::Failed { players, .. } if players == (a, b)));
        assert_eq!(mm.status(a).await, Some(QueueStatus::Searching));
        assert_eq!(mm.status(b).await, Some(QueueStatus::Searching));
        assert_eq!(mm.queue_len().await, 3);

        // Same pair goes first on the next tick.
        assert!(matches!(mm.run_tick().await, TickOutcome::Matched { players, .. } if players == (a, b)));
        assert_eq!(mm.status(c).await, Some(QueueStatus::Searching));
    }

    #[tokio::test]
    async fn test_refusal_returns_players_to_idle() {
        let rooms = Arc::new(FlakyRooms {
            failures: AtomicUsize::new(0),
            refuse: true,
        });
        let mm = Matchmaker::new(MatchmakingConfig::default(), rooms);
        let (a, b) = (PlayerId::random(), PlayerId::random());
        let (outbox, _rx) = lobby_outbox();
        mm.enqueue(a, outbox.clone()).await;
        mm.enqueue(b, outbox).await;

        assert!(matches!(mm.run_tick().await, TickOutcome::Refused { .. }));
        assert_eq!(mm.status(a).await, Some(QueueStatus::Idle));
        assert_eq!(mm.status(b).await, Some(QueueStatus::Idle));
        assert_eq!(mm.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_stale_entries_are_discarded() {
        let mm = Matchmaker::new(MatchmakingConfig::default(), flaky(0));
        let (a, b) = (PlayerId::random(), PlayerId::random());
        let (outbox, _rx) = lobby_outbox();
        mm.enqueue(a, outbox.clone()).await;
        mm.enqueue(b, outbox).await;

        // Flip `a` out of searching without touching the queue.
        mm.lobby.lock().await.statuses.insert(a, QueueStatus::Idle);

        assert!(matches!(mm.run_tick().await, TickOutcome::Requeued));
        let lobby = mm.lobby.lock().await;
        assert_eq!(lobby.queue, VecDeque::from([b]));
    }

    #[tokio::test]
    async fn test_never_pairs_a_player_with_itself() {
        let mm = Matchmaker::new(MatchmakingConfig::default(), flaky(0));
        let a = PlayerId::random();
        let (outbox, _rx) = lobby_outbox();
        mm.enqueue(a, outbox).await;
        mm.lobby.lock().await.queue.push_back(a);

        assert!(matches!(mm.run_tick().await, TickOutcome::Requeued));
        let lobby = mm.lobby.lock().await;
        assert_eq!(lobby.queue, VecDeque::from([a]));
        assert_eq!(lobby.statuses.get(&a), Some(&QueueStatus::Searching));
    }

    #[tokio::test]
    async fn test_disconnect_only_counts_current_connection() {
        let mm = Matchmaker::new(MatchmakingConfig::default(), flaky(0));
        let a = PlayerId::random();
        let (old, _old_rx) = lobby_outbox();
        let (new, _new_rx) = lobby_outbox();

        mm.register_connection(a, old.clone()).await;
        assert!(mm.register_connection(a, new.clone()).await.is_some());
        assert!(mm.enqueue(a, new.clone()).await);

        assert!(!mm.on_disconnect(a, &old).await);
        assert_eq!(mm.status(a).await, Some(QueueStatus::Searching));

        assert!(mm.on_disconnect(a, &new).await);
        assert_eq!(mm.status(a).await, None);
        assert_eq!(mm.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_disconnected_players_are_forgotten() {
        let mm = Matchmaker::new(MatchmakingConfig::default(), flaky(0));
        let (a, b) = (PlayerId::random(), PlayerId::random());
        let (outbox_a, _rx_a) = lobby_outbox();
        let (outbox_b, _rx_b) = lobby_outbox();
        mm.register_connection(a, outbox_a.clone()).await;
        mm.register_connection(b, outbox_b.clone()).await;

        assert!(mm.on_disconnect(a, &outbox_a).await);
        assert_eq!(mm.status(a).await, None);

        // A playing player stays known until the game releases them.
        mm.lobby.lock().await.statuses.insert(b, QueueStatus::Playing);
        assert!(mm.on_disconnect(b, &outbox_b).await);
        assert_eq!(mm.status(b).await, Some(QueueStatus::Playing));
        mm.on_game_ended(a, b).await;
        assert_eq!(mm.status(b).await, None);
        assert!(mm.lobby.lock().await.statuses.is_empty());
    }

    #[tokio::test]
    async fn test_game_ended_ignores_unknown_players() {
        let mm = Matchmaker::new(MatchmakingConfig::default(), flaky(0));
        let (a, b) = (PlayerId::random(), PlayerId::random());
        mm.on_game_ended(a, b).await;
        assert_eq!(mm.status(a).await, None);
    }

    #[tokio::test]
    async fn test_listener_releases_players() {
        let (registry, _repo) = registry_with(fast_config()).await;
        let mm = Arc::new(Matchmaker::new(
            MatchmakingConfig::default(),
            Arc::new(LocalRoomService::new(registry.clone())),
        ));
        let (a, b) = (PlayerId::random(), PlayerId::random());
        let _receivers = playing_pair(&mm, a, b).await;

        let listener = tokio::spawn(mm.clone().run_event_listener());
        registry.publish_game_ended(GameEndedEvent { player1: a, player2: b });

        wait_until_idle(&mm, [a, b]).await;
        listener.abort();
    }

    async fn playing_pair(mm: &Matchmaker, a: PlayerId, b: PlayerId) -> [OutboxReceiver; 2] {
        let (outbox_a, rx_a) = lobby_outbox();
        let (outbox_b, rx_b) = lobby_outbox();
        mm.register_connection(a, outbox_a).await;
        mm.register_connection(b, outbox_b).await;
        let mut lobby = mm.lobby.lock().await;
        lobby.statuses.insert(a, QueueStatus::Playing);
        lobby.statuses.insert(b, QueueStatus::Playing);
        [rx_a, rx_b]
    }

    async fn wait_until_idle(mm: &Matchmaker, players: [PlayerId; 2]) {
        for _ in 0..100 {
            if mm.status(players[0]).await == Some(QueueStatus::Idle)
                && mm.status(players[1]).await == Some(QueueStatus::Idle)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("players were never released");
    }

    /// First stream ends at once; later ones follow the registry.
    struct DroppingFeed {
        inner: LocalRoomService,
        opened: AtomicUsize,
    }

    #[async_trait]
    impl RoomService for DroppingFeed {
        async fn request_room(
            &self,
            player1: PlayerId,
            player2: PlayerId,
        ) -> Result<RoomResponse, RoomServiceError> {
            self.inner.request_room(player1, player2).await
        }

        async fn game_ended_events(&self) -> Result<GameEndedStream, RoomServiceError> {
            if self.opened.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(Box::pin(stream::empty()));
            }
            self.inner.game_ended_events().await
        }
    }

    #[tokio::test]
    async fn test_listener_reopens_dropped_stream() {
        let (registry, _repo) = registry_with(fast_config()).await;
        let rooms = Arc::new(DroppingFeed {
            inner: LocalRoomService::new(registry.clone()),
            opened: AtomicUsize::new(0),
        });
        let config = MatchmakingConfig {
            stream_retry_initial: Duration::from_millis(10),
            stream_retry_max: Duration::from_millis(40),
            ..Default::default()
        };
        let mm = Arc::new(Matchmaker::new(config, rooms.clone()));
        let (a, b) = (PlayerId::random(), PlayerId::random());
        let _receivers = playing_pair(&mm, a, b).await;

        let listener = tokio::spawn(mm.clone().run_event_listener());
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.publish_game_ended(GameEndedEvent { player1: a, player2: b });

        wait_until_idle(&mm, [a, b]).await;
        assert!(rooms.opened.load(Ordering::SeqCst) >= 2);
        listener.abort();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(usize),
        Leave(usize),
        Disconnect(usize),
        Reconnect(usize),
        Pair,
        Fail,
        Refuse,
        GameEnded(usize, usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..6usize).prop_map(Op::Enqueue),
            (0..6usize).prop_map(Op::Leave),
            (0..6usize).prop_map(Op::Disconnect),
            (0..6usize).prop_map(Op::Reconnect),
            Just(Op::Pair),
            Just(Op::Fail),
            Just(Op::Refuse),
            (0..6usize, 0..6usize).prop_map(|(a, b)| Op::GameEnded(a, b)),
        ]
    }

    fn assert_queue_matches_statuses(lobby: &Lobby) {
        for (id, status) in &lobby.statuses {
            let occurrences = lobby.queue.iter().filter(|queued| *queued == id).count();
            match status {
                QueueStatus::Searching => assert_eq!(occurrences, 1, "{} searching", id),
                _ => assert_eq!(occurrences, 0, "{} {:?}", id, status),
            }
        }
        for queued in &lobby.queue {
            assert!(lobby.statuses.contains_key(queued));
        }
    }

    proptest! {
        #[test]
        fn prop_searching_players_are_queued_exactly_once(ops in prop::collection::vec(op(), 1..60)) {
            let players: Vec<PlayerId> = (0..6).map(|_| PlayerId::random()).collect();
            let mut receivers = Vec::new();
            let mut lobby = Lobby::default();

            for op in ops {
                match op {
                    Op::Enqueue(i) => {
                        let (outbox, rx) = lobby_outbox();
                        receivers.push(rx);
                        lobby.enqueue(players[i], outbox);
                    }
                    Op::Leave(i) => {
                        lobby.leave(players[i]);
                    }
                    Op::Disconnect(i) => {
                        if let Some(outbox) = lobby.outboxes.get(&players[i]).cloned() {
                            lobby.disconnect(players[i], &outbox);
                        }
                    }
                    Op::Reconnect(i) => {
                        let (outbox, rx) = lobby_outbox();
                        receivers.push(rx);
                        lobby.register(players[i], outbox);
                    }
                    Op::Pair | Op::Fail | Op::Refuse => {
                        if let Pairing::Pair(a, b) = lobby.take_pair() {
                            prop_assert_ne!(a, b);
                            match op {
                                Op::Fail => lobby.requeue_pair([a, b]),
                                Op::Refuse => lobby.release_pair([a, b]),
                                _ => {}
                            }
                        }
                    }
                    Op::GameEnded(i, j) => {
                        lobby.release(players[i]);
                        lobby.release(players[j]);
                    }
                }
                assert_queue_matches_statuses(&lobby);
            }
        }
    }
}

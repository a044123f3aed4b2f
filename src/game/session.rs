//! Game Session
//!
//! One chess match: two seats, any number of spectators, and a position
//! owned by the rules engine. Every transition runs under the session's own
//! lock, so no two moves are ever applied to the same position at once.
//! Nothing awaits while the lock is held: messages go out through
//! non-blocking sends, and a recipient whose queue is full is disconnected.
//!
//! Lifecycle: `WaitingPlayers -> Ongoing -> Ended`, forward only.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::ids::{GameId, PlayerId};
use crate::game::record::GameRecord;
use crate::game::rules::{parse_square, ChessBoard, Outcome, RulesError, Side};
use crate::network::connection::PlayerSession;
use crate::network::outbox::Delivery;
use crate::network::protocol::{GameSnapshot, GameStatus, MovePayload, ServerMessage};

/// Who won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    /// Game not decided yet.
    Undecided,
    /// Drawn.
    Draw,
    /// Won by this player.
    Player(PlayerId),
}

impl Winner {
    /// Wire representation: player id, `"draw"`, or empty.
    pub fn to_wire(&self) -> String {
        match self {
            Winner::Undecided => String::new(),
            Winner::Draw => "draw".to_string(),
            Winner::Player(id) => id.to_string(),
        }
    }
}

/// How a session attached a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachRole {
    /// Bound to a seat.
    Seat(Side),
    /// Watching.
    Spectator,
}

/// Reasons a move or resignation is refused. None of them change state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoveRejection {
    /// Game is not ongoing.
    #[error("game is not ongoing")]
    NotOngoing,

    /// Sender does not hold a seat.
    #[error("player is not seated in this game")]
    NotSeated,

    /// Sender's side is not to move.
    #[error("not this player's turn")]
    NotYourTurn,

    /// Rules engine refused the move.
    #[error(transparent)]
    Rules(#[from] RulesError),

    /// Notation decodes to different squares than the ones submitted.
    #[error("notation moves {decoded_from}{decoded_to}, submitted {submitted_from}{submitted_to}")]
    SquareMismatch {
        /// Submitted origin.
        submitted_from: String,
        /// Submitted destination.
        submitted_to: String,
        /// Decoded origin.
        decoded_from: String,
        /// Decoded destination.
        decoded_to: String,
    },
}

/// Everything needed to wind a game down once it has ended.
#[derive(Clone)]
pub struct GameConclusion {
    /// Record to persist.
    pub record: GameRecord,
    /// Final result.
    pub winner: Winner,
    /// Seated players (white, black).
    pub seats: (PlayerId, PlayerId),
    /// Seats and spectators at the moment the game ended.
    pub participants: Vec<Arc<PlayerSession>>,
}

/// Result of an accepted move.
pub enum MoveOutcome {
    /// Play continues.
    Continue,
    /// The move ended the game.
    Ended(GameConclusion),
}

struct GameState {
    white: Arc<PlayerSession>,
    black: Arc<PlayerSession>,
    white_ready: bool,
    black_ready: bool,
    spectators: BTreeMap<PlayerId, Arc<PlayerSession>>,
    status: GameStatus,
    board: ChessBoard,
    last_move: Option<(String, String)>,
    winner: Winner,
}

impl GameState {
    fn seat(&self, side: Side) -> &Arc<PlayerSession> {
        match side {
            Side::White => &self.white,
            Side::Black => &self.black,
        }
    }
}

/// A live chess match.
pub struct GameSession {
    id: GameId,
    white_id: PlayerId,
    black_id: PlayerId,
    started_at: DateTime<Utc>,
    /// Mirror of the locked status, readable without the lock.
    status: AtomicU8,
    state: Mutex<GameState>,
}

impl GameSession {
    /// Create a session seating `white` and `black`.
    pub fn new(id: GameId, white: Arc<PlayerSession>, black: Arc<PlayerSession>) -> Self {
        Self {
            id,
            white_id: white.id(),
            black_id: black.id(),
            started_at: Utc::now(),
            status: AtomicU8::new(GameStatus::WaitingPlayers as u8),
            state: Mutex::new(GameState {
                white,
                black,
                white_ready: false,
                black_ready: false,
                spectators: BTreeMap::new(),
                status: GameStatus::WaitingPlayers,
                board: ChessBoard::new(),
                last_move: None,
                winner: Winner::Undecided,
            }),
        }
    }

    /// Game identifier.
    pub fn id(&self) -> GameId {
        self.id
    }

    /// White seat.
    pub fn white_id(&self) -> PlayerId {
        self.white_id
    }

    /// Black seat.
    pub fn black_id(&self) -> PlayerId {
        self.black_id
    }

    /// Current status, without taking the lock.
    pub fn status(&self) -> GameStatus {
        match self.status.load(Ordering::Acquire) {
            0 => GameStatus::WaitingPlayers,
            1 => GameStatus::Ongoing,
            _ => GameStatus::Ended,
        }
    }

    /// Whether the game has ended.
    pub fn is_ended(&self) -> bool {
        self.status() == GameStatus::Ended
    }

    /// Seat held by `player`, if any.
    pub fn seat_of(&self, player: PlayerId) -> Option<Side> {
        if player == self.white_id {
            Some(Side::White)
        } else if player == self.black_id {
            Some(Side::Black)
        } else {
            None
        }
    }

    fn advance(&self, state: &mut GameState, status: GameStatus) {
        if (status as u8) < (state.status as u8) {
            return;
        }
        state.status = status;
        self.status.store(status as u8, Ordering::Release);
    }

    /// Attach a player: seat owners (re)bind their seat, everyone else
    /// spectates. Always answers with a `welcome` snapshot, and starts the
    /// game once both seats are ready.
    pub async fn add_player(&self, player: Arc<PlayerSession>) -> AttachRole {
        let mut state = self.state.lock().await;

        let role = match self.seat_of(player.id()) {
            Some(Side::White) => {
                state.white = player.clone();
                state.white_ready = true;
                AttachRole::Seat(Side::White)
            }
            Some(Side::Black) => {
                state.black = player.clone();
                state.black_ready = true;
                AttachRole::Seat(Side::Black)
            }
            None => {
                state.spectators.insert(player.id(), player.clone());
                AttachRole::Spectator
            }
        };

        let welcome = ServerMessage::Welcome(self.snapshot_of(&state));
        if !push(&player, welcome) && role == AttachRole::Spectator {
            state.spectators.remove(&player.id());
        }

        if matches!(role, AttachRole::Seat(_))
            && state.white_ready
            && state.black_ready
            && state.status == GameStatus::WaitingPlayers
        {
            self.advance(&mut state, GameStatus::Ongoing);
            info!("Game {} started", self.id);

            push(&state.white, ServerMessage::GameStarted {});
            push(&state.black, ServerMessage::GameStarted {});
        }

        role
    }

    /// Validate and apply a move from `player`.
    pub async fn send_move(
        &self,
        player: &PlayerSession,
        mv: &MovePayload,
    ) -> Result<MoveOutcome, MoveRejection> {
        let mut state = self.state.lock().await;

        if state.status != GameStatus::Ongoing {
            return Err(MoveRejection::NotOngoing);
        }

        let side = self.seat_of(player.id()).ok_or(MoveRejection::NotSeated)?;
        if state.board.side_to_move() != side {
            return Err(MoveRejection::NotYourTurn);
        }

        let from = parse_square(&mv.move_from_square)?;
        let to = parse_square(&mv.move_to_square)?;
        let decoded = state.board.decode(&mv.move_notation)?;
        if decoded.from_square() != from || decoded.to_square() != to {
            return Err(MoveRejection::SquareMismatch {
                submitted_from: from.to_string(),
                submitted_to: to.to_string(),
                decoded_from: decoded.from_square().to_string(),
                decoded_to: decoded.to_square().to_string(),
            });
        }

        let outcome = state.board.apply(decoded, &mv.move_notation)?;
        state.last_move = Some((from.to_string(), to.to_string()));
        debug!("Game {}: {:?} played {}", self.id, side, mv.move_notation);

        let echo = ServerMessage::PlayerMoved(mv.clone());
        push(state.seat(side.opponent()), echo.clone());
        Self::broadcast_spectators(&mut state, &echo);

        if !outcome.is_terminal() {
            return Ok(MoveOutcome::Continue);
        }

        Ok(MoveOutcome::Ended(self.conclude(&mut state, outcome)))
    }

    /// Resign on behalf of `player`; the opponent wins.
    pub async fn resign(&self, player: &PlayerSession) -> Result<GameConclusion, MoveRejection> {
        let mut state = self.state.lock().await;

        if state.status != GameStatus::Ongoing {
            return Err(MoveRejection::NotOngoing);
        }
        let side = self.seat_of(player.id()).ok_or(MoveRejection::NotSeated)?;

        let outcome = state.board.resign(side);
        Ok(self.conclude(&mut state, outcome))
    }

    fn conclude(&self, state: &mut GameState, outcome: Outcome) -> GameConclusion {
        let (winner, result, reason) = match outcome {
            Outcome::Win(side, reason) => {
                let id = match side {
                    Side::White => self.white_id,
                    Side::Black => self.black_id,
                };
                (Winner::Player(id), side.result_name(), reason.as_str())
            }
            Outcome::Draw(reason) => (Winner::Draw, "draw", reason.as_str()),
            // Callers only conclude terminal outcomes.
            Outcome::Ongoing => (Winner::Draw, "draw", "Unknown"),
        };

        state.winner = winner;
        self.advance(state, GameStatus::Ended);
        info!("Game {} ended: {} ({})", self.id, result, reason);

        let mut participants = vec![state.white.clone(), state.black.clone()];
        participants.extend(state.spectators.values().cloned());

        GameConclusion {
            record: GameRecord {
                id: self.id,
                white_id: self.white_id,
                black_id: self.black_id,
                serialized_game: state.board.pgn(),
                final_position: state.board.fen(),
                result: result.to_string(),
                result_reason: reason.to_string(),
                status: "ended".to_string(),
                started_at: self.started_at,
                ended_at: Utc::now(),
            },
            winner,
            seats: (self.white_id, self.black_id),
            participants,
        }
    }

    fn broadcast_spectators(state: &mut GameState, message: &ServerMessage) {
        state.spectators.retain(|id, spectator| {
            let reachable = push(spectator, message.clone());
            if !reachable {
                debug!("Pruning unreachable spectator {}", id);
            }
            reachable
        });
    }

    fn snapshot_of(&self, state: &GameState) -> GameSnapshot {
        let (last_move_from, last_move_to) = match &state.last_move {
            Some((from, to)) => (Some(from.clone()), Some(to.clone())),
            None => (None, None),
        };

        GameSnapshot {
            room_id: self.id,
            white_id: self.white_id,
            white_username: state.white.display_name().to_string(),
            black_id: self.black_id,
            black_username: state.black.display_name().to_string(),
            fen: state.board.fen(),
            pgn: state.board.pgn(),
            last_move_from,
            last_move_to,
            status: state.status,
            winner: state.winner.to_wire(),
        }
    }

    /// Current snapshot.
    pub async fn snapshot(&self) -> GameSnapshot {
        let state = self.state.lock().await;
        self.snapshot_of(&state)
    }

    /// Seats plus current spectators.
    pub async fn participants(&self) -> Vec<Arc<PlayerSession>> {
        let state = self.state.lock().await;
        let mut participants = vec![state.white.clone(), state.black.clone()];
        participants.extend(state.spectators.values().cloned());
        participants
    }

    /// Number of spectators.
    pub async fn spectator_count(&self) -> usize {
        self.state.lock().await.spectators.len()
    }
}

/// Queue `message` for `player` without waiting. A player whose queue is
/// full has stopped reading and is disconnected; a reconnect resyncs them
/// through `welcome`.
fn push(player: &PlayerSession, message: ServerMessage) -> bool {
    match player.try_send(message) {
        Delivery::Queued => true,
        Delivery::Full => {
            warn!("Player {} is not draining its queue; disconnecting", player.id());
            player.terminate("Outbound queue full");
            false
        }
        Delivery::Closed => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::ConnectionConfig;
    use crate::network::outbox::{self, OutboxReceiver};
    use std::time::Duration;

    fn detached(name: &str) -> Arc<PlayerSession> {
        Arc::new(PlayerSession::new(PlayerId::random(), name, ConnectionConfig::default()))
    }

    /// Give `player` a queue of `capacity` that nobody drains, with a send
    /// timeout far longer than any test waits.
    fn attach_stalled(player: &PlayerSession, capacity: usize) -> OutboxReceiver {
        let (outbox, receiver) = outbox::channel(capacity, Duration::from_secs(60));
        let mut state = player.lock_state();
        state.connected = true;
        state.outbox = Some(outbox);
        receiver
    }

    fn mv(from: &str, to: &str, san: &str) -> MovePayload {
        MovePayload {
            move_from_square: from.into(),
            move_to_square: to.into(),
            move_notation: san.into(),
        }
    }

    async fn started_game() -> (GameSession, Arc<PlayerSession>, Arc<PlayerSession>) {
        let white = detached("white");
        let black = detached("black");
        let game = GameSession::new(GameId::random(), white.clone(), black.clone());
        game.add_player(white.clone()).await;
        game.add_player(black.clone()).await;
        (game, white, black)
    }

    #[tokio::test]
    async fn test_starts_when_both_seats_ready() {
        let white = detached("white");
        let black = detached("black");
        let game = GameSession::new(GameId::random(), white.clone(), black.clone());

        assert_eq!(game.add_player(white.clone()).await, AttachRole::Seat(Side::White));
        assert_eq!(game.status(), GameStatus::WaitingPlayers);

        // Re-attaching the same seat does not start the game.
        game.add_player(white.clone()).await;
        assert_eq!(game.status(), GameStatus::WaitingPlayers);

        assert_eq!(game.add_player(black).await, AttachRole::Seat(Side::Black));
        assert_eq!(game.status(), GameStatus::Ongoing);
    }

    #[tokio::test]
    async fn test_unreachable_spectator_is_not_kept() {
        let (game, _, _) = started_game().await;
        // A detached session has no transport, so the welcome cannot be delivered.
        assert_eq!(game.add_player(detached("watcher")).await, AttachRole::Spectator);
        assert_eq!(game.spectator_count().await, 0);
    }

    #[tokio::test]
    async fn test_stalled_recipients_do_not_hold_the_game() {
        let (game, white, black) = started_game().await;

        let watcher = detached("watcher");
        let mut watcher_rx = attach_stalled(&watcher, 2);
        assert_eq!(game.add_player(watcher.clone()).await, AttachRole::Spectator);
        assert_eq!(game.spectator_count().await, 1);
        assert_eq!(watcher.try_send(ServerMessage::Ping {}), Delivery::Queued);

        let _black_rx = attach_stalled(&black, 1);
        assert_eq!(black.try_send(ServerMessage::Ping {}), Delivery::Queued);

        // Both queues are full; the move must still go through at once.
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            game.send_move(&white, &mv("e2", "e4", "e4")),
        )
        .await
        .expect("move blocked on a full queue");
        assert!(matches!(result, Ok(MoveOutcome::Continue)));

        assert_eq!(game.spectator_count().await, 0);
        assert_eq!(game.status(), GameStatus::Ongoing);
        assert!(matches!(watcher_rx.recv().await, Some(ServerMessage::Welcome(_))));

        // The game stays usable for the next move.
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            game.send_move(&black, &mv("e7", "e5", "e5")),
        )
        .await
        .expect("game lock still held");
        assert!(matches!(result, Ok(MoveOutcome::Continue)));
    }

    #[tokio::test]
    async fn test_rejects_moves_before_start() {
        let white = detached("white");
        let black = detached("black");
        let game = GameSession::new(GameId::random(), white.clone(), black);
        let result = game.send_move(&white, &mv("e2", "e4", "e4")).await;
        assert!(matches!(result, Err(MoveRejection::NotOngoing)));
    }

    #[tokio::test]
    async fn test_turn_and_seat_enforced() {
        let (game, white, black) = started_game().await;

        let result = game.send_move(&black, &mv("e7", "e5", "e5")).await;
        assert!(matches!(result, Err(MoveRejection::NotYourTurn)));

        let outsider = detached("outsider");
        let result = game.send_move(&outsider, &mv("e2", "e4", "e4")).await;
        assert!(matches!(result, Err(MoveRejection::NotSeated)));

        assert!(matches!(
            game.send_move(&white, &mv("e2", "e4", "e4")).await,
            Ok(MoveOutcome::Continue)
        ));
        let result = game.send_move(&white, &mv("d2", "d4", "d4")).await;
        assert!(matches!(result, Err(MoveRejection::NotYourTurn)));
    }

    #[tokio::test]
    async fn test_square_mismatch_leaves_position_unchanged() {
        let (game, white, _) = started_game().await;
        let before = game.snapshot().await;

        let result = game.send_move(&white, &mv("d2", "d4", "e4")).await;
        assert!(matches!(result, Err(MoveRejection::SquareMismatch { .. })));

        let result = game.send_move(&white, &mv("e2", "e4", "Ke2")).await;
        assert!(matches!(
            result,
            Err(MoveRejection::Rules(RulesError::UndecodableNotation(_)))
        ));

        let result = game.send_move(&white, &mv("z9", "e4", "e4")).await;
        assert!(matches!(result, Err(MoveRejection::Rules(RulesError::InvalidSquare(_)))));

        let after = game.snapshot().await;
        assert_eq!(before.fen, after.fen);
        assert_eq!(after.last_move_from, None);
    }

    #[tokio::test]
    async fn test_checkmate_concludes_game() {
        let (game, white, black) = started_game().await;

        for (player, m) in [
            (&white, mv("f2", "f3", "f3")),
            (&black, mv("e7", "e5", "e5")),
            (&white, mv("g2", "g4", "g4")),
        ] {
            assert!(matches!(game.send_move(player, &m).await, Ok(MoveOutcome::Continue)));
        }

        let outcome = game.send_move(&black, &mv("d8", "h4", "Qh4#")).await.unwrap();
        let MoveOutcome::Ended(conclusion) = outcome else {
            panic!("expected the game to end");
        };

        assert_eq!(conclusion.winner, Winner::Player(black.id()));
        assert_eq!(conclusion.record.result, "black");
        assert_eq!(conclusion.record.result_reason, "Checkmate");
        assert_eq!(conclusion.record.serialized_game, "1. f3 e5 2. g4 Qh4# 0-1");
        assert_eq!(conclusion.seats, (white.id(), black.id()));
        assert!(game.is_ended());

        let snapshot = game.snapshot().await;
        assert_eq!(snapshot.status, GameStatus::Ended);
        assert_eq!(snapshot.winner, black.id().to_string());
        assert_eq!(snapshot.last_move_from.as_deref(), Some("d8"));
        assert_eq!(snapshot.last_move_to.as_deref(), Some("h4"));

        // Ended is terminal.
        let result = game.send_move(&white, &mv("a2", "a3", "a3")).await;
        assert!(matches!(result, Err(MoveRejection::NotOngoing)));
        assert!(matches!(game.resign(&white).await, Err(MoveRejection::NotOngoing)));
        game.add_player(white.clone()).await;
        assert_eq!(game.status(), GameStatus::Ended);
    }

    #[tokio::test]
    async fn test_resign_awards_opponent() {
        let (game, white, black) = started_game().await;

        let conclusion = game.resign(&white).await.unwrap();
        assert_eq!(conclusion.winner, Winner::Player(black.id()));
        assert_eq!(conclusion.record.result, "black");
        assert_eq!(conclusion.record.result_reason, "Resignation");
        assert_eq!(conclusion.participants.len(), 2);
        assert!(game.is_ended());

        assert!(matches!(game.resign(&black).await, Err(MoveRejection::NotOngoing)));
    }

    #[tokio::test]
    async fn test_spectator_cannot_resign() {
        let (game, _, _) = started_game().await;
        let outsider = detached("outsider");
        assert!(matches!(game.resign(&outsider).await, Err(MoveRejection::NotSeated)));
        assert_eq!(game.status(), GameStatus::Ongoing);
    }

    #[test]
    fn test_winner_wire_format() {
        let id = PlayerId::random();
        assert_eq!(Winner::Undecided.to_wire(), "");
        assert_eq!(Winner::Draw.to_wire(), "draw");
        assert_eq!(Winner::Player(id).to_wire(), id.to_string());
    }
}

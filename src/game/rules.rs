//! Rules Engine Adapter
//!
//! Thin layer over the `chess` crate. Legality, turn order, SAN decoding,
//! and mate detection belong to the engine. This module translates between
//! its types and the session's vocabulary, ends the game on the automatic
//! draws (insufficient material, fivefold repetition, the 75-move rule) and
//! keeps the SAN history needed for PGN serialization.
//!
//! Threefold repetition and the fifty-move rule are claimable draws and do
//! not end the game on their own.

use std::str::FromStr;

use chess::{BitBoard, Board, BoardStatus, ChessMove, Color, Piece, Square};

/// Half-moves without a capture or pawn move before the game is drawn.
const SEVENTY_FIVE_MOVE_PLIES: u32 = 150;

/// Occurrences of one position before the game is drawn.
const FIVEFOLD: usize = 5;

/// A side of the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Moves first.
    White,
    /// Moves second.
    Black,
}

impl Side {
    /// The other side.
    pub fn opponent(self) -> Side {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }

    /// Result string persisted for a win by this side.
    pub fn result_name(self) -> &'static str {
        match self {
            Side::White => "white",
            Side::Black => "black",
        }
    }
}

impl From<Color> for Side {
    fn from(color: Color) -> Self {
        match color {
            Color::White => Side::White,
            Color::Black => Side::Black,
        }
    }
}

/// Why a game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The side to move is mated.
    Checkmate,
    /// The side to move has no legal move and is not in check.
    Stalemate,
    /// Neither side can mate with any sequence of legal moves.
    InsufficientMaterial,
    /// The same position occurred five times.
    FivefoldRepetition,
    /// 75 moves by each side without a capture or pawn move.
    SeventyFiveMoveRule,
    /// A player resigned.
    Resignation,
}

impl EndReason {
    /// Human-readable reason, as persisted.
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Checkmate => "Checkmate",
            EndReason::Stalemate => "Stalemate",
            EndReason::InsufficientMaterial => "Insufficient material",
            EndReason::FivefoldRepetition => "Fivefold repetition",
            EndReason::SeventyFiveMoveRule => "Seventy-five-move rule",
            EndReason::Resignation => "Resignation",
        }
    }
}

/// Engine verdict on the current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Play continues.
    Ongoing,
    /// Drawn.
    Draw(EndReason),
    /// Won by a side.
    Win(Side, EndReason),
}

impl Outcome {
    /// Whether the game is over.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Outcome::Ongoing)
    }
}

/// Engine rejection of a submitted move.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RulesError {
    /// Square is not `[a-h][1-8]`.
    #[error("invalid square: {0}")]
    InvalidSquare(String),

    /// Notation does not decode to a legal move in this position.
    #[error("cannot decode move notation: {0}")]
    UndecodableNotation(String),

    /// The engine refused to apply the move.
    #[error("illegal move")]
    IllegalMove,
}

/// A decoded move with its coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedMove {
    inner: ChessMove,
}

impl DecodedMove {
    /// Origin square.
    pub fn from_square(&self) -> Square {
        self.inner.get_source()
    }

    /// Destination square.
    pub fn to_square(&self) -> Square {
        self.inner.get_dest()
    }
}

/// Parse a coordinate such as `e4`.
pub fn parse_square(s: &str) -> Result<Square, RulesError> {
    let bytes = s.as_bytes();
    let well_formed = bytes.len() == 2
        && (b'a'..=b'h').contains(&bytes[0])
        && (b'1'..=b'8').contains(&bytes[1]);
    if !well_formed {
        return Err(RulesError::InvalidSquare(s.to_string()));
    }

    Square::from_str(s).map_err(|_| RulesError::InvalidSquare(s.to_string()))
}

/// A game in progress, as owned by one game session.
#[derive(Debug, Clone)]
pub struct ChessBoard {
    board: Board,
    outcome: Outcome,
    /// Hash of every position reached, starting position included.
    positions: Vec<u64>,
    halfmove_clock: u32,
    fullmove_number: u32,
    san_history: Vec<String>,
}

impl Default for ChessBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl ChessBoard {
    /// Standard starting position.
    pub fn new() -> Self {
        Self::with_position(Board::default(), 0, 1)
    }

    /// Start from a FEN position.
    pub fn from_fen(fen: &str) -> Option<Self> {
        let board = Board::from_str(fen).ok()?;
        let mut counters = fen.split_whitespace().skip(4).map(|field| field.parse::<u32>().ok());
        let halfmove_clock = counters.next().flatten().unwrap_or(0);
        let fullmove_number = counters.next().flatten().unwrap_or(1).max(1);
        Some(Self::with_position(board, halfmove_clock, fullmove_number))
    }

    fn with_position(board: Board, halfmove_clock: u32, fullmove_number: u32) -> Self {
        let mut chess_board = Self {
            board,
            outcome: Outcome::Ongoing,
            positions: vec![board.get_hash()],
            halfmove_clock,
            fullmove_number,
            san_history: Vec::new(),
        };
        chess_board.outcome = chess_board.judge();
        chess_board
    }

    /// Side to move.
    pub fn side_to_move(&self) -> Side {
        self.board.side_to_move().into()
    }

    /// Decode SAN against the current position.
    pub fn decode(&self, notation: &str) -> Result<DecodedMove, RulesError> {
        ChessMove::from_san(&self.board, notation)
            .map(|inner| DecodedMove { inner })
            .map_err(|_| RulesError::UndecodableNotation(notation.to_string()))
    }

    /// Apply a decoded move and report the resulting outcome.
    pub fn apply(&mut self, mv: DecodedMove, notation: &str) -> Result<Outcome, RulesError> {
        if self.outcome.is_terminal() || !self.board.legal(mv.inner) {
            return Err(RulesError::IllegalMove);
        }

        let irreversible = self.board.piece_on(mv.inner.get_source()) == Some(Piece::Pawn)
            || self.board.piece_on(mv.inner.get_dest()).is_some();
        if irreversible {
            self.halfmove_clock = 0;
        } else {
            self.halfmove_clock += 1;
        }
        if self.board.side_to_move() == Color::Black {
            self.fullmove_number += 1;
        }

        self.board = self.board.make_move_new(mv.inner);
        self.positions.push(self.board.get_hash());
        self.san_history.push(notation.to_string());
        self.outcome = self.judge();
        Ok(self.outcome)
    }

    /// Record a resignation by `side`.
    pub fn resign(&mut self, side: Side) -> Outcome {
        if !self.outcome.is_terminal() {
            self.outcome = Outcome::Win(side.opponent(), EndReason::Resignation);
        }
        self.outcome
    }

    /// Current outcome.
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    fn judge(&self) -> Outcome {
        match self.board.status() {
            BoardStatus::Checkmate => {
                let mated: Side = self.board.side_to_move().into();
                return Outcome::Win(mated.opponent(), EndReason::Checkmate);
            }
            BoardStatus::Stalemate => return Outcome::Draw(EndReason::Stalemate),
            BoardStatus::Ongoing => {}
        }

        if insufficient_material(&self.board) {
            Outcome::Draw(EndReason::InsufficientMaterial)
        } else if self.repetitions() >= FIVEFOLD {
            Outcome::Draw(EndReason::FivefoldRepetition)
        } else if self.halfmove_clock >= SEVENTY_FIVE_MOVE_PLIES {
            Outcome::Draw(EndReason::SeventyFiveMoveRule)
        } else {
            Outcome::Ongoing
        }
    }

    fn repetitions(&self) -> usize {
        let current = self.board.get_hash();
        self.positions.iter().filter(|hash| **hash == current).count()
    }

    /// Current position as FEN.
    pub fn fen(&self) -> String {
        let position = self.board.to_string();
        let placement: Vec<&str> = position.split_whitespace().take(4).collect();
        format!(
            "{} {} {}",
            placement.join(" "),
            self.halfmove_clock,
            self.fullmove_number
        )
    }

    /// PGN movetext terminated by the result token.
    pub fn pgn(&self) -> String {
        let mut out = String::new();
        for (i, san) in self.san_history.iter().enumerate() {
            if i % 2 == 0 {
                out.push_str(&format!("{}. ", i / 2 + 1));
            }
            out.push_str(san);
            out.push(' ');
        }

        let token = match self.outcome() {
            Outcome::Ongoing => "*",
            Outcome::Win(Side::White, _) => "1-0",
            Outcome::Win(Side::Black, _) => "0-1",
            Outcome::Draw(_) => "1/2-1/2",
        };
        out.push_str(token);
        out
    }
}

/// No pawns, rooks or queens, and at most a lone minor piece, or one
/// bishop each on squares of the same shade.
fn insufficient_material(board: &Board) -> bool {
    let heavy = *board.pieces(Piece::Pawn) | *board.pieces(Piece::Rook) | *board.pieces(Piece::Queen);
    if heavy.popcnt() > 0 {
        return false;
    }

    match board.combined().popcnt() {
        0..=3 => true,
        4 => {
            let bishops = *board.pieces(Piece::Bishop);
            let white_bishops = bishops & *board.color_combined(Color::White);
            if bishops.popcnt() != 2 || white_bishops.popcnt() != 1 {
                return false;
            }
            let black_bishops = bishops & *board.color_combined(Color::Black);
            shade(white_bishops) == shade(black_bishops)
        }
        _ => false,
    }
}

/// Shade of the lowest square in `squares`.
fn shade(squares: BitBoard) -> Option<usize> {
    squares
        .into_iter()
        .next()
        .map(|square| (square.get_file().to_index() + square.get_rank().to_index()) % 2)
}

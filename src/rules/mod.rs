//! Chess rules capability.
//!
//! DESIGN
//! ======
//! The chess room manager never decides move legality itself. It talks to a
//! narrow `RulesEngine` trait: one default implementation backed by the
//! `chess` crate, and a scripted fake in the manager's tests. The engine is
//! the sole authority on move acceptance and terminal conditions; the
//! manager only tracks seats, turn bookkeeping, and the move log.

pub mod standard;

use serde::{Deserialize, Serialize};

// =============================================================================
// TYPES
// =============================================================================

/// Side color. Seat order fixes color for a room's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    White,
    Black,
}

impl Color {
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Color::White => "white",
            Color::Black => "black",
        }
    }
}

/// Piece kind, engine-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PieceKind {
    Pawn,
    Knight,
    Bishop,
    Rook,
    Queen,
    King,
}

impl PieceKind {
    /// Uppercase algebraic letter; pawns have none.
    #[must_use]
    pub fn letter(self) -> &'static str {
        match self {
            PieceKind::Pawn => "",
            PieceKind::Knight => "N",
            PieceKind::Bishop => "B",
            PieceKind::Rook => "R",
            PieceKind::Queen => "Q",
            PieceKind::King => "K",
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            PieceKind::Pawn => "pawn",
            PieceKind::Knight => "knight",
            PieceKind::Bishop => "bishop",
            PieceKind::Rook => "rook",
            PieceKind::Queen => "queen",
            PieceKind::King => "king",
        }
    }
}

/// A piece sitting on a square, as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceOnSquare {
    pub kind: PieceKind,
    pub color: Color,
}

/// Structured record of a move the engine accepted.
#[derive(Debug, Clone)]
pub struct AcceptedMove {
    pub piece: PieceKind,
    pub color: Color,
    pub capture: bool,
    pub promotion: Option<PieceKind>,
    /// Algebraic notation (simplified: no disambiguation).
    pub san: String,
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    #[error("invalid square: {0}")]
    BadSquare(String),
    #[error("move {from}{to} is not legal in this position")]
    Rejected { from: String, to: String },
    #[error("rules engine fault: {0}")]
    Internal(String),
}

// =============================================================================
// CAPABILITY
// =============================================================================

/// Narrow capability the chess room manager depends on.
pub trait RulesEngine: Send + Sync {
    /// Serialize the current position (FEN).
    fn position(&self) -> String;

    /// Color whose turn it is according to the engine.
    fn side_to_move(&self) -> Color;

    /// Is the side to move in check?
    fn in_check(&self) -> bool;

    fn is_checkmate(&self) -> bool;

    fn is_stalemate(&self) -> bool;

    /// Piece occupying `square` ("e4"), if any.
    ///
    /// # Errors
    ///
    /// Returns `BadSquare` when the square does not parse.
    fn piece_at(&self, square: &str) -> Result<Option<PieceOnSquare>, RulesError>;

    /// Legal destination squares for the piece on `square`, sorted.
    ///
    /// # Errors
    ///
    /// Returns `BadSquare` when the square does not parse.
    fn legal_targets(&self, square: &str) -> Result<Vec<String>, RulesError>;

    /// Attempt a move. The engine's verdict is authoritative.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` when the move is illegal, `BadSquare` on
    /// unparseable input.
    fn apply_move(
        &mut self,
        from: &str,
        to: &str,
        promotion: Option<char>,
    ) -> Result<AcceptedMove, RulesError>;

    /// Return to the starting position.
    fn restart(&mut self);
}

//! Default rules engine backed by the `chess` crate.
//!
//! DESIGN
//! ======
//! One `chess::Game` per room. Legality comes from `MoveGen::new_legal`
//! against the current position; terminal state from `Board::status`.
//! Promotion defaults to queen when the client omitted a piece and the
//! move requires one. Notation is simplified algebraic (no file/rank
//! disambiguation) built from the pre-move board.

use std::str::FromStr;

use chess::{Board, BoardStatus, ChessMove, Game, MoveGen, Piece, Square};

use super::{AcceptedMove, Color, PieceKind, PieceOnSquare, RulesEngine, RulesError};

// =============================================================================
// CONVERSIONS
// =============================================================================

fn color_from(c: chess::Color) -> Color {
    match c {
        chess::Color::White => Color::White,
        chess::Color::Black => Color::Black,
    }
}

fn kind_from(p: Piece) -> PieceKind {
    match p {
        Piece::Pawn => PieceKind::Pawn,
        Piece::Knight => PieceKind::Knight,
        Piece::Bishop => PieceKind::Bishop,
        Piece::Rook => PieceKind::Rook,
        Piece::Queen => PieceKind::Queen,
        Piece::King => PieceKind::King,
    }
}

fn promotion_piece(c: char) -> Option<Piece> {
    match c.to_ascii_lowercase() {
        'q' => Some(Piece::Queen),
        'r' => Some(Piece::Rook),
        'b' => Some(Piece::Bishop),
        'n' => Some(Piece::Knight),
        _ => None,
    }
}

fn parse_square(s: &str) -> Result<Square, RulesError> {
    Square::from_str(s).map_err(|_| RulesError::BadSquare(s.to_string()))
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct StandardRules {
    game: Game,
}

impl StandardRules {
    #[must_use]
    pub fn new() -> Self {
        Self { game: Game::new() }
    }

    fn board(&self) -> Board {
        self.game.current_position()
    }
}

impl Default for StandardRules {
    fn default() -> Self {
        Self::new()
    }
}

impl RulesEngine for StandardRules {
    fn position(&self) -> String {
        self.board().to_string()
    }

    fn side_to_move(&self) -> Color {
        color_from(self.game.side_to_move())
    }

    fn in_check(&self) -> bool {
        self.board().checkers().popcnt() > 0
    }

    fn is_checkmate(&self) -> bool {
        self.board().status() == BoardStatus::Checkmate
    }

    fn is_stalemate(&self) -> bool {
        self.board().status() == BoardStatus::Stalemate
    }

    fn piece_at(&self, square: &str) -> Result<Option<PieceOnSquare>, RulesError> {
        let sq = parse_square(square)?;
        let board = self.board();
        Ok(board.piece_on(sq).map(|piece| PieceOnSquare {
            kind: kind_from(piece),
            color: board.color_on(sq).map_or(Color::White, color_from),
        }))
    }

    fn legal_targets(&self, square: &str) -> Result<Vec<String>, RulesError> {
        let sq = parse_square(square)?;
        let board = self.board();
        let mut targets: Vec<String> = MoveGen::new_legal(&board)
            .filter(|m| m.get_source() == sq)
            .map(|m| m.get_dest().to_string())
            .collect();
        targets.sort();
        targets.dedup();
        Ok(targets)
    }

    fn apply_move(
        &mut self,
        from: &str,
        to: &str,
        promotion: Option<char>,
    ) -> Result<AcceptedMove, RulesError> {
        let from_sq = parse_square(from)?;
        let to_sq = parse_square(to)?;
        let wanted = promotion.and_then(promotion_piece);

        let board = self.board();
        let candidates: Vec<ChessMove> = MoveGen::new_legal(&board)
            .filter(|m| m.get_source() == from_sq && m.get_dest() == to_sq)
            .collect();

        // Exact promotion match first; omitted promotion falls back to the
        // plain move, then queen when the move requires promoting.
        let mv = candidates
            .iter()
            .find(|m| m.get_promotion() == wanted)
            .or_else(|| {
                if wanted.is_none() {
                    candidates
                        .iter()
                        .find(|m| m.get_promotion() == Some(Piece::Queen))
                } else {
                    None
                }
            })
            .copied()
            .ok_or_else(|| RulesError::Rejected { from: from.to_string(), to: to.to_string() })?;

        let Some(piece) = board.piece_on(from_sq) else {
            return Err(RulesError::Rejected { from: from.to_string(), to: to.to_string() });
        };
        let mover = color_from(board.side_to_move());
        // En passant lands on an empty square but still captures.
        let capture = board.piece_on(to_sq).is_some()
            || (piece == Piece::Pawn && from_sq.get_file() != to_sq.get_file());

        if !self.game.make_move(mv) {
            return Err(RulesError::Rejected { from: from.to_string(), to: to.to_string() });
        }

        let kind = kind_from(piece);
        let promoted = mv.get_promotion().map(kind_from);
        let san = self.notation(kind, mv, capture, promoted);

        Ok(AcceptedMove { piece: kind, color: mover, capture, promotion: promoted, san })
    }

    fn restart(&mut self) {
        self.game = Game::new();
    }
}

impl StandardRules {
    /// Simplified algebraic notation, built after the move was applied so
    /// check/mate suffixes reflect the resulting position.
    fn notation(
        &self,
        piece: PieceKind,
        mv: ChessMove,
        capture: bool,
        promotion: Option<PieceKind>,
    ) -> String {
        let from = mv.get_source();
        let to = mv.get_dest();

        let castled = piece == PieceKind::King
            && from.get_file().to_index().abs_diff(to.get_file().to_index()) == 2;
        let mut san = if castled {
            if to.get_file().to_index() > from.get_file().to_index() {
                "O-O".to_string()
            } else {
                "O-O-O".to_string()
            }
        } else {
            let mut s = String::new();
            s.push_str(piece.letter());
            if capture {
                if piece == PieceKind::Pawn {
                    // Pawn captures carry the source file.
                    s.push_str(&from.to_string()[..1]);
                }
                s.push('x');
            }
            s.push_str(&to.to_string());
            if let Some(promoted) = promotion {
                s.push('=');
                s.push_str(promoted.letter());
            }
            s
        };

        if self.is_checkmate() {
            san.push('#');
        } else if self.in_check() {
            san.push('+');
        }
        san
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_position_basics() {
        let rules = StandardRules::new();
        assert_eq!(rules.side_to_move(), Color::White);
        assert!(!rules.in_check());
        assert!(!rules.is_checkmate());
        assert!(!rules.is_stalemate());
        assert!(rules.position().starts_with("rnbqkbnr/pppppppp"));
    }

    #[test]
    fn piece_at_reads_the_board() {
        let rules = StandardRules::new();
        let pawn = rules.piece_at("e2").unwrap().unwrap();
        assert_eq!(pawn.kind, PieceKind::Pawn);
        assert_eq!(pawn.color, Color::White);

        let knight = rules.piece_at("b8").unwrap().unwrap();
        assert_eq!(knight.kind, PieceKind::Knight);
        assert_eq!(knight.color, Color::Black);

        assert!(rules.piece_at("e4").unwrap().is_none());
        assert!(matches!(rules.piece_at("z9"), Err(RulesError::BadSquare(_))));
    }

    #[test]
    fn legal_targets_for_starting_pawn_and_knight() {
        let rules = StandardRules::new();
        assert_eq!(rules.legal_targets("e2").unwrap(), vec!["e3", "e4"]);
        assert_eq!(rules.legal_targets("g1").unwrap(), vec!["f3", "h3"]);
        // Blocked pieces have no targets.
        assert!(rules.legal_targets("d1").unwrap().is_empty());
    }

    #[test]
    fn pawn_advance_is_accepted_and_flips_side() {
        let mut rules = StandardRules::new();
        let accepted = rules.apply_move("e2", "e4", None).unwrap();
        assert_eq!(accepted.piece, PieceKind::Pawn);
        assert_eq!(accepted.color, Color::White);
        assert!(!accepted.capture);
        assert_eq!(accepted.san, "e4");
        assert_eq!(rules.side_to_move(), Color::Black);
    }

    #[test]
    fn illegal_move_is_rejected_and_position_unchanged() {
        let mut rules = StandardRules::new();
        let before = rules.position();
        assert!(matches!(
            rules.apply_move("e2", "e5", None),
            Err(RulesError::Rejected { .. })
        ));
        assert_eq!(rules.position(), before);
        assert_eq!(rules.side_to_move(), Color::White);
    }

    #[test]
    fn capture_notation_marks_the_capture() {
        let mut rules = StandardRules::new();
        rules.apply_move("e2", "e4", None).unwrap();
        rules.apply_move("d7", "d5", None).unwrap();
        let accepted = rules.apply_move("e4", "d5", None).unwrap();
        assert!(accepted.capture);
        assert_eq!(accepted.san, "exd5");
    }

    #[test]
    fn scholars_mate_is_checkmate() {
        let mut rules = StandardRules::new();
        rules.apply_move("e2", "e4", None).unwrap();
        rules.apply_move("e7", "e5", None).unwrap();
        rules.apply_move("d1", "h5", None).unwrap();
        rules.apply_move("b8", "c6", None).unwrap();
        rules.apply_move("f1", "c4", None).unwrap();
        rules.apply_move("g8", "f6", None).unwrap();
        let mate = rules.apply_move("h5", "f7", None).unwrap();
        assert!(mate.capture);
        assert_eq!(mate.san, "Qxf7#");
        assert!(rules.is_checkmate());
        assert!(rules.in_check());
        assert!(!rules.is_stalemate());
    }

    #[test]
    fn restart_returns_to_the_starting_position() {
        let mut rules = StandardRules::new();
        let initial = rules.position();
        rules.apply_move("e2", "e4", None).unwrap();
        assert_ne!(rules.position(), initial);
        rules.restart();
        assert_eq!(rules.position(), initial);
        assert_eq!(rules.side_to_move(), Color::White);
    }
}

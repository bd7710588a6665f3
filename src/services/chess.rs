//! Chess room manager — create/join/reconnect, engine-delegated moves,
//! end-of-game teardown, chat relay.
//!
//! DESIGN
//! ======
//! The manager owns seats, colors, turn bookkeeping, and the move log; the
//! rules engine owns the position and is the sole authority on legality and
//! terminal state. Rooms are created explicitly (unlike grid rooms) and die
//! either when the last player departs or five seconds after the game ends,
//! via a cancellable task in the cleanup queue.
//!
//! State machine per room:
//! `Waiting (creator seated) → Active (both colors) → Finished → (timed)
//! removed`, with `Paused` when a player vanishes mid-game. Reset returns
//! any surviving room to the starting position with seats and colors kept.
//!
//! ERROR HANDLING
//! ==============
//! Engine rejections and internal faults never escape as process failures;
//! both surface as `IllegalMove` carrying the rejected squares and the set
//! of legal destinations so clients can redraw hints.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::frame::{Data, Frame, now_ms};
use crate::room_code;
use crate::rules::{Color, RulesError};
use crate::sanitize::sanitize;
use crate::state::{AppState, ChessOutcome, ChessRoom, MoveRecord, RoomPhase};

/// Grace period between game end and room teardown.
pub const ENDGAME_LINGER: Duration = Duration::from_secs(5);

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ChessError {
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("room not found: {0}")]
    NotFound(String),
    #[error("room is full")]
    RoomFull,
    #[error("game has not started")]
    NotStarted,
    #[error("game is over")]
    GameOver,
    #[error("you are not seated in this room")]
    NotAPlayer,
    #[error("not your turn")]
    WrongTurn,
    #[error("no piece at {0}")]
    NoPieceAtSquare(String),
    #[error("the piece at {0} is not yours")]
    WrongPieceColor(String),
    #[error("illegal move {from}{to}: {reason}")]
    IllegalMove {
        from: String,
        to: String,
        reason: String,
        /// Legal destinations from `from`, for client feedback.
        legal: Vec<String>,
    },
    #[error("you are not a member of this room")]
    NotInRoom,
}

impl crate::frame::ErrorCode for ChessError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "E_INVALID_INPUT",
            Self::NotFound(_) => "E_ROOM_NOT_FOUND",
            Self::RoomFull => "E_ROOM_FULL",
            Self::NotStarted => "E_NOT_STARTED",
            Self::GameOver => "E_GAME_OVER",
            Self::NotAPlayer => "E_NOT_A_PLAYER",
            Self::WrongTurn => "E_WRONG_TURN",
            Self::NoPieceAtSquare(_) => "E_NO_PIECE",
            Self::WrongPieceColor(_) => "E_WRONG_PIECE_COLOR",
            Self::IllegalMove { .. } => "E_ILLEGAL_MOVE",
            Self::NotInRoom => "E_NOT_IN_ROOM",
        }
    }
}

/// Result of creating a room.
pub struct CreatedRoom {
    pub room_id: String,
    pub state: Data,
}

/// Result of a join, distinguishing reconnection from a fresh seat.
pub enum ChessJoin {
    /// Identity already seated — re-broadcast state, seats and colors kept.
    Reconnected { color: Option<Color>, state: Data },
    /// Second seat taken; the room hears a started notice, then state.
    Seated { color: Color, started: Data, state: Data },
}

/// Result of an accepted move.
#[derive(Debug)]
pub struct MoveAccepted {
    /// Sent to the mover alone.
    pub confirmation: Data,
    /// Broadcast to the room (includes `last_move`).
    pub state: Data,
    pub game_over: bool,
}

// =============================================================================
// CREATE
// =============================================================================

/// Create a room with a fresh engine, seating the creator as white.
///
/// A colliding room code silently replaces the older room — accepted
/// residual risk of the short-code scheme.
///
/// # Errors
///
/// `InvalidInput` when the display name is empty.
pub async fn create_room(
    state: &AppState,
    user_id: Uuid,
    name: &str,
    tx: mpsc::Sender<Frame>,
) -> Result<CreatedRoom, ChessError> {
    if name.is_empty() {
        return Err(ChessError::InvalidInput("name required"));
    }

    let room_id = room_code::generate();
    let mut room = ChessRoom::new((state.rules_factory)());
    room.players.push(user_id);
    room.player_names.insert(user_id, name.to_string());
    room.player_colors.insert(user_id, Color::White);
    room.clients.insert(user_id, tx);
    let snapshot = state_data(&room);

    let mut rooms = state.chess_rooms.write().await;
    rooms.insert(room_id.clone(), room);
    info!(%room_id, %user_id, name, "chess: room created");

    Ok(CreatedRoom { room_id, state: snapshot })
}

// =============================================================================
// JOIN
// =============================================================================

/// Join (or reconnect to) a room.
///
/// # Errors
///
/// `InvalidInput` on empty fields, `NotFound` for an unknown room,
/// `RoomFull` when both seats are taken by other identities.
pub async fn join_room(
    state: &AppState,
    room_id: &str,
    user_id: Uuid,
    name: &str,
    tx: mpsc::Sender<Frame>,
) -> Result<ChessJoin, ChessError> {
    if room_id.is_empty() {
        return Err(ChessError::InvalidInput("room_id required"));
    }
    if name.is_empty() {
        return Err(ChessError::InvalidInput("name required"));
    }

    let mut rooms = state.chess_rooms.write().await;
    let room = rooms
        .get_mut(room_id)
        .ok_or_else(|| ChessError::NotFound(room_id.to_string()))?;

    if room.players.contains(&user_id) {
        // Reconnect: refresh the outbound sender, keep seat and color.
        room.clients.insert(user_id, tx);
        info!(%room_id, %user_id, "chess: player reconnected");
        return Ok(ChessJoin::Reconnected {
            color: room.player_colors.get(&user_id).copied(),
            state: state_data(room),
        });
    }

    if room.players.len() >= 2 {
        return Err(ChessError::RoomFull);
    }

    room.players.push(user_id);
    room.player_names.insert(user_id, name.to_string());
    room.player_colors.insert(user_id, Color::Black);
    room.clients.insert(user_id, tx);
    room.phase = RoomPhase::Active;

    let mut started = Data::new();
    started.insert("user_id".into(), serde_json::json!(user_id));
    started.insert("name".into(), serde_json::json!(name));
    started.insert("color".into(), serde_json::json!(Color::Black));

    info!(%room_id, %user_id, name, "chess: game started");
    Ok(ChessJoin::Seated { color: Color::Black, started, state: state_data(room) })
}

// =============================================================================
// MOVE
// =============================================================================

/// Submit a move. The engine's verdict is authoritative; on acceptance the
/// log grows, the turn flips, terminal state is cached, and — when the game
/// just ended — the deferred teardown is scheduled.
///
/// # Errors
///
/// The full guard chain of structured rejections; every rejection leaves
/// room state untouched.
pub async fn submit_move(
    state: &AppState,
    room_id: &str,
    user_id: Uuid,
    from: &str,
    to: &str,
    promotion: Option<char>,
) -> Result<MoveAccepted, ChessError> {
    let mut rooms = state.chess_rooms.write().await;
    let room = rooms
        .get_mut(room_id)
        .ok_or_else(|| ChessError::NotFound(room_id.to_string()))?;

    match room.phase {
        RoomPhase::Waiting | RoomPhase::Paused => return Err(ChessError::NotStarted),
        RoomPhase::Finished => return Err(ChessError::GameOver),
        RoomPhase::Active => {}
    }

    let color = *room
        .player_colors
        .get(&user_id)
        .ok_or(ChessError::NotAPlayer)?;
    if color != room.current_player {
        return Err(ChessError::WrongTurn);
    }

    let piece = match room.rules.piece_at(from) {
        Ok(piece) => piece,
        Err(e) => return Err(rules_fault(&*room.rules, from, to, &e)),
    };
    let Some(piece) = piece else {
        return Err(ChessError::NoPieceAtSquare(from.to_string()));
    };
    if piece.color != color {
        return Err(ChessError::WrongPieceColor(from.to_string()));
    }

    let accepted = match room.rules.apply_move(from, to, promotion) {
        Ok(accepted) => accepted,
        Err(e) => return Err(rules_fault(&*room.rules, from, to, &e)),
    };

    room.moves.push(MoveRecord {
        from: from.to_string(),
        to: to.to_string(),
        piece: accepted.piece,
        san: accepted.san.clone(),
        color,
        player: user_id,
        ts: now_ms(),
    });
    room.current_player = color.opposite();
    room.check = room.rules.in_check();
    room.checkmate = room.rules.is_checkmate();
    room.stalemate = room.rules.is_stalemate();

    if room.checkmate {
        room.phase = RoomPhase::Finished;
        room.winner = Some(ChessOutcome::Won(color));
        info!(%room_id, winner = color.as_str(), "chess: checkmate");
    } else if room.stalemate {
        room.phase = RoomPhase::Finished;
        room.winner = Some(ChessOutcome::Draw);
        info!(%room_id, "chess: stalemate");
    }

    let mut confirmation = Data::new();
    confirmation.insert("from".into(), serde_json::json!(from));
    confirmation.insert("to".into(), serde_json::json!(to));
    confirmation.insert("piece".into(), serde_json::json!(accepted.piece.name()));
    confirmation.insert("san".into(), serde_json::json!(accepted.san));
    confirmation.insert("capture".into(), serde_json::json!(accepted.capture));
    confirmation.insert("check".into(), serde_json::json!(room.check));
    confirmation.insert("checkmate".into(), serde_json::json!(room.checkmate));
    confirmation.insert("stalemate".into(), serde_json::json!(room.stalemate));
    confirmation.insert("winner".into(), serde_json::json!(room.winner));

    let game_over = room.game_over();
    let snapshot = state_data(room);
    drop(rooms);

    if game_over {
        schedule_teardown(state, room_id);
    }

    Ok(MoveAccepted { confirmation, state: snapshot, game_over })
}

/// Convert an engine-level failure into a client-facing rejection. Bad
/// squares are malformed input; everything else — including internal engine
/// faults — becomes `IllegalMove` with the legal destinations attached.
fn rules_fault(
    rules: &dyn crate::rules::RulesEngine,
    from: &str,
    to: &str,
    err: &RulesError,
) -> ChessError {
    match err {
        RulesError::BadSquare(_) => ChessError::InvalidInput("squares must be a1..h8"),
        RulesError::Rejected { .. } | RulesError::Internal(_) => ChessError::IllegalMove {
            from: from.to_string(),
            to: to.to_string(),
            reason: err.to_string(),
            legal: rules.legal_targets(from).unwrap_or_default(),
        },
    }
}

// =============================================================================
// TEARDOWN
// =============================================================================

/// Schedule the post-game linger: after the grace period, broadcast an
/// ended notice and delete the room. Replaces any pending task for the
/// same room.
pub fn schedule_teardown(state: &AppState, room_id: &str) {
    let app = state.clone();
    let key = room_id.to_string();
    state.cleanup.schedule(room_id, ENDGAME_LINGER, async move {
        teardown(&app, &key).await;
    });
}

async fn teardown(state: &AppState, room_id: &str) {
    let mut rooms = state.chess_rooms.write().await;
    // The room may already be gone (disconnect sweep won the race).
    let Some(room) = rooms.get(room_id) else {
        return;
    };
    let ended = Frame::request("chess:ended", Data::new())
        .with_room_id(room_id)
        .with_data("winner", serde_json::json!(room.winner));
    fan_out(room, &ended);
    rooms.remove(room_id);
    info!(%room_id, "chess: room removed after game end");
}

// =============================================================================
// RESET
// =============================================================================

/// Reinitialize the engine and bookkeeping, preserving seats and colors.
/// Returns the snapshot to broadcast, or `None` when the room is unknown.
/// Cancels a pending teardown so the revived room is not deleted under
/// the players.
pub async fn reset(state: &AppState, room_id: &str) -> Option<Data> {
    let mut rooms = state.chess_rooms.write().await;
    let room = rooms.get_mut(room_id)?;

    room.rules.restart();
    room.current_player = Color::White;
    room.winner = None;
    room.moves.clear();
    room.check = false;
    room.checkmate = false;
    room.stalemate = false;
    room.phase = if room.players.len() == 2 { RoomPhase::Active } else { RoomPhase::Waiting };

    state.cleanup.cancel(room_id);
    info!(%room_id, "chess: room reset");
    Some(state_data(room))
}

// =============================================================================
// CHAT
// =============================================================================

/// Sanitize and shape a chat message for relay to the room.
///
/// # Errors
///
/// `NotFound` for an unknown room, `NotInRoom` when the sender is not a
/// member, `InvalidInput` when sanitization leaves nothing to say.
pub async fn chat(
    state: &AppState,
    room_id: &str,
    user_id: Uuid,
    name: &str,
    text: &str,
) -> Result<Data, ChessError> {
    let rooms = state.chess_rooms.read().await;
    let room = rooms
        .get(room_id)
        .ok_or_else(|| ChessError::NotFound(room_id.to_string()))?;
    if !room.clients.contains_key(&user_id) {
        return Err(ChessError::NotInRoom);
    }

    let clean = sanitize(text);
    if clean.is_empty() {
        return Err(ChessError::InvalidInput("message required"));
    }

    let mut data = Data::new();
    data.insert("name".into(), serde_json::json!(name));
    data.insert("message".into(), serde_json::json!(clean));
    data.insert("ts".into(), serde_json::json!(now_ms()));
    Ok(data)
}

// =============================================================================
// DISCONNECT
// =============================================================================

/// Remove a departed identity from every chess room containing it. Empty
/// rooms are evicted (cancelling any pending teardown); surviving rooms
/// pause and members are notified in place.
pub async fn sweep_disconnect(state: &AppState, user_id: Uuid) {
    let mut rooms = state.chess_rooms.write().await;
    let mut evict = Vec::new();

    for (room_id, room) in rooms.iter_mut() {
        if !room.players.contains(&user_id) {
            continue;
        }

        let name = room.player_names.remove(&user_id).unwrap_or_default();
        room.players.retain(|p| *p != user_id);
        room.player_colors.remove(&user_id);
        room.clients.remove(&user_id);

        if room.players.is_empty() {
            evict.push(room_id.clone());
            continue;
        }

        if room.phase == RoomPhase::Active {
            room.phase = RoomPhase::Paused;
        }

        let left = Frame::request("chess:left", Data::new())
            .with_room_id(room_id.clone())
            .with_data("user_id", user_id.to_string())
            .with_data("name", name);
        let snapshot = Frame::request("chess:state", state_data(room)).with_room_id(room_id.clone());
        fan_out(room, &left);
        fan_out(room, &snapshot);
        info!(%room_id, %user_id, remaining = room.players.len(), "chess: player disconnected");
    }

    for room_id in evict {
        rooms.remove(&room_id);
        state.cleanup.cancel(&room_id);
        info!(%room_id, %user_id, "chess: evicted empty room");
    }
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Broadcast a frame to all members of a room, optionally excluding one.
pub async fn broadcast(state: &AppState, room_id: &str, frame: &Frame, exclude: Option<Uuid>) {
    let rooms = state.chess_rooms.read().await;
    let Some(room) = rooms.get(room_id) else {
        return;
    };
    for (user_id, tx) in &room.clients {
        if exclude == Some(*user_id) {
            continue;
        }
        // Best-effort: if a client's channel is full, skip it.
        let _ = tx.try_send(frame.clone());
    }
}

fn fan_out(room: &ChessRoom, frame: &Frame) {
    for tx in room.clients.values() {
        let _ = tx.try_send(frame.clone());
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Full room state for broadcast. Always a snapshot, never a diff.
pub fn state_data(room: &ChessRoom) -> Data {
    let mut data = Data::new();
    data.insert("position".into(), serde_json::json!(room.rules.position()));
    data.insert("players".into(), serde_json::json!(room.players));
    data.insert("player_names".into(), serde_json::json!(room.player_names));
    data.insert("player_colors".into(), serde_json::json!(room.player_colors));
    data.insert("current_player".into(), serde_json::json!(room.current_player));
    data.insert("game_started".into(), serde_json::json!(room.game_started()));
    data.insert("game_over".into(), serde_json::json!(room.game_over()));
    data.insert("waiting_for_player".into(), serde_json::json!(room.waiting_for_player()));
    data.insert("winner".into(), serde_json::json!(room.winner));
    data.insert("check".into(), serde_json::json!(room.check));
    data.insert("checkmate".into(), serde_json::json!(room.checkmate));
    data.insert("stalemate".into(), serde_json::json!(room.stalemate));
    data.insert("moves".into(), serde_json::json!(room.moves));
    if let Some(last) = room.moves.last() {
        data.insert("last_move".into(), serde_json::json!(last));
    }
    data
}

#[cfg(test)]
#[path = "chess_test.rs"]
mod tests;

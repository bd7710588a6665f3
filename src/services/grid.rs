//! Grid-game room manager — 3×3 board, two marks, strict alternation.
//!
//! DESIGN
//! ======
//! Rooms are created lazily on first join and evicted when the last player
//! departs. Every mutation happens under one write-lock section and returns
//! the full room snapshot for broadcast, so all members observe transitions
//! in production order.
//!
//! State machine per room:
//! `EMPTY → WAITING (1 player) → ACTIVE (2 players) → TERMINAL (won/drawn)`,
//! with reset returning to a fresh ACTIVE board while seats survive.

use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::state::{AppState, GridOutcome, GridRoom, Mark};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GridError {
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
    #[error("cell {0} is already occupied")]
    CellOccupied(usize),
    #[error("you are not seated in this room")]
    NotAPlayer,
    #[error("not your turn")]
    WrongTurn,
}

impl crate::frame::ErrorCode for GridError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "E_INVALID_INPUT",
            Self::NotFound(_) => "E_ROOM_NOT_FOUND",
            Self::RoomFull => "E_ROOM_FULL",
            Self::NotStarted => "E_NOT_STARTED",
            Self::GameOver => "E_GAME_OVER",
            Self::CellOccupied(_) => "E_CELL_OCCUPIED",
            Self::NotAPlayer => "E_NOT_A_PLAYER",
            Self::WrongTurn => "E_WRONG_TURN",
        }
    }
}

/// Result of a join, distinguishing who needs to hear about it.
#[derive(Debug)]
pub enum GridJoin {
    /// Identity already seated — idempotent rejoin, re-broadcast state.
    Rejoined { mark: Mark, state: Data },
    /// First seat taken; only the joiner is told to wait.
    Waiting { mark: Mark, state: Data },
    /// Second seat taken; the room hears a joined notice, then state.
    Started { mark: Mark, joined: Data, state: Data },
}

/// The eight winning lines of the 3×3 board.
const WIN_LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

// =============================================================================
// JOIN
// =============================================================================

/// Seat a player, creating the room on first reference.
///
/// # Errors
///
/// `InvalidInput` on empty fields, `RoomFull` when both seats are taken.
pub async fn join(
    state: &AppState,
    room_id: &str,
    user_id: Uuid,
    name: &str,
    tx: mpsc::Sender<Frame>,
) -> Result<GridJoin, GridError> {
    if room_id.is_empty() {
        return Err(GridError::InvalidInput("room_id required"));
    }
    if name.is_empty() {
        return Err(GridError::InvalidInput("name required"));
    }

    let mut rooms = state.grid_rooms.write().await;
    let room = rooms.entry(room_id.to_string()).or_insert_with(GridRoom::new);

    if let Some(mark) = room.mark_of(user_id) {
        // Reconnect: refresh the outbound sender, keep the seat.
        room.clients.insert(user_id, tx);
        info!(%room_id, %user_id, "grid: player rejoined");
        return Ok(GridJoin::Rejoined { mark, state: state_data(room) });
    }

    if room.players.len() >= 2 {
        return Err(GridError::RoomFull);
    }

    room.players.push(user_id);
    room.player_names.insert(user_id, name.to_string());
    room.clients.insert(user_id, tx);
    let mark = if room.players.len() == 1 { Mark::X } else { Mark::O };

    info!(%room_id, %user_id, name, mark = mark.as_str(), seats = room.players.len(), "grid: player seated");

    if room.players.len() == 2 {
        room.game_started = true;
        let mut joined = Data::new();
        joined.insert("user_id".into(), serde_json::json!(user_id));
        joined.insert("name".into(), serde_json::json!(name));
        joined.insert("mark".into(), serde_json::json!(mark));
        Ok(GridJoin::Started { mark, joined, state: state_data(room) })
    } else {
        Ok(GridJoin::Waiting { mark, state: state_data(room) })
    }
}

// =============================================================================
// MOVE
// =============================================================================

/// Apply a move to `cell` (0..=8, row-major). Returns the room snapshot.
///
/// # Errors
///
/// The full guard chain: `NotFound`, `NotStarted`, `GameOver`,
/// `CellOccupied`, `NotAPlayer`, `WrongTurn`.
pub async fn make_move(
    state: &AppState,
    room_id: &str,
    user_id: Uuid,
    cell: usize,
) -> Result<Data, GridError> {
    let mut rooms = state.grid_rooms.write().await;
    let room = rooms
        .get_mut(room_id)
        .ok_or_else(|| GridError::NotFound(room_id.to_string()))?;

    if !room.game_started {
        return Err(GridError::NotStarted);
    }
    if room.game_over {
        return Err(GridError::GameOver);
    }
    if room.board[cell].is_some() {
        return Err(GridError::CellOccupied(cell));
    }
    let mark = room.mark_of(user_id).ok_or(GridError::NotAPlayer)?;
    if mark != room.current_player {
        return Err(GridError::WrongTurn);
    }

    room.board[cell] = Some(mark);

    if let Some(winner) = winning_mark(&room.board) {
        room.game_over = true;
        room.winner = Some(GridOutcome::Won(winner));
        info!(%room_id, winner = winner.as_str(), "grid: game won");
    } else if room.board.iter().all(Option::is_some) {
        room.game_over = true;
        room.winner = Some(GridOutcome::Draw);
        info!(%room_id, "grid: game drawn");
    } else {
        room.current_player = room.current_player.opposite();
    }

    Ok(state_data(room))
}

/// Scan the eight fixed lines for three equal marks.
fn winning_mark(board: &[Option<Mark>; 9]) -> Option<Mark> {
    WIN_LINES.iter().find_map(|&[a, b, c]| {
        match (board[a], board[b], board[c]) {
            (Some(m1), Some(m2), Some(m3)) if m1 == m2 && m2 == m3 => Some(m1),
            _ => None,
        }
    })
}

// =============================================================================
// RESET
// =============================================================================

/// Clear the board back to a fresh game, preserving seats and names.
/// Returns the snapshot to broadcast, or `None` when the room is unknown
/// (reset of a missing room is a no-op, not an error).
pub async fn reset(state: &AppState, room_id: &str) -> Option<Data> {
    let mut rooms = state.grid_rooms.write().await;
    let room = rooms.get_mut(room_id)?;

    room.board = [None; 9];
    room.current_player = Mark::X;
    room.game_over = false;
    room.winner = None;

    info!(%room_id, "grid: room reset");
    Some(state_data(room))
}

// =============================================================================
// DISCONNECT
// =============================================================================

/// Remove a departed identity from every grid room containing it.
/// Empty rooms are evicted; surviving rooms degrade to a terminal state and
/// members are notified in place.
pub async fn sweep_disconnect(state: &AppState, user_id: Uuid) {
    let mut rooms = state.grid_rooms.write().await;
    let mut evict = Vec::new();

    for (room_id, room) in rooms.iter_mut() {
        if !room.players.contains(&user_id) {
            continue;
        }

        let name = room.player_names.remove(&user_id).unwrap_or_default();
        room.players.retain(|p| *p != user_id);
        room.clients.remove(&user_id);

        if room.players.is_empty() {
            evict.push(room_id.clone());
            continue;
        }

        // Opponent left mid-game: the board is unplayable until reset.
        room.game_started = false;
        room.game_over = true;

        let left = Frame::request("grid:left", Data::new())
            .with_room_id(room_id.clone())
            .with_data("user_id", user_id.to_string())
            .with_data("name", name);
        let snapshot = Frame::request("grid:state", state_data(room)).with_room_id(room_id.clone());
        fan_out(room, &left);
        fan_out(room, &snapshot);
        info!(%room_id, %user_id, remaining = room.players.len(), "grid: player disconnected");
    }

    for room_id in evict {
        rooms.remove(&room_id);
        info!(%room_id, %user_id, "grid: evicted empty room");
    }
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Broadcast a frame to all members of a room, optionally excluding one.
pub async fn broadcast(state: &AppState, room_id: &str, frame: &Frame, exclude: Option<Uuid>) {
    let rooms = state.grid_rooms.read().await;
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

fn fan_out(room: &GridRoom, frame: &Frame) {
    for tx in room.clients.values() {
        let _ = tx.try_send(frame.clone());
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Full room state for broadcast. Always a snapshot, never a diff.
pub fn state_data(room: &GridRoom) -> Data {
    let mut data = Data::new();
    data.insert("board".into(), serde_json::json!(room.board));
    data.insert("players".into(), serde_json::json!(room.players));
    data.insert("player_names".into(), serde_json::json!(room.player_names));
    data.insert("current_player".into(), serde_json::json!(room.current_player));
    data.insert("game_started".into(), serde_json::json!(room.game_started));
    data.insert("game_over".into(), serde_json::json!(room.game_over));
    data.insert("winner".into(), serde_json::json!(room.winner));
    data.insert("waiting_for_player".into(), serde_json::json!(room.players.len() < 2));
    data
}

#[cfg(test)]
#[path = "grid_test.rs"]
mod tests;

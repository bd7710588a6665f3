//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It owns the two keyed room stores (grid and chess), the identity
//! registry, the cleanup task table, and the rules-engine factory. There
//! are no process-wide singletons; everything hangs off this struct.
//!
//! Room membership (`clients`) is keyed by stable user identity, not by
//! connection: a reconnect simply overwrites the outbound sender, which is
//! the same last-write-wins rule the registry applies.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::cleanup::CleanupQueue;
use crate::frame::Frame;
use crate::rules::standard::StandardRules;
use crate::rules::{Color, PieceKind, RulesEngine};

// =============================================================================
// GRID ROOM
// =============================================================================

/// Player mark in the 3×3 grid game. First seat is X, second is O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mark {
    X,
    O,
}

impl Mark {
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Mark::X => Mark::O,
            Mark::O => Mark::X,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Mark::X => "x",
            Mark::O => "o",
        }
    }
}

/// How a grid game ended. Serializes as `"x"`, `"o"`, or `"draw"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridOutcome {
    Won(Mark),
    Draw,
}

impl Serialize for GridOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            GridOutcome::Won(mark) => serializer.serialize_str(mark.as_str()),
            GridOutcome::Draw => serializer.serialize_str("draw"),
        }
    }
}

/// Per-room live state for the grid game. Created lazily on first join,
/// destroyed when the last player departs.
pub struct GridRoom {
    /// Nine cells, row-major. A cell, once set, only clears on reset.
    pub board: [Option<Mark>; 9],
    /// Seat order: first entrant plays X, second plays O.
    pub players: Vec<Uuid>,
    pub player_names: HashMap<Uuid, String>,
    pub current_player: Mark,
    pub game_started: bool,
    pub game_over: bool,
    pub winner: Option<GridOutcome>,
    /// Connected members: user identity -> sender for outgoing frames.
    pub clients: HashMap<Uuid, mpsc::Sender<Frame>>,
}

impl GridRoom {
    #[must_use]
    pub fn new() -> Self {
        Self {
            board: [None; 9],
            players: Vec::new(),
            player_names: HashMap::new(),
            current_player: Mark::X,
            game_started: false,
            game_over: false,
            winner: None,
            clients: HashMap::new(),
        }
    }

    /// Mark assigned to a seated identity, by seat order.
    #[must_use]
    pub fn mark_of(&self, user_id: Uuid) -> Option<Mark> {
        match self.players.iter().position(|p| *p == user_id) {
            Some(0) => Some(Mark::X),
            Some(_) => Some(Mark::O),
            None => None,
        }
    }
}

impl Default for GridRoom {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CHESS ROOM
// =============================================================================

/// Explicit room lifecycle, so paused/finished can never be stored as a
/// contradictory pair of booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// One seat filled, waiting for an opponent.
    Waiting,
    /// Two seats filled, moves accepted.
    Active,
    /// A player vanished mid-game; the room survives until rejoin or sweep.
    Paused,
    /// Checkmate or stalemate reached; teardown is scheduled.
    Finished,
}

/// How a chess game ended. Serializes as `"white"`, `"black"`, or `"draw"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChessOutcome {
    Won(Color),
    Draw,
}

impl Serialize for ChessOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ChessOutcome::Won(color) => serializer.serialize_str(color.as_str()),
            ChessOutcome::Draw => serializer.serialize_str("draw"),
        }
    }
}

/// One entry in a room's append-only move log.
#[derive(Debug, Clone, Serialize)]
pub struct MoveRecord {
    pub from: String,
    pub to: String,
    pub piece: PieceKind,
    pub san: String,
    pub color: Color,
    pub player: Uuid,
    pub ts: i64,
}

/// Per-room live state for chess. Created by an explicit create event,
/// destroyed when empty or by the deferred post-game teardown.
pub struct ChessRoom {
    pub rules: Box<dyn RulesEngine>,
    /// Seat order: first entrant plays white, second plays black.
    pub players: Vec<Uuid>,
    pub player_names: HashMap<Uuid, String>,
    /// Color assignment is permanent for as long as the seat is held.
    pub player_colors: HashMap<Uuid, Color>,
    pub current_player: Color,
    pub phase: RoomPhase,
    pub winner: Option<ChessOutcome>,
    pub moves: Vec<MoveRecord>,
    /// Cached engine verdicts from the last accepted move.
    pub check: bool,
    pub checkmate: bool,
    pub stalemate: bool,
    /// Connected members: user identity -> sender for outgoing frames.
    pub clients: HashMap<Uuid, mpsc::Sender<Frame>>,
}

impl ChessRoom {
    #[must_use]
    pub fn new(rules: Box<dyn RulesEngine>) -> Self {
        Self {
            rules,
            players: Vec::new(),
            player_names: HashMap::new(),
            player_colors: HashMap::new(),
            current_player: Color::White,
            phase: RoomPhase::Waiting,
            winner: None,
            moves: Vec::new(),
            check: false,
            checkmate: false,
            stalemate: false,
            clients: HashMap::new(),
        }
    }

    #[must_use]
    pub fn game_started(&self) -> bool {
        self.phase == RoomPhase::Active
    }

    #[must_use]
    pub fn game_over(&self) -> bool {
        self.phase == RoomPhase::Finished
    }

    #[must_use]
    pub fn waiting_for_player(&self) -> bool {
        self.players.len() < 2
    }
}

// =============================================================================
// IDENTITY REGISTRY
// =============================================================================

/// Maps stable user identity to its current connection. Last write wins;
/// a connection carries its bound identity for its entire lifetime, so
/// managers never consult this map on the hot path — only the close path
/// does, to ignore a stale socket whose identity already rebound.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, Uuid>>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or overwrite the connection for an identity.
    pub async fn bind(&self, user_id: Uuid, client_id: Uuid) {
        self.inner.write().await.insert(user_id, client_id);
    }

    /// Remove the identity's binding.
    pub async fn unbind(&self, user_id: Uuid) {
        self.inner.write().await.remove(&user_id);
    }

    /// Is `client_id` still the identity's current connection?
    pub async fn is_current(&self, user_id: Uuid, client_id: Uuid) -> bool {
        self.inner.read().await.get(&user_id) == Some(&client_id)
    }

    pub async fn connection_of(&self, user_id: Uuid) -> Option<Uuid> {
        self.inner.read().await.get(&user_id).copied()
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Factory producing a fresh rules engine per chess room.
pub type RulesFactory = Arc<dyn Fn() -> Box<dyn RulesEngine> + Send + Sync>;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum — all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub grid_rooms: Arc<RwLock<HashMap<String, GridRoom>>>,
    pub chess_rooms: Arc<RwLock<HashMap<String, ChessRoom>>>,
    pub registry: ConnectionRegistry,
    /// Pending deferred room teardowns, keyed by room id.
    pub cleanup: CleanupQueue,
    pub rules_factory: RulesFactory,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        let factory: RulesFactory = Arc::new(|| Box::new(StandardRules::new()));
        Self::with_rules(factory)
    }

    /// Build state with an injected rules-engine factory (tests use a
    /// scripted fake here).
    #[must_use]
    pub fn with_rules(rules_factory: RulesFactory) -> Self {
        Self {
            grid_rooms: Arc::new(RwLock::new(HashMap::new())),
            chess_rooms: Arc::new(RwLock::new(HashMap::new())),
            registry: ConnectionRegistry::new(),
            cleanup: CleanupQueue::new(),
            rules_factory,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


// =============================================================================
// TESTS
// =============================================================================

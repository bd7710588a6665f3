//! Disconnect coordinator.
//!
//! DESIGN
//! ======
//! When an identity loses its connection, both room managers are swept in
//! turn: the departed player is unseated everywhere, empty rooms are
//! evicted, and surviving rooms degrade (grid: terminal, chess: paused)
//! with members notified in place. The caller — the websocket close path —
//! has already checked the registry, so a stale close for a reconnected
//! identity never reaches this function.

use tracing::info;
use uuid::Uuid;

use crate::services::{chess, grid};
use crate::state::AppState;

/// Sweep every room for a departed identity.
pub async fn handle_disconnect(state: &AppState, user_id: Uuid) {
    info!(%user_id, "disconnect: sweeping rooms");
    grid::sweep_disconnect(state, user_id).await;
    chess::sweep_disconnect(state, user_id).await;
}

#[cfg(test)]
#[path = "disconnect_test.rs"]
mod tests;

//! Domain services used by the websocket route.
//!
//! ARCHITECTURE
//! ============
//! Service modules own room state and game logic so the route layer can
//! stay focused on protocol translation and outbound fan-out. Each manager
//! validates, mutates under the store's write lock, and hands snapshots
//! back for broadcast.

pub mod chess;
pub mod disconnect;
pub mod grid;

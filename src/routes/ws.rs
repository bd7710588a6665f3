//! WebSocket handler — bidirectional frame relay.
//!
//! DESIGN
//! ======
//! On upgrade, the connection binds its stable user identity in the
//! registry and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Broadcast frames from room peers → forward to client
//!
//! Handler functions are pure protocol translation — they validate fields,
//! call the room managers, and return an `Outcome`. The dispatch layer owns
//! all outbound concerns: reply to sender and fan-out to the room, emitted
//! synchronously so every member observes transitions in production order.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → bind identity → send `session:connected`
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Dispatch applies Outcome (reply / broadcast / both)
//! 4. Close → if this socket is still the identity's current connection,
//!    unbind and sweep both room managers

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, Frame, Status};
use crate::services;
use crate::services::chess::{ChessError, ChessJoin};
use crate::services::grid::{GridError, GridJoin};
use crate::state::AppState;

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what — handlers never send frames directly.
enum Outcome {
    /// Broadcast done+data to ALL room members. Sender's copy carries
    /// `parent_id` for correlation; peers get an uncorrelated copy.
    Broadcast { room_id: String, data: Data },
    /// Send done+data to sender only.
    Reply(Data),
    /// Send done+reply to sender, then broadcast the listed event frames
    /// to the whole room, sender included.
    ReplyAndAnnounce {
        room_id: String,
        reply: Data,
        events: Vec<(&'static str, Data)>,
    },
    /// Send empty done to sender only.
    Done,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    // Stable identity supplied by the client; minted fresh when absent or
    // malformed. Reconnects present the same id to reclaim their seats.
    let user_id = params
        .get("user_id")
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(Uuid::new_v4);

    ws.on_upgrade(move |socket| run_ws(socket, state, user_id))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, user_id: Uuid) {
    let client_id = Uuid::new_v4();

    // Per-connection channel for receiving broadcast frames from peers.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(256);

    state.registry.bind(user_id, client_id).await;

    let welcome = Frame::request("session:connected", Data::new())
        .with_data("client_id", client_id.to_string())
        .with_data("user_id", user_id.to_string());
    if send_frame(&mut socket, &welcome).await.is_err() {
        release_connection(&state, user_id, client_id).await;
        return;
    }

    info!(%client_id, %user_id, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let frames = process_inbound_text(&state, client_id, user_id, &client_tx, &text).await;
                        for frame in frames {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    release_connection(&state, user_id, client_id).await;
    info!(%client_id, %user_id, "ws: client disconnected");
}

/// Close-path cleanup. The sweep runs only when this socket is still the
/// identity's current connection — a fast reconnect must not be evicted by
/// its old socket's late close.
async fn release_connection(state: &AppState, user_id: Uuid, client_id: Uuid) {
    if state.registry.is_current(user_id, client_id).await {
        state.registry.unbind(user_id).await;
        services::disconnect::handle_disconnect(state, user_id).await;
    } else {
        info!(%client_id, %user_id, "ws: stale close ignored, identity rebound");
    }
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the
/// sender. Kept free of socket concerns so tests can exercise dispatch and
/// broadcast behavior end-to-end.
async fn process_inbound_text(
    state: &AppState,
    client_id: Uuid,
    user_id: Uuid,
    client_tx: &mpsc::Sender<Frame>,
    text: &str,
) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new())
                .with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    // Stamp the connection's bound identity as `from`.
    req.from = Some(user_id.to_string());

    info!(%client_id, id = %req.id, syscall = %req.syscall, "ws: recv frame");

    let prefix = req.prefix();
    let result = match prefix {
        "grid" => handle_grid(state, user_id, client_tx, &req).await,
        "chess" => handle_chess(state, user_id, client_tx, &req).await,
        _ => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    // Apply outcome — the dispatch layer owns all outbound logic.
    match result {
        Ok(Outcome::Broadcast { room_id, data }) => {
            let sender_frame = req.done_with(data);
            // Peers get a copy without parent_id (they didn't originate it).
            let mut peer_frame = sender_frame.clone();
            peer_frame.id = Uuid::new_v4();
            peer_frame.parent_id = None;
            broadcast_room(state, prefix, &room_id, &peer_frame, Some(user_id)).await;
            vec![sender_frame]
        }
        Ok(Outcome::Reply(data)) => {
            vec![req.done_with(data)]
        }
        Ok(Outcome::ReplyAndAnnounce { room_id, reply, events }) => {
            for (syscall, data) in events {
                let frame = Frame::request(syscall, data).with_room_id(room_id.clone());
                broadcast_room(state, prefix, &room_id, &frame, None).await;
            }
            vec![req.done_with(reply)]
        }
        Ok(Outcome::Done) => {
            vec![req.done()]
        }
        Err(err_frame) => {
            vec![err_frame]
        }
    }
}

async fn broadcast_room(
    state: &AppState,
    prefix: &str,
    room_id: &str,
    frame: &Frame,
    exclude: Option<Uuid>,
) {
    if prefix == "grid" {
        services::grid::broadcast(state, room_id, frame, exclude).await;
    } else {
        services::chess::broadcast(state, room_id, frame, exclude).await;
    }
}

// =============================================================================
// GRID HANDLERS
// =============================================================================

async fn handle_grid(
    state: &AppState,
    user_id: Uuid,
    client_tx: &mpsc::Sender<Frame>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    match req.op() {
        "join" => {
            let Some(room_id) = room_id_of(req) else {
                return Err(req.error_from(&GridError::InvalidInput("room_id required")));
            };
            let Some(name) = str_field(req, "name") else {
                return Err(req.error_from(&GridError::InvalidInput("name required")));
            };

            match services::grid::join(state, &room_id, user_id, name, client_tx.clone()).await {
                Ok(GridJoin::Rejoined { mark, state: snapshot }) => Ok(Outcome::ReplyAndAnnounce {
                    room_id,
                    reply: mark_reply(mark),
                    events: vec![("grid:state", snapshot)],
                }),
                Ok(GridJoin::Waiting { mark, state: snapshot }) => {
                    // Only the joiner hears about the wait.
                    let mut reply = snapshot;
                    reply.insert("mark".into(), serde_json::json!(mark));
                    Ok(Outcome::Reply(reply))
                }
                Ok(GridJoin::Started { mark, joined, state: snapshot }) => Ok(Outcome::ReplyAndAnnounce {
                    room_id,
                    reply: mark_reply(mark),
                    events: vec![("grid:joined", joined), ("grid:state", snapshot)],
                }),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "move" => {
            let Some(room_id) = room_id_of(req) else {
                return Err(req.error_from(&GridError::InvalidInput("room_id required")));
            };
            let Some(cell) = req.data.get("cell").and_then(serde_json::Value::as_u64) else {
                return Err(req.error_from(&GridError::InvalidInput("cell required")));
            };
            if cell > 8 {
                return Err(req.error_from(&GridError::InvalidInput("cell must be in 0..=8")));
            }

            match services::grid::make_move(state, &room_id, user_id, cell as usize).await {
                Ok(snapshot) => Ok(Outcome::Broadcast { room_id, data: snapshot }),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "reset" => {
            let Some(room_id) = room_id_of(req) else {
                return Err(req.error_from(&GridError::InvalidInput("room_id required")));
            };
            match services::grid::reset(state, &room_id).await {
                Some(snapshot) => Ok(Outcome::Broadcast { room_id, data: snapshot }),
                // Reset of an unknown room is a no-op, not an error.
                None => Ok(Outcome::Done),
            }
        }
        op => Err(req.error(format!("unknown grid op: {op}"))),
    }
}

fn mark_reply(mark: crate::state::Mark) -> Data {
    let mut reply = Data::new();
    reply.insert("mark".into(), serde_json::json!(mark));
    reply
}

// =============================================================================
// CHESS HANDLERS
// =============================================================================

async fn handle_chess(
    state: &AppState,
    user_id: Uuid,
    client_tx: &mpsc::Sender<Frame>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    match req.op() {
        "create" => {
            let Some(name) = str_field(req, "name") else {
                return Err(req.error_from(&ChessError::InvalidInput("name required")));
            };

            match services::chess::create_room(state, user_id, name, client_tx.clone()).await {
                Ok(created) => {
                    let mut reply = Data::new();
                    reply.insert("room_id".into(), serde_json::json!(created.room_id));
                    reply.insert("color".into(), serde_json::json!("white"));
                    Ok(Outcome::ReplyAndAnnounce {
                        room_id: created.room_id,
                        reply,
                        events: vec![("chess:state", created.state)],
                    })
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "join" => {
            let Some(room_id) = room_id_of(req) else {
                return Err(req.error_from(&ChessError::InvalidInput("room_id required")));
            };
            let Some(name) = str_field(req, "name") else {
                return Err(req.error_from(&ChessError::InvalidInput("name required")));
            };

            match services::chess::join_room(state, &room_id, user_id, name, client_tx.clone()).await {
                Ok(ChessJoin::Reconnected { color, state: snapshot }) => {
                    let mut reply = Data::new();
                    reply.insert("color".into(), serde_json::json!(color));
                    Ok(Outcome::ReplyAndAnnounce {
                        room_id,
                        reply,
                        events: vec![("chess:state", snapshot)],
                    })
                }
                Ok(ChessJoin::Seated { color, started, state: snapshot }) => {
                    let mut reply = Data::new();
                    reply.insert("color".into(), serde_json::json!(color));
                    Ok(Outcome::ReplyAndAnnounce {
                        room_id,
                        reply,
                        events: vec![("chess:started", started), ("chess:state", snapshot)],
                    })
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "move" => {
            let Some(room_id) = room_id_of(req) else {
                return Err(req.error_from(&ChessError::InvalidInput("room_id required")));
            };
            let Some(from) = str_field(req, "from") else {
                return Err(req.error_from(&ChessError::InvalidInput("from required")));
            };
            let Some(to) = str_field(req, "to") else {
                return Err(req.error_from(&ChessError::InvalidInput("to required")));
            };
            let promotion = str_field(req, "promotion").and_then(|s| s.chars().next());

            match services::chess::submit_move(state, &room_id, user_id, from, to, promotion).await {
                Ok(accepted) => Ok(Outcome::ReplyAndAnnounce {
                    room_id,
                    reply: accepted.confirmation,
                    events: vec![("chess:state", accepted.state)],
                }),
                Err(e) => {
                    let mut frame = req.error_from(&e);
                    // Illegal moves carry the rejected squares and the legal
                    // destinations so clients can redraw hints.
                    if let ChessError::IllegalMove { from, to, legal, .. } = &e {
                        frame = frame
                            .with_data("from", serde_json::json!(from))
                            .with_data("to", serde_json::json!(to))
                            .with_data("legal_targets", serde_json::json!(legal));
                    }
                    Err(frame)
                }
            }
        }
        "reset" => {
            let Some(room_id) = room_id_of(req) else {
                return Err(req.error_from(&ChessError::InvalidInput("room_id required")));
            };
            match services::chess::reset(state, &room_id).await {
                Some(snapshot) => Ok(Outcome::Broadcast { room_id, data: snapshot }),
                None => Ok(Outcome::Done),
            }
        }
        "chat" => {
            let Some(room_id) = room_id_of(req) else {
                return Err(req.error_from(&ChessError::InvalidInput("room_id required")));
            };
            let Some(name) = str_field(req, "name") else {
                return Err(req.error_from(&ChessError::InvalidInput("name required")));
            };
            let text = req
                .data
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default();

            match services::chess::chat(state, &room_id, user_id, name, text).await {
                Ok(data) => Ok(Outcome::Broadcast { room_id, data }),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        op => Err(req.error(format!("unknown chess op: {op}"))),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Room id from the frame envelope, falling back to the data payload.
fn room_id_of(req: &Frame) -> Option<String> {
    req.room_id
        .clone()
        .or_else(|| {
            req.data
                .get("room_id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .filter(|s| !s.is_empty())
}

fn str_field<'a>(req: &'a Frame, key: &str) -> Option<&'a str> {
    req.data
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame.data.get("code").and_then(|v| v.as_str()).unwrap_or("-");
        let message = frame
            .data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;

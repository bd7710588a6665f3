use super::*;
use crate::state::test_helpers;
use serde_json::json;
use tokio::time::{Duration, timeout};

fn request_text(room_id: Option<&str>, syscall: &str, data: Data) -> String {
    let mut req = Frame::request(syscall, data);
    if let Some(room_id) = room_id {
        req = req.with_room_id(room_id);
    }
    serde_json::to_string(&req).expect("serialize request")
}

async fn recv_broadcast(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(300), rx.recv())
        .await
        .expect("broadcast receive timed out")
        .expect("broadcast channel closed")
}

async fn assert_no_broadcast(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected no broadcast frame"
    );
}

struct TestClient {
    client_id: Uuid,
    user_id: Uuid,
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

impl TestClient {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(32);
        Self { client_id: Uuid::new_v4(), user_id: Uuid::new_v4(), tx, rx }
    }

    async fn send(&self, state: &AppState, text: &str) -> Vec<Frame> {
        process_inbound_text(state, self.client_id, self.user_id, &self.tx, text).await
    }
}

// =============================================================================
// GATEWAY
// =============================================================================

#[tokio::test]
async fn invalid_json_yields_gateway_error() {
    let state = test_helpers::test_app_state();
    let client = TestClient::new();

    let frames = client.send(&state, "{not json").await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].syscall, "gateway:error");
    assert!(
        frames[0]
            .data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .contains("invalid json")
    );
}

#[tokio::test]
async fn unknown_prefix_is_rejected() {
    let state = test_helpers::test_app_state();
    let client = TestClient::new();

    let frames = client
        .send(&state, &request_text(None, "poker:deal", Data::new()))
        .await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Error);
    assert!(
        frames[0]
            .data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .contains("unknown prefix")
    );
}

#[tokio::test]
async fn inbound_frames_are_stamped_with_the_bound_identity() {
    let state = test_helpers::test_app_state();
    let client = TestClient::new();

    let mut data = Data::new();
    data.insert("name".into(), json!("Alice"));
    let frames = client
        .send(&state, &request_text(Some("STAMP1"), "grid:join", data))
        .await;
    assert_eq!(frames[0].status, Status::Done);

    let rooms = state.grid_rooms.read().await;
    assert!(rooms.get("STAMP1").unwrap().players.contains(&client.user_id));
}

// =============================================================================
// GRID
// =============================================================================

#[tokio::test]
async fn grid_join_requires_room_id_and_name() {
    let state = test_helpers::test_app_state();
    let client = TestClient::new();

    let frames = client
        .send(&state, &request_text(None, "grid:join", Data::new()))
        .await;
    assert_eq!(frames[0].status, Status::Error);
    assert_eq!(frames[0].data.get("code").and_then(|v| v.as_str()), Some("E_INVALID_INPUT"));

    let frames = client
        .send(&state, &request_text(Some("NEEDNM"), "grid:join", Data::new()))
        .await;
    assert_eq!(frames[0].status, Status::Error);
    assert_eq!(frames[0].data.get("code").and_then(|v| v.as_str()), Some("E_INVALID_INPUT"));
}

#[tokio::test]
async fn grid_first_join_replies_with_waiting_state_only() {
    let state = test_helpers::test_app_state();
    let mut client = TestClient::new();

    let mut data = Data::new();
    data.insert("name".into(), json!("Alice"));
    let frames = client
        .send(&state, &request_text(Some("GRIDW1"), "grid:join", data))
        .await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Done);
    assert_eq!(frames[0].data.get("mark").and_then(|v| v.as_str()), Some("x"));
    assert_eq!(frames[0].data.get("waiting_for_player").and_then(|v| v.as_bool()), Some(true));
    assert_no_broadcast(&mut client.rx).await;
}

#[tokio::test]
async fn grid_second_join_announces_to_the_whole_room() {
    let state = test_helpers::test_app_state();
    let mut u1 = TestClient::new();
    let mut u2 = TestClient::new();

    let mut data = Data::new();
    data.insert("name".into(), json!("Alice"));
    u1.send(&state, &request_text(Some("GRIDW2"), "grid:join", data))
        .await;

    let mut data = Data::new();
    data.insert("name".into(), json!("Bob"));
    let frames = u2
        .send(&state, &request_text(Some("GRIDW2"), "grid:join", data))
        .await;
    assert_eq!(frames[0].status, Status::Done);
    assert_eq!(frames[0].data.get("mark").and_then(|v| v.as_str()), Some("o"));

    // Both members hear the joined notice, then the state snapshot.
    for rx in [&mut u1.rx, &mut u2.rx] {
        let joined = recv_broadcast(rx).await;
        assert_eq!(joined.syscall, "grid:joined");
        assert_eq!(joined.data.get("name").and_then(|v| v.as_str()), Some("Bob"));

        let snapshot = recv_broadcast(rx).await;
        assert_eq!(snapshot.syscall, "grid:state");
        assert_eq!(snapshot.data.get("game_started").and_then(|v| v.as_bool()), Some(true));
    }
}

#[tokio::test]
async fn grid_move_broadcasts_state_and_occupied_cell_is_rejected() {
    let state = test_helpers::test_app_state();
    let mut u1 = TestClient::new();
    let mut u2 = TestClient::new();

    let mut data = Data::new();
    data.insert("name".into(), json!("Alice"));
    u1.send(&state, &request_text(Some("GRIDE1"), "grid:join", data))
        .await;
    let mut data = Data::new();
    data.insert("name".into(), json!("Bob"));
    u2.send(&state, &request_text(Some("GRIDE1"), "grid:join", data))
        .await;
    recv_broadcast(&mut u1.rx).await; // grid:joined
    recv_broadcast(&mut u1.rx).await; // grid:state
    recv_broadcast(&mut u2.rx).await;
    recv_broadcast(&mut u2.rx).await;

    // U1 takes cell 0: mark written, turn flips to o.
    let mut data = Data::new();
    data.insert("cell".into(), json!(0));
    let frames = u1
        .send(&state, &request_text(Some("GRIDE1"), "grid:move", data))
        .await;
    assert_eq!(frames[0].status, Status::Done);
    assert_eq!(
        frames[0].data.get("board").and_then(|v| v.get(0)).and_then(|v| v.as_str()),
        Some("x")
    );
    assert_eq!(frames[0].data.get("current_player").and_then(|v| v.as_str()), Some("o"));

    // Peer sees an uncorrelated copy of the same snapshot.
    let peer_copy = recv_broadcast(&mut u2.rx).await;
    assert_eq!(peer_copy.syscall, "grid:move");
    assert!(peer_copy.parent_id.is_none());
    assert_eq!(peer_copy.data.get("current_player").and_then(|v| v.as_str()), Some("o"));
    assert_no_broadcast(&mut u1.rx).await;

    // U2 tries the same cell: rejected, state unchanged, nothing broadcast.
    let mut data = Data::new();
    data.insert("cell".into(), json!(0));
    let frames = u2
        .send(&state, &request_text(Some("GRIDE1"), "grid:move", data))
        .await;
    assert_eq!(frames[0].status, Status::Error);
    assert_eq!(frames[0].data.get("code").and_then(|v| v.as_str()), Some("E_CELL_OCCUPIED"));
    assert_no_broadcast(&mut u1.rx).await;
    assert_no_broadcast(&mut u2.rx).await;
}

#[tokio::test]
async fn grid_move_cell_out_of_range_is_invalid_input() {
    let state = test_helpers::test_app_state();
    let client = TestClient::new();

    let mut data = Data::new();
    data.insert("cell".into(), json!(9));
    let frames = client
        .send(&state, &request_text(Some("GRIDE2"), "grid:move", data))
        .await;
    assert_eq!(frames[0].status, Status::Error);
    assert_eq!(frames[0].data.get("code").and_then(|v| v.as_str()), Some("E_INVALID_INPUT"));
}

#[tokio::test]
async fn grid_reset_of_unknown_room_is_done() {
    let state = test_helpers::test_app_state();
    let client = TestClient::new();

    let frames = client
        .send(&state, &request_text(Some("NOSUCH"), "grid:reset", Data::new()))
        .await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Done);
    assert!(frames[0].data.is_empty());
}

// =============================================================================
// CHESS
// =============================================================================

/// Create a room as `white` and seat `black`, draining the announce frames.
async fn seed_chess_room(state: &AppState, white: &mut TestClient, black: &mut TestClient) -> String {
    let mut data = Data::new();
    data.insert("name".into(), json!("Walter"));
    let frames = white
        .send(state, &request_text(None, "chess:create", data))
        .await;
    assert_eq!(frames[0].status, Status::Done);
    let room_id = frames[0]
        .data
        .get("room_id")
        .and_then(|v| v.as_str())
        .expect("room_id in create reply")
        .to_string();
    recv_broadcast(&mut white.rx).await; // chess:state (waiting)

    let mut data = Data::new();
    data.insert("name".into(), json!("Bella"));
    let frames = black
        .send(state, &request_text(Some(&room_id), "chess:join", data))
        .await;
    assert_eq!(frames[0].status, Status::Done);
    for rx in [&mut white.rx, &mut black.rx] {
        let started = recv_broadcast(rx).await;
        assert_eq!(started.syscall, "chess:started");
        let snapshot = recv_broadcast(rx).await;
        assert_eq!(snapshot.syscall, "chess:state");
    }
    room_id
}

#[tokio::test]
async fn chess_create_acknowledges_and_broadcasts_waiting_state() {
    let state = test_helpers::test_app_state();
    let mut client = TestClient::new();

    let mut data = Data::new();
    data.insert("name".into(), json!("Walter"));
    let frames = client
        .send(&state, &request_text(None, "chess:create", data))
        .await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Done);
    assert_eq!(frames[0].data.get("color").and_then(|v| v.as_str()), Some("white"));
    let room_id = frames[0].data.get("room_id").and_then(|v| v.as_str()).unwrap();
    assert_eq!(room_id.len(), crate::room_code::CODE_LEN);

    let snapshot = recv_broadcast(&mut client.rx).await;
    assert_eq!(snapshot.syscall, "chess:state");
    assert_eq!(snapshot.room_id.as_deref(), Some(room_id));
    assert_eq!(snapshot.data.get("waiting_for_player").and_then(|v| v.as_bool()), Some(true));
}

#[tokio::test]
async fn chess_full_flow_create_join_and_first_move() {
    let state = test_helpers::test_app_state();
    let mut white = TestClient::new();
    let mut black = TestClient::new();
    let room_id = seed_chess_room(&state, &mut white, &mut black).await;

    let mut data = Data::new();
    data.insert("from".into(), json!("e2"));
    data.insert("to".into(), json!("e4"));
    let frames = white
        .send(&state, &request_text(Some(&room_id), "chess:move", data))
        .await;

    assert_eq!(frames[0].status, Status::Done);
    assert_eq!(frames[0].data.get("san").and_then(|v| v.as_str()), Some("e4"));
    assert_eq!(frames[0].data.get("piece").and_then(|v| v.as_str()), Some("pawn"));

    for rx in [&mut white.rx, &mut black.rx] {
        let snapshot = recv_broadcast(rx).await;
        assert_eq!(snapshot.syscall, "chess:state");
        assert_eq!(snapshot.data.get("current_player").and_then(|v| v.as_str()), Some("black"));
        let last = snapshot.data.get("last_move").expect("last_move present");
        assert_eq!(last.get("from").and_then(|v| v.as_str()), Some("e2"));
        assert_eq!(last.get("to").and_then(|v| v.as_str()), Some("e4"));
    }
}

#[tokio::test]
async fn chess_illegal_move_carries_legal_targets() {
    let state = test_helpers::test_app_state();
    let mut white = TestClient::new();
    let mut black = TestClient::new();
    let room_id = seed_chess_room(&state, &mut white, &mut black).await;

    let mut data = Data::new();
    data.insert("from".into(), json!("g1"));
    data.insert("to".into(), json!("g4"));
    let frames = white
        .send(&state, &request_text(Some(&room_id), "chess:move", data))
        .await;

    assert_eq!(frames[0].status, Status::Error);
    assert_eq!(frames[0].data.get("code").and_then(|v| v.as_str()), Some("E_ILLEGAL_MOVE"));
    let targets = frames[0]
        .data
        .get("legal_targets")
        .and_then(|v| v.as_array())
        .expect("legal_targets attached");
    let targets: Vec<&str> = targets.iter().filter_map(|v| v.as_str()).collect();
    assert_eq!(targets, vec!["f3", "h3"]);
    assert_no_broadcast(&mut black.rx).await;
}

#[tokio::test]
async fn chess_moving_the_opponents_piece_is_rejected() {
    let state = test_helpers::test_app_state();
    let mut white = TestClient::new();
    let mut black = TestClient::new();
    let room_id = seed_chess_room(&state, &mut white, &mut black).await;

    // White to move; white grabs a black pawn.
    let mut data = Data::new();
    data.insert("from".into(), json!("e7"));
    data.insert("to".into(), json!("e5"));
    let frames = white
        .send(&state, &request_text(Some(&room_id), "chess:move", data))
        .await;
    assert_eq!(frames[0].data.get("code").and_then(|v| v.as_str()), Some("E_WRONG_PIECE_COLOR"));

    // Black tries to move out of turn.
    let mut data = Data::new();
    data.insert("from".into(), json!("e7"));
    data.insert("to".into(), json!("e5"));
    let frames = black
        .send(&state, &request_text(Some(&room_id), "chess:move", data))
        .await;
    assert_eq!(frames[0].data.get("code").and_then(|v| v.as_str()), Some("E_WRONG_TURN"));
}

#[tokio::test]
async fn chess_reconnect_rebroadcasts_state_to_the_room() {
    let state = test_helpers::test_app_state();
    let mut white = TestClient::new();
    let mut black = TestClient::new();
    let room_id = seed_chess_room(&state, &mut white, &mut black).await;

    // Same identity, fresh connection channel.
    let (tx_new, mut rx_new) = mpsc::channel(32);
    let mut data = Data::new();
    data.insert("name".into(), json!("Walter"));
    let frames = process_inbound_text(
        &state,
        Uuid::new_v4(),
        white.user_id,
        &tx_new,
        &request_text(Some(&room_id), "chess:join", data),
    )
    .await;

    assert_eq!(frames[0].status, Status::Done);
    assert_eq!(frames[0].data.get("color").and_then(|v| v.as_str()), Some("white"));

    // The whole room, including the fresh connection, hears the snapshot.
    let snapshot = recv_broadcast(&mut rx_new).await;
    assert_eq!(snapshot.syscall, "chess:state");
    let snapshot = recv_broadcast(&mut black.rx).await;
    assert_eq!(snapshot.syscall, "chess:state");
    assert_eq!(snapshot.data.get("game_started").and_then(|v| v.as_bool()), Some(true));
}

#[tokio::test]
async fn chess_chat_relays_sanitized_message_to_peers() {
    let state = test_helpers::test_app_state();
    let mut white = TestClient::new();
    let mut black = TestClient::new();
    let room_id = seed_chess_room(&state, &mut white, &mut black).await;

    let mut data = Data::new();
    data.insert("name".into(), json!("Walter"));
    data.insert("text".into(), json!("<i>good luck</i>"));
    let frames = white
        .send(&state, &request_text(Some(&room_id), "chess:chat", data))
        .await;

    assert_eq!(frames[0].status, Status::Done);
    assert_eq!(frames[0].data.get("message").and_then(|v| v.as_str()), Some("good luck"));

    let relayed = recv_broadcast(&mut black.rx).await;
    assert_eq!(relayed.syscall, "chess:chat");
    assert_eq!(relayed.data.get("message").and_then(|v| v.as_str()), Some("good luck"));
    assert_eq!(relayed.data.get("name").and_then(|v| v.as_str()), Some("Walter"));
    assert_no_broadcast(&mut white.rx).await;
}

#[tokio::test]
async fn chess_chat_from_non_member_is_rejected() {
    let state = test_helpers::test_app_state();
    let mut white = TestClient::new();
    let mut black = TestClient::new();
    let room_id = seed_chess_room(&state, &mut white, &mut black).await;

    let outsider = TestClient::new();
    let mut data = Data::new();
    data.insert("name".into(), json!("Eve"));
    data.insert("text".into(), json!("hi"));
    let frames = outsider
        .send(&state, &request_text(Some(&room_id), "chess:chat", data))
        .await;
    assert_eq!(frames[0].status, Status::Error);
    assert_eq!(frames[0].data.get("code").and_then(|v| v.as_str()), Some("E_NOT_IN_ROOM"));
}

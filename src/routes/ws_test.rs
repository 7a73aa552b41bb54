use super::*;
use crate::frame::Status;
use crate::services::stage::test_store::MemoryStageStore;
use crate::state::test_helpers;
use serde_json::json;
use tokio::time::{Duration, timeout};

fn test_user(can_speak: bool) -> session::SessionUser {
    session::SessionUser {
        id: Uuid::new_v4(),
        display_name: "Test User".into(),
        avatar_url: None,
        can_speak,
        auth_method: "password".into(),
    }
}

fn test_conn(user: session::SessionUser, client_tx: mpsc::Sender<Frame>) -> Conn {
    Conn {
        client_id: Uuid::new_v4(),
        user,
        client_tx,
        current_room: None,
        room_generation: Arc::new(AtomicU64::new(0)),
        inflight_ai: HashMap::new(),
    }
}

fn request_text(req: &Frame) -> String {
    serde_json::to_string(req).expect("frame should serialize")
}

fn message_of(frame: &Frame) -> &str {
    frame.data.get("message").and_then(|v| v.as_str()).unwrap_or_default()
}

async fn recv_push(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("push receive timed out")
        .expect("push channel closed unexpectedly")
}

async fn assert_no_push(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected no pushed frame"
    );
}

/// Register a peer connection on a room topic and return its receiver.
async fn subscribe_peer(state: &AppState, room_id: Uuid) -> (Uuid, mpsc::Receiver<Frame>) {
    let peer_id = Uuid::new_v4();
    let (peer_tx, peer_rx) = mpsc::channel(32);
    state.subs.subscribe(Topic::Room(room_id), peer_id, peer_tx).await;
    (peer_id, peer_rx)
}

// =============================================================================
// PARSE AND DISPATCH
// =============================================================================

#[tokio::test]
async fn invalid_json_yields_gateway_error_push() {
    let state = test_helpers::test_app_state();
    let (client_tx, _client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    let frames = process_inbound_text(&state, &mut conn, "{not json").await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].syscall, "gateway:error");
    assert_eq!(frames[0].status, Status::Item);
    assert!(message_of(&frames[0]).contains("invalid json"));
}

#[tokio::test]
async fn non_request_frames_are_ignored() {
    let state = test_helpers::test_app_state();
    let (client_tx, _client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    let done = Frame::request("room:list", Data::new()).done();
    let frames = process_inbound_text(&state, &mut conn, &request_text(&done)).await;

    assert!(frames.is_empty());
}

#[tokio::test]
async fn unknown_prefix_returns_error() {
    let state = test_helpers::test_app_state();
    let (client_tx, _client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    let req = Frame::request("bogus:thing", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].syscall, "bogus:thing");
    assert_eq!(frames[0].status, Status::Error);
    assert_eq!(frames[0].parent_id, Some(req.id));
    assert!(message_of(&frames[0]).contains("unknown prefix"));
}

#[tokio::test]
async fn request_from_is_stamped_with_authenticated_user() {
    let state = test_helpers::test_app_state();
    let (client_tx, _client_rx) = mpsc::channel(8);
    let user = test_user(true);
    let user_id = user.id;
    let mut conn = test_conn(user, client_tx);

    // Spoofed `from` on the wire must not survive dispatch.
    let mut req = Frame::request("bogus:thing", Data::new());
    req.from = Some("someone-else".into());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Error);
    assert_eq!(conn.user.id, user_id);
}

// =============================================================================
// ROOM
// =============================================================================

#[tokio::test]
async fn room_join_requires_room_id() {
    let state = test_helpers::test_app_state();
    let (client_tx, _client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    let req = Frame::request("room:join", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Error);
    assert!(message_of(&frames[0]).contains("room_id required"));
    assert!(conn.current_room.is_none());
}

#[tokio::test]
async fn room_part_requires_current_room() {
    let state = test_helpers::test_app_state();
    let (client_tx, _client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    let req = Frame::request("room:part", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Error);
    assert!(message_of(&frames[0]).contains("not in a room"));
}

#[tokio::test]
async fn room_unknown_op_returns_error() {
    let state = test_helpers::test_app_state();
    let (client_tx, _client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    let req = Frame::request("room:fly", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Error);
    assert!(message_of(&frames[0]).contains("unknown room op"));
}

#[tokio::test]
async fn room_part_releases_seat_and_notifies_peers() {
    let room_id = Uuid::new_v4();
    let store = Arc::new(MemoryStageStore::with_room(room_id));
    let state = test_helpers::test_app_state_with_stage(store);

    let (client_tx, _client_rx) = mpsc::channel(8);
    let user = test_user(true);
    let mut conn = test_conn(user.clone(), client_tx);

    // The departing connection is the user's only one in the room.
    {
        let mut rooms = state.rooms.write().await;
        let mut room = crate::state::RoomState::new();
        room.members.insert(
            conn.client_id,
            RoomMember { user_id: user.id, display_name: user.display_name.clone(), avatar_url: None },
        );
        rooms.insert(room_id, room);
    }
    conn.current_room = Some(room_id);

    stage::request_seat(state.stage.as_ref(), room_id, user.id, &user.display_name, None, true)
        .await
        .expect("seat should be granted");

    let (_peer_id, mut peer_rx) = subscribe_peer(&state, room_id).await;

    let req = Frame::request("room:part", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Done);
    assert!(conn.current_room.is_none());

    let first = recv_push(&mut peer_rx).await;
    let second = recv_push(&mut peer_rx).await;
    let mut syscalls = vec![first.syscall.clone(), second.syscall.clone()];
    syscalls.sort();
    assert_eq!(syscalls, vec!["roster:update", "stage:update"]);

    let doc = stage::snapshot(state.stage.as_ref(), room_id)
        .await
        .expect("snapshot should load");
    assert!(doc.seats.iter().all(Option::is_none));
}

#[tokio::test]
async fn room_part_keeps_seat_while_another_connection_remains() {
    let room_id = Uuid::new_v4();
    let store = Arc::new(MemoryStageStore::with_room(room_id));
    let state = test_helpers::test_app_state_with_stage(store);

    let (client_tx, _client_rx) = mpsc::channel(8);
    let user = test_user(true);
    let mut conn = test_conn(user.clone(), client_tx);

    // Same user in the room twice: this connection plus another tab.
    {
        let mut rooms = state.rooms.write().await;
        let mut room = crate::state::RoomState::new();
        let member =
            RoomMember { user_id: user.id, display_name: user.display_name.clone(), avatar_url: None };
        room.members.insert(conn.client_id, member.clone());
        room.members.insert(Uuid::new_v4(), member);
        rooms.insert(room_id, room);
    }
    conn.current_room = Some(room_id);

    stage::request_seat(state.stage.as_ref(), room_id, user.id, &user.display_name, None, true)
        .await
        .expect("seat should be granted");

    let (_peer_id, mut peer_rx) = subscribe_peer(&state, room_id).await;

    let req = Frame::request("room:part", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;
    assert_eq!(frames[0].status, Status::Done);

    // Roster update only; the seat survives the other tab.
    let push = recv_push(&mut peer_rx).await;
    assert_eq!(push.syscall, "roster:update");
    assert_no_push(&mut peer_rx).await;

    let doc = stage::snapshot(state.stage.as_ref(), room_id)
        .await
        .expect("snapshot should load");
    assert!(doc.seats[0].as_ref().is_some_and(|o| o.user_id == user.id));
}

// =============================================================================
// CHAT
// =============================================================================

#[tokio::test]
async fn chat_send_requires_joined_room() {
    let state = test_helpers::test_app_state();
    let (client_tx, mut client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    let mut data = Data::new();
    data.insert("body".into(), json!("hello"));
    let req = Frame::request("chat:send", data);
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Error);
    assert!(message_of(&frames[0]).contains("must join a room first"));
    assert_no_push(&mut client_rx).await;
}

#[tokio::test]
async fn chat_send_requires_body() {
    let state = test_helpers::test_app_state();
    let (client_tx, _client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);
    conn.current_room = Some(Uuid::new_v4());

    let req = Frame::request("chat:send", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Error);
    assert!(message_of(&frames[0]).contains("body required"));
}

#[tokio::test]
async fn chat_history_requires_room_or_partner() {
    let state = test_helpers::test_app_state();
    let (client_tx, _client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    let req = Frame::request("chat:history", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Error);
    assert!(message_of(&frames[0]).contains("join a room or pass 'with'"));
}

#[tokio::test]
async fn chat_dm_requires_recipient() {
    let state = test_helpers::test_app_state();
    let (client_tx, _client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    let mut data = Data::new();
    data.insert("body".into(), json!("psst"));
    let req = Frame::request("chat:dm", data);
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Error);
    assert!(message_of(&frames[0]).contains("'to' required"));
}

#[test]
fn conversation_for_prefers_explicit_dm_partner() {
    let me = Uuid::new_v4();
    let them = Uuid::new_v4();
    let room_id = Uuid::new_v4();

    let mut data = Data::new();
    data.insert("with".into(), json!(them.to_string()));
    let req = Frame::request("chat:history", data);

    let conversation = conversation_for(&req, me, Some(room_id)).expect("dm conversation");
    assert_eq!(conversation, chat::dm_conversation_id(me, them));

    let req = Frame::request("chat:history", Data::new());
    let conversation = conversation_for(&req, me, Some(room_id)).expect("room conversation");
    assert_eq!(conversation, chat::room_conversation_id(room_id));

    let err = conversation_for(&req, me, None).expect_err("no context should fail");
    assert_eq!(err.status, Status::Error);
}

// =============================================================================
// STAGE
// =============================================================================

#[tokio::test]
async fn stage_requires_joined_room() {
    let state = test_helpers::test_app_state();
    let (client_tx, _client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    let req = Frame::request("stage:request_seat", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Error);
    assert!(message_of(&frames[0]).contains("must join a room first"));
}

#[tokio::test]
async fn stage_request_seat_replies_and_pushes_update() {
    let room_id = Uuid::new_v4();
    let store = Arc::new(MemoryStageStore::with_room(room_id));
    let state = test_helpers::test_app_state_with_stage(store);

    let (client_tx, mut client_rx) = mpsc::channel(8);
    let user = test_user(true);
    let user_id = user.id;
    let mut conn = test_conn(user, client_tx);
    conn.current_room = Some(room_id);

    let (_peer_id, mut peer_rx) = subscribe_peer(&state, room_id).await;

    let req = Frame::request("stage:request_seat", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Done);
    assert_eq!(frames[0].parent_id, Some(req.id));
    assert_eq!(frames[0].data.get("seat").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(frames[0].data.get("version").and_then(|v| v.as_i64()), Some(1));

    let push = recv_push(&mut peer_rx).await;
    assert_eq!(push.syscall, "stage:update");
    assert_eq!(push.status, Status::Item);
    assert_eq!(push.room_id, Some(room_id));
    assert!(push.parent_id.is_none());
    let seats = push.data.get("seats").and_then(|v| v.as_array()).expect("seats array");
    assert_eq!(seats[0]["user_id"], json!(user_id.to_string()));
    assert!(seats[1].is_null());

    // The sender's own subscription channel gets nothing; the reply covers it.
    assert_no_push(&mut client_rx).await;
}

#[tokio::test]
async fn stage_full_surfaces_error_code() {
    let room_id = Uuid::new_v4();
    let store = Arc::new(MemoryStageStore::with_room(room_id));
    let state = test_helpers::test_app_state_with_stage(store);

    for n in 0..4 {
        stage::request_seat(state.stage.as_ref(), room_id, Uuid::new_v4(), &format!("speaker-{n}"), None, true)
            .await
            .expect("seat should be granted");
    }

    let (client_tx, _client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);
    conn.current_room = Some(room_id);

    let req = Frame::request("stage:request_seat", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Error);
    assert_eq!(frames[0].data.get("code").and_then(|v| v.as_str()), Some("E_STAGE_FULL"));
}

#[tokio::test]
async fn stage_listener_cannot_take_seat() {
    let room_id = Uuid::new_v4();
    let store = Arc::new(MemoryStageStore::with_room(room_id));
    let state = test_helpers::test_app_state_with_stage(store);

    let (client_tx, _client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(false), client_tx);
    conn.current_room = Some(room_id);

    let req = Frame::request("stage:request_seat", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Error);
    assert_eq!(frames[0].data.get("code").and_then(|v| v.as_str()), Some("E_STAGE_NOT_ALLOWED"));
}

#[tokio::test]
async fn stage_toggle_mute_round_trips_through_dispatch() {
    let room_id = Uuid::new_v4();
    let store = Arc::new(MemoryStageStore::with_room(room_id));
    let state = test_helpers::test_app_state_with_stage(store);

    let (client_tx, _client_rx) = mpsc::channel(8);
    let user = test_user(true);
    let mut conn = test_conn(user, client_tx);
    conn.current_room = Some(room_id);

    let seat_req = Frame::request("stage:request_seat", Data::new());
    process_inbound_text(&state, &mut conn, &request_text(&seat_req)).await;

    let mute_req = Frame::request("stage:toggle_mute", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&mute_req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Done);
    let seats = frames[0].data.get("seats").and_then(|v| v.as_array()).expect("seats array");
    assert_eq!(seats[0]["muted"], json!(true));
    assert_eq!(frames[0].data.get("version").and_then(|v| v.as_i64()), Some(2));
}

// =============================================================================
// FRIENDS
// =============================================================================

#[tokio::test]
async fn friend_request_requires_target() {
    let state = test_helpers::test_app_state();
    let (client_tx, _client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    let req = Frame::request("friend:request", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Error);
    assert!(message_of(&frames[0]).contains("'to' required"));
}

#[tokio::test]
async fn friend_unknown_op_returns_error() {
    let state = test_helpers::test_app_state();
    let (client_tx, _client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    let req = Frame::request("friend:poke", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Error);
    assert!(message_of(&frames[0]).contains("unknown friend op"));
}

// =============================================================================
// AI
// =============================================================================

/// An LLM that never answers, for exercising in-flight request handling.
struct StalledLlm;

#[async_trait::async_trait]
impl crate::llm::LlmChat for StalledLlm {
    async fn chat(
        &self,
        _max_tokens: u32,
        _system: &str,
        _messages: &[crate::llm::types::Message],
    ) -> Result<crate::llm::types::ChatResponse, crate::llm::types::LlmError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn ai_unknown_op_errors_inline() {
    let state = test_helpers::test_app_state();
    let (client_tx, _client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    let req = Frame::request("ai:paint", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Error);
    assert!(message_of(&frames[0]).contains("unknown ai op"));
}

#[tokio::test]
async fn ai_result_arrives_on_connection_channel() {
    let state = test_helpers::test_app_state();
    let (client_tx, mut client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    // No room and no partner: the spawned op fails fast, and the error
    // still travels back through the connection channel.
    let req = Frame::request("ai:suggest", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;

    assert!(frames.is_empty());

    let result = recv_push(&mut client_rx).await;
    assert_eq!(result.syscall, "ai:suggest");
    assert_eq!(result.status, Status::Error);
    assert_eq!(result.parent_id, Some(req.id));
    assert!(message_of(&result).contains("join a room or pass 'with'"));
}

#[tokio::test]
async fn ai_result_for_superseded_room_context_is_discarded() {
    let state = test_helpers::test_app_state();
    let (client_tx, mut client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    let req = Frame::request("ai:suggest", Data::new());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;
    assert!(frames.is_empty());

    // Room context changes before the spawned task delivers.
    conn.room_generation.fetch_add(1, Ordering::SeqCst);

    assert_no_push(&mut client_rx).await;
}

#[tokio::test]
async fn cancel_aborts_inflight_ai_work() {
    let state = test_helpers::test_app_state_with_llm(Arc::new(StalledLlm));
    let (client_tx, mut client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    let mut data = Data::new();
    data.insert("instruction".into(), json!("write a limerick"));
    let req = Frame::request("ai:creative", data);
    let frames = process_inbound_text(&state, &mut conn, &request_text(&req)).await;
    assert!(frames.is_empty());

    let handle = conn.inflight_ai.get(&req.id).expect("tracked while in flight").clone();

    let mut cancel = Frame::request(req.syscall.clone(), Data::new());
    cancel.status = Status::Cancel;
    cancel.parent_id = Some(req.id);
    let frames = process_inbound_text(&state, &mut conn, &request_text(&cancel)).await;
    assert!(frames.is_empty());
    assert!(!conn.inflight_ai.contains_key(&req.id));

    timeout(Duration::from_millis(500), async {
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("cancelled task should wind down");

    // No result frame ever reaches the connection.
    assert_no_push(&mut client_rx).await;
}

#[tokio::test]
async fn cancel_for_unknown_request_is_a_noop() {
    let state = test_helpers::test_app_state();
    let (client_tx, mut client_rx) = mpsc::channel(8);
    let mut conn = test_conn(test_user(true), client_tx);

    let mut cancel = Frame::request("ai:creative", Data::new());
    cancel.status = Status::Cancel;
    cancel.parent_id = Some(Uuid::new_v4());
    let frames = process_inbound_text(&state, &mut conn, &request_text(&cancel)).await;

    assert!(frames.is_empty());
    assert_no_push(&mut client_rx).await;
}

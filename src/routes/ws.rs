//! WebSocket handler — bidirectional frame relay.
//!
//! DESIGN
//! ======
//! On upgrade, generates a client ID and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Pushed frames from subscribed topics → forward to client
//!
//! Handler functions are pure business logic — they validate, call services,
//! and return an `Outcome`. The dispatch layer owns all outbound concerns:
//! reply to sender and push to room subscribers.
//!
//! AI operations run on spawned tasks so a slow completion never stalls the
//! relay loop. Each connection carries a room-context generation counter,
//! bumped on every join/part; a spawned result whose generation no longer
//! matches is discarded instead of being delivered into the wrong context,
//! and a result arriving after disconnect is dropped with the channel. A
//! cancel frame naming the request aborts the spawned task outright.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → consume ticket → send `session:connected`
//! 2. Subscribe the personal topic, mark the user online
//! 3. Client sends frames → dispatch → handler returns Outcome
//! 4. Close → leave room (seat + roster), drop subscriptions, mark offline

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::{Data, FRAME_CODE, FRAME_MESSAGE, Frame, Status};
use crate::services::subscription::Topic;
use crate::services::{ai, chat, friend, presence, room, session, stage};
use crate::state::{AppState, RoomMember};

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what — handlers never send frames directly.
enum Outcome {
    /// Send done+data to sender only.
    Reply(Data),
    /// Send empty done to sender only.
    Done,
    /// Reply to sender with one payload and push an item frame to the room
    /// topic, skipping the sender's own connection.
    ReplyAndRoomPush { reply: Data, push: Frame },
    /// Result will arrive later through the connection channel.
    Spawned,
}

// =============================================================================
// CONNECTION STATE
// =============================================================================

/// Per-connection context threaded through the dispatch layer.
struct Conn {
    client_id: Uuid,
    user: session::SessionUser,
    client_tx: mpsc::Sender<Frame>,
    /// The one room this connection has joined, if any.
    current_room: Option<Uuid>,
    /// Bumped on every join/part; spawned work checks it before delivering.
    room_generation: Arc<AtomicU64>,
    /// Abort handles for spawned ai tasks, keyed by the request frame id.
    inflight_ai: HashMap<Uuid, tokio::task::AbortHandle>,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(ticket) = params.get("ticket") else {
        return (StatusCode::UNAUTHORIZED, "ticket required").into_response();
    };

    let user_id = match session::consume_ws_ticket(&state.pool, ticket).await {
        Ok(Some(uid)) => uid,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "invalid or expired ticket").into_response(),
        Err(e) => {
            tracing::error!(error = %e, "ws ticket validation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "ticket validation error").into_response();
        }
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, user_id))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, user_id: Uuid) {
    let user = match session::user_by_id(&state.pool, user_id).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            warn!(%user_id, "ws: user row vanished after ticket consume");
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "ws: user load failed");
            return;
        }
    };

    let client_id = Uuid::new_v4();

    // Per-connection channel for frames pushed from subscribed topics.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(256);

    let welcome = Frame::push("session:connected", Data::new())
        .with_data("client_id", client_id.to_string())
        .with_data("user_id", user.id.to_string())
        .with_data("display_name", user.display_name.clone())
        .with_data("can_speak", user.can_speak);
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    state
        .subs
        .subscribe(Topic::User(user.id), client_id, client_tx.clone())
        .await;
    if presence::mark_online(&state, user.id).await {
        presence::broadcast_presence(&state, user.id, true).await;
    }

    info!(%client_id, %user_id, "ws: client connected");

    let mut conn = Conn {
        client_id,
        user,
        client_tx,
        current_room: None,
        room_generation: Arc::new(AtomicU64::new(0)),
        inflight_ai: HashMap::new(),
    };

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        dispatch_frame(&state, &mut socket, &mut conn, &text).await;
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

    // Teardown order: leave the room first (roster and seat release reach
    // peers while the room state still exists), then drop every
    // subscription, then the presence transition.
    if let Some(room_id) = conn.current_room.take() {
        depart_room(&state, room_id, conn.client_id, conn.user.id).await;
    }
    for handle in conn.inflight_ai.values() {
        handle.abort();
    }
    state.subs.drop_connection(conn.client_id).await;
    if presence::mark_offline(&state, conn.user.id).await {
        presence::broadcast_presence(&state, conn.user.id, false).await;
    }
    info!(%client_id, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse an incoming JSON frame, dispatch to handler, apply outcome.
async fn dispatch_frame(state: &AppState, socket: &mut WebSocket, conn: &mut Conn, text: &str) {
    let sender_frames = process_inbound_text(state, conn, text).await;
    for frame in sender_frames {
        let _ = send_frame(socket, &frame).await;
    }
}

/// Parse and process one inbound text frame and return frames for the sender.
///
/// This keeps the websocket transport concerns separate from frame handling,
/// so tests can exercise dispatch, pushes, and cleanup end-to-end.
async fn process_inbound_text(state: &AppState, conn: &mut Conn, text: &str) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(client_id = %conn.client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::push("gateway:error", Data::new()).with_data(FRAME_MESSAGE, format!("invalid json: {e}"));
            return vec![err];
        }
    };

    if req.status == Status::Cancel {
        cancel_ai(conn, &req);
        return vec![];
    }
    if req.status != Status::Request {
        debug!(client_id = %conn.client_id, status = ?req.status, "ws: non-request frame ignored");
        return vec![];
    }

    // Stamp the authenticated user id as `from`.
    req.from = Some(conn.user.id.to_string());

    info!(client_id = %conn.client_id, id = %req.id, syscall = %req.syscall, "ws: recv frame");

    let result = match req.prefix() {
        "room" => handle_room(state, conn, &req).await,
        "chat" => handle_chat(state, conn, &req).await,
        "stage" => handle_stage(state, conn, &req).await,
        "friend" => handle_friend(state, conn, &req).await,
        "ai" => handle_ai(state, conn, &req),
        prefix => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    // Apply outcome — the dispatch layer owns all outbound logic.
    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::ReplyAndRoomPush { reply, push }) => {
            if let Some(room_id) = push.room_id {
                state
                    .subs
                    .publish_excluding(Topic::Room(room_id), &push, Some(conn.client_id))
                    .await;
            }
            vec![req.done_with(reply)]
        }
        Ok(Outcome::Spawned) => vec![],
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// ROOM HANDLERS
// =============================================================================

async fn handle_room(state: &AppState, conn: &mut Conn, req: &Frame) -> Result<Outcome, Frame> {
    let op = req.syscall.split_once(':').map_or("", |(_, op)| op);

    match op {
        "create" => {
            let Some(name) = data_str(req, "name") else {
                return Err(req.error("name required"));
            };
            match room::create_room(state, name, conn.user.id).await {
                Ok(summary) => {
                    let mut data = Data::new();
                    data.insert("id".into(), serde_json::json!(summary.id));
                    data.insert("name".into(), serde_json::json!(summary.name));
                    Ok(Outcome::Reply(data))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "list" => match room::list_rooms(state).await {
            Ok(rooms) => {
                let mut data = Data::new();
                data.insert("rooms".into(), serde_json::to_value(&rooms).unwrap_or_default());
                Ok(Outcome::Reply(data))
            }
            Err(e) => Err(req.error_from(&e)),
        },
        "join" => {
            let Some(room_id) = req.room_id.or_else(|| data_uuid(req, "room_id")) else {
                return Err(req.error("room_id required"));
            };

            // One room context per connection: joining a second room parts
            // the first.
            if let Some(old_room) = conn.current_room {
                if old_room != room_id {
                    conn.current_room = None;
                    depart_room(state, old_room, conn.client_id, conn.user.id).await;
                }
            }
            conn.room_generation.fetch_add(1, Ordering::SeqCst);

            let member = RoomMember {
                user_id: conn.user.id,
                display_name: conn.user.display_name.clone(),
                avatar_url: conn.user.avatar_url.clone(),
            };

            // Subscribe before the snapshot read so no delta falls in the gap.
            state
                .subs
                .subscribe(Topic::Room(room_id), conn.client_id, conn.client_tx.clone())
                .await;

            match room::join_room(state, room_id, conn.client_id, member).await {
                Ok(snap) => {
                    conn.current_room = Some(room_id);

                    let mut reply = Data::new();
                    reply.insert("room_id".into(), serde_json::json!(snap.room_id));
                    reply.insert("name".into(), serde_json::json!(snap.name));
                    reply.insert("messages".into(), serde_json::to_value(&snap.messages).unwrap_or_default());
                    reply.insert("roster".into(), serde_json::to_value(&snap.roster).unwrap_or_default());
                    reply.insert("stage".into(), serde_json::to_value(&snap.stage).unwrap_or_default());
                    Ok(Outcome::Reply(reply))
                }
                Err(e) => {
                    state.subs.unsubscribe(Topic::Room(room_id), conn.client_id).await;
                    Err(req.error_from(&e))
                }
            }
        }
        "part" => {
            let Some(room_id) = conn.current_room.take() else {
                return Err(req.error("not in a room"));
            };
            conn.room_generation.fetch_add(1, Ordering::SeqCst);
            depart_room(state, room_id, conn.client_id, conn.user.id).await;
            Ok(Outcome::Done)
        }
        _ => Err(req.error(format!("unknown room op: {op}"))),
    }
}

/// Remove one connection from a room: release the room subscription, drop the
/// member, and free the user's seat once none of their connections remain.
async fn depart_room(state: &AppState, room_id: Uuid, client_id: Uuid, user_id: Uuid) {
    state.subs.unsubscribe(Topic::Room(room_id), client_id).await;
    room::part_room(state, room_id, client_id).await;

    if user_still_in_room(state, room_id, user_id).await {
        return;
    }
    match stage::leave_seat_if_present(state.stage.as_ref(), room_id, user_id).await {
        Ok(Some(change)) => {
            let push = Frame::push("stage:update", stage_data(&change.doc)).with_room_id(room_id);
            state.subs.publish(Topic::Room(room_id), &push).await;
        }
        Ok(None) => {}
        Err(e) => warn!(%room_id, %user_id, error = %e, "ws: seat release on part failed"),
    }
}

async fn user_still_in_room(state: &AppState, room_id: Uuid, user_id: Uuid) -> bool {
    let rooms = state.rooms.read().await;
    rooms
        .get(&room_id)
        .is_some_and(|room| room.members.values().any(|m| m.user_id == user_id))
}

// =============================================================================
// CHAT HANDLERS
// =============================================================================

async fn handle_chat(state: &AppState, conn: &Conn, req: &Frame) -> Result<Outcome, Frame> {
    let op = req.syscall.split_once(':').map_or("", |(_, op)| op);

    match op {
        "send" => {
            let Some(room_id) = conn.current_room else {
                return Err(req.error("must join a room first"));
            };
            let Some(body) = data_str(req, "body") else {
                return Err(req.error("body required"));
            };
            match chat::send_room_message(&state.pool, room_id, conn.user.id, &conn.user.display_name, body).await {
                Ok(message) => {
                    let data = chat::message_data(&message);
                    let push = Frame::push("chat:message", data.clone()).with_room_id(room_id);
                    Ok(Outcome::ReplyAndRoomPush { reply: data, push })
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "dm" => {
            let Some(to) = data_uuid(req, "to") else {
                return Err(req.error("'to' required"));
            };
            let Some(body) = data_str(req, "body") else {
                return Err(req.error("body required"));
            };
            match chat::send_dm(state, conn.user.id, &conn.user.display_name, to, body, Some(conn.client_id)).await {
                Ok(message) => Ok(Outcome::Reply(chat::message_data(&message))),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "history" => {
            let conversation = conversation_for(req, conn.user.id, conn.current_room)?;
            match chat::recent_messages(&state.pool, &conversation).await {
                Ok(messages) => {
                    let mut data = Data::new();
                    data.insert("conversation_id".into(), serde_json::json!(conversation));
                    data.insert("messages".into(), serde_json::to_value(&messages).unwrap_or_default());
                    Ok(Outcome::Reply(data))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "mark_read" => {
            let Some(with) = data_uuid(req, "with") else {
                return Err(req.error("'with' required"));
            };
            let conversation = chat::dm_conversation_id(conn.user.id, with);
            match chat::mark_read(&state.pool, &conversation, conn.user.id).await {
                Ok(updated) => {
                    let mut data = Data::new();
                    data.insert("updated".into(), serde_json::json!(updated));
                    Ok(Outcome::Reply(data))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "unread" => {
            let Some(with) = data_uuid(req, "with") else {
                return Err(req.error("'with' required"));
            };
            let conversation = chat::dm_conversation_id(conn.user.id, with);
            match chat::unread_count(&state.pool, &conversation, conn.user.id).await {
                Ok(count) => {
                    let mut data = Data::new();
                    data.insert("count".into(), serde_json::json!(count));
                    Ok(Outcome::Reply(data))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        _ => Err(req.error(format!("unknown chat op: {op}"))),
    }
}

/// Resolve the conversation a request targets: an explicit DM partner via
/// `with`, else the joined room.
fn conversation_for(req: &Frame, user_id: Uuid, room: Option<Uuid>) -> Result<String, Frame> {
    if let Some(with) = data_uuid(req, "with") {
        return Ok(chat::dm_conversation_id(user_id, with));
    }
    if let Some(room_id) = room {
        return Ok(chat::room_conversation_id(room_id));
    }
    Err(req.error("join a room or pass 'with' to pick a conversation"))
}

// =============================================================================
// STAGE HANDLERS
// =============================================================================

async fn handle_stage(state: &AppState, conn: &Conn, req: &Frame) -> Result<Outcome, Frame> {
    let Some(room_id) = conn.current_room else {
        return Err(req.error("must join a room first"));
    };

    let op = req.syscall.split_once(':').map_or("", |(_, op)| op);
    let user = &conn.user;

    let result = match op {
        "request_seat" => {
            stage::request_seat(
                state.stage.as_ref(),
                room_id,
                user.id,
                &user.display_name,
                user.avatar_url.as_deref(),
                user.can_speak,
            )
            .await
        }
        "leave_seat" => stage::leave_seat(state.stage.as_ref(), room_id, user.id).await,
        "toggle_mute" => stage::toggle_mute(state.stage.as_ref(), room_id, user.id).await,
        _ => return Err(req.error(format!("unknown stage op: {op}"))),
    };

    match result {
        Ok(change) => {
            let mut reply = stage_data(&change.doc);
            reply.insert("seat".into(), serde_json::json!(change.seat));
            let push = Frame::push("stage:update", stage_data(&change.doc)).with_room_id(room_id);
            Ok(Outcome::ReplyAndRoomPush { reply, push })
        }
        Err(e) => Err(req.error_from(&e)),
    }
}

/// Full seat list + version, the idempotent redraw payload.
fn stage_data(doc: &stage::StageDoc) -> Data {
    let mut data = Data::new();
    data.insert("seats".into(), serde_json::to_value(&doc.seats).unwrap_or_default());
    data.insert("version".into(), serde_json::json!(doc.version));
    data
}

// =============================================================================
// FRIEND HANDLERS
// =============================================================================

async fn handle_friend(state: &AppState, conn: &Conn, req: &Frame) -> Result<Outcome, Frame> {
    let op = req.syscall.split_once(':').map_or("", |(_, op)| op);
    let user_id = conn.user.id;

    match op {
        "request" => {
            let Some(to) = data_uuid(req, "to") else {
                return Err(req.error("'to' required"));
            };
            match friend::send_request(state, user_id, to).await {
                Ok(request) => {
                    let mut data = Data::new();
                    data.insert("request_id".into(), serde_json::json!(request.id));
                    data.insert("to_user".into(), serde_json::json!(request.to_user));
                    Ok(Outcome::Reply(data))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "accept" => {
            let Some(request_id) = data_uuid(req, "request_id") else {
                return Err(req.error("request_id required"));
            };
            match friend::accept_request(state, request_id, user_id).await {
                Ok(()) => Ok(Outcome::Done),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "reject" => {
            let Some(request_id) = data_uuid(req, "request_id") else {
                return Err(req.error("request_id required"));
            };
            match friend::reject_request(state, request_id, user_id).await {
                Ok(()) => Ok(Outcome::Done),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "remove" => {
            let Some(other) = data_uuid(req, "user_id") else {
                return Err(req.error("user_id required"));
            };
            match friend::remove_friend(state, user_id, other).await {
                Ok(()) => Ok(Outcome::Done),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "block" => {
            let Some(other) = data_uuid(req, "user_id") else {
                return Err(req.error("user_id required"));
            };
            match friend::block_user(state, user_id, other).await {
                Ok(()) => Ok(Outcome::Done),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "unblock" => {
            let Some(other) = data_uuid(req, "user_id") else {
                return Err(req.error("user_id required"));
            };
            match friend::unblock_user(&state.pool, user_id, other).await {
                Ok(()) => Ok(Outcome::Done),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "list" => match friend::list_friends(state, user_id).await {
            Ok(friends) => {
                let mut data = Data::new();
                data.insert("friends".into(), serde_json::to_value(&friends).unwrap_or_default());
                Ok(Outcome::Reply(data))
            }
            Err(e) => Err(req.error_from(&e)),
        },
        "requests" => match friend::pending_requests(&state.pool, user_id).await {
            Ok(requests) => {
                let mut data = Data::new();
                data.insert("requests".into(), serde_json::to_value(&requests).unwrap_or_default());
                Ok(Outcome::Reply(data))
            }
            Err(e) => Err(req.error_from(&e)),
        },
        "search" => {
            let Some(query) = data_str(req, "query") else {
                return Err(req.error("query required"));
            };
            match friend::search_users(&state.pool, user_id, query).await {
                Ok(users) => {
                    let mut data = Data::new();
                    data.insert("users".into(), serde_json::to_value(&users).unwrap_or_default());
                    Ok(Outcome::Reply(data))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        _ => Err(req.error(format!("unknown friend op: {op}"))),
    }
}

// =============================================================================
// AI HANDLERS (spawned; results flow back through the connection channel)
// =============================================================================

fn handle_ai(state: &AppState, conn: &mut Conn, req: &Frame) -> Result<Outcome, Frame> {
    let op = req.syscall.split_once(':').map_or("", |(_, op)| op);
    if !matches!(op, "suggest" | "creative" | "summarize" | "translate") {
        return Err(req.error(format!("unknown ai op: {op}")));
    }

    let state = state.clone();
    let req = req.clone();
    let req_id = req.id;
    let user = conn.user.clone();
    let client_tx = conn.client_tx.clone();
    let room = conn.current_room;
    let client_id = conn.client_id;
    let generation = Arc::clone(&conn.room_generation);
    let started_generation = generation.load(Ordering::SeqCst);

    let handle = tokio::spawn(async move {
        let frame = match run_ai_op(&state, room, &user, &req).await {
            Ok(data) => req.done_with(data),
            Err(err_frame) => err_frame,
        };
        if generation.load(Ordering::SeqCst) != started_generation {
            debug!(%client_id, syscall = %req.syscall, "ws: ai result for a superseded room context discarded");
            return;
        }
        if client_tx.send(frame).await.is_err() {
            debug!(%client_id, "ws: ai result after disconnect dropped");
        }
    });

    conn.inflight_ai.retain(|_, h| !h.is_finished());
    conn.inflight_ai.insert(req_id, handle.abort_handle());

    Ok(Outcome::Spawned)
}

/// Abort the spawned ai task a cancel frame targets. The frame names its
/// target via `parent_id` (or reuses the request's own id); an unknown or
/// already-finished id is a no-op.
fn cancel_ai(conn: &mut Conn, req: &Frame) {
    let target = req.parent_id.unwrap_or(req.id);
    if let Some(handle) = conn.inflight_ai.remove(&target) {
        handle.abort();
        info!(client_id = %conn.client_id, id = %target, "ws: ai request cancelled");
    }
}

async fn run_ai_op(
    state: &AppState,
    room: Option<Uuid>,
    user: &session::SessionUser,
    req: &Frame,
) -> Result<Data, Frame> {
    let op = req.syscall.split_once(':').map_or("", |(_, op)| op);

    match op {
        "suggest" => {
            let history = ai_history(state, room, user.id, req).await?;
            match ai::suggest_replies(state, user.id, &history).await {
                Ok(suggestions) => {
                    let mut data = Data::new();
                    data.insert("suggestions".into(), serde_json::json!(suggestions));
                    Ok(data)
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "summarize" => {
            let history = ai_history(state, room, user.id, req).await?;
            match ai::summarize(state, user.id, &history).await {
                Ok(summary) => {
                    let mut data = Data::new();
                    data.insert("summary".into(), serde_json::json!(summary));
                    Ok(data)
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "creative" => {
            let instruction = data_str(req, "instruction").unwrap_or("");
            match ai::creative(state, user.id, instruction).await {
                Ok(text) => {
                    let mut data = Data::new();
                    data.insert("text".into(), serde_json::json!(text));
                    Ok(data)
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "translate" => {
            let text = data_str(req, "text").unwrap_or("");
            let language = data_str(req, "language").unwrap_or("");
            match ai::translate(state, user.id, text, language).await {
                Ok(translated) => {
                    let mut data = Data::new();
                    data.insert("text".into(), serde_json::json!(translated));
                    Ok(data)
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        _ => Err(req.error(format!("unknown ai op: {op}"))),
    }
}

/// The conversation transcript an AI op works from: an explicit DM via
/// `with`, else the joined room.
async fn ai_history(
    state: &AppState,
    room: Option<Uuid>,
    user_id: Uuid,
    req: &Frame,
) -> Result<Vec<chat::ChatMessage>, Frame> {
    let conversation = conversation_for(req, user_id, room)?;
    chat::recent_messages(&state.pool, &conversation)
        .await
        .map_err(|e| req.error_from(&e))
}

// =============================================================================
// HELPERS
// =============================================================================

fn data_str<'a>(req: &'a Frame, key: &str) -> Option<&'a str> {
    req.data.get(key).and_then(|v| v.as_str())
}

fn data_uuid(req: &Frame, key: &str) -> Option<Uuid> {
    data_str(req, key).and_then(|s| s.parse().ok())
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
        let code = frame.data.get(FRAME_CODE).and_then(|v| v.as_str()).unwrap_or("-");
        let message = frame.data.get(FRAME_MESSAGE).and_then(|v| v.as_str()).unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;

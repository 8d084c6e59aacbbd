use super::*;
use crate::features::testkit::live;

fn key() -> RoomKey {
    RoomKey::new("project", "p-1")
}

fn push(kind: &str, user: &str, payload: Value) -> Message {
    Message::new(kind, payload).with_user_id(user)
}

// =============================================================================
// STATE FOLDING
// =============================================================================

#[test]
fn joined_and_left_track_participants() {
    let mut state = RoomState::default();
    assert!(state.apply(&key(), &push(USER_JOINED, "ann", json!({ "name": "Ann" }))));
    assert!(state.apply(&key(), &push(USER_JOINED, "bob", json!({}))));
    assert_eq!(state.participants.keys().collect::<Vec<_>>(), vec!["ann", "bob"]);
    assert_eq!(state.participants["ann"]["name"], "Ann");

    assert!(state.apply(&key(), &push(USER_LEFT, "ann", json!({}))));
    assert_eq!(state.participants.keys().collect::<Vec<_>>(), vec!["bob"]);
    assert!(!state.apply(&key(), &push(USER_LEFT, "ann", json!({}))), "already gone");
}

#[test]
fn leaving_user_loses_cursor() {
    let mut state = RoomState::default();
    state.apply(&key(), &push(USER_JOINED, "ann", json!({})));
    state.apply(&key(), &push(CURSOR_MOVE, "ann", json!({ "x": 10.5, "y": 4 })));
    assert_eq!(state.cursors["ann"], CursorPosition { x: 10.5, y: 4.0 });

    state.apply(&key(), &push(USER_LEFT, "ann", json!({})));
    assert!(state.cursors.is_empty());
}

#[test]
fn pushes_for_other_rooms_are_ignored() {
    let mut state = RoomState::default();
    let other_id = json!({ "resourceType": "project", "resourceId": "p-2" });
    let other_type = json!({ "resourceType": "doc", "resourceId": "p-1" });
    assert!(!state.apply(&key(), &push(USER_JOINED, "ann", other_id)));
    assert!(!state.apply(&key(), &push(USER_JOINED, "ann", other_type)));

    let ours = json!({ "resourceType": "project", "resourceId": "p-1" });
    assert!(state.apply(&key(), &push(USER_JOINED, "ann", ours)));
    assert_eq!(state.participants.len(), 1);
}

#[test]
fn user_id_falls_back_to_payload() {
    let mut state = RoomState::default();
    assert!(state.apply(&key(), &Message::new(USER_JOINED, json!({ "userId": "cat" }))));
    assert!(state.participants.contains_key("cat"));
    assert!(!state.apply(&key(), &Message::new(USER_JOINED, json!({}))), "no user id");
}

#[test]
fn malformed_cursor_is_ignored() {
    let mut state = RoomState::default();
    assert!(!state.apply(&key(), &push(CURSOR_MOVE, "ann", json!({ "x": "left", "y": 1 }))));
    assert!(!state.apply(&key(), &push(CURSOR_MOVE, "ann", json!({ "x": 1 }))));
    assert!(state.cursors.is_empty());
}

#[test]
fn room_key_uses_camel_case_fields() {
    let value = serde_json::to_value(key()).expect("serialize");
    assert_eq!(value, json!({ "resourceType": "project", "resourceId": "p-1" }));
    assert_eq!(key().payload(), value);
}

// =============================================================================
// SESSION
// =============================================================================

#[tokio::test(start_paused = true)]
async fn join_announces_room_and_tracks_pushes() {
    let mut live = live().await;
    let room = RoomSession::join(&live.session, key()).expect("join");

    let join = live.sent().await;
    assert_eq!(join.kind, JOIN_ROOM);
    assert_eq!(join.payload, json!({ "resourceType": "project", "resourceId": "p-1" }));

    live.deliver(push(USER_JOINED, "ann", json!({ "resourceId": "p-1" }))).await;
    live.deliver(push(CURSOR_MOVE, "ann", json!({ "x": 1, "y": 2 }))).await;
    live.deliver(push(USER_JOINED, "zed", json!({ "resourceId": "elsewhere" }))).await;

    let state = room.state();
    assert_eq!(state.participants.keys().collect::<Vec<_>>(), vec!["ann"]);
    assert_eq!(state.cursors["ann"], CursorPosition { x: 1.0, y: 2.0 });
    assert_eq!(room.key(), &key());
}

#[tokio::test(start_paused = true)]
async fn broadcast_cursor_position_sends_room_scoped_move() {
    let mut live = live().await;
    let room = RoomSession::join(&live.session, key()).expect("join");
    assert_eq!(live.sent().await.kind, JOIN_ROOM);

    room.broadcast_cursor_position(12.5, -3.0).expect("broadcast");
    let sent = live.sent().await;
    assert_eq!(sent.kind, CURSOR_MOVE);
    assert_eq!(
        sent.payload,
        json!({ "x": 12.5, "y": -3.0, "resourceType": "project", "resourceId": "p-1" })
    );
}

#[tokio::test(start_paused = true)]
async fn join_is_replayed_after_reconnect() {
    let mut live = live().await;
    let _room = RoomSession::join(&live.session, key()).expect("join");
    assert_eq!(live.sent().await.kind, JOIN_ROOM);

    live.bounce().await;
    let replay = live.sent().await;
    assert_eq!(replay.kind, JOIN_ROOM);
    assert_eq!(replay.payload["resourceId"], "p-1");
    assert_eq!(live.transport.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn leave_sends_leave_and_stops_tracking() {
    let mut live = live().await;
    let room = RoomSession::join(&live.session, key()).expect("join");
    let state = Arc::clone(&room.state);
    assert_eq!(live.sent().await.kind, JOIN_ROOM);

    room.leave().expect("leave");
    let leave = live.sent().await;
    assert_eq!(leave.kind, LEAVE_ROOM);
    assert_eq!(leave.payload, json!({ "resourceType": "project", "resourceId": "p-1" }));

    live.deliver(push(USER_JOINED, "ann", json!({}))).await;
    assert!(state.lock().expect("lock").participants.is_empty());

    live.bounce().await;
    assert!(live.peer.written_messages().is_empty(), "no join replay after leave");
}

#[tokio::test(start_paused = true)]
async fn dropping_room_leaves() {
    let mut live = live().await;
    let room = RoomSession::join(&live.session, key()).expect("join");
    assert_eq!(live.sent().await.kind, JOIN_ROOM);

    drop(room);
    assert_eq!(live.sent().await.kind, LEAVE_ROOM);
}

#[tokio::test(start_paused = true)]
async fn join_on_detached_session_fails() {
    let mut live = live().await;
    live.session.detach();
    assert!(matches!(RoomSession::join(&live.session, key()), Err(SessionError::Detached)));
}

use mirror_ui_host_runtime::input::{PointerEvent, PointerPhase};
use mirror_ui_host_runtime::keys::{KeyDisposition, KeyEvent, KeyPhase};
use mirror_ui_host_runtime::mirror::{self, MirrorTree, MirrorWidget};
use mirror_ui_host_runtime::{
    Modifiers, OutboundRequest, ProcessError, Reply, SendMode, SessionConfig, SessionError,
    SessionEvent, SyncSession, TransportAdapter,
};
use serde_json::{Map, Value, json};
use std::time::{Duration, Instant};

/// Accepts every request asynchronously and keeps the payloads.
#[derive(Debug, Default)]
struct AsyncTransport {
    sent: Vec<Value>,
}

impl TransportAdapter for AsyncTransport {
    fn transmit(&mut self, request: &OutboundRequest, _mode: SendMode) -> Option<Reply> {
        self.sent
            .push(serde_json::from_slice(&request.payload).expect("json request"));
        None
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn reply(body: Value) -> Reply {
    Ok(serde_json::to_vec(&body).expect("encode reply"))
}

fn operations(session: &SyncSession<AsyncTransport>, request: usize) -> Value {
    session.transport().sent[request]["operations"].clone()
}

/// A session that has exchanged its initial request and mirrors a shell
/// holding a button (`w3`), a list (`w4`) with one item (`w5`) and a text
/// field (`w6`).
fn started(now: Instant, listen: Value) -> SyncSession<AsyncTransport> {
    let mut session = SyncSession::new(AsyncTransport::default(), SessionConfig::default());
    mirror::register(session.registry_mut());

    session.send_now(now, false).expect("initial request");
    session
        .handle_response(
            now,
            reply(json!({
                "head": {"connectionId": "c7"},
                "operations": [
                    ["create", "w2", "rwt.widgets.Shell", {"text": "Main"}],
                    ["create", "w3", "rwt.widgets.Button", {"parent": "w2", "text": "OK"}],
                    ["create", "w4", "rwt.widgets.List", {"parent": "w2"}],
                    ["create", "w5", "rwt.widgets.ListItem", {"parent": "w4", "text": "first"}],
                    ["create", "w6", "rwt.widgets.Text", {"parent": "w2", "text": ""}],
                    ["listen", "w3", listen.clone()],
                    ["listen", "w4", listen]
                ]
            })),
        )
        .expect("initial response");
    session.drain_events();
    session
}

fn text_of(session: &SyncSession<AsyncTransport>, id: &str) -> String {
    session
        .registry()
        .object::<MirrorWidget>(id)
        .map(|widget| widget.text().to_string())
        .expect("mirrored widget")
}

fn pointer_down(now: Instant, target: &str, x: i32) -> PointerEvent {
    PointerEvent {
        phase: PointerPhase::Down,
        hit_target: target.to_string(),
        raw_button: 0,
        x,
        y: 10,
        modifiers: Modifiers::empty(),
        time: now,
    }
}

fn click(session: &mut SyncSession<AsyncTransport>, now: Instant, x: i32) {
    let tree = MirrorTree::snapshot(session.registry());
    let event = pointer_down(now, "w3", x);
    for widget in tree.ancestry("w3") {
        session
            .pointer_event(now, &tree, &widget, &event)
            .expect("pointer");
    }
}

fn key(phase: KeyPhase, name: &str, key_code: u32) -> KeyEvent {
    KeyEvent {
        phase,
        target: "w3".to_string(),
        key: name.to_string(),
        key_code,
        char_code: 0,
        modifiers: Modifiers::empty(),
        repeat: false,
    }
}

#[test]
fn buffered_mutations_flush_in_enqueue_order() {
    let now = Instant::now();
    let mut session = started(now, json!({}));

    assert!(session.set_property(now, "w6", "text", json!("a")));
    assert!(session.call(now, "w2", "pack", Map::new()));
    assert!(session.set_property(now, "w6", "text", json!("ab")));
    assert!(session.call(now, "w2", "layout", Map::new()));
    assert_eq!(session.transport().sent.len(), 1);

    session.fire_timers(now + ms(60)).expect("debounced flush");

    assert_eq!(session.transport().sent.len(), 2);
    assert_eq!(
        operations(&session, 1),
        json!([
            ["call", "w2", "pack", {}],
            ["set", "w6", {"text": "ab"}],
            ["call", "w2", "layout", {}]
        ])
    );
}

#[test]
fn send_during_pending_request_is_deferred_then_sent_once() {
    let now = Instant::now();
    let mut session = started(now, json!({}));

    session.send_now(now, false).expect("first");
    assert!(session.is_request_pending());

    assert!(session.set_property(now, "w6", "text", json!("late")));
    session.send_now(now, false).expect("deferred");
    session.fire_timers(now + ms(100)).expect("timers while pending");
    assert_eq!(session.transport().sent.len(), 2);

    session
        .handle_response(now + ms(120), reply(json!({"head": {}, "operations": []})))
        .expect("response");
    session.fire_timers(now + ms(200)).expect("deferred flush");
    assert_eq!(session.transport().sent.len(), 3);
    assert_eq!(operations(&session, 2), json!([["set", "w6", {"text": "late"}]]));

    session
        .handle_response(now + ms(220), reply(json!({"head": {}, "operations": []})))
        .expect("response");
    session.fire_timers(now + ms(400)).expect("idle");
    assert_eq!(session.transport().sent.len(), 3);
}

#[test]
fn operations_apply_in_order_and_destroyed_targets_fail() {
    let now = Instant::now();
    let mut session = started(now, json!({}));

    session.send_now(now, false).expect("send");
    session
        .handle_response(
            now,
            reply(json!({"head": {}, "operations": [
                ["create", "w7", "rwt.widgets.Label", {"parent": "w2"}],
                ["set", "w7", {"text": "1"}],
                ["set", "w7", {"text": "2"}]
            ]})),
        )
        .expect("apply");
    assert_eq!(text_of(&session, "w7"), "2");

    session.send_now(now, false).expect("send");
    session
        .handle_response(now, reply(json!({"head": {}, "operations": [["destroy", "w7"]]})))
        .expect("destroy");

    session.send_now(now, false).expect("send");
    let err = session
        .handle_response(
            now,
            reply(json!({"head": {}, "operations": [["set", "w7", {"text": "3"}]]})),
        )
        .expect_err("stale target");
    match err {
        SessionError::Process(err) => {
            assert!(matches!(err.root_cause(), ProcessError::TargetNotFound(id) if id == "w7"));
        }
        other => panic!("expected process error, got {other:?}"),
    }
}

#[test]
fn processing_side_effects_are_not_reported_but_user_events_are() {
    let now = Instant::now();
    let mut session = started(now, json!({"Selection": true}));

    session.send_now(now, false).expect("send");
    session
        .handle_response(
            now,
            reply(json!({"head": {}, "operations": [["set", "w4", {"selection": 0}]]})),
        )
        .expect("apply");
    session.fire_timers(now + ms(500)).expect("timers");
    assert_eq!(session.transport().sent.len(), 2);
    assert_eq!(session.pending_operations(), 0);

    let selection = mirror_ui_host_runtime::input::LocalEvent::Selection {
        target: "w4".to_string(),
        default: false,
        detail: Map::new(),
    };
    assert!(session.local_event(now + ms(500), selection).expect("user selection"));
    assert_eq!(session.transport().sent.len(), 3);
    assert_eq!(operations(&session, 2), json!([["notify", "w4", "Selection", {}]]));
}

#[test]
fn double_click_inside_window_reports_one_double_click() {
    let now = Instant::now();
    let mut session = started(now, json!({"MouseDown": true, "MouseDoubleClick": true}));

    click(&mut session, now, 10);
    session
        .handle_response(now + ms(50), reply(json!({"head": {}, "operations": []})))
        .expect("response");
    click(&mut session, now + ms(200), 12);

    let sent = &session.transport().sent;
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[1]["operations"][0][2], json!("MouseDown"));
    assert_eq!(sent[2]["operations"][0][2], json!("MouseDoubleClick"));
    assert_eq!(sent[2]["operations"].as_array().map(Vec::len), Some(1));
}

#[test]
fn clicks_outside_window_are_independent() {
    let now = Instant::now();
    let mut session = started(now, json!({"MouseDown": true, "MouseDoubleClick": true}));

    click(&mut session, now, 10);
    session
        .handle_response(now + ms(50), reply(json!({"head": {}, "operations": []})))
        .expect("response");
    click(&mut session, now + ms(600), 10);

    let sent = &session.transport().sent;
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[1]["operations"][0][2], json!("MouseDown"));
    assert_eq!(sent[2]["operations"][0][2], json!("MouseDown"));
}

#[test]
fn keys_arriving_during_a_request_replay_in_order() {
    let now = Instant::now();
    let mut session = started(now, json!({"KeyDown": true}));
    let tree = MirrorTree::snapshot(session.registry());

    let first = session
        .key_event(now, &tree, key(KeyPhase::Down, "a", 65))
        .expect("k1");
    assert_eq!(first.disposition, KeyDisposition::Sent);

    // A repeating bare modifier is never reported, but it still waits its
    // turn in the buffer.
    let mut shift = key(KeyPhase::Down, "Shift", 16);
    shift.repeat = true;
    let second = session.key_event(now, &tree, shift).expect("k2");
    let third = session
        .key_event(now, &tree, key(KeyPhase::Down, "c", 67))
        .expect("k3");
    assert_eq!(second.disposition, KeyDisposition::Buffered);
    assert_eq!(third.disposition, KeyDisposition::Buffered);
    assert_eq!(session.transport().sent.len(), 2);

    session
        .handle_response(now + ms(30), reply(json!({"head": {}, "operations": []})))
        .expect("response to k1");

    let replayed: Vec<String> = session
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::ReplayKey(event) => Some(event.key),
            _ => None,
        })
        .collect();
    assert_eq!(replayed, ["Shift"]);

    let key_codes: Vec<Value> = session.transport().sent[1..]
        .iter()
        .map(|request| request["operations"][0][3]["keyCode"].clone())
        .collect();
    assert_eq!(key_codes, [json!(65), json!(67)]);
}

#[test]
fn key_event_behind_pointer_request_is_neither_merged_nor_lost() {
    let now = Instant::now();
    let mut session = started(now, json!({"MouseDown": true, "KeyDown": true}));
    let tree = MirrorTree::snapshot(session.registry());

    click(&mut session, now, 10);
    assert!(session.is_request_pending());

    let first = session
        .key_event(now, &tree, key(KeyPhase::Down, "a", 65))
        .expect("k1");
    let second = session
        .key_event(now, &tree, key(KeyPhase::Down, "b", 66))
        .expect("k2");
    assert_eq!(first.disposition, KeyDisposition::Buffered);
    assert_eq!(second.disposition, KeyDisposition::Buffered);
    assert_eq!(session.transport().sent.len(), 2);

    for offset in [30, 60, 90] {
        session
            .handle_response(now + ms(offset), reply(json!({"head": {}, "operations": []})))
            .expect("response");
        session.fire_timers(now + ms(offset + 10)).expect("timers");
    }

    let key_codes: Vec<Value> = session
        .transport()
        .sent
        .iter()
        .flat_map(|request| request["operations"].as_array().cloned().unwrap_or_default())
        .filter(|operation| operation[2] == json!("KeyDown"))
        .map(|operation| operation[3]["keyCode"].clone())
        .collect();
    assert_eq!(key_codes, [json!(65), json!(66)]);
}

#[test]
fn server_cannot_create_the_display() {
    let now = Instant::now();
    let mut session = started(now, json!({}));

    session.send_now(now, false).expect("send");
    let err = session
        .handle_response(
            now,
            reply(json!({"head": {}, "operations": [["create", "w9", "rwt.widgets.Display", {}]]})),
        )
        .expect_err("service type");
    match err {
        SessionError::Process(err) => {
            assert!(matches!(err.root_cause(), ProcessError::UnsupportedOperation(_)));
        }
        other => panic!("expected process error, got {other:?}"),
    }
}

#[test]
fn faulting_operation_keeps_earlier_effects_and_skips_the_rest() {
    let now = Instant::now();
    let mut session = started(now, json!({}));

    session.send_now(now, false).expect("send");
    let result = session.handle_response(
        now,
        reply(json!({"head": {}, "operations": [
            ["set", "w3", {"text": "Apply"}],
            ["set", "w4", {"selection": "not-an-index"}],
            ["set", "w6", {"text": "skipped"}]
        ]})),
    );

    assert!(result.is_err());
    assert_eq!(text_of(&session, "w3"), "Apply");
    assert_eq!(text_of(&session, "w6"), "");

    let faults: Vec<String> = session
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::OperationFault { message } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(faults.len(), 1);
    assert!(faults[0].contains("\"w4\""));
    assert!(!session.is_request_pending());
}

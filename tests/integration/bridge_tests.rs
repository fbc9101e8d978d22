//! Lighting bridge: discovery, link-button pairing, room control and
//! credential handling through the orchestrator.

use smartpanel::app::events::ChannelEvent;
use smartpanel::app::intents::UserIntent;
use smartpanel::app::ports::{HttpMethod, StoragePort};
use smartpanel::bridge::BridgeState;
use smartpanel::error::{ErrorReason, HttpError};
use smartpanel::fsm::{ServiceKind, ServiceState};

use crate::mocks::*;

const BUTTON_NOT_PRESSED: &str =
    r#"[{"error":{"type":101,"address":"","description":"link button not pressed"}}]"#;
const PAIRED: &str = r#"[{"success":{"username":"hue-user-1"}}]"#;

/// Panel whose stored bridge credentials are accepted on the first try.
fn connected_panel() -> (Panel, Vec<ChannelEvent>) {
    let mut rig = Rig::new().with_bridge(0).with_stored_bridge("hue-user-1");
    rig.bridge_http.respond(HttpMethod::Get, "/groups", 200, GROUPS_BODY);
    let mut panel = rig.build(0);
    let mut events = Vec::new();
    run(&mut panel, 0, 200, 100, &mut events);
    assert_eq!(panel.bridge().state(), BridgeState::Connected);
    (panel, events)
}

#[test]
fn pairing_waits_for_the_link_button() {
    let mut rig = Rig::new().with_bridge(2);
    rig.bridge_http.respond(HttpMethod::Post, "/api", 200, BUTTON_NOT_PRESSED);
    rig.bridge_http.respond(HttpMethod::Get, "/groups", 200, GROUPS_BODY);
    let mut panel = rig.build(0);
    let mut events = Vec::new();

    panel.handle_intent(UserIntent::PairBridge, 0, &mut events);
    run(&mut panel, 0, 2_000, 500, &mut events);
    assert_eq!(
        panel.service_state(ServiceKind::Bridge),
        ServiceState::AwaitingUserAction
    );
    assert_eq!(panel.bridge().address(), Some(BRIDGE_ADDR));

    // User presses the button.
    panel
        .bridge_mut()
        .http_mut()
        .respond(HttpMethod::Post, "/api", 200, PAIRED);
    run(&mut panel, 2_500, 5_000, 500, &mut events);

    assert_eq!(panel.bridge().state(), BridgeState::Connected);
    let states: Vec<_> = statuses(&events, ServiceKind::Bridge)
        .into_iter()
        .map(|(s, _)| s)
        .collect();
    assert_eq!(
        states,
        [
            ServiceState::Discovering,
            ServiceState::AwaitingUserAction,
            ServiceState::Authenticating,
            ServiceState::Connected,
        ]
    );

    // Credentials persisted for the next boot.
    let mut buf = [0u8; 64];
    let n = panel.storage().read("hue", "user", &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hue-user-1");

    // Pairing request carries the app/device name.
    let pairing = panel
        .bridge()
        .http()
        .requests()
        .iter()
        .find(|r| r.method == HttpMethod::Post)
        .unwrap();
    assert_eq!(pairing.url, format!("http://{}/api", BRIDGE_ADDR));
    let body: serde_json::Value = serde_json::from_slice(&pairing.body).unwrap();
    assert_eq!(body["devicetype"], format!("smartpanel#{}", DEVICE_ID));
}

#[test]
fn rooms_are_published_retained_after_connect() {
    let (panel, _) = connected_panel();

    let rooms = panel.bridge().rooms();
    assert_eq!(rooms.len(), 2, "light groups that are not rooms are skipped");
    assert_eq!(rooms[0].room_id, 1);
    assert_eq!(rooms[0].name.as_str(), "Kitchen");
    assert!(rooms[0].is_on);
    assert_eq!(rooms[0].brightness_pct, 100);
    assert!(!rooms[1].is_on);

    let published = panel.transport().port().published();
    let state = on_topic(published, "hue/state");
    let last = state.last().unwrap();
    assert_eq!(last["rooms"].as_array().unwrap().len(), 2);
    assert_eq!(last["rooms"][1]["roomId"], 3);
    assert_eq!(last["rooms"][1]["isOn"], false);
    assert!(
        published
            .iter()
            .filter(|p| p.topic.ends_with("/hue/state"))
            .all(|p| p.retain)
    );
}

#[test]
fn room_command_reaches_the_bridge_and_is_acked() {
    let (mut panel, mut events) = connected_panel();
    panel.bridge_mut().http_mut().respond(
        HttpMethod::Put,
        "/groups/3/action",
        200,
        r#"[{"success":{"/groups/3/action/on":true}}]"#,
    );

    inject(
        &mut panel,
        r#"{"id":"c-1","type":"light-room-set","params":{"roomId":3,"isOn":true,"brightness":40}}"#,
    );
    panel.tick(300, &mut events);

    let put = panel
        .bridge()
        .http()
        .requests()
        .iter()
        .find(|r| r.method == HttpMethod::Put)
        .unwrap();
    assert_eq!(
        put.url,
        format!("http://{}/api/hue-user-1/groups/3/action", BRIDGE_ADDR)
    );
    let body: serde_json::Value = serde_json::from_slice(&put.body).unwrap();
    assert_eq!(body["on"], true);
    assert_eq!(body["bri"], 102);

    let acks = acks(&panel);
    assert_eq!(ack_for(&acks, "c-1")[0]["success"], true);

    // A successful write pulls fresh room state on the next tick.
    let gets_before = count(&panel, HttpMethod::Get);
    panel.tick(400, &mut events);
    assert_eq!(count(&panel, HttpMethod::Get), gets_before + 1);
}

#[test]
fn timed_out_room_command_never_reaches_the_bridge() {
    let (mut panel, mut events) = connected_panel();
    panel.bridge_mut().http_mut().respond(
        HttpMethod::Put,
        "/action",
        200,
        r#"[{"success":{"/groups/1/action/on":true}}]"#,
    );

    for id in ["a", "b", "c"] {
        inject(
            &mut panel,
            &format!(r#"{{"id":"{id}","type":"light-room-set","params":{{"roomId":1,"isOn":true}}}}"#),
        );
    }
    // One bridge call per tick: only "a" goes out.
    panel.tick(300, &mut events);
    assert_eq!(count(&panel, HttpMethod::Put), 1);

    // The link stalls past the command timeout.
    panel.tick(30_000, &mut events);
    panel.tick(30_100, &mut events);
    panel.tick(30_200, &mut events);

    assert_eq!(count(&panel, HttpMethod::Put), 1, "expired actions are dropped");
    let acks = acks(&panel);
    assert_eq!(ack_for(&acks, "a")[0]["success"], true);
    for id in ["b", "c"] {
        let ack = ack_for(&acks, id);
        assert_eq!(ack.len(), 1);
        assert_eq!(ack[0]["success"], false);
        assert_eq!(ack[0]["error"], "command timed out");
    }
}

#[test]
fn unknown_room_is_rejected() {
    let (mut panel, mut events) = connected_panel();
    panel.bridge_mut().http_mut().respond(
        HttpMethod::Put,
        "/groups/7/action",
        200,
        r#"[{"error":{"type":3,"address":"/groups/7","description":"resource not available"}}]"#,
    );

    inject(
        &mut panel,
        r#"{"id":"c-2","type":"light-room-set","params":{"roomId":7,"isOn":false}}"#,
    );
    panel.tick(300, &mut events);

    let acks = acks(&panel);
    let ack = ack_for(&acks, "c-2");
    assert_eq!(ack[0]["success"], false);
    assert_eq!(ack[0]["error"], "rejected by device");
    assert_eq!(panel.bridge().state(), BridgeState::Connected);
}

#[test]
fn room_command_without_a_bridge_fails_fast() {
    let mut panel = Rig::new().build(0);
    let mut events = Vec::new();
    panel.tick(0, &mut events);

    inject(
        &mut panel,
        r#"{"id":"c-3","type":"light-room-set","params":{"roomId":1,"brightness":10}}"#,
    );
    panel.tick(100, &mut events);

    let acks = acks(&panel);
    assert_eq!(ack_for(&acks, "c-3")[0]["error"], "service not connected");
    assert!(panel.bridge().http().requests().is_empty());
}

#[test]
fn rejected_username_is_forgotten() {
    let mut rig = Rig::new().with_bridge(0).with_stored_bridge("stale-user");
    rig.bridge_http.respond(
        HttpMethod::Get,
        "/groups",
        200,
        r#"[{"error":{"type":1,"address":"/groups","description":"unauthorized user"}}]"#,
    );
    let mut panel = rig.build(0);
    let mut events = Vec::new();

    run(&mut panel, 0, 300, 100, &mut events);

    assert_eq!(panel.bridge().state(), BridgeState::Error);
    assert_eq!(
        statuses(&events, ServiceKind::Bridge).last(),
        Some(&(ServiceState::Error, ErrorReason::BridgeUnauthorized))
    );
    assert!(!panel.storage().exists("hue", "user"));
    assert!(!panel.bridge().is_paired());

    // No credentials left, so the error hold ends in a quiet Disconnected.
    run(&mut panel, 400, 40_000, 1_000, &mut events);
    assert_eq!(panel.bridge().state(), BridgeState::Disconnected);
}

#[test]
fn repeated_timeouts_mark_the_bridge_unreachable() {
    let (mut panel, mut events) = connected_panel();
    panel
        .bridge_mut()
        .http_mut()
        .fail(HttpMethod::Get, "/groups", HttpError::Timeout);

    run(&mut panel, 300, 16_000, 100, &mut events);

    assert_eq!(panel.bridge().state(), BridgeState::Error);
    assert_eq!(
        statuses(&events, ServiceKind::Bridge).last(),
        Some(&(ServiceState::Error, ErrorReason::BridgeUnreachable))
    );
    // Unreachable is not a credential problem.
    assert!(panel.storage().exists("hue", "user"));
}

#[test]
fn pairing_window_expires() {
    let mut rig = Rig::new().with_bridge(0);
    rig.bridge_http.respond(HttpMethod::Post, "/api", 200, BUTTON_NOT_PRESSED);
    let mut panel = rig.build(0);
    let mut events = Vec::new();

    panel.handle_intent(UserIntent::PairBridge, 0, &mut events);
    run(&mut panel, 0, 32_000, 500, &mut events);

    assert_eq!(
        statuses(&events, ServiceKind::Bridge).last(),
        Some(&(ServiceState::Error, ErrorReason::PairingTimedOut))
    );
}

#[test]
fn missing_bridge_ends_discovery_with_an_error() {
    let mut panel = Rig::new().build(0);
    let mut events = Vec::new();

    panel.handle_intent(UserIntent::PairBridge, 0, &mut events);
    run(&mut panel, 0, 11_000, 500, &mut events);

    assert_eq!(
        statuses(&events, ServiceKind::Bridge).last(),
        Some(&(ServiceState::Error, ErrorReason::NoBridgeFound))
    );
}

#[test]
fn cancel_abandons_the_button_wait() {
    let mut rig = Rig::new().with_bridge(0);
    rig.bridge_http.respond(HttpMethod::Post, "/api", 200, BUTTON_NOT_PRESSED);
    let mut panel = rig.build(0);
    let mut events = Vec::new();

    panel.handle_intent(UserIntent::PairBridge, 0, &mut events);
    run(&mut panel, 0, 1_000, 500, &mut events);
    assert_eq!(panel.bridge().state(), BridgeState::WaitingForButton);

    panel.handle_intent(UserIntent::Cancel(ServiceKind::Bridge), 1_200, &mut events);
    assert_eq!(
        statuses(&events, ServiceKind::Bridge).last(),
        Some(&(ServiceState::Disconnected, ErrorReason::Cancelled))
    );

    // Stays idle: no more pairing requests.
    let posts = count(&panel, HttpMethod::Post);
    run(&mut panel, 1_500, 10_000, 500, &mut events);
    assert_eq!(count(&panel, HttpMethod::Post), posts);
    assert_eq!(panel.bridge().state(), BridgeState::Disconnected);
}

fn count(panel: &Panel, method: HttpMethod) -> usize {
    panel
        .bridge()
        .http()
        .requests()
        .iter()
        .filter(|r| r.method == method)
        .count()
}

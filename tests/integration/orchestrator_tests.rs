//! Panel-side plumbing: local intents, the event channel and the model the
//! display folds from it.

use core::cell::RefCell;
use core::time::Duration;
use std::rc::Rc;

use smartpanel::app::events::ChannelEvent;
use smartpanel::app::intents::UserIntent;
use smartpanel::app::ports::HttpMethod;
use smartpanel::app::presentation::PresentationLink;
use smartpanel::bridge::BridgeState;
use smartpanel::channel::CrossCoreChannel;
use smartpanel::error::ErrorReason;
use smartpanel::fsm::{ServiceKind, ServiceState};
use smartpanel::io_task;

use crate::mocks::*;

type Events = CrossCoreChannel<ChannelEvent, 64>;
type Intents = CrossCoreChannel<UserIntent, 4>;

fn panel_acks(events: &[ChannelEvent]) -> Vec<(String, bool, ErrorReason)> {
    events
        .iter()
        .filter_map(|e| match e {
            ChannelEvent::CommandAck(a) => Some((a.request_id.as_str().to_string(), a.success, a.reason)),
            _ => None,
        })
        .collect()
}

// ── Local intents ────────────────────────────────────────────

#[test]
fn local_room_change_is_answered_on_the_panel_only() {
    let mut rig = Rig::new().with_bridge(0).with_stored_bridge("hue-user-1");
    rig.bridge_http.respond(HttpMethod::Get, "/groups", 200, GROUPS_BODY);
    rig.bridge_http.respond(
        HttpMethod::Put,
        "/groups/1/action",
        200,
        r#"[{"success":{"/groups/1/action/on":false}}]"#,
    );
    let mut panel = rig.build(0);
    let mut events = Vec::new();
    run(&mut panel, 0, 200, 100, &mut events);
    assert_eq!(panel.bridge().state(), BridgeState::Connected);

    let id = panel.handle_intent(
        UserIntent::SetRoom {
            room_id: 1,
            on: Some(false),
            brightness_pct: None,
        },
        300,
        &mut events,
    );
    assert_eq!(id.map(|i| i.as_str().to_string()).as_deref(), Some("local-1"));
    panel.tick(300, &mut events);

    let answered = panel_acks(&events);
    assert_eq!(answered, vec![("local-1".to_string(), true, ErrorReason::None)]);
    assert!(acks(&panel).is_empty(), "local commands are not acked on the broker");
    assert_eq!(panel.stats().local_commands, 1);
    assert_eq!(panel.stats().rate_limited, 0);
}

#[test]
fn local_zone_change_without_a_session_fails_at_once() {
    let mut panel = Rig::new().build(0);
    let mut events = Vec::new();
    panel.tick(0, &mut events);

    let first = panel.handle_intent(
        UserIntent::SetZoneTemperature {
            zone_id: 1,
            target_c: 21.0,
        },
        100,
        &mut events,
    );
    let second = panel.handle_intent(
        UserIntent::SetZoneTemperature {
            zone_id: 1,
            target_c: 21.5,
        },
        200,
        &mut events,
    );
    assert_ne!(first, second, "each intent gets its own id");

    let answered = panel_acks(&events);
    assert_eq!(answered.len(), 2);
    assert!(answered.iter().all(|(_, ok, reason)| !ok && *reason == ErrorReason::NotConnected));
}

#[test]
fn auto_adjust_intent_keeps_the_stored_hysteresis() {
    let mut panel = Rig::new().build(0);
    let mut events = Vec::new();
    panel.tick(0, &mut events);
    inject(
        &mut panel,
        r#"{"id":"m-1","type":"thermostat-set-auto-adjust","params":{"zoneId":1,"enabled":true,"targetTemperature":21,"hysteresis":1.0}}"#,
    );
    panel.tick(100, &mut events);

    panel.handle_intent(
        UserIntent::SetAutoAdjust {
            zone_id: 1,
            enabled: false,
            target_c: 19.0,
        },
        200,
        &mut events,
    );

    let mapping = panel.thermostat().mappings().get(1).copied().unwrap();
    assert!(!mapping.auto_adjust);
    assert_eq!(mapping.target_c, 19.0);
    assert_eq!(mapping.hysteresis_c, 1.0);
}

#[test]
fn broker_cancel_is_a_no_op() {
    let mut panel = Rig::new().build(0);
    let mut events = Vec::new();
    panel.tick(0, &mut events);
    let before = events.len();

    assert!(panel
        .handle_intent(UserIntent::Cancel(ServiceKind::Transport), 100, &mut events)
        .is_none());

    assert_eq!(events.len(), before);
    assert!(panel.transport().is_connected());
}

// ── Event channel and panel model ────────────────────────────

#[test]
fn panel_model_follows_the_event_channel() {
    let events = Events::new();
    let intents = Intents::new();
    let mut link = PresentationLink::new(&events, &intents);

    let mut rig = Rig::new().with_bridge(0).with_stored_bridge("hue-user-1");
    rig.bridge_http.respond(HttpMethod::Get, "/groups", 200, GROUPS_BODY);
    rig.sensor = MockSensor::steady(21.0, 38.0);
    let mut panel = rig.build(0);

    let mut sink = &events;
    run(&mut panel, 0, 200, 100, &mut sink);
    let applied = link.poll(Duration::ZERO);

    let model = link.model();
    assert!(applied > 0);
    assert_eq!(model.events_seen as usize, applied);
    assert_eq!(model.dropped_events, 0);
    assert_eq!(model.service(ServiceKind::Transport).state, ServiceState::Connected);
    assert_eq!(model.service(ServiceKind::Bridge).state, ServiceState::Connected);
    assert_eq!(model.rooms.len(), 2);
    assert_eq!(model.room(1).unwrap().name.as_str(), "Kitchen");
    assert_eq!(model.sensor.unwrap().temperature_c, 21.0);
    assert!(events.is_empty(), "poll drains everything queued");
}

#[test]
fn auth_prompt_is_shown_then_cleared() {
    let events = Events::new();
    let intents = Intents::new();
    let mut link = PresentationLink::new(&events, &intents);

    let mut rig = Rig::new();
    rig.thermostat_http
        .respond(HttpMethod::Post, "oauth2/device_authorize", 200, DEVICE_CODE_BODY);
    let mut panel = rig.build(0);
    let mut sink = &events;

    run(&mut panel, 0, 1_000, 500, &mut sink);
    link.poll(Duration::ZERO);
    let prompt = link.model().auth_prompt.unwrap();
    assert_eq!(prompt.user_code.as_str(), "7BQ5ZQ");
    assert_eq!(
        link.model().service(ServiceKind::Thermostat).state,
        ServiceState::AwaitingUserAction
    );

    panel.handle_intent(UserIntent::Cancel(ServiceKind::Thermostat), 1_200, &mut sink);
    link.poll(Duration::ZERO);
    assert!(link.model().auth_prompt.is_none());
    assert_eq!(
        link.model().service(ServiceKind::Thermostat).reason,
        ErrorReason::Cancelled
    );
}

#[test]
fn bridge_disconnect_clears_the_room_list() {
    let events = Events::new();
    let intents = Intents::new();
    let mut link = PresentationLink::new(&events, &intents);

    let mut rig = Rig::new().with_bridge(0).with_stored_bridge("hue-user-1");
    rig.bridge_http.respond(HttpMethod::Get, "/groups", 200, GROUPS_BODY);
    let mut panel = rig.build(0);
    let mut sink = &events;

    run(&mut panel, 0, 200, 100, &mut sink);
    link.poll(Duration::ZERO);
    assert_eq!(link.model().rooms.len(), 2);

    // The bridge forgets the panel; Error, then the hold ends in Disconnected.
    panel.bridge_mut().http_mut().respond(
        HttpMethod::Get,
        "/groups",
        200,
        r#"[{"error":{"type":1,"address":"/groups","description":"unauthorized user"}}]"#,
    );
    run(&mut panel, 1_000, 45_000, 1_000, &mut sink);
    link.poll(Duration::ZERO);

    assert!(link.model().rooms.is_empty());
    assert_eq!(
        link.model().service(ServiceKind::Bridge).state,
        ServiceState::Disconnected
    );
}

#[test]
fn full_event_channel_drops_and_reports() {
    let events: CrossCoreChannel<ChannelEvent, 2> = CrossCoreChannel::new();
    let intents = Intents::new();
    let mut link = PresentationLink::new(&events, &intents);
    let mut panel = Rig::new().build(0);

    let mut sink = &events;
    panel.tick(0, &mut sink);

    assert_eq!(events.len(), 2);
    assert!(events.dropped() > 0);
    let status = on_topic(panel.transport().port().published(), "status");
    let reported = status[0]["droppedEvents"].as_u64().unwrap();
    assert!(reported > 0 && reported <= u64::from(events.dropped()));

    assert_eq!(link.poll(Duration::ZERO), 2);
    assert_eq!(link.model().dropped_events, events.dropped());
}

#[test]
fn intent_queue_rejects_when_full() {
    let events = Events::new();
    let intents: CrossCoreChannel<UserIntent, 1> = CrossCoreChannel::new();
    let link = PresentationLink::new(&events, &intents);

    assert!(link.send_intent(UserIntent::PairBridge));
    assert!(!link.send_intent(UserIntent::ConnectThermostat));
    assert_eq!(intents.dropped(), 1);
}

// ── Executor ─────────────────────────────────────────────────

#[test]
fn executor_ticks_services_and_applies_intents() {
    let events = Events::new();
    let intents = Intents::new();
    let mut link = PresentationLink::new(&events, &intents);
    let panel = Rc::new(RefCell::new(Rig::new().with_bridge(1_000).build(0)));

    assert!(link.send_intent(UserIntent::PairBridge));
    io_task::drive(panel.clone(), &events, &intents, Duration::from_millis(5), async {
        async_io_mini::Timer::after(Duration::from_millis(60)).await;
    });

    let panel = panel.borrow();
    assert!(panel.transport().is_connected());
    assert_eq!(panel.bridge().state(), BridgeState::Discovering);

    link.poll(Duration::ZERO);
    assert_eq!(
        link.model().service(ServiceKind::Bridge).state,
        ServiceState::Discovering
    );
}

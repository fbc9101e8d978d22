//! Thermostat cloud: device-flow login, token upkeep, setpoint commands
//! and the auto-adjust loop.

use smartpanel::adapters::http::{DEFAULT_TIMEOUT, HttpAdapter};
use smartpanel::adapters::nvs::NvsAdapter;
use smartpanel::app::events::{AdjustDirection, ChannelEvent};
use smartpanel::app::intents::UserIntent;
use smartpanel::app::ports::{HttpMethod, StoragePort};
use smartpanel::config::SystemConfig;
use smartpanel::error::ErrorReason;
use smartpanel::fsm::{ServiceKind, ServiceState};
use smartpanel::thermostat::auth::AuthTokenSet;
use smartpanel::thermostat::vault::TokenVault;
use smartpanel::thermostat::{ThermostatService, ThermostatState};

use crate::mocks::*;

const PENDING: &str = r#"{"error":"authorization_pending"}"#;

fn cloud(http: &mut HttpAdapter, current_c: f32, target_c: f32) {
    http.respond(HttpMethod::Post, "oauth2/device_authorize", 200, DEVICE_CODE_BODY);
    http.respond(HttpMethod::Post, "oauth2/token", 400, PENDING);
    http.respond(HttpMethod::Get, "api/v2/me", 200, ME_BODY);
    http.respond(HttpMethod::Get, "/homes/1234/zones", 200, ZONES_BODY);
    http.respond(HttpMethod::Get, "/zones/1/state", 200, &zone_state_body(current_c, target_c));
    http.respond(HttpMethod::Put, "/zones/1/overlay", 204, "");
}

fn approve(panel: &mut Panel) {
    panel
        .thermostat_mut()
        .http_mut()
        .respond(HttpMethod::Post, "oauth2/token", 200, TOKEN_BODY);
}

/// Walks the device flow to `Connected`.  Granted at 11 s, home at 12 s,
/// zones at 13 s, first zone pass and control cycle at 14 s, and any
/// correction written on the returned tick.
fn authorize(panel: &mut Panel, events: &mut Vec<ChannelEvent>) -> u64 {
    run(panel, 0, 6_000, 1_000, events);
    approve(panel);
    run(panel, 7_000, 15_000, 1_000, events);
    assert_eq!(panel.thermostat().state(), ThermostatState::Connected);
    15_000
}

/// Tick every `step_ms` and note when `part` was requested.
fn request_times(
    panel: &mut Panel,
    to_ms: u64,
    step_ms: u64,
    method: HttpMethod,
    part: &str,
    events: &mut Vec<ChannelEvent>,
) -> Vec<u64> {
    let mut times = Vec::new();
    let mut seen = requests_to(panel, method, part);
    let mut now = 0;
    while now <= to_ms {
        panel.tick(now, events);
        let count = requests_to(panel, method, part);
        if count > seen {
            times.push(now);
            seen = count;
        }
        now += step_ms;
    }
    times
}

fn requests_to(panel: &Panel, method: HttpMethod, part: &str) -> usize {
    panel
        .thermostat()
        .http()
        .requests()
        .iter()
        .filter(|r| r.method == method && r.url.contains(part))
        .count()
}

// ── Device flow ──────────────────────────────────────────────

#[test]
fn device_flow_shows_a_code_then_connects() {
    let mut rig = Rig::new();
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    let mut panel = rig.build(0);
    let mut events = Vec::new();

    run(&mut panel, 0, 6_000, 1_000, &mut events);

    assert_eq!(
        panel.service_state(ServiceKind::Thermostat),
        ServiceState::AwaitingUserAction
    );
    let prompt = events
        .iter()
        .find_map(|e| match e {
            ChannelEvent::AuthPrompt {
                user_code,
                verification_uri,
            } => Some((*user_code, *verification_uri)),
            _ => None,
        })
        .unwrap();
    assert_eq!(prompt.0.as_str(), "7BQ5ZQ");
    assert_eq!(prompt.1.as_str(), "https://login.tado.com/oauth2/device");
    let poll = panel
        .thermostat()
        .http()
        .requests()
        .iter()
        .rfind(|r| r.url.contains("oauth2/token"))
        .unwrap();
    assert!(String::from_utf8_lossy(&poll.body).contains("device_code=dc-42"));

    approve(&mut panel);
    run(&mut panel, 7_000, 14_000, 1_000, &mut events);

    assert_eq!(panel.thermostat().state(), ThermostatState::Connected);
    assert!(panel.thermostat().pending_prompt().is_none());
    let zones = panel.thermostat().zones();
    assert_eq!(zones.len(), 1, "hot water zone is skipped");
    assert_eq!(zones[0].current_c, Some(19.0));
    assert_eq!(zones[0].target_c, Some(20.0));

    let state = on_topic(panel.transport().port().published(), "tado/state");
    let last = state.last().unwrap();
    assert_eq!(last["zones"][0]["zoneId"], 1);
    assert_eq!(last["zones"][0]["name"], "Living");

    // Cloud calls carry the access token.
    let me = panel
        .thermostat()
        .http()
        .requests()
        .iter()
        .find(|r| r.url.contains("api/v2/me"))
        .unwrap();
    assert_eq!(me.bearer.as_deref(), Some("at-1"));
}

#[test]
fn tokens_are_stored_sealed() {
    let mut rig = Rig::new();
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    let mut panel = rig.build(0);
    let mut events = Vec::new();
    authorize(&mut panel, &mut events);

    let mut blob = vec![0u8; 4096];
    let n = panel.storage().read("auth", "tokens", &mut blob).unwrap();
    let blob = &blob[..n];
    assert!(!blob.windows(4).any(|w| w == b"at-1"));
    assert!(!blob.windows(4).any(|w| w == b"rt-1"));

    let tokens = TokenVault::new(SECRET).open(blob, 0).unwrap();
    assert_eq!(tokens.refresh_token, "rt-1");
}

#[test]
fn heartbeat_carries_the_pending_user_code() {
    let mut rig = Rig::new();
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    let mut panel = rig.build(0);
    let mut events = Vec::new();

    run(&mut panel, 0, 31_000, 1_000, &mut events);

    let status = on_topic(panel.transport().port().published(), "status");
    let last = status.last().unwrap();
    assert_eq!(last["tado"], "awaiting_user_action");
    assert_eq!(last["userCode"], "7BQ5ZQ");
    assert_eq!(last["verificationUri"], "https://login.tado.com/oauth2/device");
    assert!(status[0].get("userCode").is_none());
}

#[test]
fn pending_authorization_is_polled_at_the_server_interval() {
    let mut rig = Rig::new();
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    let mut panel = rig.build(0);
    let mut events = Vec::new();

    let polls = request_times(&mut panel, 60_000, 250, HttpMethod::Post, "oauth2/token", &mut events);

    // Code issued at 250 ms, interval 5 s.
    assert_eq!(polls.len(), 11);
    assert_eq!(polls[0], 5_250);
    assert!(polls.windows(2).all(|w| w[1] - w[0] >= 5_000));
    assert_eq!(panel.thermostat().state(), ThermostatState::AwaitingApproval);
}

#[test]
fn each_slow_down_adds_five_seconds_between_polls() {
    let mut rig = Rig::new();
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    rig.thermostat_http
        .respond(HttpMethod::Post, "oauth2/token", 400, r#"{"error":"slow_down"}"#);
    let mut panel = rig.build(0);
    let mut events = Vec::new();

    let polls = request_times(&mut panel, 60_000, 250, HttpMethod::Post, "oauth2/token", &mut events);

    assert_eq!(polls, [5_250, 15_250, 30_250, 50_250]);
    assert_eq!(panel.thermostat().poll_interval_ms(), 25_000);
}

#[test]
fn slow_down_stretches_the_poll_interval() {
    let mut rig = Rig::new();
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    rig.thermostat_http
        .respond(HttpMethod::Post, "oauth2/token", 400, r#"{"error":"slow_down"}"#);
    let mut panel = rig.build(0);
    let mut events = Vec::new();

    run(&mut panel, 0, 6_000, 1_000, &mut events);

    assert_eq!(panel.thermostat().poll_interval_ms(), 10_000);
    assert_eq!(panel.thermostat().state(), ThermostatState::AwaitingApproval);
}

#[test]
fn denied_authorization_waits_for_the_user() {
    let mut rig = Rig::new();
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    rig.thermostat_http
        .respond(HttpMethod::Post, "oauth2/token", 400, r#"{"error":"access_denied"}"#);
    let mut panel = rig.build(0);
    let mut events = Vec::new();

    run(&mut panel, 0, 6_000, 1_000, &mut events);
    assert_eq!(
        statuses(&events, ServiceKind::Thermostat).last(),
        Some(&(ServiceState::Error, ErrorReason::AccessDenied))
    );

    // Past the error hold: back to Disconnected, but no new login attempt.
    let code_requests = requests_to(&panel, HttpMethod::Post, "device_authorize");
    run(&mut panel, 7_000, 60_000, 1_000, &mut events);
    assert_eq!(panel.thermostat().state(), ThermostatState::Disconnected);
    assert_eq!(requests_to(&panel, HttpMethod::Post, "device_authorize"), code_requests);

    // "Connect thermostat" starts over.
    panel.handle_intent(UserIntent::ConnectThermostat, 61_000, &mut events);
    run(&mut panel, 61_000, 62_000, 1_000, &mut events);
    assert_eq!(panel.thermostat().state(), ThermostatState::AwaitingApproval);
}

#[test]
fn expired_device_code_is_reported() {
    let mut rig = Rig::new();
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    rig.thermostat_http
        .respond(HttpMethod::Post, "oauth2/token", 400, r#"{"error":"expired_token"}"#);
    let mut panel = rig.build(0);
    let mut events = Vec::new();

    run(&mut panel, 0, 6_000, 1_000, &mut events);

    assert_eq!(
        statuses(&events, ServiceKind::Thermostat).last(),
        Some(&(ServiceState::Error, ErrorReason::DeviceCodeExpired))
    );
}

#[test]
fn cancel_abandons_the_approval_wait() {
    let mut rig = Rig::new();
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    let mut panel = rig.build(0);
    let mut events = Vec::new();

    run(&mut panel, 0, 2_000, 1_000, &mut events);
    panel.handle_intent(UserIntent::Cancel(ServiceKind::Thermostat), 2_500, &mut events);

    assert_eq!(
        statuses(&events, ServiceKind::Thermostat).last(),
        Some(&(ServiceState::Disconnected, ErrorReason::Cancelled))
    );
    assert!(panel.thermostat().pending_prompt().is_none());

    let polls = requests_to(&panel, HttpMethod::Post, "oauth2/token");
    run(&mut panel, 3_000, 20_000, 1_000, &mut events);
    assert_eq!(requests_to(&panel, HttpMethod::Post, "oauth2/token"), polls);
}

// ── Setpoints ────────────────────────────────────────────────

#[test]
fn set_temperature_writes_an_overlay() {
    let mut rig = Rig::new();
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    let mut panel = rig.build(0);
    let mut events = Vec::new();
    let now = authorize(&mut panel, &mut events);

    inject(
        &mut panel,
        r#"{"id":"t-1","type":"thermostat-set-temperature","params":{"zoneId":1,"targetTemperature":22}}"#,
    );
    panel.tick(now + 1_000, &mut events);

    let acks = acks(&panel);
    assert_eq!(ack_for(&acks, "t-1")[0]["success"], true);

    let put = panel
        .thermostat()
        .http()
        .requests()
        .iter()
        .rfind(|r| r.method == HttpMethod::Put)
        .unwrap();
    assert_eq!(put.bearer.as_deref(), Some("at-1"));
    let body: serde_json::Value = serde_json::from_slice(&put.body).unwrap();
    assert_eq!(body["setting"]["temperature"]["celsius"], 22.0);
    assert_eq!(body["setting"]["power"], "ON");
    assert_eq!(panel.thermostat().zones()[0].target_c, Some(22.0));

    let state = on_topic(panel.transport().port().published(), "tado/state");
    assert_eq!(state.last().unwrap()["zones"][0]["targetC"], 22.0);
}

#[test]
fn set_temperature_on_unknown_zone_is_invalid() {
    let mut rig = Rig::new();
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    let mut panel = rig.build(0);
    let mut events = Vec::new();
    let now = authorize(&mut panel, &mut events);

    inject(
        &mut panel,
        r#"{"id":"t-2","type":"thermostat-set-temperature","params":{"zoneId":5,"targetTemperature":21}}"#,
    );
    panel.tick(now + 1_000, &mut events);

    let acks = acks(&panel);
    assert_eq!(ack_for(&acks, "t-2")[0]["error"], "invalid command");
}

#[test]
fn set_temperature_before_login_fails_fast() {
    let mut panel = Rig::new().build(0);
    let mut events = Vec::new();
    panel.tick(0, &mut events);

    inject(
        &mut panel,
        r#"{"id":"t-3","type":"thermostat-set-temperature","params":{"zoneId":1,"targetTemperature":21}}"#,
    );
    panel.tick(100, &mut events);

    let acks = acks(&panel);
    assert_eq!(ack_for(&acks, "t-3")[0]["error"], "service not connected");
}

#[test]
fn expired_access_token_is_refreshed_and_the_write_retried() {
    let mut rig = Rig::new();
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    let mut panel = rig.build(0);
    let mut events = Vec::new();
    let now = authorize(&mut panel, &mut events);

    let http = panel.thermostat_mut().http_mut();
    http.respond(HttpMethod::Put, "/zones/1/overlay", 401, "");
    http.respond(
        HttpMethod::Post,
        "oauth2/token",
        200,
        r#"{"access_token":"at-2","refresh_token":"rt-2","expires_in":600}"#,
    );

    inject(
        &mut panel,
        r#"{"id":"t-4","type":"thermostat-set-temperature","params":{"zoneId":1,"targetTemperature":21.5}}"#,
    );
    panel.tick(now + 1_000, &mut events);
    assert_eq!(panel.thermostat().state(), ThermostatState::Refreshing);
    assert!(ack_for(&acks(&panel), "t-4").is_empty(), "still in flight");

    panel
        .thermostat_mut()
        .http_mut()
        .respond(HttpMethod::Put, "/zones/1/overlay", 204, "");
    panel.tick(now + 2_000, &mut events);
    assert_eq!(panel.thermostat().state(), ThermostatState::Connected);
    panel.tick(now + 3_000, &mut events);

    assert_eq!(ack_for(&acks(&panel), "t-4")[0]["success"], true);
    let requests = panel.thermostat().http().requests();
    let refresh = requests
        .iter()
        .rfind(|r| r.url.contains("oauth2/token"))
        .unwrap();
    let form = String::from_utf8_lossy(&refresh.body);
    assert!(form.contains("grant_type=refresh_token"));
    assert!(form.contains("refresh_token=rt-1"));
    let put = requests.iter().rfind(|r| r.method == HttpMethod::Put).unwrap();
    assert_eq!(put.bearer.as_deref(), Some("at-2"));
}

#[test]
fn rejected_fresh_token_waits_before_refreshing_again() {
    let mut rig = Rig::new();
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    let mut panel = rig.build(0);
    let mut events = Vec::new();
    let now = authorize(&mut panel, &mut events);

    let http = panel.thermostat_mut().http_mut();
    http.respond(HttpMethod::Put, "/zones/1/overlay", 401, "");
    http.respond(
        HttpMethod::Post,
        "oauth2/token",
        200,
        r#"{"access_token":"at-2","refresh_token":"rt-2","expires_in":600}"#,
    );
    inject(
        &mut panel,
        r#"{"id":"t-5","type":"thermostat-set-temperature","params":{"zoneId":1,"targetTemperature":21}}"#,
    );

    // 401, refresh, then 401 again on the brand-new token.
    panel.tick(now + 1_000, &mut events);
    panel.tick(now + 2_000, &mut events);
    panel.tick(now + 3_000, &mut events);
    assert_eq!(panel.thermostat().state(), ThermostatState::Refreshing);
    let refreshes = requests_to(&panel, HttpMethod::Post, "oauth2/token");

    run(&mut panel, now + 4_000, now + 12_000, 1_000, &mut events);
    assert_eq!(requests_to(&panel, HttpMethod::Post, "oauth2/token"), refreshes);

    panel.tick(now + 13_000, &mut events);
    assert_eq!(requests_to(&panel, HttpMethod::Post, "oauth2/token"), refreshes + 1);
}

// ── Auto-adjust ──────────────────────────────────────────────

fn enable_auto_adjust(panel: &mut Panel, events: &mut Vec<ChannelEvent>) {
    panel.tick(0, events);
    inject(
        panel,
        r#"{"id":"a-1","type":"thermostat-set-auto-adjust","params":{"zoneId":1,"enabled":true,"targetTemperature":21,"hysteresis":0.5}}"#,
    );
    panel.tick(0, events);
    assert_eq!(ack_for(&acks(panel), "a-1")[0]["success"], true);
}

#[test]
fn mapping_is_accepted_while_offline_and_persisted() {
    let mut panel = Rig::new().build(0);
    let mut events = Vec::new();
    enable_auto_adjust(&mut panel, &mut events);

    let mapping = panel.thermostat().mappings().get(1).copied().unwrap();
    assert!(mapping.auto_adjust);
    assert_eq!(mapping.target_c, 21.0);
    assert!(panel.storage().exists("tado", "zones"));
}

#[test]
fn auto_adjust_raises_a_cold_zone() {
    let mut rig = Rig::new();
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    let mut panel = rig.build(0);
    let mut events = Vec::new();
    enable_auto_adjust(&mut panel, &mut events);

    authorize(&mut panel, &mut events);

    let adjust = events
        .iter()
        .find_map(|e| match e {
            ChannelEvent::AutoAdjust(a) => Some(*a),
            _ => None,
        })
        .unwrap();
    assert_eq!(adjust.zone_id, 1);
    assert_eq!(adjust.direction, AdjustDirection::Raise);
    assert_eq!(adjust.measured_c, 19.0);
    assert_eq!(adjust.new_target_c, 20.5);
    assert_eq!(panel.thermostat().corrections_applied(), 1);

    let put = panel
        .thermostat()
        .http()
        .requests()
        .iter()
        .rfind(|r| r.method == HttpMethod::Put)
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&put.body).unwrap();
    assert_eq!(body["setting"]["temperature"]["celsius"], 20.5);
}

#[test]
fn readings_between_cycle_boundaries_do_not_add_corrections() {
    let mut rig = Rig::new();
    rig.cfg.local_zone_id = Some(1);
    rig.sensor = MockSensor::default();
    for i in 0..20 {
        rig.sensor.push(22.0 + i as f32 * 0.1, 45.0);
    }
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    let mut panel = rig.build(0);
    let mut events = Vec::new();
    enable_auto_adjust(&mut panel, &mut events);

    let now = authorize(&mut panel, &mut events);
    assert_eq!(requests_to(&panel, HttpMethod::Put, "overlay"), 1);

    // Fresh readings every 2 s and a zone poll every minute until the
    // next boundary at 314 s.
    run(&mut panel, now + 1_000, 313_000, 1_000, &mut events);
    assert_eq!(requests_to(&panel, HttpMethod::Put, "overlay"), 1);
    let adjustments = events
        .iter()
        .filter(|e| matches!(e, ChannelEvent::AutoAdjust(_)))
        .count();
    assert_eq!(adjustments, 1);

    run(&mut panel, 314_000, 316_000, 1_000, &mut events);
    assert_eq!(requests_to(&panel, HttpMethod::Put, "overlay"), 2);
    assert_eq!(panel.thermostat().corrections_applied(), 2);
}

#[test]
fn zone_pass_reads_one_zone_per_tick() {
    let mut rig = Rig::new();
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    rig.thermostat_http.respond(
        HttpMethod::Get,
        "/homes/1234/zones",
        200,
        r#"[{"id":1,"name":"Living","type":"HEATING"},{"id":2,"name":"Bed","type":"HEATING"},{"id":3,"name":"Bath","type":"HEATING"}]"#,
    );
    // Routes registered later win, so the state routes go after the list.
    for zone in ["/zones/1/state", "/zones/2/state", "/zones/3/state"] {
        rig.thermostat_http
            .respond(HttpMethod::Get, zone, 200, &zone_state_body(18.0, 19.0));
    }
    let mut panel = rig.build(0);
    let mut events = Vec::new();

    run(&mut panel, 0, 6_000, 1_000, &mut events);
    approve(&mut panel);
    run(&mut panel, 7_000, 12_000, 1_000, &mut events);
    assert_eq!(panel.thermostat().state(), ThermostatState::Discovering);
    assert_eq!(requests_to(&panel, HttpMethod::Get, "/zones"), 0, "home first");

    panel.tick(13_000, &mut events);
    assert_eq!(panel.thermostat().state(), ThermostatState::Connected);

    let mut reads = Vec::new();
    for now in [14_000, 15_000, 16_000, 17_000] {
        let before = panel.thermostat().http().requests().len();
        panel.tick(now, &mut events);
        reads.push(panel.thermostat().http().requests().len() - before);
    }
    assert_eq!(reads, [1, 1, 1, 0]);
    assert_eq!(panel.thermostat().zones().len(), 3);
}

#[test]
fn auto_adjust_holds_inside_the_hysteresis_band() {
    let mut rig = Rig::new();
    // target 21, h 0.5: a 0.5 °C shortfall is not enough.
    cloud(&mut rig.thermostat_http, 20.5, 20.0);
    let mut panel = rig.build(0);
    let mut events = Vec::new();
    enable_auto_adjust(&mut panel, &mut events);

    authorize(&mut panel, &mut events);

    assert_eq!(requests_to(&panel, HttpMethod::Put, "overlay"), 0);
    assert_eq!(panel.thermostat().corrections_applied(), 0);
}

#[test]
fn auto_adjust_uses_the_panel_sensor_for_its_own_zone() {
    let mut rig = Rig::new();
    rig.cfg.local_zone_id = Some(1);
    rig.sensor = MockSensor::steady(22.0, 45.0);
    cloud(&mut rig.thermostat_http, 19.0, 20.0);
    let mut panel = rig.build(0);
    let mut events = Vec::new();
    enable_auto_adjust(&mut panel, &mut events);

    authorize(&mut panel, &mut events);

    let adjust = events
        .iter()
        .find_map(|e| match e {
            ChannelEvent::AutoAdjust(a) => Some(*a),
            _ => None,
        })
        .unwrap();
    assert_eq!(adjust.direction, AdjustDirection::Lower);
    assert_eq!(adjust.measured_c, 22.0);
    assert_eq!(adjust.new_target_c, 19.5);
}

// ── Restart with stored tokens (service level) ───────────────

fn stored(storage: &mut NvsAdapter, secret: &[u8]) {
    let tokens = AuthTokenSet {
        access_token: "at-old".into(),
        refresh_token: "rt-9".into(),
        expires_at_ms: 0,
    };
    TokenVault::new(secret).store(storage, &tokens).unwrap();
}

#[test]
fn stored_tokens_are_refreshed_on_boot() {
    let cfg = SystemConfig::default();
    let mut storage = NvsAdapter::new().unwrap();
    stored(&mut storage, SECRET);
    let mut http = HttpAdapter::new(DEFAULT_TIMEOUT);
    cloud(&mut http, 19.0, 20.0);
    http.respond(HttpMethod::Post, "oauth2/token", 200, TOKEN_BODY);

    let mut svc = ThermostatService::new(http, &cfg, SECRET, &mut storage, 0);
    let mut events = Vec::new();
    svc.poll(0, &mut storage, &mut events);
    assert_eq!(svc.state(), ThermostatState::Refreshing);
    svc.poll(100, &mut storage, &mut events);
    svc.poll(200, &mut storage, &mut events);
    svc.poll(300, &mut storage, &mut events);

    assert_eq!(svc.state(), ThermostatState::Connected);
    let first = &svc.http().requests()[0];
    assert!(first.url.contains("oauth2/token"));
    assert!(String::from_utf8_lossy(&first.body).contains("refresh_token=rt-9"));
    assert!(
        !svc.http()
            .requests()
            .iter()
            .any(|r| r.url.contains("device_authorize"))
    );
}

#[test]
fn tokens_from_another_device_are_discarded() {
    let cfg = SystemConfig::default();
    let mut storage = NvsAdapter::new().unwrap();
    stored(&mut storage, b"some-other-board");
    let mut http = HttpAdapter::new(DEFAULT_TIMEOUT);
    cloud(&mut http, 19.0, 20.0);

    let mut svc = ThermostatService::new(http, &cfg, SECRET, &mut storage, 0);
    let mut events = Vec::new();
    svc.poll(0, &mut storage, &mut events);

    assert!(!storage.exists("auth", "tokens"));
    assert!(
        statuses(&events, ServiceKind::Thermostat)
            .iter()
            .any(|(_, reason)| *reason == ErrorReason::CredentialsCorrupted)
    );
    assert_eq!(svc.state(), ThermostatState::RequestingCode);
}

#[test]
fn refused_refresh_falls_back_to_the_device_flow() {
    let cfg = SystemConfig::default();
    let mut storage = NvsAdapter::new().unwrap();
    stored(&mut storage, SECRET);
    let mut http = HttpAdapter::new(DEFAULT_TIMEOUT);
    cloud(&mut http, 19.0, 20.0);
    http.respond(HttpMethod::Post, "oauth2/token", 400, r#"{"error":"invalid_grant"}"#);

    let mut svc = ThermostatService::new(http, &cfg, SECRET, &mut storage, 0);
    let mut events = Vec::new();
    svc.poll(0, &mut storage, &mut events);
    svc.poll(100, &mut storage, &mut events);

    assert!(
        statuses(&events, ServiceKind::Thermostat)
            .contains(&(ServiceState::Disconnected, ErrorReason::RefreshFailed))
    );
    assert_eq!(svc.state(), ThermostatState::RequestingCode);
    assert!(svc.tokens().is_none());
    assert!(!storage.exists("auth", "tokens"));
}

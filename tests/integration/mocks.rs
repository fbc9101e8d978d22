//! Shared fixtures for the integration suite.
//!
//! The broker, HTTP, mDNS, NVS and system adapters are the library's own
//! simulation backends.  Only the climate sensor is mocked here, because
//! the ADC simulation keeps its raw values in process-wide statics that
//! parallel tests would fight over.

use std::collections::VecDeque;

use serde_json::Value;

use smartpanel::adapters::http::{DEFAULT_TIMEOUT, HttpAdapter};
use smartpanel::adapters::mdns::MdnsDiscovery;
use smartpanel::adapters::mqtt::{MqttAdapter, Published};
use smartpanel::adapters::nvs::NvsAdapter;
use smartpanel::adapters::system::DeviceSystem;
use smartpanel::app::events::ChannelEvent;
use smartpanel::app::orchestrator::{IoOrchestrator, IoPorts};
use smartpanel::app::ports::{EventSink, SensorPort, SensorSample, StoragePort};
use smartpanel::config::SystemConfig;
use smartpanel::error::ErrorReason;
use smartpanel::fsm::{ServiceKind, ServiceState};

pub const DEVICE_ID: &str = "panel-a1b2c3";
pub const SECRET: &[u8] = &[0x24, 0x6f, 0x28, 0xa1, 0xb2, 0xc3];
pub const BRIDGE_ADDR: &str = "192.168.1.40";

pub type Panel =
    IoOrchestrator<MqttAdapter, HttpAdapter, MdnsDiscovery, HttpAdapter, MockSensor, NvsAdapter, DeviceSystem>;

// ── Sensor ───────────────────────────────────────────────────

/// Returns queued samples in order, then repeats the last one.  An empty
/// script means the sensor never answers.
#[derive(Default)]
pub struct MockSensor {
    script: VecDeque<SensorSample>,
    last: Option<SensorSample>,
    pub reads: u32,
}

impl MockSensor {
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn steady(temperature_c: f32, humidity_pct: f32) -> Self {
        let mut s = Self::default();
        s.push(temperature_c, humidity_pct);
        s
    }

    pub fn push(&mut self, temperature_c: f32, humidity_pct: f32) {
        self.script.push_back(SensorSample {
            temperature_c,
            humidity_pct,
        });
    }
}

impl SensorPort for MockSensor {
    fn read(&mut self) -> Option<SensorSample> {
        self.reads += 1;
        if let Some(next) = self.script.pop_front() {
            self.last = Some(next);
        }
        self.last
    }
}

// ── Event sink with a fixed capacity ─────────────────────────

/// Accepts `capacity` events, then drops and counts the rest.
pub struct BoundedSink {
    pub events: Vec<ChannelEvent>,
    capacity: usize,
    dropped: u32,
}

impl BoundedSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            capacity,
            dropped: 0,
        }
    }
}

impl EventSink for BoundedSink {
    fn emit(&mut self, event: ChannelEvent) -> bool {
        if self.events.len() >= self.capacity {
            self.dropped += 1;
            return false;
        }
        self.events.push(event);
        true
    }

    fn dropped(&self) -> u32 {
        self.dropped
    }
}

// ── Panel rig ────────────────────────────────────────────────

pub struct Rig {
    pub cfg: SystemConfig,
    pub mqtt: MqttAdapter,
    pub bridge_http: HttpAdapter,
    pub discovery: MdnsDiscovery,
    pub thermostat_http: HttpAdapter,
    pub sensor: MockSensor,
    pub storage: NvsAdapter,
    pub system: DeviceSystem,
}

impl Rig {
    pub fn new() -> Self {
        let cfg = SystemConfig::default();
        let hostname = heapless::String::try_from("smartpanel-a1b2c3").unwrap();
        Self {
            mqtt: MqttAdapter::new(&cfg, DEVICE_ID),
            bridge_http: HttpAdapter::new(DEFAULT_TIMEOUT),
            discovery: MdnsDiscovery::new(hostname),
            thermostat_http: HttpAdapter::new(DEFAULT_TIMEOUT),
            sensor: MockSensor::silent(),
            storage: NvsAdapter::new().unwrap(),
            system: DeviceSystem::new(),
            cfg,
        }
    }

    /// Bridge answers on mDNS after `after_polls` polls.
    pub fn with_bridge(mut self, after_polls: u32) -> Self {
        self.discovery = self.discovery.with_simulated_bridge(BRIDGE_ADDR, after_polls);
        self
    }

    /// Pre-seed paired bridge credentials.
    pub fn with_stored_bridge(mut self, user: &str) -> Self {
        self.storage.write("hue", "addr", BRIDGE_ADDR.as_bytes()).unwrap();
        self.storage.write("hue", "user", user.as_bytes()).unwrap();
        self
    }

    pub fn build(self, now_ms: u64) -> Panel {
        let ports = IoPorts {
            mqtt: self.mqtt,
            bridge_http: self.bridge_http,
            discovery: self.discovery,
            thermostat_http: self.thermostat_http,
            sensor: self.sensor,
            storage: self.storage,
            system: self.system,
        };
        IoOrchestrator::new(ports, DEVICE_ID, SECRET, &self.cfg, now_ms)
    }
}

// ── Canned cloud and bridge replies ──────────────────────────

pub const GROUPS_BODY: &str = r#"{
    "1": {"name": "Kitchen", "type": "Room", "action": {"on": true, "bri": 254}},
    "3": {"name": "Living", "type": "Room", "action": {"on": false, "bri": 1}},
    "9": {"name": "All", "type": "LightGroup", "action": {"on": true, "bri": 100}}
}"#;

pub const DEVICE_CODE_BODY: &str = r#"{"device_code":"dc-42","user_code":"7BQ5ZQ","verification_uri":"https://login.tado.com/oauth2/device","verification_uri_complete":"https://login.tado.com/oauth2/device?user_code=7BQ5ZQ","expires_in":300,"interval":5}"#;

pub const TOKEN_BODY: &str = r#"{"access_token":"at-1","refresh_token":"rt-1","expires_in":600,"token_type":"Bearer"}"#;

pub const ME_BODY: &str = r#"{"homes":[{"id":1234,"name":"Home"}]}"#;

pub const ZONES_BODY: &str = r#"[
    {"id":1,"name":"Living","type":"HEATING"},
    {"id":2,"name":"Water","type":"HOT_WATER"}
]"#;

pub fn zone_state_body(current_c: f32, target_c: f32) -> String {
    format!(
        r#"{{"setting":{{"type":"HEATING","power":"ON","temperature":{{"celsius":{target_c}}}}},
            "sensorDataPoints":{{"insideTemperature":{{"celsius":{current_c}}},"humidity":{{"percentage":45.0}}}},
            "activityDataPoints":{{"heatingPower":{{"percentage":20.0}}}}}}"#
    )
}

// ── Helpers ──────────────────────────────────────────────────

/// Tick `panel` every `step_ms` from `from_ms` up to and including `to_ms`.
pub fn run(panel: &mut Panel, from_ms: u64, to_ms: u64, step_ms: u64, sink: &mut impl EventSink) {
    let mut now = from_ms;
    while now <= to_ms {
        panel.tick(now, sink);
        now += step_ms;
    }
}

pub fn command_topic() -> String {
    format!("{}/command", DEVICE_ID)
}

pub fn inject(panel: &mut Panel, payload: &str) {
    let topic = command_topic();
    assert!(panel.transport().port().inject(&topic, payload.as_bytes()));
}

/// Acks published so far, as parsed JSON.
pub fn acks(panel: &Panel) -> Vec<Value> {
    on_topic(panel.transport().port().published(), "command/ack")
}

pub fn on_topic(published: &[Published], suffix: &str) -> Vec<Value> {
    let topic = format!("{}/{}", DEVICE_ID, suffix);
    published
        .iter()
        .filter(|p| p.topic == topic)
        .map(|p| serde_json::from_slice(&p.payload).unwrap())
        .collect()
}

pub fn ack_for<'a>(acks: &'a [Value], id: &str) -> Vec<&'a Value> {
    acks.iter().filter(|a| a["id"] == id).collect()
}

pub fn statuses(events: &[ChannelEvent], kind: ServiceKind) -> Vec<(ServiceState, ErrorReason)> {
    events
        .iter()
        .filter_map(|e| match *e {
            ChannelEvent::ConnectivityStatus {
                service,
                state,
                reason,
            } if service == kind => Some((state, reason)),
            _ => None,
        })
        .collect()
}

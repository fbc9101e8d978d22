//! Publish/subscribe transport client.
//!
//! ```text
//!            connect()            CONNACK ok
//!  Disconnected ──────▶ Connecting ─────────▶ Connected
//!       ▲                  │   │                  │
//!       │   backoff delay  │   │ 3× auth reject   │ link lost
//!       └──────────────────┘   ▼                  │
//!       ▲                   Failed (until retry)  │
//!       └─────────────────────────────────────────┘
//! ```
//!
//! The client is generic over [`MqttPort`] and is polled from the I/O tick.
//! It owns the per-device topics, reconnect backoff, inbound routing and
//! parsing, and the acknowledgment outbox.  Commands are handed to the
//! orchestrator; the orchestrator answers each one through [`send_ack`].
//!
//! [`send_ack`]: TransportClient::send_ack

pub mod backoff;
pub mod commands;
pub mod pending;
pub mod topics;

use heapless::{Deque, Vec};
use log::{debug, info, warn};
use serde::Serialize;

use crate::app::events::{ChannelEvent, RoomState, SensorReading, ZoneState};
use crate::app::ports::{EventSink, MqttEvent, MqttPort};
use crate::config::SystemConfig;
use crate::error::{ErrorReason, TransportError};
use crate::fsm::{ServiceKind, ServiceState, Snapshot, StateMachine};

use backoff::Backoff;
use commands::{AckMessage, CommandEnvelope, ParseError, parse_command};
use topics::{Route, Router, Topics};

/// Give up on a CONNACK after this long and back off.
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Consecutive credential rejections before the client stops retrying.
pub const MAX_AUTH_FAILURES: u8 = 3;

/// Acks held while the link is down.
pub const OUTBOX_DEPTH: usize = 16;

/// Broker events handled per poll.
pub const MAX_EVENTS_PER_POLL: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Broker keeps refusing our credentials; waits for an explicit retry.
    Failed,
}

impl Snapshot for LinkState {
    fn snapshot(self) -> ServiceState {
        match self {
            Self::Disconnected => ServiceState::Disconnected,
            Self::Connecting => ServiceState::Authenticating,
            Self::Connected => ServiceState::Connected,
            Self::Failed => ServiceState::Error,
        }
    }
}

/// Running counters, surfaced in the status heartbeat and logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub parse_errors: u32,
    pub unrouted: u32,
    pub reconnects: u32,
    pub acks_sent: u32,
    pub acks_dropped: u32,
    pub publish_failures: u32,
}

/// What one poll produced for the orchestrator.
#[derive(Debug, Default)]
pub struct Inbound {
    pub commands: Vec<CommandEnvelope, MAX_EVENTS_PER_POLL>,
    /// The session came up during this poll.
    pub connected_now: bool,
}

/// Online heartbeat published on `{id}/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport<'a> {
    pub online: bool,
    pub version: &'a str,
    pub uptime_secs: u64,
    pub mqtt: &'static str,
    pub hue: &'static str,
    pub tado: &'static str,
    pub dropped_events: u32,
    pub timed_out_commands: u32,
    pub parse_errors: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_uri: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryPayload {
    temperature: f32,
    humidity: f32,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct RoomsPayload<'a> {
    rooms: &'a [RoomState],
}

#[derive(Serialize)]
struct ZonesPayload<'a> {
    zones: &'a [ZoneState],
}

pub struct TransportClient<M: MqttPort> {
    mqtt: M,
    topics: Topics,
    router: Router,
    link: StateMachine<LinkState>,
    backoff: Backoff,
    next_attempt_at: u64,
    auth_failures: u8,
    ever_attempted: bool,
    outbox: Deque<AckMessage, OUTBOX_DEPTH>,
    stats: TransportStats,
}

impl<M: MqttPort> TransportClient<M> {
    pub fn new(mqtt: M, device_id: &str, cfg: &SystemConfig) -> Self {
        let topics = Topics::for_device(device_id);
        let router = Router::for_device(&topics);
        // Per-device jitter seed so a fleet does not reconnect in lockstep.
        let seed = device_id
            .bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
        Self {
            mqtt,
            topics,
            router,
            link: StateMachine::new("MQTT", LinkState::Disconnected),
            backoff: Backoff::new(
                cfg.reconnect_initial_ms,
                cfg.reconnect_max_ms,
                cfg.reconnect_jitter_percent,
                seed,
            ),
            next_attempt_at: 0,
            auth_failures: 0,
            ever_attempted: false,
            outbox: Deque::new(),
            stats: TransportStats::default(),
        }
    }

    // ── Session ──────────────────────────────────────────────

    /// Drive the connection and drain broker events.
    pub fn poll(&mut self, now_ms: u64, sink: &mut impl EventSink) -> Inbound {
        let mut inbound = Inbound::default();

        match self.link.current() {
            LinkState::Disconnected if now_ms >= self.next_attempt_at => {
                self.start_connect(now_ms, sink);
            }
            LinkState::Connecting if self.link.time_in_state(now_ms) >= CONNECT_TIMEOUT_MS => {
                warn!("MQTT: no CONNACK within {} ms", CONNECT_TIMEOUT_MS);
                self.mqtt.disconnect();
                self.schedule_reconnect(now_ms, ErrorReason::None, sink);
            }
            _ => {}
        }

        for _ in 0..MAX_EVENTS_PER_POLL {
            let Some(event) = self.mqtt.poll_event() else {
                break;
            };
            match event {
                MqttEvent::Connected => {
                    if self.on_connected(now_ms, sink) {
                        inbound.connected_now = true;
                    }
                }
                MqttEvent::Disconnected => {
                    if matches!(
                        self.link.current(),
                        LinkState::Connected | LinkState::Connecting
                    ) {
                        info!("MQTT: link lost");
                        self.schedule_reconnect(now_ms, ErrorReason::None, sink);
                    }
                }
                MqttEvent::AuthRejected => self.on_auth_rejected(now_ms, sink),
                MqttEvent::Message { topic, payload } => {
                    if let Some(cmd) = self.on_message(&topic, &payload) {
                        // Bounded by MAX_EVENTS_PER_POLL.
                        let _ = inbound.commands.push(cmd);
                    }
                }
            }
        }
        inbound
    }

    /// Leave `Failed` and try the broker again immediately.
    pub fn retry(&mut self, now_ms: u64, sink: &mut impl EventSink) {
        if self.link.is_in_state(LinkState::Connected) {
            return;
        }
        self.auth_failures = 0;
        self.backoff.reset();
        self.next_attempt_at = now_ms;
        if !self.link.is_in_state(LinkState::Disconnected) {
            self.mqtt.disconnect();
            self.set_link(LinkState::Disconnected, "retry", ErrorReason::None, now_ms, sink);
        }
    }

    fn start_connect(&mut self, now_ms: u64, sink: &mut impl EventSink) {
        if self.ever_attempted {
            self.stats.reconnects = self.stats.reconnects.wrapping_add(1);
        }
        self.ever_attempted = true;
        match self.mqtt.connect() {
            Ok(()) => {
                debug!("MQTT: connecting (attempt {})", self.backoff.attempt() + 1);
                self.set_link(LinkState::Connecting, "connect", ErrorReason::None, now_ms, sink);
            }
            Err(e) => {
                warn!("MQTT: connect failed: {}", e);
                self.schedule_reconnect(now_ms, ErrorReason::None, sink);
            }
        }
    }

    fn on_connected(&mut self, now_ms: u64, sink: &mut impl EventSink) -> bool {
        if self.link.is_in_state(LinkState::Connected) {
            return false;
        }
        self.backoff.reset();
        self.auth_failures = 0;
        for filter in self.router.filters() {
            if let Err(e) = self.mqtt.subscribe(filter) {
                warn!("MQTT: subscribe {} failed: {}", filter, e);
            }
        }
        self.set_link(LinkState::Connected, "connack", ErrorReason::None, now_ms, sink);
        self.flush_outbox();
        true
    }

    fn on_auth_rejected(&mut self, now_ms: u64, sink: &mut impl EventSink) {
        self.auth_failures = self.auth_failures.saturating_add(1);
        warn!(
            "MQTT: broker rejected credentials ({}/{})",
            self.auth_failures, MAX_AUTH_FAILURES
        );
        if self.auth_failures >= MAX_AUTH_FAILURES {
            self.mqtt.disconnect();
            self.set_link(
                LinkState::Failed,
                "auth rejected",
                ErrorReason::BrokerAuthRejected,
                now_ms,
                sink,
            );
        } else {
            self.schedule_reconnect(now_ms, ErrorReason::BrokerAuthRejected, sink);
        }
    }

    fn schedule_reconnect(&mut self, now_ms: u64, reason: ErrorReason, sink: &mut impl EventSink) {
        let delay = self.backoff.next_delay();
        self.next_attempt_at = now_ms + u64::from(delay);
        info!("MQTT: retrying in {} ms", delay);
        self.set_link(LinkState::Disconnected, "backoff", reason, now_ms, sink);
    }

    fn set_link(
        &mut self,
        next: LinkState,
        why: &'static str,
        reason: ErrorReason,
        now_ms: u64,
        sink: &mut impl EventSink,
    ) {
        let before = self.link.snapshot();
        self.link.transition(next, why, now_ms);
        if before != self.link.snapshot() || reason != ErrorReason::None {
            sink.emit(ChannelEvent::status(
                ServiceKind::Transport,
                self.link.snapshot(),
                reason,
            ));
        }
    }

    // ── Inbound ──────────────────────────────────────────────

    fn on_message(&mut self, topic: &str, payload: &[u8]) -> Option<CommandEnvelope> {
        match self.router.route(topic) {
            Some(Route::Command) => match parse_command(payload) {
                Ok(cmd) => {
                    debug!("MQTT: command {} ({})", cmd.id, cmd.command.kind().as_str());
                    Some(cmd)
                }
                Err(e) => {
                    self.stats.parse_errors = self.stats.parse_errors.wrapping_add(1);
                    warn!("MQTT: rejected command on {}: {:?}", topic, e.error);
                    if let Some(id) = e.id {
                        let reason = match e.error {
                            ParseError::TooLarge => ErrorReason::Rejected,
                            _ => ErrorReason::InvalidCommand,
                        };
                        self.send_ack(AckMessage::failed(id, reason));
                    }
                    None
                }
            },
            None => {
                self.stats.unrouted = self.stats.unrouted.wrapping_add(1);
                debug!("MQTT: unrouted topic {}", topic);
                None
            }
        }
    }

    // ── Outbound ─────────────────────────────────────────────

    /// Publish an acknowledgment, or hold it until the link is back.
    pub fn send_ack(&mut self, ack: AckMessage) {
        if self.is_connected() && self.outbox.is_empty() && self.publish_ack(&ack) {
            return;
        }
        if self.outbox.is_full() {
            let _ = self.outbox.pop_front();
            self.stats.acks_dropped = self.stats.acks_dropped.wrapping_add(1);
            warn!("MQTT: ack outbox full, oldest dropped");
        }
        let _ = self.outbox.push_back(ack);
        if self.is_connected() {
            self.flush_outbox();
        }
    }

    fn publish_ack(&mut self, ack: &AckMessage) -> bool {
        let payload = ack.to_json();
        match self
            .mqtt
            .publish(self.topics.command_ack.as_str(), &payload, false)
        {
            Ok(()) => {
                self.stats.acks_sent = self.stats.acks_sent.wrapping_add(1);
                true
            }
            Err(e) => {
                self.stats.publish_failures = self.stats.publish_failures.wrapping_add(1);
                warn!("MQTT: ack {} not published: {}", ack.id, e);
                false
            }
        }
    }

    fn flush_outbox(&mut self) {
        while let Some(ack) = self.outbox.front().copied() {
            if !self.publish_ack(&ack) {
                break;
            }
            let _ = self.outbox.pop_front();
        }
    }

    pub fn publish_telemetry(&mut self, reading: &SensorReading, uptime_secs: u64) -> bool {
        let payload = TelemetryPayload {
            temperature: reading.temperature_c,
            humidity: reading.humidity_pct,
            uptime_secs,
        };
        let topic = self.topics.telemetry.clone();
        self.publish_json(&topic, &payload, false)
    }

    pub fn publish_status(&mut self, report: &StatusReport<'_>) -> bool {
        let topic = self.topics.status.clone();
        self.publish_json(&topic, report, true)
    }

    pub fn publish_room_state(&mut self, rooms: &[RoomState]) -> bool {
        let topic = self.topics.hue_state.clone();
        self.publish_json(&topic, &RoomsPayload { rooms }, true)
    }

    pub fn publish_zone_state(&mut self, zones: &[ZoneState]) -> bool {
        let topic = self.topics.tado_state.clone();
        self.publish_json(&topic, &ZonesPayload { zones }, true)
    }

    fn publish_json<T: Serialize>(&mut self, topic: &str, value: &T, retain: bool) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Ok(payload) = serde_json::to_vec(value) else {
            return false;
        };
        match self.mqtt.publish(topic, &payload, retain) {
            Ok(()) => true,
            Err(TransportError::NotConnected) => false,
            Err(e) => {
                self.stats.publish_failures = self.stats.publish_failures.wrapping_add(1);
                warn!("MQTT: publish {} failed: {}", topic, e);
                false
            }
        }
    }

    // ── Accessors ────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.link.is_in_state(LinkState::Connected)
    }

    pub fn link(&self) -> LinkState {
        self.link.current()
    }

    pub fn snapshot(&self) -> ServiceState {
        self.link.snapshot()
    }

    pub fn next_attempt_at(&self) -> u64 {
        self.next_attempt_at
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn port(&self) -> &M {
        &self.mqtt
    }

    pub fn port_mut(&mut self) -> &mut M {
        &mut self.mqtt
    }
}

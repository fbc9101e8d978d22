//! I/O orchestrator: owns every I/O-side service and runs them on one
//! cooperative tick.
//!
//! ```text
//!  MqttPort ──▶ TransportClient ──commands──▶ ┌──────────────────┐
//!                      ▲                      │  IoOrchestrator  │──▶ EventSink
//!                      └────────acks───────── │  tracker · limit │
//!  HttpPort/Discovery ──▶ BridgeService ◀────▶│                  │◀── UserIntent
//!  HttpPort ───────────▶ ThermostatService ◀─▶│                  │
//!  SensorPort ─────────────────────────────▶  └──────────────────┘
//! ```
//!
//! Every inbound command is registered with the [`CommandTracker`] before it
//! is handed to a service, and every tracker completion turns into exactly
//! one acknowledgment (plus one per duplicate delivered while in flight).
//! Commands issued from the panel UI take the same path with a local id and
//! are answered on the channel only.

use core::fmt::Write;
use core::time::Duration;

use burster::Limiter;
use log::{debug, info, warn};

use crate::bridge::{BridgeOutput, BridgeService, RoomAction};
use crate::config::SystemConfig;
use crate::error::ErrorReason;
use crate::fsm::{ServiceKind, ServiceState};
use crate::thermostat::{Submitted, ThermostatOutput, ThermostatService, ZoneAction};
use crate::transport::commands::{AckMessage, Command, FirmwareUrl};
use crate::transport::pending::{CommandOrigin, CommandTracker, Completion, Registration};
use crate::transport::{StatusReport, TransportClient};

use super::events::{ChannelEvent, CommandAck, CommandId, SensorReading};
use super::intents::UserIntent;
use super::ports::{DiscoveryPort, EventSink, HttpPort, MqttPort, SensorPort, StoragePort, SystemPort};

/// The driven adapters the orchestrator is built from.
pub struct IoPorts<M, HB, D, HT, S, St, Sy> {
    pub mqtt: M,
    pub bridge_http: HB,
    pub discovery: D,
    pub thermostat_http: HT,
    pub sensor: S,
    pub storage: St,
    pub system: Sy,
}

/// Device action acknowledged on one tick and carried out on the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SystemAction {
    Reboot,
    FirmwareUpdate(FirmwareUrl),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub rate_limited: u32,
    pub duplicates: u32,
    pub local_commands: u32,
    pub sensor_misses: u32,
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    sensor_ms: u64,
    telemetry_ms: u64,
    heartbeat_ms: u64,
}

pub struct IoOrchestrator<M, HB, D, HT, S, St, Sy>
where
    M: MqttPort,
    HB: HttpPort,
    D: DiscoveryPort,
    HT: HttpPort,
    S: SensorPort,
    St: StoragePort,
    Sy: SystemPort,
{
    transport: TransportClient<M>,
    bridge: BridgeService<HB, D>,
    thermostat: ThermostatService<HT>,
    tracker: CommandTracker,
    limiter: burster::TokenBucket<fn() -> Duration>,
    sensor: S,
    storage: St,
    system: Sy,
    deferred: Option<SystemAction>,
    last_reading: Option<SensorReading>,
    next_sensor_at: u64,
    next_telemetry_at: u64,
    next_heartbeat_at: u64,
    next_local_id: u32,
    timing: Timing,
    stats: OrchestratorStats,
}

impl<M, HB, D, HT, S, St, Sy> IoOrchestrator<M, HB, D, HT, S, St, Sy>
where
    M: MqttPort,
    HB: HttpPort,
    D: DiscoveryPort,
    HT: HttpPort,
    S: SensorPort,
    St: StoragePort,
    Sy: SystemPort,
{
    /// Build every service.  `device_secret` keys the token vault.
    pub fn new(
        ports: IoPorts<M, HB, D, HT, S, St, Sy>,
        device_id: &str,
        device_secret: &[u8],
        cfg: &SystemConfig,
        now_ms: u64,
    ) -> Self {
        let IoPorts {
            mqtt,
            bridge_http,
            discovery,
            thermostat_http,
            sensor,
            mut storage,
            system,
        } = ports;

        let transport = TransportClient::new(mqtt, device_id, cfg);
        let bridge = BridgeService::new(bridge_http, discovery, device_id, cfg, &storage);
        let thermostat = ThermostatService::new(thermostat_http, cfg, device_secret, &mut storage, now_ms);
        info!("I/O orchestrator ready for {}", device_id);

        Self {
            transport,
            bridge,
            thermostat,
            tracker: CommandTracker::new(cfg.command_timeout_ms, cfg.command_retention_ms),
            limiter: burster::TokenBucket::new_with_time_provider(
                10,
                10, // 10 remote commands per second, 10 burst capacity
                platform_now as fn() -> Duration,
            ),
            sensor,
            storage,
            system,
            deferred: None,
            last_reading: None,
            next_sensor_at: now_ms,
            next_telemetry_at: now_ms,
            next_heartbeat_at: now_ms,
            next_local_id: 1,
            timing: Timing {
                sensor_ms: u64::from(cfg.sensor_read_interval_ms),
                telemetry_ms: u64::from(cfg.telemetry_interval_secs) * 1000,
                heartbeat_ms: u64::from(cfg.heartbeat_interval_secs) * 1000,
            },
            stats: OrchestratorStats::default(),
        }
    }

    // ── Per-tick orchestration ────────────────────────────────

    /// One cooperative pass over every service.  Each service does at most
    /// one blocking round trip per call, so a tick stays short.
    pub fn tick(&mut self, now_ms: u64, sink: &mut impl EventSink) {
        // 1. Device actions acknowledged on the previous tick
        if let Some(action) = self.deferred.take() {
            self.run_system_action(action);
        }

        // 2. Broker session and inbound commands
        let inbound = self.transport.poll(now_ms, sink);
        for envelope in inbound.commands {
            self.accept(envelope.id, CommandOrigin::Remote, envelope.command, now_ms, sink);
        }

        // 3. Services
        let out = self.bridge.poll(now_ms, &mut self.storage, sink);
        self.settle_bridge(out, now_ms, sink);
        let out = self.thermostat.poll(now_ms, &mut self.storage, sink);
        self.settle_thermostat(out, now_ms, sink);

        // 4. Overdue commands
        for completion in self.tracker.sweep(now_ms) {
            self.deliver(completion, sink);
        }

        // 5. Local sensor and telemetry
        if now_ms >= self.next_sensor_at {
            self.next_sensor_at = now_ms + self.timing.sensor_ms;
            self.sample_sensor(now_ms, sink);
        }

        // 6. Heartbeat and retained state on (re)connect
        if inbound.connected_now {
            self.transport.publish_room_state(self.bridge.rooms());
            self.transport.publish_zone_state(self.thermostat.zones());
        }
        if self.transport.is_connected() && (inbound.connected_now || now_ms >= self.next_heartbeat_at) {
            self.next_heartbeat_at = now_ms + self.timing.heartbeat_ms;
            self.publish_heartbeat(now_ms, sink.dropped());
        }
    }

    /// Apply one intent from the presentation context.  Room and zone
    /// changes return the local id their [`CommandAck`] will carry.
    pub fn handle_intent(
        &mut self,
        intent: UserIntent,
        now_ms: u64,
        sink: &mut impl EventSink,
    ) -> Option<CommandId> {
        debug!("Intent: {:?}", intent);
        let command = match intent {
            UserIntent::PairBridge => {
                let out = self.bridge.pair(now_ms, &mut self.storage, sink);
                self.settle_bridge(out, now_ms, sink);
                return None;
            }
            UserIntent::ConnectThermostat => {
                let out = self.thermostat.connect(now_ms, sink);
                self.settle_thermostat(out, now_ms, sink);
                return None;
            }
            UserIntent::Cancel(ServiceKind::Bridge) => {
                let out = self.bridge.cancel(now_ms, sink);
                self.settle_bridge(out, now_ms, sink);
                return None;
            }
            UserIntent::Cancel(ServiceKind::Thermostat) => {
                let out = self.thermostat.cancel(now_ms, sink);
                self.settle_thermostat(out, now_ms, sink);
                return None;
            }
            UserIntent::Cancel(ServiceKind::Transport) => {
                debug!("Intent: broker has no wait to cancel");
                return None;
            }
            UserIntent::ReconnectBroker => {
                self.transport.retry(now_ms, sink);
                return None;
            }
            UserIntent::SetRoom {
                room_id,
                on,
                brightness_pct,
            } => Command::LightRoomSet {
                room_id,
                on,
                brightness_pct,
            },
            UserIntent::SetZoneTemperature { zone_id, target_c } => {
                Command::ThermostatSetTemperature { zone_id, target_c }
            }
            UserIntent::SetAutoAdjust {
                zone_id,
                enabled,
                target_c,
            } => Command::ThermostatSetAutoAdjust {
                zone_id,
                enabled,
                target_c,
                hysteresis_c: None,
            },
        };

        let id = self.local_id();
        self.stats.local_commands = self.stats.local_commands.wrapping_add(1);
        self.accept(id, CommandOrigin::Local, command, now_ms, sink);
        Some(id)
    }

    // ── Command path ─────────────────────────────────────────

    fn accept(
        &mut self,
        id: CommandId,
        origin: CommandOrigin,
        command: Command,
        now_ms: u64,
        sink: &mut impl EventSink,
    ) {
        if origin == CommandOrigin::Remote && self.limiter.try_consume(1).is_err() {
            self.stats.rate_limited = self.stats.rate_limited.wrapping_add(1);
            warn!("Cmd: {} rate limited", id);
            self.answer(id, origin, false, ErrorReason::RateLimited, 0, sink);
            return;
        }

        match self.tracker.register(id, origin, command, now_ms) {
            Registration::Accepted(seq) => self.dispatch(seq, command, now_ms, sink),
            Registration::Replay { success, reason } => {
                self.stats.duplicates = self.stats.duplicates.wrapping_add(1);
                info!("Cmd: {} already handled, replaying outcome", id);
                self.answer(id, origin, success, reason, 0, sink);
            }
            Registration::InFlight => {
                self.stats.duplicates = self.stats.duplicates.wrapping_add(1);
            }
            Registration::Full => self.answer(id, origin, false, ErrorReason::Rejected, 0, sink),
        }
    }

    fn dispatch(&mut self, seq: u32, command: Command, now_ms: u64, sink: &mut impl EventSink) {
        // Ok(true): finished here.  Ok(false): a service will report back.
        let outcome: Result<bool, ErrorReason> = match command {
            Command::LightRoomSet {
                room_id,
                on,
                brightness_pct,
            } => self
                .bridge
                .submit(
                    seq,
                    RoomAction {
                        room_id,
                        on,
                        brightness_pct,
                    },
                    now_ms,
                )
                .map(|()| false)
                .map_err(ErrorReason::from),
            Command::ThermostatSetTemperature { zone_id, target_c } => {
                self.submit_zone(seq, ZoneAction::SetTemperature { zone_id, target_c }, now_ms, sink)
            }
            Command::ThermostatSetAutoAdjust {
                zone_id,
                enabled,
                target_c,
                hysteresis_c,
            } => self.submit_zone(
                seq,
                ZoneAction::SetAutoAdjust {
                    zone_id,
                    enabled,
                    target_c,
                    hysteresis_c,
                },
                now_ms,
                sink,
            ),
            Command::ThermostatSyncMapping(mapping) => {
                self.submit_zone(seq, ZoneAction::SyncMapping(mapping), now_ms, sink)
            }
            Command::DeviceReboot => {
                self.deferred = Some(SystemAction::Reboot);
                Ok(true)
            }
            Command::DeviceFirmwareUpdate { url } => {
                self.deferred = Some(SystemAction::FirmwareUpdate(url));
                Ok(true)
            }
        };

        let completion = match outcome {
            Ok(done) => {
                self.tracker.mark_sent(seq, now_ms);
                if done {
                    self.tracker.acknowledge(seq, now_ms)
                } else {
                    None
                }
            }
            Err(reason) => self.tracker.fail(seq, reason, now_ms),
        };
        if let Some(c) = completion {
            self.deliver(c, sink);
        }
    }

    fn submit_zone(
        &mut self,
        seq: u32,
        action: ZoneAction,
        now_ms: u64,
        sink: &mut impl EventSink,
    ) -> Result<bool, ErrorReason> {
        self.thermostat
            .submit(seq, action, now_ms, &mut self.storage, sink)
            .map(|s| s == Submitted::Done)
            .map_err(ErrorReason::from)
    }

    fn settle_bridge(&mut self, out: BridgeOutput, now_ms: u64, sink: &mut impl EventSink) {
        for (seq, result) in out.completions {
            self.settle(seq, result.map_err(ErrorReason::from), now_ms, sink);
        }
        if out.rooms_changed {
            self.transport.publish_room_state(self.bridge.rooms());
        }
    }

    fn settle_thermostat(&mut self, out: ThermostatOutput, now_ms: u64, sink: &mut impl EventSink) {
        for (seq, result) in out.completions {
            self.settle(seq, result.map_err(ErrorReason::from), now_ms, sink);
        }
        if out.zones_changed {
            self.transport.publish_zone_state(self.thermostat.zones());
        }
    }

    fn settle(&mut self, seq: u32, result: Result<(), ErrorReason>, now_ms: u64, sink: &mut impl EventSink) {
        let completion = match result {
            Ok(()) => self.tracker.acknowledge(seq, now_ms),
            Err(reason) => self.tracker.fail(seq, reason, now_ms),
        };
        // None: the command already timed out and was answered then.
        if let Some(c) = completion {
            self.deliver(c, sink);
        }
    }

    fn deliver(&mut self, c: Completion, sink: &mut impl EventSink) {
        if c.success {
            debug!("Cmd: {} ({}) done", c.id, c.command.kind().as_str());
        } else {
            info!("Cmd: {} ({}) failed: {}", c.id, c.command.kind().as_str(), c.reason);
        }
        self.answer(c.id, c.origin, c.success, c.reason, c.replays, sink);
    }

    /// Remote commands get one broker ack per delivery received; every
    /// outcome is also mirrored to the panel.
    fn answer(
        &mut self,
        id: CommandId,
        origin: CommandOrigin,
        success: bool,
        reason: ErrorReason,
        replays: u8,
        sink: &mut impl EventSink,
    ) {
        if origin == CommandOrigin::Remote {
            let ack = if success {
                AckMessage::ok(id)
            } else {
                AckMessage::failed(id, reason)
            };
            for _ in 0..=replays {
                self.transport.send_ack(ack);
            }
        }
        sink.emit(ChannelEvent::CommandAck(CommandAck {
            request_id: id,
            success,
            reason,
        }));
    }

    fn local_id(&mut self) -> CommandId {
        let mut id = CommandId::new();
        let _ = write!(id, "local-{}", self.next_local_id);
        self.next_local_id = self.next_local_id.wrapping_add(1);
        id
    }

    fn run_system_action(&mut self, action: SystemAction) {
        match action {
            SystemAction::Reboot => {
                info!("System: rebooting on remote request");
                self.system.reboot();
            }
            SystemAction::FirmwareUpdate(url) => {
                info!("System: firmware update from {}", url);
                if let Err(reason) = self.system.update_firmware(url.as_str()) {
                    warn!("System: firmware update failed: {}", reason);
                }
            }
        }
    }

    // ── Sensor, telemetry, heartbeat ─────────────────────────

    fn sample_sensor(&mut self, now_ms: u64, sink: &mut impl EventSink) {
        let Some(sample) = self.sensor.read() else {
            self.stats.sensor_misses = self.stats.sensor_misses.wrapping_add(1);
            debug!("Sensor: no reading");
            return;
        };
        let reading = SensorReading {
            temperature_c: sample.temperature_c,
            humidity_pct: sample.humidity_pct,
            at_ms: now_ms,
        };
        self.last_reading = Some(reading);
        self.thermostat.observe_local(reading.temperature_c, now_ms);
        sink.emit(ChannelEvent::SensorReading(reading));

        if now_ms >= self.next_telemetry_at && self.transport.publish_telemetry(&reading, now_ms / 1000) {
            self.next_telemetry_at = now_ms + self.timing.telemetry_ms;
        }
    }

    fn publish_heartbeat(&mut self, now_ms: u64, dropped_events: u32) {
        let prompt = self.thermostat.pending_prompt();
        let report = StatusReport {
            online: true,
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: now_ms / 1000,
            mqtt: self.transport.snapshot().as_str(),
            hue: self.bridge.snapshot().as_str(),
            tado: self.thermostat.snapshot().as_str(),
            dropped_events,
            timed_out_commands: self.tracker.timed_out(),
            parse_errors: self.transport.stats().parse_errors,
            user_code: prompt.map(|(code, _)| code),
            verification_uri: prompt.map(|(_, uri)| uri),
        };
        if !self.transport.publish_status(&report) {
            debug!("MQTT: heartbeat not published");
        }
    }

    // ── Accessors ────────────────────────────────────────────

    pub fn service_state(&self, service: ServiceKind) -> ServiceState {
        match service {
            ServiceKind::Transport => self.transport.snapshot(),
            ServiceKind::Bridge => self.bridge.snapshot(),
            ServiceKind::Thermostat => self.thermostat.snapshot(),
        }
    }

    pub fn transport(&self) -> &TransportClient<M> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut TransportClient<M> {
        &mut self.transport
    }

    pub fn bridge(&self) -> &BridgeService<HB, D> {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut BridgeService<HB, D> {
        &mut self.bridge
    }

    pub fn thermostat(&self) -> &ThermostatService<HT> {
        &self.thermostat
    }

    pub fn thermostat_mut(&mut self) -> &mut ThermostatService<HT> {
        &mut self.thermostat
    }

    pub fn tracker(&self) -> &CommandTracker {
        &self.tracker
    }

    pub fn storage(&self) -> &St {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut St {
        &mut self.storage
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.sensor
    }

    pub fn system(&self) -> &Sy {
        &self.system
    }

    pub fn last_reading(&self) -> Option<SensorReading> {
        self.last_reading
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats
    }
}

// ── Platform-specific monotonic clock for the rate limiter ───

#[cfg(target_os = "espidf")]
fn platform_now() -> Duration {
    // SAFETY: esp_timer_get_time reads a monotonic hardware counter.
    let us = unsafe { esp_idf_sys::esp_timer_get_time() };
    Duration::from_micros(us as u64)
}

#[cfg(not(target_os = "espidf"))]
fn platform_now() -> Duration {
    use std::time::Instant;
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed()
}

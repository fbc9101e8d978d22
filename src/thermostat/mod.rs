//! Thermostat cloud integration: device-flow login, token upkeep, zone
//! polling, and the auto-adjust loop.
//!
//! ```text
//!              no tokens                       code issued
//!  Disconnected ─────────▶ RequestingCode ─────────────────▶ AwaitingApproval
//!       │ tokens                                                  │ granted
//!       ▼                     refresh failed                      ▼
//!   Refreshing ────────────────────────────▶ RequestingCode   Discovering
//!       │ ok                                                      │ home + zones
//!       └──────────────────────────────▶ Connected ◀──────────────┘
//!                                          │  ▲ 401 / near expiry
//!                                          └──┘ via Refreshing
//!  expired_token / access_denied ──▶ Error (held until "connect thermostat")
//! ```
//!
//! Zone mappings live here too.  They can be edited while the cloud side is
//! down; only overlay writes need a session.
//!
//! Every `poll` makes at most one cloud call: discovery reads the home and
//! its zone list on separate ticks, a zone pass reads one zone per tick, and
//! corrections planned at a cycle boundary are written one per tick.

pub mod api;
pub mod auth;
pub mod control;
pub mod vault;

use heapless::{Deque, Vec as HVec};
use log::{debug, info, warn};

use crate::app::events::{AutoAdjustStatus, ChannelEvent, Label, ZoneState};
use crate::app::ports::{EventSink, HttpMethod, HttpPort, HttpRequest, HttpResponse, StoragePort};
use crate::config::SystemConfig;
use crate::error::{ErrorReason, StorageError, ThermostatError};
use crate::fsm::{ServiceKind, ServiceState, Snapshot, StateMachine};

use api::{MAX_ZONES, ZoneInfo};
use auth::{AuthTokenSet, DeviceAuthorization, TokenPoll};
use control::{AutoAdjustController, MappingTable, ZoneMapping};
use vault::TokenVault;

/// Zone commands waiting for the cloud.
pub const QUEUE_DEPTH: usize = 8;

/// Delay before retrying a failed code request, refresh or discovery.
pub const RETRY_DELAY_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermostatState {
    Disconnected,
    RequestingCode,
    AwaitingApproval,
    Refreshing,
    Discovering,
    Connected,
    Error,
}

impl Snapshot for ThermostatState {
    fn snapshot(self) -> ServiceState {
        match self {
            Self::Disconnected => ServiceState::Disconnected,
            Self::RequestingCode | Self::Refreshing => ServiceState::Authenticating,
            Self::AwaitingApproval => ServiceState::AwaitingUserAction,
            Self::Discovering => ServiceState::Discovering,
            Self::Connected => ServiceState::Connected,
            Self::Error => ServiceState::Error,
        }
    }
}

/// A zone change requested by a command or the panel UI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZoneAction {
    SetTemperature {
        zone_id: u32,
        target_c: f32,
    },
    SetAutoAdjust {
        zone_id: u32,
        enabled: bool,
        target_c: f32,
        hysteresis_c: Option<f32>,
    },
    SyncMapping(ZoneMapping),
}

/// How `submit` disposed of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Applied locally; complete now.
    Done,
    /// Waiting for a cloud call; completion comes from `poll`.
    Queued,
}

pub type ActionResult = (u32, Result<(), ThermostatError>);

#[derive(Debug, Default)]
pub struct ThermostatOutput {
    pub completions: HVec<ActionResult, QUEUE_DEPTH>,
    pub zones_changed: bool,
}

#[derive(Debug, Clone, Copy)]
struct Deferred {
    seq: u32,
    zone_id: u32,
    target_c: f32,
    queued_at_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    zone_poll_ms: u64,
    refresh_margin_ms: u64,
    command_timeout_ms: u64,
    error_hold_ms: u64,
}

pub struct ThermostatService<H: HttpPort> {
    http: H,
    fsm: StateMachine<ThermostatState>,
    vault: TokenVault,
    tokens: Option<AuthTokenSet>,
    device: Option<DeviceAuthorization>,
    poll_interval_ms: u64,
    code_expires_at: u64,
    next_request_at: u64,
    /// Automatic (re)authorization is off until the next `connect`.
    suspended: bool,
    /// Reported on the first poll after a failed vault check.
    corrupted_on_boot: bool,
    home_id: Option<u32>,
    zones: HVec<ZoneInfo, MAX_ZONES>,
    states: HVec<ZoneState, MAX_ZONES>,
    next_zone_poll_at: u64,
    /// Next zone to read while a zone pass is under way.
    zone_cursor: Option<usize>,
    mappings: MappingTable,
    controller: AutoAdjustController,
    queue: Deque<Deferred, QUEUE_DEPTH>,
    /// Corrections planned at the last cycle boundary, written one per tick.
    corrections: Deque<control::Correction, MAX_ZONES>,
    /// No cloud call has succeeded since the last token grant.
    token_untried: bool,
    timing: Timing,
}

impl<H: HttpPort> ThermostatService<H> {
    /// Build the service, restoring sealed tokens and zone mappings.
    pub fn new(
        http: H,
        cfg: &SystemConfig,
        device_secret: &[u8],
        storage: &mut impl StoragePort,
        now_ms: u64,
    ) -> Self {
        let vault = TokenVault::new(device_secret);
        let (tokens, corrupted_on_boot) = match vault.load(storage, now_ms) {
            Ok(tokens) => (tokens, false),
            Err(StorageError::Corrupted) => (None, true),
            Err(e) => {
                warn!("Tado: token storage unreadable: {}", e);
                (None, false)
            }
        };
        Self {
            http,
            fsm: StateMachine::new("Tado", ThermostatState::Disconnected),
            vault,
            tokens,
            device: None,
            poll_interval_ms: 5_000,
            code_expires_at: 0,
            next_request_at: 0,
            suspended: false,
            corrupted_on_boot,
            home_id: None,
            zones: HVec::new(),
            states: HVec::new(),
            next_zone_poll_at: 0,
            zone_cursor: None,
            mappings: MappingTable::load(storage),
            controller: AutoAdjustController::new(
                cfg.control_cycle_ms,
                cfg.auto_adjust_step_c,
                cfg.local_zone_id,
            ),
            queue: Deque::new(),
            corrections: Deque::new(),
            token_untried: false,
            timing: Timing {
                zone_poll_ms: u64::from(cfg.zone_poll_ms),
                refresh_margin_ms: u64::from(cfg.token_refresh_margin_secs) * 1000,
                command_timeout_ms: u64::from(cfg.command_timeout_ms),
                error_hold_ms: u64::from(cfg.service_error_hold_ms),
            },
        }
    }

    // ── User-facing operations ───────────────────────────────

    /// Start or restart authorization.  No-op while connected.
    pub fn connect(&mut self, now_ms: u64, sink: &mut impl EventSink) -> ThermostatOutput {
        let mut out = ThermostatOutput::default();
        self.suspended = false;
        match self.fsm.current() {
            ThermostatState::Connected | ThermostatState::Refreshing | ThermostatState::Discovering => {}
            _ => self.begin_auth(now_ms, sink, &mut out),
        }
        out
    }

    /// Abort a pending device-flow wait (or any other unfinished login).
    pub fn cancel(&mut self, now_ms: u64, sink: &mut impl EventSink) -> ThermostatOutput {
        let mut out = ThermostatOutput::default();
        match self.fsm.current() {
            ThermostatState::RequestingCode
            | ThermostatState::AwaitingApproval
            | ThermostatState::Refreshing
            | ThermostatState::Discovering => {
                self.device = None;
                self.suspended = true;
                self.enter(ThermostatState::Disconnected, "cancelled", ErrorReason::Cancelled, now_ms, sink, &mut out);
            }
            other => debug!("Tado: nothing to cancel in {:?}", other),
        }
        out
    }

    /// Hand over a zone action.  Mapping edits apply immediately; setpoint
    /// writes need a session (or one being refreshed).
    pub fn submit(
        &mut self,
        seq: u32,
        action: ZoneAction,
        now_ms: u64,
        storage: &mut impl StoragePort,
        sink: &mut impl EventSink,
    ) -> Result<Submitted, ThermostatError> {
        match action {
            ZoneAction::SetTemperature { zone_id, target_c } => {
                if !control::OVERLAY_RANGE.contains(&target_c) {
                    return Err(ThermostatError::InvalidSetpoint);
                }
                match self.fsm.current() {
                    ThermostatState::Connected if !self.zone_known(zone_id) => {
                        Err(ThermostatError::UnknownZone)
                    }
                    ThermostatState::Connected | ThermostatState::Refreshing => {
                        self.queue
                            .push_back(Deferred {
                                seq,
                                zone_id,
                                target_c,
                                queued_at_ms: now_ms,
                            })
                            .map_err(|_| ThermostatError::Busy)?;
                        if let Some(m) = self.mappings.get_mut(zone_id) {
                            if control::MAPPING_TARGET_RANGE.contains(&target_c) {
                                m.target_c = target_c;
                            }
                            self.save_mappings(storage);
                        }
                        Ok(Submitted::Queued)
                    }
                    _ => Err(ThermostatError::NotConnected),
                }
            }
            ZoneAction::SetAutoAdjust {
                zone_id,
                enabled,
                target_c,
                hysteresis_c,
            } => {
                let existing = self.mappings.get(zone_id).copied();
                let name = existing
                    .map(|m| m.zone_name)
                    .or_else(|| self.zone_name(zone_id))
                    .unwrap_or_default();
                let hysteresis = hysteresis_c
                    .or(existing.map(|m| m.hysteresis_c))
                    .unwrap_or(control::DEFAULT_HYSTERESIS_C);
                let mapping = ZoneMapping::new(zone_id, name.as_str(), target_c, enabled, hysteresis)?;
                self.upsert_mapping(mapping, storage, sink)?;
                Ok(Submitted::Done)
            }
            ZoneAction::SyncMapping(mapping) => {
                self.upsert_mapping(mapping, storage, sink)?;
                Ok(Submitted::Done)
            }
        }
    }

    /// Feed a reading from the panel's own sensor into the controller.
    pub fn observe_local(&mut self, temperature_c: f32, now_ms: u64) {
        self.controller.observe_local(temperature_c, now_ms);
    }

    // ── Tick ─────────────────────────────────────────────────

    pub fn poll(
        &mut self,
        now_ms: u64,
        storage: &mut impl StoragePort,
        sink: &mut impl EventSink,
    ) -> ThermostatOutput {
        let mut out = ThermostatOutput::default();
        self.expire_deferred(now_ms);

        if self.corrupted_on_boot {
            self.corrupted_on_boot = false;
            sink.emit(ChannelEvent::status(
                ServiceKind::Thermostat,
                self.fsm.snapshot(),
                ErrorReason::CredentialsCorrupted,
            ));
        }

        match self.fsm.current() {
            ThermostatState::Disconnected => {
                if !self.suspended {
                    self.begin_auth(now_ms, sink, &mut out);
                }
            }
            ThermostatState::RequestingCode => self.poll_request_code(now_ms, sink, &mut out),
            ThermostatState::AwaitingApproval => self.poll_approval(now_ms, storage, sink, &mut out),
            ThermostatState::Refreshing => self.poll_refresh(now_ms, storage, sink, &mut out),
            ThermostatState::Discovering => self.poll_discovery(now_ms, sink, &mut out),
            ThermostatState::Connected => self.poll_connected(now_ms, sink, &mut out),
            ThermostatState::Error => {
                if self.fsm.time_in_state(now_ms) >= self.timing.error_hold_ms {
                    self.enter(ThermostatState::Disconnected, "error hold elapsed", ErrorReason::None, now_ms, sink, &mut out);
                }
            }
        }
        out
    }

    fn begin_auth(&mut self, now_ms: u64, sink: &mut impl EventSink, out: &mut ThermostatOutput) {
        self.next_request_at = now_ms;
        if self.tokens.is_some() {
            self.enter(ThermostatState::Refreshing, "stored tokens", ErrorReason::None, now_ms, sink, out);
        } else {
            self.enter(ThermostatState::RequestingCode, "device flow", ErrorReason::None, now_ms, sink, out);
        }
    }

    fn poll_request_code(&mut self, now_ms: u64, sink: &mut impl EventSink, out: &mut ThermostatOutput) {
        if now_ms < self.next_request_at {
            return;
        }
        let body = auth::device_authorize_body();
        let result = self
            .http
            .send(&HttpRequest::form(auth::DEVICE_AUTHORIZE_URL, &body))
            .map_err(ThermostatError::from)
            .and_then(|resp| {
                api::check_status(&resp)?;
                auth::parse_device_authorization(&resp.body)
            });
        match result {
            Ok(grant) => {
                info!(
                    "Tado: visit {} and enter code {}",
                    grant.verification_uri, grant.user_code
                );
                self.poll_interval_ms = u64::from(grant.interval_secs) * 1000;
                self.code_expires_at = now_ms + u64::from(grant.expires_in_secs) * 1000;
                self.next_request_at = now_ms + self.poll_interval_ms;
                sink.emit(ChannelEvent::AuthPrompt {
                    user_code: grant.user_code,
                    verification_uri: grant.verification_uri,
                });
                self.device = Some(grant);
                self.enter(ThermostatState::AwaitingApproval, "code issued", ErrorReason::None, now_ms, sink, out);
            }
            Err(e) => {
                warn!("Tado: device code request failed: {}", e);
                self.next_request_at = now_ms + RETRY_DELAY_MS;
            }
        }
    }

    fn poll_approval(
        &mut self,
        now_ms: u64,
        storage: &mut impl StoragePort,
        sink: &mut impl EventSink,
        out: &mut ThermostatOutput,
    ) {
        if now_ms >= self.code_expires_at {
            self.give_up(ErrorReason::DeviceCodeExpired, now_ms, sink, out);
            return;
        }
        if now_ms < self.next_request_at {
            return;
        }
        self.next_request_at = now_ms + self.poll_interval_ms;
        let Some(device) = &self.device else {
            self.begin_auth(now_ms, sink, out);
            return;
        };
        let body = auth::device_token_body(&device.device_code);
        let resp = match self.http.send(&HttpRequest::form(auth::TOKEN_URL, &body)) {
            Ok(resp) => resp,
            Err(e) => {
                debug!("Tado: token poll failed: {}", e);
                return;
            }
        };
        match auth::parse_token_response(resp.status, &resp.body, now_ms, None) {
            TokenPoll::Granted(tokens) => {
                info!("Tado: device authorized");
                self.device = None;
                self.next_request_at = now_ms;
                self.home_id = None;
                self.install_tokens(tokens, storage);
                self.enter(ThermostatState::Discovering, "authorized", ErrorReason::None, now_ms, sink, out);
            }
            TokenPoll::Pending => debug!("Tado: authorization pending"),
            TokenPoll::SlowDown => {
                self.poll_interval_ms += u64::from(auth::SLOW_DOWN_STEP_SECS) * 1000;
                self.next_request_at = now_ms + self.poll_interval_ms;
                info!("Tado: slowing poll to {} ms", self.poll_interval_ms);
            }
            TokenPoll::Expired => self.give_up(ErrorReason::DeviceCodeExpired, now_ms, sink, out),
            TokenPoll::Denied => self.give_up(ErrorReason::AccessDenied, now_ms, sink, out),
            TokenPoll::Failed => self.give_up(ErrorReason::Rejected, now_ms, sink, out),
        }
    }

    fn poll_refresh(
        &mut self,
        now_ms: u64,
        storage: &mut impl StoragePort,
        sink: &mut impl EventSink,
        out: &mut ThermostatOutput,
    ) {
        if now_ms < self.next_request_at {
            return;
        }
        let Some(refresh) = self.tokens.as_ref().map(|t| t.refresh_token.clone()) else {
            self.begin_auth(now_ms, sink, out);
            return;
        };
        let body = auth::refresh_body(&refresh);
        let resp = match self.http.send(&HttpRequest::form(auth::TOKEN_URL, &body)) {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Tado: refresh request failed: {}", e);
                self.next_request_at = now_ms + RETRY_DELAY_MS;
                return;
            }
        };
        match auth::parse_token_response(resp.status, &resp.body, now_ms, Some(&refresh)) {
            TokenPoll::Granted(tokens) => {
                debug!("Tado: access token refreshed");
                self.install_tokens(tokens, storage);
                if self.home_id.is_some() && !self.zones.is_empty() {
                    self.enter(ThermostatState::Connected, "refreshed", ErrorReason::None, now_ms, sink, out);
                } else {
                    self.enter(ThermostatState::Discovering, "refreshed", ErrorReason::None, now_ms, sink, out);
                }
            }
            _ if resp.status >= 500 => {
                warn!("Tado: token endpoint HTTP {}", resp.status);
                self.next_request_at = now_ms + RETRY_DELAY_MS;
            }
            _ => {
                warn!("Tado: refresh refused, re-authorizing");
                self.tokens = None;
                TokenVault::erase(storage);
                self.enter(ThermostatState::Disconnected, "refresh failed", ErrorReason::RefreshFailed, now_ms, sink, out);
                self.begin_auth(now_ms, sink, out);
            }
        }
    }

    fn poll_discovery(&mut self, now_ms: u64, sink: &mut impl EventSink, out: &mut ThermostatOutput) {
        if now_ms < self.next_request_at {
            return;
        }
        // Home lookup and zone listing run on separate ticks.
        let result = match self.home_id {
            None => self.discover_home().map(|()| false),
            Some(home_id) => self.discover_zones(home_id).map(|()| true),
        };
        match result {
            Ok(false) => self.next_request_at = now_ms,
            Ok(true) => {
                info!(
                    "Tado: home {} with {} heating zone(s)",
                    self.home_id.unwrap_or_default(),
                    self.zones.len()
                );
                self.next_zone_poll_at = now_ms;
                self.enter(ThermostatState::Connected, "home discovered", ErrorReason::None, now_ms, sink, out);
            }
            Err(ThermostatError::Unauthorized) => self.start_refresh(now_ms, sink, out),
            Err(e) => {
                warn!("Tado: home discovery failed: {}", e);
                self.next_request_at = now_ms + RETRY_DELAY_MS;
            }
        }
    }

    fn poll_connected(&mut self, now_ms: u64, sink: &mut impl EventSink, out: &mut ThermostatOutput) {
        let due = self
            .tokens
            .as_ref()
            .is_none_or(|t| t.needs_refresh(now_ms, self.timing.refresh_margin_ms));
        if due {
            self.start_refresh(now_ms, sink, out);
            return;
        }

        // At most one cloud round trip per tick keeps the I/O context responsive.
        if let Some(item) = self.queue.pop_front() {
            match self.write_overlay(item.zone_id, item.target_c) {
                Ok(()) => {
                    self.set_cached_target(item.zone_id, item.target_c, sink);
                    out.zones_changed = true;
                    let _ = out.completions.push((item.seq, Ok(())));
                }
                Err(ThermostatError::Unauthorized) => {
                    let _ = self.queue.push_front(item);
                    self.start_refresh(now_ms, sink, out);
                }
                Err(e) => {
                    let _ = out.completions.push((item.seq, Err(e)));
                }
            }
            return;
        }

        if let Some(c) = self.corrections.pop_front() {
            self.apply_correction(c, now_ms, sink, out);
            return;
        }

        if self.zone_cursor.is_some() || now_ms >= self.next_zone_poll_at {
            match self.refresh_next_zone(now_ms, sink) {
                Ok(changed) => out.zones_changed |= changed,
                Err(ThermostatError::Unauthorized) => {
                    self.start_refresh(now_ms, sink, out);
                    return;
                }
                Err(e) => warn!("Tado: zone poll failed: {}", e),
            }
        }

        // Decide on a complete zone pass; the writes follow on later ticks.
        if self.zone_cursor.is_none() && self.controller.cycle_due(now_ms) {
            self.plan_corrections(now_ms);
        }
    }

    /// Cycle boundary: at most one correction per mapped zone.
    fn plan_corrections(&mut self, now_ms: u64) {
        self.corrections.clear();
        for mapping in self.mappings.iter() {
            let Some(zone) = self.states.iter().find(|z| z.zone_id == mapping.zone_id) else {
                continue;
            };
            if let Some(c) = self.controller.decide(mapping, zone, now_ms) {
                let _ = self.corrections.push_back(c);
            }
        }
    }

    fn apply_correction(
        &mut self,
        c: control::Correction,
        now_ms: u64,
        sink: &mut impl EventSink,
        out: &mut ThermostatOutput,
    ) {
        match self.write_overlay(c.zone_id, c.new_target_c) {
            Ok(()) => {
                info!(
                    "Tado: zone {} {:?} to {:.1} (delta {:+.2})",
                    c.zone_id, c.direction, c.new_target_c, c.delta_c
                );
                self.controller.record_applied();
                self.set_cached_target(c.zone_id, c.new_target_c, sink);
                out.zones_changed = true;
                sink.emit(ChannelEvent::AutoAdjust(AutoAdjustStatus {
                    zone_id: c.zone_id,
                    direction: c.direction,
                    delta_c: c.delta_c,
                    measured_c: c.measured_c,
                    new_target_c: c.new_target_c,
                    at_ms: now_ms,
                }));
            }
            Err(ThermostatError::Unauthorized) => {
                let _ = self.corrections.push_front(c);
                self.start_refresh(now_ms, sink, out);
            }
            // Retried on the next cycle boundary.
            Err(e) => warn!("Tado: correction for zone {} failed: {}", c.zone_id, e),
        }
    }

    // ── HTTP calls ───────────────────────────────────────────

    fn authorized(
        &mut self,
        method: HttpMethod,
        url: &str,
        body: Option<&[u8]>,
    ) -> Result<HttpResponse, ThermostatError> {
        let token = self
            .tokens
            .as_ref()
            .map(|t| t.access_token.as_str())
            .ok_or(ThermostatError::Unauthorized)?;
        let request = match body {
            Some(body) => HttpRequest::json(method, url, body),
            None => HttpRequest::get(url),
        }
        .with_bearer(token);
        let resp = self.http.send(&request)?;
        api::check_status(&resp)?;
        self.token_untried = false;
        Ok(resp)
    }

    fn discover_home(&mut self) -> Result<(), ThermostatError> {
        let resp = self.authorized(HttpMethod::Get, &api::me_url(), None)?;
        self.home_id = Some(api::parse_home_id(&resp.body)?);
        Ok(())
    }

    fn discover_zones(&mut self, home_id: u32) -> Result<(), ThermostatError> {
        let resp = self.authorized(HttpMethod::Get, &api::zones_url(home_id), None)?;
        self.zones = api::parse_zones(&resp.body)?;
        self.zone_cursor = None;
        self.states.retain(|s| self.zones.iter().any(|z| z.zone_id == s.zone_id));
        Ok(())
    }

    /// Read one zone of the current pass, starting a pass when none is open.
    fn refresh_next_zone(&mut self, now_ms: u64, sink: &mut impl EventSink) -> Result<bool, ThermostatError> {
        let home_id = self.home_id.ok_or(ThermostatError::NotConnected)?;
        let index = match self.zone_cursor {
            Some(i) => i,
            None => {
                self.next_zone_poll_at = now_ms + self.timing.zone_poll_ms;
                0
            }
        };
        let Some(zone) = self.zones.get(index).copied() else {
            self.zone_cursor = None;
            return Ok(false);
        };
        self.zone_cursor = (index + 1 < self.zones.len()).then_some(index + 1);

        let resp = match self.authorized(HttpMethod::Get, &api::zone_state_url(home_id, zone.zone_id), None) {
            Ok(resp) => resp,
            Err(ThermostatError::Unauthorized) => {
                // Same zone again once the token is refreshed.
                self.zone_cursor = Some(index);
                return Err(ThermostatError::Unauthorized);
            }
            Err(e) => return Err(e),
        };
        let auto = self.mappings.get(zone.zone_id).is_some_and(|m| m.auto_adjust);
        let state = api::parse_zone_state(&resp.body, &zone, auto)?;
        Ok(self.store_state(state, sink))
    }

    fn write_overlay(&mut self, zone_id: u32, target_c: f32) -> Result<(), ThermostatError> {
        let home_id = self.home_id.ok_or(ThermostatError::NotConnected)?;
        if !self.zone_known(zone_id) {
            return Err(ThermostatError::UnknownZone);
        }
        let body = api::overlay_body(target_c);
        self.authorized(HttpMethod::Put, &api::overlay_url(home_id, zone_id), Some(&body))?;
        Ok(())
    }

    // ── State helpers ────────────────────────────────────────

    fn enter(
        &mut self,
        next: ThermostatState,
        why: &'static str,
        reason: ErrorReason,
        now_ms: u64,
        sink: &mut impl EventSink,
        out: &mut ThermostatOutput,
    ) {
        self.fsm.transition(next, why, now_ms);
        // Deferred writes survive Refreshing only.
        if !matches!(next, ThermostatState::Connected | ThermostatState::Refreshing) {
            while let Some(item) = self.queue.pop_front() {
                let _ = out.completions.push((item.seq, Err(ThermostatError::NotConnected)));
            }
            self.corrections.clear();
            self.zone_cursor = None;
        }
        sink.emit(ChannelEvent::status(ServiceKind::Thermostat, next.snapshot(), reason));
    }

    fn start_refresh(&mut self, now_ms: u64, sink: &mut impl EventSink, out: &mut ThermostatOutput) {
        if self.token_untried {
            warn!("Tado: new token rejected, refreshing again in {} ms", RETRY_DELAY_MS);
            self.next_request_at = now_ms + RETRY_DELAY_MS;
        } else {
            self.next_request_at = now_ms;
        }
        self.enter(ThermostatState::Refreshing, "token refresh", ErrorReason::None, now_ms, sink, out);
    }

    /// Device flow ended for good; wait for the user.
    fn give_up(&mut self, reason: ErrorReason, now_ms: u64, sink: &mut impl EventSink, out: &mut ThermostatOutput) {
        warn!("Tado: authorization ended: {}", reason);
        self.device = None;
        self.suspended = true;
        self.enter(ThermostatState::Error, "device flow ended", reason, now_ms, sink, out);
    }

    fn install_tokens(&mut self, tokens: AuthTokenSet, storage: &mut impl StoragePort) {
        if let Err(e) = self.vault.store(storage, &tokens) {
            warn!("Tado: could not persist tokens: {}", e);
        }
        self.tokens = Some(tokens);
        self.token_untried = true;
    }

    fn expire_deferred(&mut self, now_ms: u64) {
        let timeout = self.timing.command_timeout_ms;
        let before = self.queue.len();
        let mut kept: Deque<Deferred, QUEUE_DEPTH> = Deque::new();
        for d in self.queue.iter().filter(|d| now_ms.saturating_sub(d.queued_at_ms) < timeout) {
            let _ = kept.push_back(*d);
        }
        if kept.len() != before {
            debug!("Tado: dropped {} stale deferred command(s)", before - kept.len());
            self.queue = kept;
        }
    }

    fn upsert_mapping(
        &mut self,
        mapping: ZoneMapping,
        storage: &mut impl StoragePort,
        sink: &mut impl EventSink,
    ) -> Result<(), ThermostatError> {
        self.mappings.upsert(mapping)?;
        self.save_mappings(storage);
        info!(
            "Tado: zone {} mapped to {:.1} (auto={}, h={:.2})",
            mapping.zone_id, mapping.target_c, mapping.auto_adjust, mapping.hysteresis_c
        );
        if let Some(state) = self.states.iter_mut().find(|s| s.zone_id == mapping.zone_id) {
            if state.auto_adjust != mapping.auto_adjust {
                state.auto_adjust = mapping.auto_adjust;
                sink.emit(ChannelEvent::ThermostatZoneState(*state));
            }
        }
        Ok(())
    }

    fn save_mappings(&self, storage: &mut impl StoragePort) {
        if let Err(e) = self.mappings.save(storage) {
            warn!("Tado: could not persist zone mappings: {}", e);
        }
    }

    /// Replace the cached state; emits and returns `true` when it changed.
    fn store_state(&mut self, state: ZoneState, sink: &mut impl EventSink) -> bool {
        match self.states.iter().position(|s| s.zone_id == state.zone_id) {
            Some(i) if self.states[i] == state => return false,
            Some(i) => self.states[i] = state,
            None => {
                if self.states.push(state).is_err() {
                    return false;
                }
            }
        }
        sink.emit(ChannelEvent::ThermostatZoneState(state));
        true
    }

    fn set_cached_target(&mut self, zone_id: u32, target_c: f32, sink: &mut impl EventSink) {
        if let Some(state) = self.states.iter().find(|s| s.zone_id == zone_id).copied() {
            self.store_state(
                ZoneState {
                    target_c: Some(target_c),
                    ..state
                },
                sink,
            );
        }
    }

    fn zone_known(&self, zone_id: u32) -> bool {
        self.zones.iter().any(|z| z.zone_id == zone_id)
    }

    fn zone_name(&self, zone_id: u32) -> Option<Label> {
        self.zones.iter().find(|z| z.zone_id == zone_id).map(|z| z.name)
    }

    // ── Accessors ────────────────────────────────────────────

    pub fn state(&self) -> ThermostatState {
        self.fsm.current()
    }

    pub fn snapshot(&self) -> ServiceState {
        self.fsm.snapshot()
    }

    pub fn zones(&self) -> &[ZoneState] {
        &self.states
    }

    pub fn mappings(&self) -> &MappingTable {
        &self.mappings
    }

    pub fn tokens(&self) -> Option<&AuthTokenSet> {
        self.tokens.as_ref()
    }

    /// User code and verification URI while waiting for approval.
    pub fn pending_prompt(&self) -> Option<(&str, &str)> {
        self.device
            .as_ref()
            .map(|d| (d.user_code.as_str(), d.verification_uri.as_str()))
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms
    }

    pub fn corrections_applied(&self) -> u32 {
        self.controller.corrections()
    }

    pub fn http(&self) -> &H {
        &self.http
    }

    pub fn http_mut(&mut self) -> &mut H {
        &mut self.http
    }
}

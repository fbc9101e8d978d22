//! Lighting bridge discovery, link-button pairing, and room control.
//!
//! ```text
//!                pair()                     found (pairing)
//!  Disconnected ───────▶ Discovering ─────────────────────▶ WaitingForButton
//!       ▲  │ stored creds     │ found (stored creds)              │ username
//!       │  └─────────────────▶│──────────────▶ Authenticating ◀───┘
//!       │                     │ timeout            │ groups ok
//!       │ hold elapsed        ▼                    ▼
//!       └────────────────── Error ◀────────── Connected
//!                      (unreachable, 401)
//! ```
//!
//! Every blocking wait is expressed as a deadline checked on `poll`, so one
//! I/O tick never spends more than one HTTP round trip here.  Credentials
//! are persisted only once the bridge has accepted them on a real call.

pub mod api;

use heapless::{Deque, String as HString, Vec as HVec};
use log::{debug, info, warn};

use crate::app::events::{ChannelEvent, RoomState};
use crate::app::ports::{
    BridgeAddress, DiscoveryPort, EventSink, HttpMethod, HttpPort, HttpRequest, HttpResponse,
    StoragePort,
};
use crate::config::SystemConfig;
use crate::error::{BridgeError, ErrorReason};
use crate::fsm::{ServiceKind, ServiceState, Snapshot, StateMachine};
use crate::utils::Redacted;

use api::{MAX_ROOMS, PairingReply, Username};

const NS: &str = "hue";
const KEY_ADDR: &str = "addr";
const KEY_USER: &str = "user";

/// Room commands waiting for the bridge.
pub const QUEUE_DEPTH: usize = 8;

/// Consecutive failed calls before the bridge is declared unreachable.
pub const MAX_HTTP_FAILURES: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Discovering,
    WaitingForButton,
    Authenticating,
    Connected,
    Error,
}

impl Snapshot for BridgeState {
    fn snapshot(self) -> ServiceState {
        match self {
            Self::Disconnected => ServiceState::Disconnected,
            Self::Discovering => ServiceState::Discovering,
            Self::WaitingForButton => ServiceState::AwaitingUserAction,
            Self::Authenticating => ServiceState::Authenticating,
            Self::Connected => ServiceState::Connected,
            Self::Error => ServiceState::Error,
        }
    }
}

/// One room change requested by a command or the panel UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomAction {
    pub room_id: u16,
    pub on: Option<bool>,
    pub brightness_pct: Option<u8>,
}

/// Outcome of a submitted action, keyed by the tracker sequence number.
pub type ActionResult = (u32, Result<(), BridgeError>);

#[derive(Debug, Default)]
pub struct BridgeOutput {
    pub completions: HVec<ActionResult, QUEUE_DEPTH>,
    pub rooms_changed: bool,
}

#[derive(Debug, Clone, Copy)]
struct Queued {
    seq: u32,
    action: RoomAction,
    queued_at_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    discovery_timeout_ms: u64,
    pairing_window_ms: u64,
    pairing_poll_ms: u64,
    room_poll_ms: u64,
    error_hold_ms: u64,
    command_timeout_ms: u64,
}

pub struct BridgeService<H: HttpPort, D: DiscoveryPort> {
    http: H,
    discovery: D,
    fsm: StateMachine<BridgeState>,
    device_id: HString<16>,
    address: Option<BridgeAddress>,
    username: Option<Username>,
    /// Current attempt was started by a user pairing request.
    pairing: bool,
    /// Authentication already fell back to rediscovery once.
    rediscovered: bool,
    /// Automatic reconnects are off until the next `pair`.
    suspended: bool,
    next_request_at: u64,
    next_room_poll_at: u64,
    rooms: HVec<RoomState, MAX_ROOMS>,
    queue: Deque<Queued, QUEUE_DEPTH>,
    http_failures: u8,
    timing: Timing,
}

impl<H: HttpPort, D: DiscoveryPort> BridgeService<H, D> {
    /// Build the service and load any stored credentials.
    pub fn new(
        http: H,
        discovery: D,
        device_id: &str,
        cfg: &SystemConfig,
        storage: &impl StoragePort,
    ) -> Self {
        let address = read_string::<64>(storage, KEY_ADDR);
        let username = read_string::<64>(storage, KEY_USER);
        let suspended = address.is_none() || username.is_none();
        if suspended {
            info!("Hue: no stored bridge, waiting for pairing");
        } else {
            info!("Hue: stored bridge credentials found");
        }
        Self {
            http,
            discovery,
            fsm: StateMachine::new("Hue", BridgeState::Disconnected),
            device_id: HString::try_from(device_id).unwrap_or_default(),
            address,
            username,
            pairing: false,
            rediscovered: false,
            suspended,
            next_request_at: 0,
            next_room_poll_at: 0,
            rooms: HVec::new(),
            queue: Deque::new(),
            http_failures: 0,
            timing: Timing {
                discovery_timeout_ms: u64::from(cfg.bridge_discovery_timeout_ms),
                pairing_window_ms: u64::from(cfg.bridge_pairing_window_ms),
                pairing_poll_ms: u64::from(cfg.bridge_pairing_poll_ms),
                room_poll_ms: u64::from(cfg.bridge_room_poll_ms),
                error_hold_ms: u64::from(cfg.service_error_hold_ms),
                command_timeout_ms: u64::from(cfg.command_timeout_ms),
            },
        }
    }

    // ── User-facing operations ───────────────────────────────

    /// Forget any stored bridge and start discovery + link-button pairing.
    pub fn pair(
        &mut self,
        now_ms: u64,
        storage: &mut impl StoragePort,
        sink: &mut impl EventSink,
    ) -> BridgeOutput {
        let mut out = BridgeOutput::default();
        self.forget_credentials(storage);
        self.suspended = false;
        self.pairing = true;
        self.rediscovered = false;
        self.discovery.start();
        self.enter(BridgeState::Discovering, "pair", ErrorReason::None, now_ms, sink, &mut out);
        out
    }

    /// Abort a discovery, pairing or authentication wait.
    pub fn cancel(&mut self, now_ms: u64, sink: &mut impl EventSink) -> BridgeOutput {
        let mut out = BridgeOutput::default();
        match self.fsm.current() {
            BridgeState::Discovering | BridgeState::WaitingForButton | BridgeState::Authenticating => {
                self.discovery.stop();
                self.suspended = true;
                self.pairing = false;
                self.enter(
                    BridgeState::Disconnected,
                    "cancelled",
                    ErrorReason::Cancelled,
                    now_ms,
                    sink,
                    &mut out,
                );
            }
            other => debug!("Hue: nothing to cancel in {:?}", other),
        }
        out
    }

    /// Queue a room change.  Only accepted while connected.
    pub fn submit(&mut self, seq: u32, action: RoomAction, now_ms: u64) -> Result<(), BridgeError> {
        if !self.fsm.is_in_state(BridgeState::Connected) {
            return Err(BridgeError::NotConnected);
        }
        self.queue
            .push_back(Queued {
                seq,
                action,
                queued_at_ms: now_ms,
            })
            .map_err(|_| BridgeError::Rejected)
    }

    // ── Tick ─────────────────────────────────────────────────

    pub fn poll(
        &mut self,
        now_ms: u64,
        storage: &mut impl StoragePort,
        sink: &mut impl EventSink,
    ) -> BridgeOutput {
        let mut out = BridgeOutput::default();
        self.expire_queued(now_ms);
        match self.fsm.current() {
            BridgeState::Disconnected => {
                if !self.suspended && self.username.is_some() {
                    self.pairing = false;
                    self.discovery.start();
                    self.enter(BridgeState::Discovering, "reconnect", ErrorReason::None, now_ms, sink, &mut out);
                }
            }
            BridgeState::Discovering => self.poll_discovery(now_ms, sink, &mut out),
            BridgeState::WaitingForButton => self.poll_pairing(now_ms, sink, &mut out),
            BridgeState::Authenticating => self.poll_authenticating(now_ms, storage, sink, &mut out),
            BridgeState::Connected => self.poll_connected(now_ms, storage, sink, &mut out),
            BridgeState::Error => {
                if self.fsm.time_in_state(now_ms) >= self.timing.error_hold_ms {
                    self.enter(BridgeState::Disconnected, "error hold elapsed", ErrorReason::None, now_ms, sink, &mut out);
                }
            }
        }
        out
    }

    fn poll_discovery(&mut self, now_ms: u64, sink: &mut impl EventSink, out: &mut BridgeOutput) {
        if let Some(addr) = self.discovery.poll() {
            self.discovery.stop();
            info!("Hue: bridge found at {}", addr);
            self.address = Some(addr);
            if self.pairing {
                self.next_request_at = now_ms;
                self.enter(BridgeState::WaitingForButton, "bridge found", ErrorReason::None, now_ms, sink, out);
            } else {
                self.enter(BridgeState::Authenticating, "bridge found", ErrorReason::None, now_ms, sink, out);
            }
            return;
        }
        if self.fsm.time_in_state(now_ms) >= self.timing.discovery_timeout_ms {
            self.discovery.stop();
            if !self.pairing && self.address.is_some() {
                info!("Hue: discovery timed out, trying stored address");
                self.enter(BridgeState::Authenticating, "stored address", ErrorReason::None, now_ms, sink, out);
            } else {
                warn!("Hue: no bridge found");
                self.enter(BridgeState::Error, "discovery timeout", ErrorReason::NoBridgeFound, now_ms, sink, out);
            }
        }
    }

    fn poll_pairing(&mut self, now_ms: u64, sink: &mut impl EventSink, out: &mut BridgeOutput) {
        if self.fsm.time_in_state(now_ms) >= self.timing.pairing_window_ms {
            warn!("Hue: link button not pressed in time");
            self.enter(BridgeState::Error, "pairing window elapsed", ErrorReason::PairingTimedOut, now_ms, sink, out);
            return;
        }
        if now_ms < self.next_request_at {
            return;
        }
        self.next_request_at = now_ms + self.timing.pairing_poll_ms;

        let Some(addr) = self.address.clone() else {
            self.enter(BridgeState::Error, "no address", ErrorReason::NoBridgeFound, now_ms, sink, out);
            return;
        };
        let url = api::pairing_url(&addr);
        let body = api::pairing_body(&self.device_id);
        let reply = self
            .http
            .send(&HttpRequest::json(HttpMethod::Post, &url, &body))
            .map_err(BridgeError::from)
            .and_then(|resp| api::parse_pairing(&resp.body));
        match reply {
            Ok(PairingReply::Granted(user)) => {
                info!("Hue: paired as {}", Redacted(&user));
                self.username = Some(user);
                self.enter(BridgeState::Authenticating, "link button pressed", ErrorReason::None, now_ms, sink, out);
            }
            Ok(PairingReply::ButtonNotPressed) => debug!("Hue: waiting for link button"),
            Ok(PairingReply::Refused(code)) => {
                warn!("Hue: pairing refused (type {})", code);
                self.enter(BridgeState::Error, "pairing refused", ErrorReason::Rejected, now_ms, sink, out);
            }
            // Transient; the window deadline bounds the retries.
            Err(e) => warn!("Hue: pairing request failed: {}", e),
        }
    }

    fn poll_authenticating(
        &mut self,
        now_ms: u64,
        storage: &mut impl StoragePort,
        sink: &mut impl EventSink,
        out: &mut BridgeOutput,
    ) {
        match self.fetch_rooms() {
            Ok(rooms) => {
                self.persist_credentials(storage);
                self.pairing = false;
                self.rediscovered = false;
                self.http_failures = 0;
                self.apply_rooms(rooms, sink, out);
                out.rooms_changed = true;
                self.next_room_poll_at = now_ms + self.timing.room_poll_ms;
                self.enter(BridgeState::Connected, "credentials accepted", ErrorReason::None, now_ms, sink, out);
            }
            Err(BridgeError::Unauthorized) => {
                warn!("Hue: bridge rejected stored username");
                self.forget_credentials(storage);
                self.enter(BridgeState::Error, "unauthorized", ErrorReason::BridgeUnauthorized, now_ms, sink, out);
            }
            Err(BridgeError::Http(e)) if !self.rediscovered && !self.pairing => {
                info!("Hue: bridge unreachable ({}), rediscovering", e);
                self.rediscovered = true;
                self.discovery.start();
                self.enter(BridgeState::Discovering, "rediscover", ErrorReason::None, now_ms, sink, out);
            }
            Err(e) => {
                warn!("Hue: authentication failed: {}", e);
                self.enter(BridgeState::Error, "unreachable", ErrorReason::BridgeUnreachable, now_ms, sink, out);
            }
        }
    }

    fn poll_connected(
        &mut self,
        now_ms: u64,
        storage: &mut impl StoragePort,
        sink: &mut impl EventSink,
        out: &mut BridgeOutput,
    ) {
        // One call per tick: either the next queued action or a room refresh.
        if let Some(Queued { seq, action, .. }) = self.queue.pop_front() {
            let result = self.apply_action(&action);
            match result {
                Ok(()) => {
                    self.http_failures = 0;
                    self.next_room_poll_at = now_ms;
                }
                Err(BridgeError::Http(_)) => self.http_failures = self.http_failures.saturating_add(1),
                Err(_) => {}
            }
            let _ = out.completions.push((seq, result));
            self.after_call(result, now_ms, storage, sink, out);
            return;
        }

        if now_ms >= self.next_room_poll_at {
            self.next_room_poll_at = now_ms + self.timing.room_poll_ms;
            let result = self.fetch_rooms();
            match result {
                Ok(rooms) => {
                    self.http_failures = 0;
                    self.apply_rooms(rooms, sink, out);
                    return;
                }
                Err(BridgeError::Http(_)) => self.http_failures = self.http_failures.saturating_add(1),
                Err(_) => {}
            }
            self.after_call(result.map(|_| ()), now_ms, storage, sink, out);
        }
    }

    /// Common failure handling for calls made while connected.
    fn after_call(
        &mut self,
        result: Result<(), BridgeError>,
        now_ms: u64,
        storage: &mut impl StoragePort,
        sink: &mut impl EventSink,
        out: &mut BridgeOutput,
    ) {
        match result {
            Err(BridgeError::Unauthorized) => {
                warn!("Hue: username no longer valid");
                self.forget_credentials(storage);
                self.enter(BridgeState::Error, "unauthorized", ErrorReason::BridgeUnauthorized, now_ms, sink, out);
            }
            Err(BridgeError::Http(e)) if self.http_failures >= MAX_HTTP_FAILURES => {
                warn!("Hue: {} consecutive failures ({})", self.http_failures, e);
                self.enter(BridgeState::Error, "unreachable", ErrorReason::BridgeUnreachable, now_ms, sink, out);
            }
            _ => {}
        }
    }

    // ── HTTP calls ───────────────────────────────────────────

    fn fetch_rooms(&mut self) -> Result<HVec<RoomState, MAX_ROOMS>, BridgeError> {
        let (Some(addr), Some(user)) = (&self.address, &self.username) else {
            return Err(BridgeError::Unauthorized);
        };
        let url = api::groups_url(addr, user);
        let resp = self.http.send(&HttpRequest::get(&url))?;
        check_status(&resp)?;
        api::parse_rooms(&resp.body)
    }

    fn apply_action(&mut self, action: &RoomAction) -> Result<(), BridgeError> {
        let (Some(addr), Some(user)) = (&self.address, &self.username) else {
            return Err(BridgeError::Unauthorized);
        };
        let url = api::group_action_url(addr, user, action.room_id);
        let body = api::action_body(action.on, action.brightness_pct);
        let resp = self
            .http
            .send(&HttpRequest::json(HttpMethod::Put, &url, &body))?;
        check_status(&resp)?;
        match api::error_type(&resp.body) {
            None => Ok(()),
            Some(api::ERR_UNAUTHORIZED_USER) => Err(BridgeError::Unauthorized),
            Some(api::ERR_RESOURCE_NOT_AVAILABLE) => Err(BridgeError::UnknownRoom),
            Some(_) => Err(BridgeError::Rejected),
        }
    }

    // ── State helpers ────────────────────────────────────────

    fn enter(
        &mut self,
        next: BridgeState,
        why: &'static str,
        reason: ErrorReason,
        now_ms: u64,
        sink: &mut impl EventSink,
        out: &mut BridgeOutput,
    ) {
        let leaving_connected = self.fsm.is_in_state(BridgeState::Connected) && next != BridgeState::Connected;
        self.fsm.transition(next, why, now_ms);
        if leaving_connected {
            while let Some(item) = self.queue.pop_front() {
                let _ = out.completions.push((item.seq, Err(BridgeError::NotConnected)));
            }
        }
        sink.emit(ChannelEvent::status(ServiceKind::Bridge, next.snapshot(), reason));
    }

    /// Drop actions older than the command timeout.  The tracker has
    /// already answered them as timed out.
    fn expire_queued(&mut self, now_ms: u64) {
        let timeout = self.timing.command_timeout_ms;
        let before = self.queue.len();
        let mut kept: Deque<Queued, QUEUE_DEPTH> = Deque::new();
        for q in self.queue.iter().filter(|q| now_ms.saturating_sub(q.queued_at_ms) < timeout) {
            let _ = kept.push_back(*q);
        }
        if kept.len() != before {
            debug!("Hue: dropped {} stale room action(s)", before - kept.len());
            self.queue = kept;
        }
    }

    fn apply_rooms(
        &mut self,
        rooms: HVec<RoomState, MAX_ROOMS>,
        sink: &mut impl EventSink,
        out: &mut BridgeOutput,
    ) {
        for room in &rooms {
            if self.rooms.iter().find(|r| r.room_id == room.room_id) != Some(room) {
                sink.emit(ChannelEvent::BridgeRoomState(*room));
                out.rooms_changed = true;
            }
        }
        if rooms.len() != self.rooms.len() {
            out.rooms_changed = true;
        }
        self.rooms = rooms;
    }

    fn persist_credentials(&mut self, storage: &mut impl StoragePort) {
        let (Some(addr), Some(user)) = (&self.address, &self.username) else {
            return;
        };
        let stored = storage
            .write(NS, KEY_ADDR, addr.as_bytes())
            .and_then(|()| storage.write(NS, KEY_USER, user.as_bytes()));
        if let Err(e) = stored {
            warn!("Hue: could not persist credentials: {}", e);
        }
    }

    fn forget_credentials(&mut self, storage: &mut impl StoragePort) {
        self.username = None;
        let _ = storage.delete(NS, KEY_USER);
        let _ = storage.delete(NS, KEY_ADDR);
    }

    // ── Accessors ────────────────────────────────────────────

    pub fn state(&self) -> BridgeState {
        self.fsm.current()
    }

    pub fn snapshot(&self) -> ServiceState {
        self.fsm.snapshot()
    }

    pub fn rooms(&self) -> &[RoomState] {
        &self.rooms
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn is_paired(&self) -> bool {
        self.username.is_some()
    }

    pub fn http(&self) -> &H {
        &self.http
    }

    pub fn http_mut(&mut self) -> &mut H {
        &mut self.http
    }

    pub fn discovery_mut(&mut self) -> &mut D {
        &mut self.discovery
    }
}

fn check_status(resp: &HttpResponse) -> Result<(), BridgeError> {
    match resp.status {
        s if (200..300).contains(&s) => Ok(()),
        401 | 403 => Err(BridgeError::Unauthorized),
        404 => Err(BridgeError::UnknownRoom),
        _ => Err(BridgeError::Rejected),
    }
}

fn read_string<const N: usize>(storage: &impl StoragePort, key: &str) -> Option<HString<N>> {
    let mut buf = [0u8; N];
    let n = storage.read(NS, key, &mut buf).ok()?;
    let s = core::str::from_utf8(&buf[..n]).ok()?;
    HString::try_from(s).ok().filter(|s: &HString<N>| !s.is_empty())
}

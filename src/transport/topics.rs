//! Per-device topic names and inbound topic routing.
//!
//! ```text
//!  device → server                      server → device
//!  ───────────────                      ───────────────
//!  {id}/telemetry                       {id}/command
//!  {id}/status
//!  {id}/hue/state
//!  {id}/tado/state
//!  {id}/command/ack
//! ```
//!
//! Inbound messages are dispatched by matching the topic against a small
//! table of MQTT-style filters (`+` = one level, `#` = rest).  A topic no
//! filter accepts is unrouted; the caller logs and counts it.

use core::fmt::Write;

use heapless::{String, Vec};

/// Longest topic this device produces or routes.
pub const TOPIC_LEN: usize = 64;

pub type Topic = String<TOPIC_LEN>;

/// Fully expanded outbound and inbound topics for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub telemetry: Topic,
    pub status: Topic,
    pub hue_state: Topic,
    pub tado_state: Topic,
    pub command: Topic,
    pub command_ack: Topic,
}

impl Topics {
    pub fn for_device(device_id: &str) -> Self {
        Self {
            telemetry: join(device_id, "telemetry"),
            status: join(device_id, "status"),
            hue_state: join(device_id, "hue/state"),
            tado_state: join(device_id, "tado/state"),
            command: join(device_id, "command"),
            command_ack: join(device_id, "command/ack"),
        }
    }
}

fn join(prefix: &str, suffix: &str) -> Topic {
    let mut t = Topic::new();
    // Device ids are at most 16 bytes, so this always fits.
    let _ = write!(t, "{}/{}", prefix, suffix);
    t
}

// ───────────────────────────────────────────────────────────────
// Filter matching
// ───────────────────────────────────────────────────────────────

/// MQTT filter match: `+` matches exactly one level, a trailing `#`
/// matches the remaining levels (including none).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return f.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(fl), Some(tl)) if fl == tl => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Router
// ───────────────────────────────────────────────────────────────

/// Handler selected for an inbound topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// `{id}/command`: a JSON command envelope.
    Command,
}

const MAX_ROUTES: usize = 4;

/// First-match routing table.
#[derive(Debug, Clone)]
pub struct Router {
    routes: Vec<(Topic, Route), MAX_ROUTES>,
}

impl Router {
    pub const fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Routing table for a device's inbound topics.
    pub fn for_device(topics: &Topics) -> Self {
        let mut r = Self::new();
        r.add(topics.command.as_str(), Route::Command);
        r
    }

    /// Append a filter.  Returns `false` when the table is full or the
    /// filter is too long.
    pub fn add(&mut self, filter: &str, route: Route) -> bool {
        let Ok(f) = Topic::try_from(filter) else {
            return false;
        };
        self.routes.push((f, route)).is_ok()
    }

    pub fn route(&self, topic: &str) -> Option<Route> {
        self.routes
            .iter()
            .find(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, route)| *route)
    }

    /// Filters the client must subscribe to.
    pub fn filters(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|(f, _)| f.as_str())
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

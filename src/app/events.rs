//! Events that cross from the I/O context to the presentation context.
//!
//! Every variant is `Copy` and carries no borrowed or heap data, so a value
//! can move through the [`CrossCoreChannel`](crate::channel::CrossCoreChannel)
//! and the producer keeps nothing that the consumer could observe later.

use core::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ErrorReason;
use crate::fsm::{ServiceKind, ServiceState};

// ───────────────────────────────────────────────────────────────
// Fixed-capacity, Copy text
// ───────────────────────────────────────────────────────────────

/// Inline UTF-8 text of at most `N` bytes (`N <= 255`).
///
/// `heapless::String` is not `Copy`; this is, which is what lets room
/// names and command ids ride inside [`ChannelEvent`].  Input longer than
/// `N` is truncated on a character boundary.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortText<const N: usize> {
    len: u8,
    bytes: [u8; N],
}

impl<const N: usize> ShortText<N> {
    pub const fn new() -> Self {
        Self {
            len: 0,
            bytes: [0; N],
        }
    }

    /// Copy `s`, truncating to the last full character that fits.
    pub fn truncated(s: &str) -> Self {
        let cap = N.min(u8::MAX as usize);
        let mut end = s.len().min(cap);
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut out = Self::new();
        out.bytes[..end].copy_from_slice(&s.as_bytes()[..end]);
        out.len = end as u8;
        out
    }

    /// Copy `s` only if it fits without truncation.
    pub fn exact(s: &str) -> Option<Self> {
        if s.len() > N || s.len() > u8::MAX as usize {
            return None;
        }
        Some(Self::truncated(s))
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }
}

impl<const N: usize> Default for ShortText<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Debug for ShortText<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> fmt::Display for ShortText<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> fmt::Write for ShortText<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let start = self.len as usize;
        if start + s.len() > N.min(u8::MAX as usize) {
            return Err(fmt::Error);
        }
        self.bytes[start..start + s.len()].copy_from_slice(s.as_bytes());
        self.len += s.len() as u8;
        Ok(())
    }
}

impl<const N: usize> Serialize for ShortText<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de, const N: usize> Deserialize<'de> for ShortText<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TextVisitor<const M: usize>;

        impl<const M: usize> Visitor<'_> for TextVisitor<M> {
            type Value = ShortText<M>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a string of at most {M} bytes")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                ShortText::exact(v).ok_or_else(|| E::invalid_length(v.len(), &self))
            }
        }

        deserializer.deserialize_str(TextVisitor::<N>)
    }
}

/// Correlation id of a command (server-assigned or `local-N`).
pub type CommandId = ShortText<64>;

/// Display name of a room or zone.
pub type Label = ShortText<24>;

// ───────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────

/// One sample from the panel's own environmental sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorReading {
    pub temperature_c: f32,
    pub humidity_pct: f32,
    #[serde(skip)]
    pub at_ms: u64,
}

/// Lighting bridge room (group) state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub room_id: u16,
    pub name: Label,
    pub is_on: bool,
    pub brightness_pct: u8,
}

/// Thermostat zone state as last reported by the cloud API.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneState {
    pub zone_id: u32,
    pub name: Label,
    pub current_c: Option<f32>,
    /// `None` when the zone's heating is switched off.
    pub target_c: Option<f32>,
    pub humidity_pct: Option<f32>,
    pub heating_power_pct: u8,
    pub auto_adjust: bool,
}

/// Outcome of an inbound command, mirrored to the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    pub request_id: CommandId,
    pub success: bool,
    pub reason: ErrorReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustDirection {
    Raise,
    Lower,
}

/// Diagnostics record for one auto-adjust correction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoAdjustStatus {
    pub zone_id: u32,
    pub direction: AdjustDirection,
    /// `target - measured` at decision time.
    pub delta_c: f32,
    pub measured_c: f32,
    pub new_target_c: f32,
    pub at_ms: u64,
}

// ───────────────────────────────────────────────────────────────
// Channel event
// ───────────────────────────────────────────────────────────────

/// Everything the presentation context can learn about the I/O side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelEvent {
    SensorReading(SensorReading),
    BridgeRoomState(RoomState),
    ThermostatZoneState(ZoneState),
    ConnectivityStatus {
        service: ServiceKind,
        state: ServiceState,
        reason: ErrorReason,
    },
    CommandAck(CommandAck),
    AutoAdjust(AutoAdjustStatus),
    /// Device-flow user code the display should show for approval.
    AuthPrompt {
        user_code: ShortText<16>,
        verification_uri: ShortText<64>,
    },
}

impl ChannelEvent {
    pub fn status(service: ServiceKind, state: ServiceState, reason: ErrorReason) -> Self {
        Self::ConnectivityStatus {
            service,
            state,
            reason,
        }
    }
}

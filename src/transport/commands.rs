//! Inbound command envelopes and outbound acknowledgments (JSON wire format).
//!
//! ```text
//! {deviceId}/command
//!   {"id":"c-91","type":"light-room-set","params":{"roomId":3,"isOn":true,"brightness":40}}
//!
//! {deviceId}/command/ack
//!   {"id":"c-91","success":true,"error":null}
//! ```
//!
//! Parameters may sit under `params` or directly in the envelope.  Ids are
//! strings or integers.  Every failure after the id has been read keeps the
//! id in [`CommandError`] so the caller can still answer with a failure ack.
//! Oversized payloads and over-long ids still carry an id when one can be
//! read; an over-long id is cut to fit.

use core::fmt::Write;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::app::events::{CommandId, ShortText};
use crate::error::ErrorReason;
use crate::thermostat::control::{DEFAULT_HYSTERESIS_C, OVERLAY_RANGE, ZoneMapping};

/// Payloads above this size are refused as commands.
pub const MAX_COMMAND_BYTES: usize = 1024;

/// Largest refused payload still scanned for an id to answer.
pub const MAX_INBOUND_BYTES: usize = 4 * 1024;

pub type FirmwareUrl = ShortText<200>;

// ───────────────────────────────────────────────────────────────
// Parsed command
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    LightRoomSet,
    ThermostatSetTemperature,
    ThermostatSetAutoAdjust,
    ThermostatSyncMapping,
    DeviceReboot,
    DeviceFirmwareUpdate,
}

impl CommandKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LightRoomSet => "light-room-set",
            Self::ThermostatSetTemperature => "thermostat-set-temperature",
            Self::ThermostatSetAutoAdjust => "thermostat-set-auto-adjust",
            Self::ThermostatSyncMapping => "thermostat-sync-mapping",
            Self::DeviceReboot => "device-reboot",
            Self::DeviceFirmwareUpdate => "device-firmware-update",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        [
            Self::LightRoomSet,
            Self::ThermostatSetTemperature,
            Self::ThermostatSetAutoAdjust,
            Self::ThermostatSyncMapping,
            Self::DeviceReboot,
            Self::DeviceFirmwareUpdate,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    LightRoomSet {
        room_id: u16,
        on: Option<bool>,
        brightness_pct: Option<u8>,
    },
    ThermostatSetTemperature {
        zone_id: u32,
        target_c: f32,
    },
    ThermostatSetAutoAdjust {
        zone_id: u32,
        enabled: bool,
        target_c: f32,
        hysteresis_c: Option<f32>,
    },
    ThermostatSyncMapping(ZoneMapping),
    DeviceReboot,
    DeviceFirmwareUpdate {
        url: FirmwareUrl,
    },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::LightRoomSet { .. } => CommandKind::LightRoomSet,
            Self::ThermostatSetTemperature { .. } => CommandKind::ThermostatSetTemperature,
            Self::ThermostatSetAutoAdjust { .. } => CommandKind::ThermostatSetAutoAdjust,
            Self::ThermostatSyncMapping(_) => CommandKind::ThermostatSyncMapping,
            Self::DeviceReboot => CommandKind::DeviceReboot,
            Self::DeviceFirmwareUpdate { .. } => CommandKind::DeviceFirmwareUpdate,
        }
    }
}

/// A parsed command with its correlation id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandEnvelope {
    pub id: CommandId,
    pub command: Command,
}

// ───────────────────────────────────────────────────────────────
// Parse errors
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    TooLarge,
    NotJson,
    MissingId,
    /// Id longer than a [`CommandId`] holds; the error carries it cut short.
    IdTooLong,
    UnknownType,
    InvalidParams(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandError {
    /// Present when the envelope was readable far enough to find an id.
    pub id: Option<CommandId>,
    pub error: ParseError,
}

impl CommandError {
    fn anonymous(error: ParseError) -> Self {
        Self { id: None, error }
    }
}

// ───────────────────────────────────────────────────────────────
// Parser
// ───────────────────────────────────────────────────────────────

pub fn parse_command(payload: &[u8]) -> Result<CommandEnvelope, CommandError> {
    if payload.len() > MAX_COMMAND_BYTES {
        return Err(CommandError {
            id: salvage_id(payload),
            error: ParseError::TooLarge,
        });
    }
    let value: Value = serde_json::from_slice(payload)
        .map_err(|_| CommandError::anonymous(ParseError::NotJson))?;
    let Value::Object(envelope) = value else {
        return Err(CommandError::anonymous(ParseError::NotJson));
    };
    let (id, whole) = envelope
        .get("id")
        .and_then(id_text)
        .ok_or(CommandError::anonymous(ParseError::MissingId))?;
    if !whole {
        return Err(CommandError {
            id: Some(id),
            error: ParseError::IdTooLong,
        });
    }

    let with_id = |error| CommandError {
        id: Some(id),
        error,
    };

    let kind = envelope
        .get("type")
        .and_then(Value::as_str)
        .and_then(CommandKind::from_wire)
        .ok_or(with_id(ParseError::UnknownType))?;

    let params = match envelope.get("params") {
        Some(Value::Object(p)) => p,
        Some(_) => return Err(with_id(ParseError::InvalidParams("params must be an object"))),
        None => &envelope,
    };

    let command = parse_params(kind, params).map_err(with_id)?;
    Ok(CommandEnvelope { id, command })
}

fn parse_params(kind: CommandKind, p: &Map<String, Value>) -> Result<Command, ParseError> {
    match kind {
        CommandKind::LightRoomSet => {
            let room_id = id_number(p, "roomId")?;
            let room_id =
                u16::try_from(room_id).map_err(|_| ParseError::InvalidParams("roomId out of range"))?;
            let on = opt_bool(p, "isOn")?;
            let brightness_pct = match p.get("brightness") {
                None | Some(Value::Null) => None,
                Some(v) => {
                    let b = v
                        .as_f64()
                        .ok_or(ParseError::InvalidParams("brightness must be a number"))?;
                    if !(0.0..=100.0).contains(&b) {
                        return Err(ParseError::InvalidParams("brightness must be 0-100"));
                    }
                    Some(b.round() as u8)
                }
            };
            if on.is_none() && brightness_pct.is_none() {
                return Err(ParseError::InvalidParams("isOn or brightness required"));
            }
            Ok(Command::LightRoomSet {
                room_id,
                on,
                brightness_pct,
            })
        }
        CommandKind::ThermostatSetTemperature => {
            let zone_id = id_number(p, "zoneId")?;
            let target_c = req_f32(p, "targetTemperature")?;
            if !OVERLAY_RANGE.contains(&target_c) {
                return Err(ParseError::InvalidParams("targetTemperature must be 5-25"));
            }
            Ok(Command::ThermostatSetTemperature { zone_id, target_c })
        }
        CommandKind::ThermostatSetAutoAdjust => {
            let zone_id = id_number(p, "zoneId")?;
            let enabled = opt_bool(p, "enabled")?
                .ok_or(ParseError::InvalidParams("enabled is required"))?;
            let target_c = req_f32(p, "targetTemperature")?;
            let hysteresis_c = opt_f32(p, "hysteresis")?;
            // Range checks shared with the mapping itself.
            ZoneMapping::new(
                zone_id,
                "",
                target_c,
                enabled,
                hysteresis_c.unwrap_or(DEFAULT_HYSTERESIS_C),
            )
            .map_err(|_| ParseError::InvalidParams("targetTemperature or hysteresis out of range"))?;
            Ok(Command::ThermostatSetAutoAdjust {
                zone_id,
                enabled,
                target_c,
                hysteresis_c,
            })
        }
        CommandKind::ThermostatSyncMapping => {
            let zone_id = id_number(p, "zoneId")?;
            let zone_name = p
                .get("zoneName")
                .and_then(Value::as_str)
                .ok_or(ParseError::InvalidParams("zoneName is required"))?;
            let target_c = req_f32(p, "targetTemperature")?;
            let auto_adjust = opt_bool(p, "autoAdjustEnabled")?
                .ok_or(ParseError::InvalidParams("autoAdjustEnabled is required"))?;
            let hysteresis_c = opt_f32(p, "hysteresis")?.unwrap_or(DEFAULT_HYSTERESIS_C);
            let mapping = ZoneMapping::new(zone_id, zone_name, target_c, auto_adjust, hysteresis_c)
                .map_err(|_| ParseError::InvalidParams("targetTemperature or hysteresis out of range"))?;
            Ok(Command::ThermostatSyncMapping(mapping))
        }
        CommandKind::DeviceReboot => Ok(Command::DeviceReboot),
        CommandKind::DeviceFirmwareUpdate => {
            let url = p
                .get("url")
                .and_then(Value::as_str)
                .ok_or(ParseError::InvalidParams("url is required"))?;
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(ParseError::InvalidParams("url must be http(s)"));
            }
            let url = FirmwareUrl::exact(url).ok_or(ParseError::InvalidParams("url too long"))?;
            Ok(Command::DeviceFirmwareUpdate { url })
        }
    }
}

// ── Field helpers ────────────────────────────────────────────

/// Correlation id and whether it fit whole.
fn id_text(v: &Value) -> Option<(CommandId, bool)> {
    match v {
        Value::String(s) if !s.is_empty() => Some(match CommandId::exact(s) {
            Some(id) => (id, true),
            None => (CommandId::truncated(s), false),
        }),
        Value::Number(n) => {
            let mut id = CommandId::new();
            write!(id, "{}", n).ok()?;
            Some((id, true))
        }
        _ => None,
    }
}

/// Read only the `id` of a payload too large to accept.
fn salvage_id(payload: &[u8]) -> Option<CommandId> {
    #[derive(Deserialize)]
    struct IdOnly {
        id: Value,
    }

    if payload.len() > MAX_INBOUND_BYTES {
        return None;
    }
    let envelope: IdOnly = serde_json::from_slice(payload).ok()?;
    id_text(&envelope.id).map(|(id, _)| id)
}

/// Integer id given as a JSON number or a numeric string (`3` or `"3"`).
fn id_number(p: &Map<String, Value>, key: &'static str) -> Result<u32, ParseError> {
    let parsed = match p.get(key) {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.parse::<u32>().ok(),
        _ => None,
    };
    parsed.ok_or(ParseError::InvalidParams(match key {
        "roomId" => "roomId must be an integer",
        _ => "zoneId must be an integer",
    }))
}

fn opt_bool(p: &Map<String, Value>, key: &str) -> Result<Option<bool>, ParseError> {
    match p.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ParseError::InvalidParams("expected a boolean")),
    }
}

fn opt_f32(p: &Map<String, Value>, key: &str) -> Result<Option<f32>, ParseError> {
    match p.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|f| f.is_finite())
            .map(|f| Some(f as f32))
            .ok_or(ParseError::InvalidParams("expected a number")),
    }
}

fn req_f32(p: &Map<String, Value>, key: &str) -> Result<f32, ParseError> {
    opt_f32(p, key)?.ok_or(ParseError::InvalidParams("missing numeric field"))
}

// ───────────────────────────────────────────────────────────────
// Acknowledgment
// ───────────────────────────────────────────────────────────────

/// One outbound acknowledgment, kept `Copy` so it can sit in the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckMessage {
    pub id: CommandId,
    pub success: bool,
    pub reason: ErrorReason,
}

impl AckMessage {
    pub fn ok(id: CommandId) -> Self {
        Self {
            id,
            success: true,
            reason: ErrorReason::None,
        }
    }

    pub fn failed(id: CommandId, reason: ErrorReason) -> Self {
        Self {
            id,
            success: false,
            reason,
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Wire<'a> {
            id: &'a str,
            success: bool,
            error: Option<&'a str>,
        }
        let wire = Wire {
            id: self.id.as_str(),
            success: self.success,
            error: (!self.success).then(|| self.reason.as_str()),
        };
        serde_json::to_vec(&wire).unwrap_or_default()
    }
}

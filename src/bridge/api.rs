//! Local lighting-bridge REST API: URLs, bodies, and response parsing.
//!
//! The bridge answers most calls with a JSON array of `success` / `error`
//! objects:
//!
//! ```text
//! POST /api                      [{"success":{"username":"3fA9..."}}]
//!                                [{"error":{"type":101,"description":"link button not pressed"}}]
//! GET  /api/{user}/groups        {"1":{"name":"Kitchen","type":"Room","action":{"on":true,"bri":200}}}
//! PUT  /api/{user}/groups/3/action  {"on":true,"bri":102}
//! ```

use heapless::Vec as HVec;
use serde_json::{Value, json};

use crate::app::events::{Label, RoomState};
use crate::error::BridgeError;

/// Rooms tracked per bridge.
pub const MAX_ROOMS: usize = 16;

/// Bridge error types that matter to us.
pub const ERR_UNAUTHORIZED_USER: u64 = 1;
pub const ERR_RESOURCE_NOT_AVAILABLE: u64 = 3;
pub const ERR_LINK_BUTTON_NOT_PRESSED: u64 = 101;

pub type Username = heapless::String<64>;

pub fn pairing_url(addr: &str) -> String {
    format!("http://{}/api", addr)
}

pub fn groups_url(addr: &str, user: &str) -> String {
    format!("http://{}/api/{}/groups", addr, user)
}

pub fn group_action_url(addr: &str, user: &str, room_id: u16) -> String {
    format!("http://{}/api/{}/groups/{}/action", addr, user, room_id)
}

/// `devicetype` is `app#device`, which the bridge shows in its app list.
pub fn pairing_body(device_id: &str) -> Vec<u8> {
    json!({ "devicetype": format!("smartpanel#{}", device_id) })
        .to_string()
        .into_bytes()
}

pub fn action_body(on: Option<bool>, brightness_pct: Option<u8>) -> Vec<u8> {
    let mut body = serde_json::Map::new();
    if let Some(on) = on {
        body.insert("on".into(), Value::Bool(on));
    }
    if let Some(pct) = brightness_pct {
        body.insert("bri".into(), Value::from(pct_to_bri(pct)));
        // Dimming a light that is off should also switch it on.
        if on.is_none() && pct > 0 {
            body.insert("on".into(), Value::Bool(true));
        }
    }
    Value::Object(body).to_string().into_bytes()
}

// ───────────────────────────────────────────────────────────────
// Brightness scale
// ───────────────────────────────────────────────────────────────

/// 0–100 % onto the bridge's 1–254 scale.
pub fn pct_to_bri(pct: u8) -> u8 {
    let pct = u32::from(pct.min(100));
    (1 + (pct * 253 + 50) / 100) as u8
}

/// Inverse of [`pct_to_bri`], rounded to the nearest percent.
pub fn bri_to_pct(bri: u8) -> u8 {
    let bri = u32::from(bri.max(1)) - 1;
    ((bri * 100 + 126) / 253).min(100) as u8
}

// ───────────────────────────────────────────────────────────────
// Responses
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingReply {
    Granted(Username),
    ButtonNotPressed,
    Refused(u64),
}

pub fn parse_pairing(body: &[u8]) -> Result<PairingReply, BridgeError> {
    let value: Value = serde_json::from_slice(body).map_err(|_| BridgeError::Malformed)?;
    let first = value
        .as_array()
        .and_then(|a| a.first())
        .ok_or(BridgeError::Malformed)?;
    if let Some(user) = first.pointer("/success/username").and_then(Value::as_str) {
        let user = Username::try_from(user).map_err(|_| BridgeError::Malformed)?;
        return Ok(PairingReply::Granted(user));
    }
    match first.pointer("/error/type").and_then(Value::as_u64) {
        Some(ERR_LINK_BUTTON_NOT_PRESSED) => Ok(PairingReply::ButtonNotPressed),
        Some(code) => Ok(PairingReply::Refused(code)),
        None => Err(BridgeError::Malformed),
    }
}

/// First error type in an array reply, if the reply is an error.
pub fn error_type(body: &[u8]) -> Option<u64> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value
        .as_array()?
        .iter()
        .find_map(|item| item.pointer("/error/type").and_then(Value::as_u64))
}

/// Parse `GET /groups`, keeping only groups of type `Room`.
pub fn parse_rooms(body: &[u8]) -> Result<HVec<RoomState, MAX_ROOMS>, BridgeError> {
    let value: Value = serde_json::from_slice(body).map_err(|_| BridgeError::Malformed)?;
    if let Some(code) = value
        .as_array()
        .and_then(|a| a.first())
        .and_then(|e| e.pointer("/error/type"))
        .and_then(Value::as_u64)
    {
        return Err(if code == ERR_UNAUTHORIZED_USER {
            BridgeError::Unauthorized
        } else {
            BridgeError::Rejected
        });
    }
    let groups = value.as_object().ok_or(BridgeError::Malformed)?;

    let mut rooms = HVec::new();
    for (key, group) in groups {
        if group.get("type").and_then(Value::as_str) != Some("Room") {
            continue;
        }
        let Ok(room_id) = key.parse::<u16>() else {
            continue;
        };
        let name = group.get("name").and_then(Value::as_str).unwrap_or("");
        let any_on = group.pointer("/state/any_on").and_then(Value::as_bool);
        let action_on = group.pointer("/action/on").and_then(Value::as_bool);
        let bri = group
            .pointer("/action/bri")
            .and_then(Value::as_u64)
            .map_or(0, |b| b.min(254) as u8);
        let room = RoomState {
            room_id,
            name: Label::truncated(name),
            is_on: any_on.or(action_on).unwrap_or(false),
            brightness_pct: if bri == 0 { 0 } else { bri_to_pct(bri) },
        };
        if rooms.push(room).is_err() {
            break;
        }
    }
    rooms.sort_unstable_by_key(|r: &RoomState| r.room_id);
    Ok(rooms)
}

//! Thermostat cloud REST API: URLs, overlay body, and response parsing.
//!
//! ```text
//! GET /api/v2/me                                  {"homes":[{"id":123}]}
//! GET /api/v2/homes/{h}/zones                     [{"id":1,"name":"Living","type":"HEATING"}]
//! GET /api/v2/homes/{h}/zones/{z}/state           setting / sensorDataPoints / activityDataPoints
//! PUT /api/v2/homes/{h}/zones/{z}/overlay         {"setting":{...},"termination":{...}}
//! ```

use heapless::Vec as HVec;
use serde_json::{Value, json};

use crate::app::events::{Label, ZoneState};
use crate::app::ports::HttpResponse;
use crate::error::ThermostatError;

pub const API_BASE: &str = "https://my.tado.com/api/v2";

pub const MAX_ZONES: usize = 8;

/// A heating zone as listed by the home.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneInfo {
    pub zone_id: u32,
    pub name: Label,
}

pub fn me_url() -> String {
    format!("{}/me", API_BASE)
}

pub fn zones_url(home_id: u32) -> String {
    format!("{}/homes/{}/zones", API_BASE, home_id)
}

pub fn zone_state_url(home_id: u32, zone_id: u32) -> String {
    format!("{}/homes/{}/zones/{}/state", API_BASE, home_id, zone_id)
}

pub fn overlay_url(home_id: u32, zone_id: u32) -> String {
    format!("{}/homes/{}/zones/{}/overlay", API_BASE, home_id, zone_id)
}

/// Manual heating overlay that ends at the next schedule change.
pub fn overlay_body(target_c: f32) -> Vec<u8> {
    // One decimal, which is all the thermostat accepts.
    let celsius = (f64::from(target_c) * 10.0).round() / 10.0;
    json!({
        "setting": {
            "type": "HEATING",
            "power": "ON",
            "temperature": { "celsius": celsius }
        },
        "termination": { "typeSkillBasedApp": "TADO_MODE" }
    })
    .to_string()
    .into_bytes()
}

/// Map a non-success status onto the service error.
pub fn check_status(resp: &HttpResponse) -> Result<(), ThermostatError> {
    match resp.status {
        s if (200..300).contains(&s) => Ok(()),
        401 => Err(ThermostatError::Unauthorized),
        404 => Err(ThermostatError::UnknownZone),
        s => Err(ThermostatError::Rejected(s)),
    }
}

fn parse(body: &[u8]) -> Result<Value, ThermostatError> {
    serde_json::from_slice(body).map_err(|_| ThermostatError::Malformed)
}

pub fn parse_home_id(body: &[u8]) -> Result<u32, ThermostatError> {
    parse(body)?
        .pointer("/homes/0/id")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or(ThermostatError::Malformed)
}

/// Heating zones only; hot water and air-conditioning zones are skipped.
pub fn parse_zones(body: &[u8]) -> Result<HVec<ZoneInfo, MAX_ZONES>, ThermostatError> {
    let value = parse(body)?;
    let list = value.as_array().ok_or(ThermostatError::Malformed)?;
    let mut zones = HVec::new();
    for zone in list {
        if zone.get("type").and_then(Value::as_str) != Some("HEATING") {
            continue;
        }
        let Some(zone_id) = zone
            .get("id")
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
        else {
            continue;
        };
        let name = zone.get("name").and_then(Value::as_str).unwrap_or("");
        if zones
            .push(ZoneInfo {
                zone_id,
                name: Label::truncated(name),
            })
            .is_err()
        {
            break;
        }
    }
    Ok(zones)
}

pub fn parse_zone_state(
    body: &[u8],
    zone: &ZoneInfo,
    auto_adjust: bool,
) -> Result<ZoneState, ThermostatError> {
    let value = parse(body)?;
    if !value.is_object() {
        return Err(ThermostatError::Malformed);
    }
    let f = |path: &str| value.pointer(path).and_then(Value::as_f64).map(|v| v as f32);
    let powered = value.pointer("/setting/power").and_then(Value::as_str) != Some("OFF");
    Ok(ZoneState {
        zone_id: zone.zone_id,
        name: zone.name,
        current_c: f("/sensorDataPoints/insideTemperature/celsius"),
        target_c: if powered {
            f("/setting/temperature/celsius")
        } else {
            None
        },
        humidity_pct: f("/sensorDataPoints/humidity/percentage"),
        heating_power_pct: f("/activityDataPoints/heatingPower/percentage")
            .map_or(0, |p| p.clamp(0.0, 100.0).round() as u8),
        auto_adjust,
    })
}

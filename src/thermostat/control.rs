//! Zone mappings and the auto-adjust hysteresis controller.
//!
//! ```text
//!            target (mapping)
//!                  │
//!   measured ──▶ delta = target − measured
//!                  │
//!        delta >  +h ──▶ Raise  (thermostat target + step)
//!        delta <  −h ──▶ Lower  (thermostat target − step)
//!        otherwise   ──▶ nothing
//! ```
//!
//! The controller is edge-triggered on the control-cycle boundary: readings
//! arriving between boundaries only update the latest measurement, so at
//! most one correction per zone is issued per cycle.  A failed correction is
//! simply evaluated again on the next boundary.

use core::ops::RangeInclusive;

use heapless::Vec;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::app::events::{AdjustDirection, Label, ZoneState};
use crate::app::ports::StoragePort;
use crate::error::{StorageError, ThermostatError};

/// Local-proxy targets accepted on a mapping (°C).
pub const MAPPING_TARGET_RANGE: RangeInclusive<f32> = 5.0..=30.0;

/// Overlay setpoints the controller may write (°C).
pub const OVERLAY_RANGE: RangeInclusive<f32> = 5.0..=25.0;

pub const DEFAULT_HYSTERESIS_C: f32 = 0.5;

/// Largest deadband accepted from a command.
pub const MAX_HYSTERESIS_C: f32 = 5.0;

pub const MAX_MAPPINGS: usize = 8;

/// A local reading older than this no longer stands in for the zone's own.
pub const LOCAL_READING_MAX_AGE_MS: u64 = 120_000;

const NS: &str = "tado";
const KEY_ZONES: &str = "zones";

// ───────────────────────────────────────────────────────────────
// ZoneMapping
// ───────────────────────────────────────────────────────────────

/// Link between a thermostat zone and a locally desired temperature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneMapping {
    pub zone_id: u32,
    pub zone_name: Label,
    pub target_c: f32,
    pub auto_adjust: bool,
    /// Always `> 0`.
    pub hysteresis_c: f32,
}

impl ZoneMapping {
    pub fn new(
        zone_id: u32,
        zone_name: &str,
        target_c: f32,
        auto_adjust: bool,
        hysteresis_c: f32,
    ) -> Result<Self, ThermostatError> {
        let mapping = Self {
            zone_id,
            zone_name: Label::truncated(zone_name),
            target_c,
            auto_adjust,
            hysteresis_c,
        };
        mapping.validate()?;
        Ok(mapping)
    }

    pub fn validate(&self) -> Result<(), ThermostatError> {
        if !MAPPING_TARGET_RANGE.contains(&self.target_c) {
            return Err(ThermostatError::InvalidSetpoint);
        }
        if !(self.hysteresis_c > 0.0 && self.hysteresis_c <= MAX_HYSTERESIS_C) {
            return Err(ThermostatError::InvalidSetpoint);
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────
// MappingTable
// ───────────────────────────────────────────────────────────────

/// Bounded set of mappings, one per zone, persisted as a postcard list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingTable {
    entries: Vec<ZoneMapping, MAX_MAPPINGS>,
}

impl MappingTable {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert or replace the mapping for `mapping.zone_id`.
    pub fn upsert(&mut self, mapping: ZoneMapping) -> Result<(), ThermostatError> {
        mapping.validate()?;
        if let Some(slot) = self.get_mut(mapping.zone_id) {
            *slot = mapping;
            return Ok(());
        }
        self.entries
            .push(mapping)
            .map_err(|_| ThermostatError::MappingTableFull)
    }

    pub fn get(&self, zone_id: u32) -> Option<&ZoneMapping> {
        self.entries.iter().find(|m| m.zone_id == zone_id)
    }

    pub fn get_mut(&mut self, zone_id: u32) -> Option<&mut ZoneMapping> {
        self.entries.iter_mut().find(|m| m.zone_id == zone_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ZoneMapping> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load from storage.  Missing or undecodable data yields an empty table.
    pub fn load(storage: &impl StoragePort) -> Self {
        let mut buf = [0u8; 512];
        match storage.read(NS, KEY_ZONES, &mut buf) {
            Ok(n) => match postcard::from_bytes::<Vec<ZoneMapping, MAX_MAPPINGS>>(&buf[..n]) {
                Ok(entries) => {
                    let mut table = Self::new();
                    for m in entries.into_iter().filter(|m| m.validate().is_ok()) {
                        let _ = table.upsert(m);
                    }
                    debug!("Tado: loaded {} zone mapping(s)", table.len());
                    table
                }
                Err(_) => {
                    warn!("Tado: stored zone mappings unreadable, starting empty");
                    Self::new()
                }
            },
            Err(_) => Self::new(),
        }
    }

    pub fn save(&self, storage: &mut impl StoragePort) -> Result<(), StorageError> {
        let bytes = postcard::to_allocvec(&self.entries).map_err(|_| StorageError::IoError)?;
        storage.write(NS, KEY_ZONES, &bytes)
    }
}

// ───────────────────────────────────────────────────────────────
// Controller
// ───────────────────────────────────────────────────────────────

/// One correction the controller wants applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub zone_id: u32,
    pub direction: AdjustDirection,
    pub delta_c: f32,
    pub measured_c: f32,
    pub new_target_c: f32,
}

/// Pure hysteresis decision.  `thermostat_target_c` is what the thermostat
/// currently holds; the correction moves it by one `step_c`.
pub fn evaluate(
    mapping: &ZoneMapping,
    measured_c: f32,
    thermostat_target_c: f32,
    step_c: f32,
) -> Option<Correction> {
    let delta = mapping.target_c - measured_c;
    let (direction, proposed) = if delta > mapping.hysteresis_c {
        (AdjustDirection::Raise, thermostat_target_c + step_c)
    } else if delta < -mapping.hysteresis_c {
        (AdjustDirection::Lower, thermostat_target_c - step_c)
    } else {
        return None;
    };
    let new_target = proposed.clamp(*OVERLAY_RANGE.start(), *OVERLAY_RANGE.end());
    if (new_target - thermostat_target_c).abs() < f32::EPSILON {
        return None;
    }
    Some(Correction {
        zone_id: mapping.zone_id,
        direction,
        delta_c: delta,
        measured_c,
        new_target_c: new_target,
    })
}

/// Cycle gate and measurement source for the auto-adjust loop.
#[derive(Debug, Clone)]
pub struct AutoAdjustController {
    cycle_ms: u32,
    step_c: f32,
    local_zone_id: Option<u32>,
    next_cycle_at: u64,
    local: Option<(f32, u64)>,
    corrections: u32,
}

impl AutoAdjustController {
    pub fn new(cycle_ms: u32, step_c: f32, local_zone_id: Option<u32>) -> Self {
        Self {
            cycle_ms,
            step_c,
            local_zone_id,
            next_cycle_at: 0,
            local: None,
            corrections: 0,
        }
    }

    /// Record a reading from the panel's own sensor.
    pub fn observe_local(&mut self, temperature_c: f32, now_ms: u64) {
        self.local = Some((temperature_c, now_ms));
    }

    /// True once per cycle boundary; arms the next boundary when it fires.
    pub fn cycle_due(&mut self, now_ms: u64) -> bool {
        if now_ms < self.next_cycle_at {
            return false;
        }
        self.next_cycle_at = now_ms + u64::from(self.cycle_ms);
        true
    }

    pub fn next_cycle_at(&self) -> u64 {
        self.next_cycle_at
    }

    /// Measurement used for `mapping`: the panel's own reading when this
    /// zone is the local one and the reading is fresh, else the zone's.
    pub fn measured(&self, mapping: &ZoneMapping, zone: &ZoneState, now_ms: u64) -> Option<f32> {
        if self.local_zone_id == Some(mapping.zone_id) {
            if let Some((temp, at)) = self.local {
                if now_ms.saturating_sub(at) <= LOCAL_READING_MAX_AGE_MS {
                    return Some(temp);
                }
            }
        }
        zone.current_c
    }

    /// Correction for one zone at a cycle boundary, if any.
    pub fn decide(&self, mapping: &ZoneMapping, zone: &ZoneState, now_ms: u64) -> Option<Correction> {
        if !mapping.auto_adjust {
            return None;
        }
        let measured = self.measured(mapping, zone, now_ms)?;
        // Heating off: start correcting from the mapping's own target.
        let current_target = zone.target_c.unwrap_or(mapping.target_c);
        evaluate(mapping, measured, current_target, self.step_c)
    }

    pub fn record_applied(&mut self) {
        self.corrections = self.corrections.wrapping_add(1);
    }

    pub fn corrections(&self) -> u32 {
        self.corrections
    }
}

//! Room climate sensor: NTC thermistor plus ratiometric humidity sensor,
//! both sampled through the ESP32-S3 ADC1 oneshot driver.
//!
//! Implements [`SensorPort`].
//!
//! - Temperature: 10 kOhm NTC (B = 3950) in a divider with a fixed 10 kOhm
//!   resistor, converted with the simplified Beta equation.
//! - Humidity: analog output of 0.826 V at 0 %RH rising 31.5 mV per %RH
//!   (HIH-4030 class, 5 V supply divided down), temperature compensated.
//!
//! A reading pinned to either rail means an open or shorted line; the
//! sample is reported as missing rather than converted to nonsense.
//!
//! ## Dual-target design
//!
//! On ESP-IDF the adapter owns an ADC1 oneshot unit.  On host/test the raw
//! counts come from atomics so tests can inject them.

#[cfg(not(target_os = "espidf"))]
use core::sync::atomic::{AtomicU16, Ordering};

use log::{info, warn};

use crate::app::ports::{SensorPort, SensorSample};

pub const ADC1_CH_TEMP: u32 = 8;
pub const ADC1_CH_HUMIDITY: u32 = 9;

const R25: f32 = 10_000.0;
const BETA: f32 = 3950.0;
const T25_K: f32 = 298.15;
const R_DIVIDER: f32 = 10_000.0;
const ADC_MAX: f32 = 4095.0;
const V_REF: f32 = 3.3;

/// Humidity output divider (5 V sensor into a 3.3 V ADC).
const HUMIDITY_DIVIDER: f32 = 0.6;
const HUMIDITY_ZERO_V: f32 = 0.826;
const HUMIDITY_SLOPE_V: f32 = 0.031_5;

/// Counts within this distance of either rail are treated as a wiring fault.
const RAIL_MARGIN: u16 = 12;

#[cfg(not(target_os = "espidf"))]
static SIM_TEMP_ADC: AtomicU16 = AtomicU16::new(2048);
#[cfg(not(target_os = "espidf"))]
static SIM_HUMIDITY_ADC: AtomicU16 = AtomicU16::new(1900);

#[cfg(not(target_os = "espidf"))]
pub fn sim_set_temp_adc(raw: u16) {
    SIM_TEMP_ADC.store(raw, Ordering::Relaxed);
}

#[cfg(not(target_os = "espidf"))]
pub fn sim_set_humidity_adc(raw: u16) {
    SIM_HUMIDITY_ADC.store(raw, Ordering::Relaxed);
}

pub struct ClimateSensor {
    #[cfg(target_os = "espidf")]
    adc: esp_idf_svc::sys::adc_oneshot_unit_handle_t,
    misses: u32,
}

// SAFETY: the oneshot handle is used only from the I/O thread that owns
// the adapter.
#[cfg(target_os = "espidf")]
unsafe impl Send for ClimateSensor {}

impl ClimateSensor {
    #[cfg(target_os = "espidf")]
    pub fn new() -> Result<Self, i32> {
        use esp_idf_svc::sys::*;

        let mut handle: adc_oneshot_unit_handle_t = core::ptr::null_mut();
        let init_cfg = adc_oneshot_unit_init_cfg_t {
            unit_id: adc_unit_t_ADC_UNIT_1,
            ulp_mode: adc_ulp_mode_t_ADC_ULP_MODE_DISABLE,
            ..Default::default()
        };
        // SAFETY: out-pointer is a valid local.
        let ret = unsafe { adc_oneshot_new_unit(&init_cfg, &mut handle) };
        if ret != ESP_OK as i32 {
            return Err(ret);
        }
        let chan_cfg = adc_oneshot_chan_cfg_t {
            atten: adc_atten_t_ADC_ATTEN_DB_12,
            bitwidth: adc_bitwidth_t_ADC_BITWIDTH_12,
        };
        for channel in [ADC1_CH_TEMP, ADC1_CH_HUMIDITY] {
            // SAFETY: handle was just created by adc_oneshot_new_unit.
            let ret = unsafe { adc_oneshot_config_channel(handle, channel, &chan_cfg) };
            if ret != ESP_OK as i32 {
                return Err(ret);
            }
        }
        info!("Sensor: ADC1 configured (CH{}=temp, CH{}=humidity)", ADC1_CH_TEMP, ADC1_CH_HUMIDITY);
        Ok(Self { adc: handle, misses: 0 })
    }

    #[cfg(not(target_os = "espidf"))]
    #[allow(clippy::unnecessary_wraps)]
    pub fn new() -> Result<Self, i32> {
        info!("Sensor: simulated climate sensor");
        Ok(Self { misses: 0 })
    }

    /// Consecutive reads that produced no sample.
    pub fn misses(&self) -> u32 {
        self.misses
    }

    #[cfg(target_os = "espidf")]
    fn read_adc(&self, channel: u32) -> Option<u16> {
        let mut raw: i32 = 0;
        // SAFETY: the handle lives as long as self; reads are single-threaded.
        let ret = unsafe { esp_idf_svc::sys::adc_oneshot_read(self.adc, channel, &mut raw) };
        if ret != esp_idf_svc::sys::ESP_OK as i32 {
            return None;
        }
        Some(raw.max(0) as u16)
    }

    #[cfg(not(target_os = "espidf"))]
    fn read_adc(&self, channel: u32) -> Option<u16> {
        let cell = if channel == ADC1_CH_TEMP {
            &SIM_TEMP_ADC
        } else {
            &SIM_HUMIDITY_ADC
        };
        Some(cell.load(Ordering::Relaxed))
    }
}

fn in_range(raw: u16) -> bool {
    raw > RAIL_MARGIN && raw < (ADC_MAX as u16).saturating_sub(RAIL_MARGIN)
}

fn counts_to_volts(raw: u16) -> f32 {
    (f32::from(raw) / ADC_MAX) * V_REF
}

pub fn adc_to_celsius(raw: u16) -> Option<f32> {
    if !in_range(raw) {
        return None;
    }
    let voltage = counts_to_volts(raw);
    let r_ntc = R_DIVIDER * voltage / (V_REF - voltage);
    let inv_t = (1.0 / T25_K) + (1.0 / BETA) * (r_ntc / R25).ln();
    if inv_t <= 0.0 {
        return None;
    }
    Some((1.0 / inv_t) - 273.15)
}

pub fn adc_to_humidity(raw: u16, celsius: f32) -> Option<f32> {
    if !in_range(raw) {
        return None;
    }
    let sensor_v = counts_to_volts(raw) / HUMIDITY_DIVIDER;
    let rh = (sensor_v - HUMIDITY_ZERO_V) / HUMIDITY_SLOPE_V;
    let compensated = rh / (1.0546 - 0.002_16 * celsius);
    Some(compensated.clamp(0.0, 100.0))
}

impl SensorPort for ClimateSensor {
    fn read(&mut self) -> Option<SensorSample> {
        let sample = self
            .read_adc(ADC1_CH_TEMP)
            .and_then(adc_to_celsius)
            .and_then(|temperature_c| {
                let humidity_pct = self
                    .read_adc(ADC1_CH_HUMIDITY)
                    .and_then(|raw| adc_to_humidity(raw, temperature_c))?;
                Some(SensorSample {
                    temperature_c,
                    humidity_pct,
                })
            });
        match sample {
            Some(_) => self.misses = 0,
            None => {
                self.misses = self.misses.saturating_add(1);
                if self.misses == 1 {
                    warn!("Sensor: read failed (open or shorted input?)");
                }
            }
        }
        sample
    }
}

//! System configuration parameters
//!
//! All tunable parameters for the SmartPanel I/O context.
//! Values can be overridden via NVS (non-volatile storage).

use heapless::String;
use serde::{Deserialize, Serialize};

/// Core system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    // --- Broker ---
    /// MQTT broker host name or IP
    pub broker_host: String<64>,
    /// MQTT broker TCP port
    pub broker_port: u16,
    /// Broker username (empty = anonymous)
    pub broker_user: String<32>,
    /// Broker password (empty = none)
    pub broker_password: String<64>,
    /// Topic prefix override; empty means "use the MAC-derived device id"
    pub device_id_override: String<16>,

    // --- Reconnect backoff ---
    /// First reconnect delay (milliseconds)
    pub reconnect_initial_ms: u32,
    /// Upper bound on reconnect delay (milliseconds)
    pub reconnect_max_ms: u32,
    /// Jitter as a fraction of the delay, in percent (0-25)
    pub reconnect_jitter_percent: u8,

    // --- Commands ---
    /// How long an inbound command may stay unacknowledged (milliseconds)
    pub command_timeout_ms: u32,
    /// How long terminal commands are retained for diagnostics (milliseconds)
    pub command_retention_ms: u32,

    // --- Bridge ---
    /// Discovery window before giving up (milliseconds)
    pub bridge_discovery_timeout_ms: u32,
    /// Link-button pairing window (milliseconds)
    pub bridge_pairing_window_ms: u32,
    /// Pairing request cadence while waiting for the button (milliseconds)
    pub bridge_pairing_poll_ms: u32,
    /// Room state poll interval (milliseconds)
    pub bridge_room_poll_ms: u32,
    /// Hold time in Error before resetting to Disconnected (milliseconds)
    pub service_error_hold_ms: u32,

    // --- Thermostat ---
    /// Auto-adjust control cycle (milliseconds)
    pub control_cycle_ms: u32,
    /// Zone state poll interval (milliseconds)
    pub zone_poll_ms: u32,
    /// Refresh the access token this long before it expires (seconds)
    pub token_refresh_margin_secs: u32,
    /// Corrective step applied to the thermostat target (°C)
    pub auto_adjust_step_c: f32,
    /// Zone fed by the panel's own temperature sensor, if any
    pub local_zone_id: Option<u32>,

    // --- Timing ---
    /// Sensor read interval (milliseconds)
    pub sensor_read_interval_ms: u32,
    /// Telemetry publish interval (seconds)
    pub telemetry_interval_secs: u32,
    /// Online heartbeat interval (seconds)
    pub heartbeat_interval_secs: u32,
    /// I/O context tick (milliseconds)
    pub io_tick_ms: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        let mut broker_host = String::new();
        let _ = broker_host.push_str("mqtt.local");

        Self {
            // Broker
            broker_host,
            broker_port: 1883,
            broker_user: String::new(),
            broker_password: String::new(),
            device_id_override: String::new(),

            // Backoff
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 60_000,
            reconnect_jitter_percent: 20,

            // Commands
            command_timeout_ms: 15_000,
            command_retention_ms: 60_000,

            // Bridge
            bridge_discovery_timeout_ms: 10_000,
            bridge_pairing_window_ms: 30_000, // bridge link button stays armed 30 s
            bridge_pairing_poll_ms: 2_000,
            bridge_room_poll_ms: 5_000,
            service_error_hold_ms: 30_000,

            // Thermostat
            control_cycle_ms: 300_000, // 5 min
            zone_poll_ms: 60_000,
            token_refresh_margin_secs: 60,
            auto_adjust_step_c: 0.5,
            local_zone_id: None,

            // Timing
            sensor_read_interval_ms: 2_000,
            telemetry_interval_secs: 60,
            heartbeat_interval_secs: 30,
            io_tick_ms: 50,
        }
    }
}

/// Range-check every field.  Invalid values are rejected, never clamped.
pub fn validate_config(cfg: &SystemConfig) -> Result<(), &'static str> {
    if cfg.broker_host.is_empty() {
        return Err("broker_host must not be empty");
    }
    if cfg.broker_port == 0 {
        return Err("broker_port must be 1-65535");
    }
    if !(100..=30_000).contains(&cfg.reconnect_initial_ms) {
        return Err("reconnect_initial_ms must be 100-30000");
    }
    if cfg.reconnect_max_ms < cfg.reconnect_initial_ms || cfg.reconnect_max_ms > 600_000 {
        return Err("reconnect_max_ms must be >= reconnect_initial_ms and <= 600000");
    }
    if cfg.reconnect_jitter_percent > 25 {
        return Err("reconnect_jitter_percent must be 0-25");
    }
    if !(1_000..=120_000).contains(&cfg.command_timeout_ms) {
        return Err("command_timeout_ms must be 1000-120000");
    }
    if cfg.command_retention_ms < cfg.command_timeout_ms {
        return Err("command_retention_ms must be >= command_timeout_ms");
    }
    if !(1_000..=60_000).contains(&cfg.bridge_discovery_timeout_ms) {
        return Err("bridge_discovery_timeout_ms must be 1000-60000");
    }
    if !(5_000..=120_000).contains(&cfg.bridge_pairing_window_ms) {
        return Err("bridge_pairing_window_ms must be 5000-120000");
    }
    if cfg.bridge_pairing_poll_ms == 0 || cfg.bridge_pairing_poll_ms > cfg.bridge_pairing_window_ms
    {
        return Err("bridge_pairing_poll_ms must be within the pairing window");
    }
    if !(1_000..=600_000).contains(&cfg.bridge_room_poll_ms) {
        return Err("bridge_room_poll_ms must be 1000-600000");
    }
    if !(10_000..=3_600_000).contains(&cfg.control_cycle_ms) {
        return Err("control_cycle_ms must be 10000-3600000");
    }
    if !(5_000..=3_600_000).contains(&cfg.zone_poll_ms) {
        return Err("zone_poll_ms must be 5000-3600000");
    }
    if !(0.1..=2.0).contains(&cfg.auto_adjust_step_c) {
        return Err("auto_adjust_step_c must be 0.1-2.0");
    }
    if !(10..=600).contains(&cfg.token_refresh_margin_secs) {
        return Err("token_refresh_margin_secs must be 10-600");
    }
    if !(20..=1_000).contains(&cfg.io_tick_ms) {
        return Err("io_tick_ms must be 20-1000");
    }
    if cfg.sensor_read_interval_ms < cfg.io_tick_ms {
        return Err("sensor_read_interval_ms must be >= io_tick_ms");
    }
    if !(5..=3_600).contains(&cfg.telemetry_interval_secs) {
        return Err("telemetry_interval_secs must be 5-3600");
    }
    if !(5..=600).contains(&cfg.heartbeat_interval_secs) {
        return Err("heartbeat_interval_secs must be 5-600");
    }
    Ok(())
}

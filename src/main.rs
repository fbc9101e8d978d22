//! SmartPanel Firmware: Main Entry Point
//!
//! Boots the panel, then splits the work across the two cores:
//!
//! ```text
//! ┌──────────────────────────────── Core 0 ───────────────────────────────┐
//! │  I/O context (io_task)                                                │
//! │   MqttAdapter  HttpAdapter  MdnsDiscovery  ClimateSensor  NvsAdapter  │
//! │   ─────────────────── Port Trait Boundary ─────────────────────────   │
//! │   TransportClient · BridgeService · ThermostatService · tracker       │
//! └───────────────────────────────┬───────────────────▲───────────────────┘
//!                     EVENTS (32) │                   │ INTENTS (8)
//! ┌───────────────────────────────▼───────────────────┴─── Core 1 ────────┐
//! │  Presentation context: PresentationLink → PanelModel → display        │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

mod esp_link_shims;

use core::time::Duration;

use anyhow::{Result, anyhow};
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use log::{info, warn};

use smartpanel::adapters::device_id;
use smartpanel::adapters::http::{DEFAULT_TIMEOUT, HttpAdapter};
use smartpanel::adapters::mdns::MdnsDiscovery;
use smartpanel::adapters::mqtt::MqttAdapter;
use smartpanel::adapters::nvs::NvsAdapter;
use smartpanel::adapters::sensors::ClimateSensor;
use smartpanel::adapters::system::{self, DeviceSystem};
use smartpanel::adapters::time::MonotonicClock;
use smartpanel::adapters::wifi::{WifiCredentials, WifiStation};
use smartpanel::app::events::ChannelEvent;
use smartpanel::app::intents::UserIntent;
use smartpanel::app::orchestrator::{IoOrchestrator, IoPorts};
use smartpanel::app::ports::ConfigPort;
use smartpanel::app::presentation::PresentationLink;
use smartpanel::channel::{CrossCoreChannel, EVENT_DEPTH, INTENT_DEPTH};
use smartpanel::config::SystemConfig;
use smartpanel::drivers::task_pin::{Core, spawn_on_core};
use smartpanel::fsm::ServiceKind;
use smartpanel::io_task::{self, PanelIo};

// ── Cross-core channels ───────────────────────────────────────

static EVENTS: CrossCoreChannel<ChannelEvent, EVENT_DEPTH> = CrossCoreChannel::new();
static INTENTS: CrossCoreChannel<UserIntent, INTENT_DEPTH> = CrossCoreChannel::new();

// ── Main ──────────────────────────────────────────────────────

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("╔══════════════════════════════════════╗");
    info!("║  SmartPanel v{}                      ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    system::check_rollback();

    // ── 2. Load config from NVS (or defaults) ─────────────────
    let nvs = NvsAdapter::new().map_err(|e| anyhow!("NVS init failed: {e}"))?;
    let config = match nvs.load() {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("NVS config load failed ({}), using defaults", e);
            SystemConfig::default()
        }
    };

    // ── 3. Identity ───────────────────────────────────────────
    let mac = device_id::read_mac();
    let id = device_id::effective_device_id(&mac, &config.device_id_override);
    let hostname = device_id::hostname(&mac);
    info!("Device {} ({}.local)", id, hostname);

    // ── 4. Network ────────────────────────────────────────────
    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let wifi = match WifiCredentials::load(&nvs) {
        Ok(creds) => match WifiStation::start(
            peripherals.modem,
            sysloop,
            Some(nvs_partition),
            &creds,
        ) {
            Ok(sta) => Some(sta),
            Err(e) => {
                warn!("WiFi: station start failed ({}), running offline", e);
                None
            }
        },
        Err(e) => {
            warn!("WiFi: {}, running offline", e);
            None
        }
    };

    // ── 5. Adapters ───────────────────────────────────────────
    let sensor = ClimateSensor::new().map_err(|e| anyhow!("ADC init failed ({e})"))?;
    let mut discovery = MdnsDiscovery::new(hostname);
    discovery.init();
    let mqtt = MqttAdapter::new(&config, &id);

    // ── 6. I/O context on Core 0 ──────────────────────────────
    let tick = Duration::from_millis(u64::from(config.io_tick_ms));
    let io_handle = io_task::spawn(
        move || {
            let clock = MonotonicClock::new();
            let ports = IoPorts {
                mqtt,
                bridge_http: HttpAdapter::new(DEFAULT_TIMEOUT),
                discovery,
                thermostat_http: HttpAdapter::new(DEFAULT_TIMEOUT),
                sensor,
                storage: nvs,
                system: DeviceSystem::new(),
            };
            PanelIo {
                orchestrator: IoOrchestrator::new(ports, &id, &mac, &config, clock.uptime_ms()),
                wifi,
            }
        },
        &EVENTS,
        &INTENTS,
        tick,
    )?;

    // ── 7. Presentation context on Core 1 ─────────────────────
    let ui_handle = spawn_on_core(Core::App, 5, 16, "panel-ui\0", presentation_loop)?;

    info!("System ready.");
    if io_handle.join().is_err() || ui_handle.join().is_err() {
        return Err(anyhow!("a panel task exited"));
    }
    Ok(())
}

/// Display side: fold events into the model and report what changed.
fn presentation_loop() {
    let mut link = PresentationLink::new(&EVENTS, &INTENTS);
    let mut last_states = [None; 3];
    let mut shown_prompt = None;
    let mut reported_drops = 0;

    loop {
        if link.poll(Duration::from_millis(250)) == 0 {
            continue;
        }
        let model = link.model();
        for kind in ServiceKind::ALL {
            let view = model.service(kind);
            if last_states[kind as usize] != Some(view) {
                last_states[kind as usize] = Some(view);
                info!("UI: {:?} → {} {}", kind, view.state.as_str(), view.reason);
            }
        }
        if model.auth_prompt != shown_prompt {
            shown_prompt = model.auth_prompt;
            if let Some(prompt) = shown_prompt.as_ref() {
                info!("UI: visit {} and enter {}", prompt.verification_uri, prompt.user_code);
            }
        }
        if model.dropped_events != reported_drops {
            reported_drops = model.dropped_events;
            warn!("UI: {} events dropped so far", reported_drops);
        }
    }
}

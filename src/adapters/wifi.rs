//! WiFi station-mode adapter.
//!
//! Credentials live in NVS namespace `wifi` (`ssid`, `pass`) and are
//! validated before use.  The station itself is brought up once at boot
//! and then watched from the I/O context: a dropped association is
//! retried with an exponential backoff (2 s → 4 s → 8 s … capped at 60 s).
//!
//! ## cfg gating
//!
//! - **`target_os = "espidf"`**: `BlockingWifi<EspWifi>` from `esp-idf-svc`.
//! - **all other targets**: simulation that tests can disconnect at will.

use core::fmt;

use log::{error, info, warn};

use crate::app::ports::StoragePort;
use crate::utils::is_printable_ascii;

pub const NVS_NAMESPACE: &str = "wifi";
pub const KEY_SSID: &str = "ssid";
pub const KEY_PASS: &str = "pass";

const INITIAL_BACKOFF_MS: u64 = 2_000;
const MAX_BACKOFF_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityError {
    NoCredentials,
    InvalidSsid,
    InvalidPassword,
    ConnectionFailed,
}

impl fmt::Display for ConnectivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCredentials => write!(f, "no WiFi credentials configured"),
            Self::InvalidSsid => write!(f, "SSID invalid (must be 1-32 printable ASCII bytes)"),
            Self::InvalidPassword => write!(
                f,
                "password invalid (must be 8-64 bytes for WPA2, or empty for open)"
            ),
            Self::ConnectionFailed => write!(f, "WiFi connection failed"),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Credentials
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: heapless::String<32>,
    pub password: heapless::String<64>,
}

fn validate_ssid(ssid: &str) -> Result<(), ConnectivityError> {
    if ssid.is_empty() || ssid.len() > 32 || !is_printable_ascii(ssid) {
        return Err(ConnectivityError::InvalidSsid);
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), ConnectivityError> {
    // Open networks have no password; WPA2-PSK needs 8..=64 bytes.
    if password.is_empty() {
        return Ok(());
    }
    if password.len() < 8 || password.len() > 64 || !is_printable_ascii(password) {
        return Err(ConnectivityError::InvalidPassword);
    }
    Ok(())
}

impl WifiCredentials {
    pub fn new(ssid: &str, password: &str) -> Result<Self, ConnectivityError> {
        validate_ssid(ssid)?;
        validate_password(password)?;
        Ok(Self {
            ssid: heapless::String::try_from(ssid).map_err(|()| ConnectivityError::InvalidSsid)?,
            password: heapless::String::try_from(password)
                .map_err(|()| ConnectivityError::InvalidPassword)?,
        })
    }

    /// Read and validate the stored network.
    pub fn load(storage: &impl StoragePort) -> Result<Self, ConnectivityError> {
        let mut ssid = [0u8; 32];
        let mut pass = [0u8; 64];
        let n = storage
            .read(NVS_NAMESPACE, KEY_SSID, &mut ssid)
            .map_err(|_| ConnectivityError::NoCredentials)?;
        let ssid = core::str::from_utf8(&ssid[..n]).map_err(|_| ConnectivityError::InvalidSsid)?;
        let m = if storage.exists(NVS_NAMESPACE, KEY_PASS) {
            storage
                .read(NVS_NAMESPACE, KEY_PASS, &mut pass)
                .map_err(|_| ConnectivityError::InvalidPassword)?
        } else {
            0
        };
        let pass =
            core::str::from_utf8(&pass[..m]).map_err(|_| ConnectivityError::InvalidPassword)?;
        Self::new(ssid, pass)
    }

    pub fn store(&self, storage: &mut impl StoragePort) -> Result<(), crate::error::StorageError> {
        storage.write(NVS_NAMESPACE, KEY_SSID, self.ssid.as_bytes())?;
        storage.write(NVS_NAMESPACE, KEY_PASS, self.password.as_bytes())
    }
}

// ───────────────────────────────────────────────────────────────
// Station
// ───────────────────────────────────────────────────────────────

pub struct WifiStation {
    next_retry_at: u64,
    backoff_ms: u64,
    reconnects: u32,
    #[cfg(target_os = "espidf")]
    wifi: esp_idf_svc::wifi::BlockingWifi<esp_idf_svc::wifi::EspWifi<'static>>,
    #[cfg(not(target_os = "espidf"))]
    sim_connected: bool,
    #[cfg(not(target_os = "espidf"))]
    sim_fail: bool,
}

impl WifiStation {
    /// Configure the station and block until the first association.
    #[cfg(target_os = "espidf")]
    pub fn start(
        modem: esp_idf_svc::hal::modem::Modem,
        sysloop: esp_idf_svc::eventloop::EspSystemEventLoop,
        nvs: Option<esp_idf_svc::nvs::EspDefaultNvsPartition>,
        creds: &WifiCredentials,
    ) -> Result<Self, ConnectivityError> {
        use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};

        let fail = |e: esp_idf_svc::sys::EspError| {
            error!("WiFi: driver error {:?}", e);
            ConnectivityError::ConnectionFailed
        };
        let esp_wifi = EspWifi::new(modem, sysloop.clone(), nvs).map_err(fail)?;
        let mut wifi = BlockingWifi::wrap(esp_wifi, sysloop).map_err(fail)?;
        let auth_method = if creds.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: creds.ssid.clone(),
            password: creds.password.clone(),
            auth_method,
            ..Default::default()
        }))
        .map_err(fail)?;
        wifi.start().map_err(fail)?;
        info!("WiFi: connecting to '{}'", creds.ssid);
        let mut station = Self {
            next_retry_at: 0,
            backoff_ms: INITIAL_BACKOFF_MS,
            reconnects: 0,
            wifi,
        };
        if let Err(e) = station.platform_connect() {
            // Keep the driver; the I/O context retries.
            warn!("WiFi: first association failed: {}", e);
        }
        Ok(station)
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn start(creds: &WifiCredentials) -> Result<Self, ConnectivityError> {
        info!("WiFi(sim): associated with '{}'", creds.ssid);
        Ok(Self {
            next_retry_at: 0,
            backoff_ms: INITIAL_BACKOFF_MS,
            reconnects: 0,
            sim_connected: true,
            sim_fail: false,
        })
    }

    /// Simulation: lose the association; `fail` keeps reconnects failing.
    #[cfg(not(target_os = "espidf"))]
    pub fn sim_drop(&mut self, fail: bool) {
        self.sim_connected = false;
        self.sim_fail = fail;
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    pub fn is_connected(&self) -> bool {
        self.platform_is_connected()
    }

    /// Called from the I/O context.  Retries a lost association once the
    /// backoff delay has passed.
    pub fn watch(&mut self, now_ms: u64) {
        if self.platform_is_connected() {
            self.backoff_ms = INITIAL_BACKOFF_MS;
            return;
        }
        if now_ms < self.next_retry_at {
            return;
        }
        self.reconnects = self.reconnects.wrapping_add(1);
        info!("WiFi: reconnect attempt {}", self.reconnects);
        match self.platform_connect() {
            Ok(()) => {
                info!("WiFi: reconnected");
                self.backoff_ms = INITIAL_BACKOFF_MS;
            }
            Err(e) => {
                warn!("WiFi: {} (retry in {} ms)", e, self.backoff_ms);
                self.next_retry_at = now_ms + self.backoff_ms;
                self.backoff_ms = (self.backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }

    // ── Platform-specific ─────────────────────────────────────

    #[cfg(target_os = "espidf")]
    fn platform_connect(&mut self) -> Result<(), ConnectivityError> {
        self.wifi
            .connect()
            .and_then(|()| self.wifi.wait_netif_up())
            .map_err(|e| {
                warn!("WiFi: connect error {:?}", e);
                ConnectivityError::ConnectionFailed
            })
    }

    #[cfg(not(target_os = "espidf"))]
    fn platform_connect(&mut self) -> Result<(), ConnectivityError> {
        if self.sim_fail {
            return Err(ConnectivityError::ConnectionFailed);
        }
        self.sim_connected = true;
        Ok(())
    }

    #[cfg(target_os = "espidf")]
    fn platform_is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    #[cfg(not(target_os = "espidf"))]
    fn platform_is_connected(&self) -> bool {
        self.sim_connected
    }
}

// ───────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────

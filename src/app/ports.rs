//! Port traits: the hexagonal boundary between the I/O services and the
//! outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ TransportClient / BridgeService /
//!                              ThermostatService / IoOrchestrator
//! ```
//!
//! Driven adapters (broker client, HTTP client, mDNS browser, sensor,
//! storage, event sink) implement these traits.  Services take them as
//! generics at the call site, so nothing in the domain layer touches
//! ESP-IDF directly and every service runs against mocks on the host.
//!
//! ## Contract notes
//!
//! - All ports are **non-blocking or bounded**: the I/O context
//!   timeslices between services, so no port may wait indefinitely.
//! - **ConfigPort** implementations MUST validate before persisting.
//! - **StoragePort** writes MUST be atomic per key.

use crate::config::SystemConfig;
use crate::error::{ErrorReason, HttpError, StorageError, TransportError};

use super::events::ChannelEvent;

// ───────────────────────────────────────────────────────────────
// Publish/subscribe broker
// ───────────────────────────────────────────────────────────────

/// Session-level notifications from the broker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    Connected,
    Disconnected,
    /// CONNACK refused for bad credentials / not authorized.
    AuthRejected,
    Message { topic: String, payload: Vec<u8> },
}

/// Publish/subscribe client.  Connection is asynchronous: `connect`
/// only starts it, and the outcome arrives through `poll_event`.
pub trait MqttPort {
    fn connect(&mut self) -> Result<(), TransportError>;

    fn disconnect(&mut self);

    fn subscribe(&mut self, filter: &str) -> Result<(), TransportError>;

    /// Fire-and-forget publish (QoS 0/1 at the adapter's discretion).
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool)
    -> Result<(), TransportError>;

    /// Next pending session event, if any.  Never blocks.
    fn poll_event(&mut self) -> Option<MqttEvent>;
}

// ───────────────────────────────────────────────────────────────
// HTTP(S) client
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

#[derive(Debug, Clone, Copy)]
pub struct HttpRequest<'a> {
    pub method: HttpMethod,
    pub url: &'a str,
    pub body: Option<&'a [u8]>,
    pub content_type: Option<&'a str>,
    /// OAuth access token, sent as `Authorization: Bearer ...`.
    pub bearer: Option<&'a str>,
}

impl<'a> HttpRequest<'a> {
    pub fn get(url: &'a str) -> Self {
        Self {
            method: HttpMethod::Get,
            url,
            body: None,
            content_type: None,
            bearer: None,
        }
    }

    pub fn json(method: HttpMethod, url: &'a str, body: &'a [u8]) -> Self {
        Self {
            method,
            url,
            body: Some(body),
            content_type: Some("application/json"),
            bearer: None,
        }
    }

    pub fn form(url: &'a str, body: &'a [u8]) -> Self {
        Self {
            method: HttpMethod::Post,
            url,
            body: Some(body),
            content_type: Some("application/x-www-form-urlencoded"),
            bearer: None,
        }
    }

    pub fn with_bearer(mut self, token: &'a str) -> Self {
        self.bearer = Some(token);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Blocking request with an adapter-enforced timeout.
pub trait HttpPort {
    fn send(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse, HttpError>;
}

// ───────────────────────────────────────────────────────────────
// Local bridge discovery
// ───────────────────────────────────────────────────────────────

/// Host or IP of a discovered bridge.
pub type BridgeAddress = heapless::String<64>;

/// Multicast/broadcast search for a lighting bridge on the LAN.
pub trait DiscoveryPort {
    fn start(&mut self);

    /// First bridge found since `start`, if any.  Never blocks.
    fn poll(&mut self) -> Option<BridgeAddress>;

    fn stop(&mut self);
}

// ───────────────────────────────────────────────────────────────
// Environmental sensor
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub temperature_c: f32,
    pub humidity_pct: f32,
}

pub trait SensorPort {
    /// `None` when the sensor did not answer this time.
    fn read(&mut self) -> Option<SensorSample>;
}

// ───────────────────────────────────────────────────────────────
// Event sink (I/O → presentation)
// ───────────────────────────────────────────────────────────────

/// Where services push their [`ChannelEvent`]s.  Returns `false` when
/// the event was dropped for backpressure; producers never wait.
pub trait EventSink {
    fn emit(&mut self, event: ChannelEvent) -> bool;

    /// Events lost to backpressure so far.
    fn dropped(&self) -> u32 {
        0
    }
}

impl<const N: usize> EventSink for &crate::channel::CrossCoreChannel<ChannelEvent, N> {
    fn emit(&mut self, event: ChannelEvent) -> bool {
        self.send(event)
    }

    fn dropped(&self) -> u32 {
        (**self).dropped()
    }
}

impl EventSink for Vec<ChannelEvent> {
    fn emit(&mut self, event: ChannelEvent) -> bool {
        self.push(event);
        true
    }
}

// ───────────────────────────────────────────────────────────────
// Device services
// ───────────────────────────────────────────────────────────────

/// Reboot and firmware update.
pub trait SystemPort {
    /// Restart the device.  On hardware this does not return.
    fn reboot(&mut self);

    /// Download and stage a firmware image, then reboot into it.
    fn update_firmware(&mut self, url: &str) -> Result<(), ErrorReason>;
}

// ───────────────────────────────────────────────────────────────
// Configuration port (driven adapter: domain ↔ persistent config)
// ───────────────────────────────────────────────────────────────

/// Loads and persists system configuration.
///
/// Implementations MUST validate values before persisting.  Invalid ranges
/// are rejected with [`ConfigError::ValidationFailed`], never clamped, so a
/// bad remote update cannot push the controller or reconnect logic into an
/// unusable operating point.
pub trait ConfigPort {
    /// Load configuration.  Returns [`SystemConfig::default()`] when none
    /// is stored.
    fn load(&self) -> Result<SystemConfig, ConfigError>;

    /// Validate and persist configuration.
    fn save(&self, config: &SystemConfig) -> Result<(), ConfigError>;
}

// ───────────────────────────────────────────────────────────────
// Storage port (driven adapter: domain ↔ NVS / flash)
// ───────────────────────────────────────────────────────────────

/// Persistent key-value storage for credentials, mappings and config.
///
/// - Keys are namespaced (`hue`, `tado`, `auth`, `config`, `wifi`).
/// - Write operations MUST be atomic; no partial writes on power loss.
/// - Secrets are sealed by the caller before they reach this port.
pub trait StoragePort {
    /// Read a value.  Returns the number of bytes written to `buf`.
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Write a value atomically.
    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Delete a key.  Returns `Ok(())` even if the key didn't exist.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError>;

    fn exists(&self, namespace: &str, key: &str) -> bool;
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`ConfigPort`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Stored config failed deserialization.
    Corrupted,
    /// A field failed range validation.
    ValidationFailed(&'static str),
    StorageFull,
    IoError,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
            Self::StorageFull => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl From<ConfigError> for crate::error::Error {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::ValidationFailed(msg) => Self::Config(msg),
            ConfigError::Corrupted => Self::Storage(StorageError::Corrupted),
            ConfigError::StorageFull => Self::Storage(StorageError::Full),
            ConfigError::IoError => Self::Storage(StorageError::IoError),
        }
    }
}

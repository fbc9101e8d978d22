//! Unified error types for the SmartPanel I/O firmware.
//!
//! One `Error` enum that every subsystem converts into, keeping the
//! orchestrator's error handling uniform. All variants are `Copy` so they
//! can be folded into state snapshots that cross the core boundary without
//! allocation.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

/// Every fallible operation in the I/O context funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Publish/subscribe transport failure.
    Transport(TransportError),
    /// Lighting bridge discovery, pairing, or call failure.
    Bridge(BridgeError),
    /// Thermostat authentication or API failure.
    Thermostat(ThermostatError),
    /// Non-volatile storage failure.
    Storage(StorageError),
    /// Configuration is invalid or could not be loaded.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Bridge(e) => write!(f, "bridge: {e}"),
            Self::Thermostat(e) => write!(f, "thermostat: {e}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Broker unreachable, socket reset, DNS failure.
    ConnectFailed,
    /// Broker rejected our credentials.
    AuthRejected,
    /// Operation requires an established session.
    NotConnected,
    /// Publish could not be queued by the client.
    PublishFailed,
    /// Subscription request was rejected.
    SubscribeFailed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed => write!(f, "broker connect failed"),
            Self::AuthRejected => write!(f, "broker rejected credentials"),
            Self::NotConnected => write!(f, "not connected"),
            Self::PublishFailed => write!(f, "publish failed"),
            Self::SubscribeFailed => write!(f, "subscribe failed"),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ---------------------------------------------------------------------------
// HTTP errors (shared by bridge + thermostat adapters)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpError {
    /// Connection could not be established.
    Connect,
    /// Request did not complete within the adapter timeout.
    Timeout,
    /// Response body exceeded the adapter buffer.
    BodyTooLarge,
    /// Underlying I/O failure mid-request.
    Io,
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect failed"),
            Self::Timeout => write!(f, "request timed out"),
            Self::BodyTooLarge => write!(f, "response body too large"),
            Self::Io => write!(f, "I/O error"),
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeError {
    /// Service is not in `Connected`.
    NotConnected,
    /// Bridge rejected the stored username.
    Unauthorized,
    /// Room id does not exist on the bridge.
    UnknownRoom,
    /// Bridge returned an error object for the call.
    Rejected,
    /// Response body could not be parsed.
    Malformed,
    /// HTTP layer failure.
    Http(HttpError),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "bridge not connected"),
            Self::Unauthorized => write!(f, "bridge credential rejected"),
            Self::UnknownRoom => write!(f, "unknown room"),
            Self::Rejected => write!(f, "bridge rejected request"),
            Self::Malformed => write!(f, "malformed bridge response"),
            Self::Http(e) => write!(f, "http: {e}"),
        }
    }
}

impl From<HttpError> for BridgeError {
    fn from(e: HttpError) -> Self {
        Self::Http(e)
    }
}

impl From<BridgeError> for Error {
    fn from(e: BridgeError) -> Self {
        Self::Bridge(e)
    }
}

// ---------------------------------------------------------------------------
// Thermostat errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermostatError {
    /// Service is not in `Connected`.
    NotConnected,
    /// Access token rejected (401).
    Unauthorized,
    /// Token endpoint refused the refresh token.
    RefreshFailed,
    /// Zone id is not known to this home.
    UnknownZone,
    /// Setpoint or hysteresis outside the accepted range.
    InvalidSetpoint,
    /// No free slot for another zone mapping.
    MappingTableFull,
    /// Command queue is full.
    Busy,
    /// Non-success status from the API.
    Rejected(u16),
    /// Response body could not be parsed.
    Malformed,
    /// HTTP layer failure.
    Http(HttpError),
}

impl fmt::Display for ThermostatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "thermostat not connected"),
            Self::Unauthorized => write!(f, "access token rejected"),
            Self::RefreshFailed => write!(f, "token refresh failed"),
            Self::UnknownZone => write!(f, "unknown zone"),
            Self::InvalidSetpoint => write!(f, "setpoint out of range"),
            Self::MappingTableFull => write!(f, "zone mapping table full"),
            Self::Busy => write!(f, "command queue full"),
            Self::Rejected(status) => write!(f, "api returned HTTP {status}"),
            Self::Malformed => write!(f, "malformed thermostat response"),
            Self::Http(e) => write!(f, "http: {e}"),
        }
    }
}

impl From<HttpError> for ThermostatError {
    fn from(e: HttpError) -> Self {
        Self::Http(e)
    }
}

impl From<ThermostatError> for Error {
    fn from(e: ThermostatError) -> Self {
        Self::Thermostat(e)
    }
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

/// Errors from [`StoragePort`](crate::app::ports::StoragePort) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Requested key does not exist.
    NotFound,
    /// Storage partition is full.
    Full,
    /// Generic I/O error.
    IoError,
    /// Stored blob failed its integrity check.
    Corrupted,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Full => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
            Self::Corrupted => write!(f, "stored data corrupted"),
        }
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

// ---------------------------------------------------------------------------
// Reason codes carried in cross-core snapshots
// ---------------------------------------------------------------------------

/// Compact, `Copy` reason attached to `Error` snapshots and failed acks.
///
/// The presentation context renders these; it never sees the full error
/// chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorReason {
    #[default]
    None,
    NoBridgeFound,
    PairingTimedOut,
    BridgeUnreachable,
    BridgeUnauthorized,
    DeviceCodeExpired,
    AccessDenied,
    RefreshFailed,
    BrokerAuthRejected,
    CredentialsCorrupted,
    Cancelled,
    CommandTimedOut,
    NotConnected,
    Rejected,
    InvalidCommand,
    RateLimited,
}

impl ErrorReason {
    /// Human-readable text used in acknowledgment payloads.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::NoBridgeFound => "no bridge found",
            Self::PairingTimedOut => "pairing timed out",
            Self::BridgeUnreachable => "bridge unreachable",
            Self::BridgeUnauthorized => "bridge credential rejected",
            Self::DeviceCodeExpired => "device code expired",
            Self::AccessDenied => "authorization denied",
            Self::RefreshFailed => "token refresh failed",
            Self::BrokerAuthRejected => "broker rejected credentials",
            Self::CredentialsCorrupted => "stored credentials corrupted",
            Self::Cancelled => "cancelled",
            Self::CommandTimedOut => "command timed out",
            Self::NotConnected => "service not connected",
            Self::Rejected => "rejected by device",
            Self::InvalidCommand => "invalid command",
            Self::RateLimited => "rate limited",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<BridgeError> for ErrorReason {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::NotConnected => Self::NotConnected,
            BridgeError::Unauthorized => Self::BridgeUnauthorized,
            BridgeError::Http(_) => Self::BridgeUnreachable,
            BridgeError::UnknownRoom | BridgeError::Rejected | BridgeError::Malformed => {
                Self::Rejected
            }
        }
    }
}

impl From<ThermostatError> for ErrorReason {
    fn from(e: ThermostatError) -> Self {
        match e {
            ThermostatError::NotConnected => Self::NotConnected,
            ThermostatError::RefreshFailed | ThermostatError::Unauthorized => Self::RefreshFailed,
            ThermostatError::UnknownZone | ThermostatError::InvalidSetpoint => Self::InvalidCommand,
            ThermostatError::MappingTableFull
            | ThermostatError::Busy
            | ThermostatError::Rejected(_)
            | ThermostatError::Malformed
            | ThermostatError::Http(_) => {
                Self::Rejected
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

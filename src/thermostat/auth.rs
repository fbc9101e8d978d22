//! OAuth 2.0 device authorization grant (RFC 8628) against the thermostat
//! cloud, plus refresh-token rotation.
//!
//! ```text
//!  POST /device_authorize  ──▶ device_code, user_code, verification_uri, interval
//!  POST /token (device_code) every `interval` s
//!        authorization_pending ──▶ keep polling
//!        slow_down             ──▶ interval += 5 s
//!        expired_token         ──▶ give up
//!        access_denied         ──▶ give up
//!        200                   ──▶ access_token, refresh_token, expires_in
//!  POST /token (refresh_token) before expiry
//! ```

use core::fmt;

use serde::Deserialize;

use crate::app::events::ShortText;
use crate::error::ThermostatError;

pub const DEVICE_AUTHORIZE_URL: &str = "https://login.tado.com/oauth2/device_authorize";
pub const TOKEN_URL: &str = "https://login.tado.com/oauth2/token";

/// Public client id registered for device-flow apps.
pub const CLIENT_ID: &str = "1bb50063-6b0c-4d11-bd99-387f4a91cc46";
pub const SCOPE: &str = "offline_access";

const DEVICE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Added to the poll interval on `slow_down`.
pub const SLOW_DOWN_STEP_SECS: u32 = 5;

const DEFAULT_INTERVAL_SECS: u32 = 5;

pub type UserCode = ShortText<16>;
pub type VerificationUri = ShortText<64>;

// ───────────────────────────────────────────────────────────────
// Token set
// ───────────────────────────────────────────────────────────────

/// Access and refresh token with an absolute expiry on the uptime clock.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthTokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at_ms: u64,
}

impl AuthTokenSet {
    /// True once `now` is within `margin_ms` of expiry.
    pub fn needs_refresh(&self, now_ms: u64, margin_ms: u64) -> bool {
        now_ms.saturating_add(margin_ms) >= self.expires_at_ms
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

impl fmt::Debug for AuthTokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthTokenSet")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

// ───────────────────────────────────────────────────────────────
// Device authorization
// ───────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: UserCode,
    pub verification_uri: VerificationUri,
    pub interval_secs: u32,
    pub expires_in_secs: u32,
}

impl fmt::Debug for DeviceAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAuthorization")
            .field("user_code", &self.user_code)
            .field("verification_uri", &self.verification_uri)
            .field("interval_secs", &self.interval_secs)
            .field("expires_in_secs", &self.expires_in_secs)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct DeviceAuthorizeWire {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    expires_in: u32,
    #[serde(default)]
    interval: Option<u32>,
}

pub fn device_authorize_body() -> Vec<u8> {
    form_encode(&[("client_id", CLIENT_ID), ("scope", SCOPE)])
}

pub fn parse_device_authorization(body: &[u8]) -> Result<DeviceAuthorization, ThermostatError> {
    let wire: DeviceAuthorizeWire =
        serde_json::from_slice(body).map_err(|_| ThermostatError::Malformed)?;
    let user_code = UserCode::exact(&wire.user_code).ok_or(ThermostatError::Malformed)?;
    // Prefer the short URI; fall back to the complete one if it fits better.
    let verification_uri = VerificationUri::exact(&wire.verification_uri)
        .or_else(|| {
            wire.verification_uri_complete
                .as_deref()
                .and_then(VerificationUri::exact)
        })
        .ok_or(ThermostatError::Malformed)?;
    Ok(DeviceAuthorization {
        device_code: wire.device_code,
        user_code,
        verification_uri,
        interval_secs: wire.interval.unwrap_or(DEFAULT_INTERVAL_SECS).max(1),
        expires_in_secs: wire.expires_in,
    })
}

// ───────────────────────────────────────────────────────────────
// Token endpoint
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenPoll {
    Granted(AuthTokenSet),
    Pending,
    SlowDown,
    Expired,
    Denied,
    /// Any other refusal; the grant is unusable.
    Failed,
}

#[derive(Deserialize)]
struct TokenWire {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

#[derive(Deserialize)]
struct TokenErrorWire {
    error: String,
}

pub fn device_token_body(device_code: &str) -> Vec<u8> {
    form_encode(&[
        ("client_id", CLIENT_ID),
        ("device_code", device_code),
        ("grant_type", DEVICE_GRANT),
    ])
}

pub fn refresh_body(refresh_token: &str) -> Vec<u8> {
    form_encode(&[
        ("client_id", CLIENT_ID),
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ])
}

/// Interpret a token endpoint reply.  `previous_refresh` is kept when the
/// server does not rotate the refresh token.
pub fn parse_token_response(
    status: u16,
    body: &[u8],
    now_ms: u64,
    previous_refresh: Option<&str>,
) -> TokenPoll {
    if (200..300).contains(&status) {
        let Ok(wire) = serde_json::from_slice::<TokenWire>(body) else {
            return TokenPoll::Failed;
        };
        let Some(refresh_token) = wire.refresh_token.or(previous_refresh.map(String::from)) else {
            return TokenPoll::Failed;
        };
        return TokenPoll::Granted(AuthTokenSet {
            access_token: wire.access_token,
            refresh_token,
            expires_at_ms: now_ms.saturating_add(wire.expires_in.saturating_mul(1000)),
        });
    }
    match serde_json::from_slice::<TokenErrorWire>(body) {
        Ok(e) => match e.error.as_str() {
            "authorization_pending" => TokenPoll::Pending,
            "slow_down" => TokenPoll::SlowDown,
            "expired_token" => TokenPoll::Expired,
            "access_denied" => TokenPoll::Denied,
            _ => TokenPoll::Failed,
        },
        Err(_) => TokenPoll::Failed,
    }
}

// ───────────────────────────────────────────────────────────────
// Form encoding
// ───────────────────────────────────────────────────────────────

/// `application/x-www-form-urlencoded` body from key/value pairs.
pub fn form_encode(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push(b'&');
        }
        percent_encode(k, &mut out);
        out.push(b'=');
        percent_encode(v, &mut out);
    }
    out
}

fn percent_encode(s: &str, out: &mut Vec<u8>) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => out.push(b),
            b' ' => out.push(b'+'),
            _ => {
                out.push(b'%');
                out.push(HEX[(b >> 4) as usize]);
                out.push(HEX[(b & 0x0F) as usize]);
            }
        }
    }
}

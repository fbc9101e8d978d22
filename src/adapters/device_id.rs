//! Device identity derived from the ESP32 factory MAC address.
//!
//! Produces a stable, human-readable device ID in the form `SP-XXYYZZ`
//! (last 3 bytes of the 6-byte MAC in uppercase hex). This ID is:
//! - Deterministic across reboots (factory-burned eFuse MAC)
//! - The prefix of every broker topic (`SP-XXYYZZ/telemetry`, ...)
//! - The MQTT client id and the bridge pairing `devicetype` suffix
//!
//! The full MAC doubles as the device secret that keys the token vault.

use core::fmt::Write;

/// Fixed-size device ID string: "SP-XXYYZZ".
pub type DeviceIdString = heapless::String<16>;

/// Full 6-byte MAC address.
pub type MacAddress = [u8; 6];

/// Read the factory MAC address from eFuse.
#[cfg(target_os = "espidf")]
pub fn read_mac() -> MacAddress {
    let mut mac: MacAddress = [0u8; 6];
    // SAFETY: the buffer is exactly the 6 bytes the call writes.
    unsafe {
        esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr());
    }
    mac
}

/// Simulation: returns a deterministic fake MAC.
#[cfg(not(target_os = "espidf"))]
pub fn read_mac() -> MacAddress {
    [0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE]
}

/// Derive the short device ID from the last 3 MAC bytes.
/// Format: `SP-XXYYZZ` (e.g., `SP-EFCAFE`).
pub fn device_id(mac: &MacAddress) -> DeviceIdString {
    let mut id = DeviceIdString::new();
    let _ = write!(id, "SP-{:02X}{:02X}{:02X}", mac[3], mac[4], mac[5]);
    id
}

/// Configured override if set, otherwise the MAC-derived id.
pub fn effective_device_id(mac: &MacAddress, override_id: &str) -> DeviceIdString {
    if override_id.is_empty() {
        return device_id(mac);
    }
    DeviceIdString::try_from(override_id).unwrap_or_else(|()| device_id(mac))
}

/// Derive the DHCP/mDNS hostname from the last 3 MAC bytes.
/// Format: `smartpanel-xxyyzz` (lowercase).
pub fn hostname(mac: &MacAddress) -> heapless::String<24> {
    let mut name = heapless::String::<24>::new();
    let _ = write!(name, "smartpanel-{:02x}{:02x}{:02x}", mac[3], mac[4], mac[5]);
    name
}

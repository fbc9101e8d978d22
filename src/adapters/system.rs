//! Device services: restart and firmware update.
//!
//! Implements [`SystemPort`].  A firmware update streams the image over
//! HTTP(S) straight into the inactive OTA slot through `esp-ota`, marks it
//! bootable and restarts.  Nothing is buffered beyond one read chunk.
//!
//! On simulation targets calls are recorded instead of acted on.

use log::{info, warn};

use crate::app::ports::SystemPort;
use crate::error::ErrorReason;

/// Download chunk size for firmware images.
#[cfg_attr(not(target_os = "espidf"), allow(dead_code))]
const OTA_CHUNK: usize = 4096;

#[derive(Default)]
pub struct DeviceSystem {
    #[cfg(not(target_os = "espidf"))]
    sim: SimSystem,
}

#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimSystem {
    pub reboots: u32,
    pub updates: Vec<String>,
    pub fail_updates: bool,
}

impl DeviceSystem {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn sim(&self) -> &SimSystem {
        &self.sim
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn sim_mut(&mut self) -> &mut SimSystem {
        &mut self.sim
    }

    #[cfg(target_os = "espidf")]
    fn download_and_stage(&mut self, url: &str) -> Result<usize, ErrorReason> {
        use core::time::Duration;
        use embedded_svc::http::Method;
        use embedded_svc::http::client::Client;
        use embedded_svc::io::Read;
        use esp_idf_svc::http::client::{Configuration, EspHttpConnection};

        let conf = Configuration {
            timeout: Some(Duration::from_secs(30)),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let conn = EspHttpConnection::new(&conf).map_err(|e| {
            warn!("OTA: http init failed: {:?}", e);
            ErrorReason::NotConnected
        })?;
        let mut client = Client::wrap(conn);
        let request = client.request(Method::Get, url, &[]).map_err(|e| {
            warn!("OTA: request failed: {:?}", e);
            ErrorReason::NotConnected
        })?;
        let mut response = request.submit().map_err(|e| {
            warn!("OTA: submit failed: {:?}", e);
            ErrorReason::NotConnected
        })?;
        let status = response.status();
        if !(200..300).contains(&status) {
            warn!("OTA: server answered HTTP {}", status);
            return Err(ErrorReason::Rejected);
        }

        let mut update = esp_ota::OtaUpdate::begin().map_err(|e| {
            warn!("OTA: begin failed: {:?}", e);
            ErrorReason::Rejected
        })?;
        let mut chunk = [0u8; OTA_CHUNK];
        let mut written = 0usize;
        loop {
            let n = response.read(&mut chunk).map_err(|e| {
                warn!("OTA: read failed after {} bytes: {:?}", written, e);
                ErrorReason::NotConnected
            })?;
            if n == 0 {
                break;
            }
            update.write(&chunk[..n]).map_err(|e| {
                warn!("OTA: flash write failed: {:?}", e);
                ErrorReason::Rejected
            })?;
            written += n;
        }
        // Dropping `update` on any error above aborts the session.
        let mut completed = update.finalize().map_err(|e| {
            warn!("OTA: image rejected: {:?}", e);
            ErrorReason::Rejected
        })?;
        completed.set_as_boot_partition().map_err(|e| {
            warn!("OTA: set boot partition failed: {:?}", e);
            ErrorReason::Rejected
        })?;
        Ok(written)
    }
}

impl SystemPort for DeviceSystem {
    #[cfg(target_os = "espidf")]
    fn reboot(&mut self) {
        info!("System: restarting");
        esp_ota::restart();
    }

    #[cfg(not(target_os = "espidf"))]
    fn reboot(&mut self) {
        info!("System(sim): restart requested");
        self.sim.reboots += 1;
    }

    #[cfg(target_os = "espidf")]
    fn update_firmware(&mut self, url: &str) -> Result<(), ErrorReason> {
        info!("OTA: downloading image");
        let written = self.download_and_stage(url)?;
        info!("OTA: {} bytes staged, rebooting", written);
        esp_ota::restart();
    }

    #[cfg(not(target_os = "espidf"))]
    fn update_firmware(&mut self, url: &str) -> Result<(), ErrorReason> {
        self.sim.updates.push(url.to_owned());
        if self.sim.fail_updates {
            warn!("System(sim): firmware update failed");
            return Err(ErrorReason::Rejected);
        }
        info!("System(sim): firmware update staged");
        self.sim.reboots += 1;
        Ok(())
    }
}

/// Confirm the running image so the bootloader does not roll back.
#[cfg(target_os = "espidf")]
pub fn check_rollback() {
    match esp_ota::mark_app_valid() {
        Ok(()) => info!("OTA: firmware marked valid"),
        Err(e) => warn!("OTA: mark_app_valid failed: {:?}", e),
    }
}

#[cfg(not(target_os = "espidf"))]
pub fn check_rollback() {
    info!("OTA rollback check (simulation): skipped");
}

//! mDNS adapter: sets the panel hostname and browses for the lighting
//! bridge (`_hue._tcp`).
//!
//! Implements [`DiscoveryPort`].  On ESP-IDF the browse is an asynchronous
//! mDNS PTR query whose results are collected without blocking on every
//! `poll`; an exhausted query is simply restarted, and the bridge service's
//! own deadline decides when to give up.  On simulation targets a preset
//! address is "found" after a configurable number of polls.

use log::{debug, info};

use crate::app::ports::{BridgeAddress, DiscoveryPort};

#[cfg_attr(not(target_os = "espidf"), allow(dead_code))]
const BRIDGE_SERVICE: &str = "_hue";
#[cfg_attr(not(target_os = "espidf"), allow(dead_code))]
const BRIDGE_PROTO: &str = "_tcp";

/// Per-query timeout inside the mDNS component (milliseconds).
#[cfg_attr(not(target_os = "espidf"), allow(dead_code))]
const QUERY_TIMEOUT_MS: u32 = 3_000;

pub struct MdnsDiscovery {
    hostname: heapless::String<24>,
    initialised: bool,
    browsing: bool,
    #[cfg(target_os = "espidf")]
    search: *mut esp_idf_svc::sys::mdns_search_once_t,
    #[cfg(not(target_os = "espidf"))]
    sim: SimBridge,
}

#[cfg(not(target_os = "espidf"))]
#[derive(Default)]
struct SimBridge {
    address: Option<BridgeAddress>,
    polls_until_found: u32,
    polls: u32,
}

// SAFETY: the search handle is only touched from the I/O thread that owns
// this adapter; the mDNS component synchronises internally.
#[cfg(target_os = "espidf")]
unsafe impl Send for MdnsDiscovery {}

impl MdnsDiscovery {
    pub fn new(hostname: heapless::String<24>) -> Self {
        Self {
            hostname,
            initialised: false,
            browsing: false,
            #[cfg(target_os = "espidf")]
            search: core::ptr::null_mut(),
            #[cfg(not(target_os = "espidf"))]
            sim: SimBridge::default(),
        }
    }

    /// Simulation: answer with `address` on the `after_polls`-th poll.
    #[cfg(not(target_os = "espidf"))]
    pub fn with_simulated_bridge(mut self, address: &str, after_polls: u32) -> Self {
        self.sim.address = BridgeAddress::try_from(address).ok();
        self.sim.polls_until_found = after_polls;
        self
    }

    pub fn is_browsing(&self) -> bool {
        self.browsing
    }

    /// Bring up the responder and claim the hostname.  Idempotent.
    pub fn init(&mut self) {
        if self.initialised {
            return;
        }
        self.platform_init();
        self.initialised = true;
        info!("mDNS: hostname {}.local", self.hostname);
    }

    // ── Platform-specific ─────────────────────────────────────

    #[cfg(target_os = "espidf")]
    fn platform_init(&self) {
        use esp_idf_svc::sys::*;
        let mut hostname_buf = [0u8; 32];
        let hb = self.hostname.as_bytes();
        let hl = hb.len().min(31);
        hostname_buf[..hl].copy_from_slice(&hb[..hl]);
        // SAFETY: all strings are NUL-terminated and outlive the calls.
        unsafe {
            let ret = mdns_init();
            if ret != ESP_OK as i32 {
                log::error!("mDNS: mdns_init failed ({})", ret);
                return;
            }
            mdns_hostname_set(hostname_buf.as_ptr().cast());
            mdns_instance_name_set(b"SmartPanel\0".as_ptr().cast());
        }
    }

    #[cfg(not(target_os = "espidf"))]
    fn platform_init(&self) {
        debug!("mDNS(sim): responder up");
    }

    #[cfg(target_os = "espidf")]
    fn begin_query(&mut self) {
        use esp_idf_svc::sys::*;
        let service = b"_hue\0";
        let proto = b"_tcp\0";
        // SAFETY: strings are NUL-terminated statics; a null notifier is allowed.
        self.search = unsafe {
            mdns_query_async_new(
                core::ptr::null(),
                service.as_ptr().cast(),
                proto.as_ptr().cast(),
                mdns_type_t_MDNS_TYPE_PTR as u16,
                QUERY_TIMEOUT_MS,
                4,
                None,
            )
        };
        if self.search.is_null() {
            log::warn!("mDNS: could not start {}.{} query", BRIDGE_SERVICE, BRIDGE_PROTO);
        }
    }

    #[cfg(target_os = "espidf")]
    fn end_query(&mut self) {
        if !self.search.is_null() {
            // SAFETY: the handle came from mdns_query_async_new and is
            // deleted exactly once.
            unsafe { esp_idf_svc::sys::mdns_query_async_delete(self.search) };
            self.search = core::ptr::null_mut();
        }
    }

    #[cfg(target_os = "espidf")]
    fn platform_poll(&mut self) -> Option<BridgeAddress> {
        use esp_idf_svc::sys::*;
        if self.search.is_null() {
            self.begin_query();
            return None;
        }
        let mut results: *mut mdns_result_t = core::ptr::null_mut();
        let mut count: u8 = 0;
        // SAFETY: zero timeout, so this only inspects the finished flag.
        let done = unsafe { mdns_query_async_get_results(self.search, 0, &mut results, &mut count) };
        if !done {
            return None;
        }
        // SAFETY: `results` is a list owned by us until mdns_query_results_free.
        let found = unsafe { first_address(results) };
        unsafe { mdns_query_results_free(results) };
        self.end_query();
        found
    }

    #[cfg(not(target_os = "espidf"))]
    fn platform_poll(&mut self) -> Option<BridgeAddress> {
        self.sim.polls += 1;
        if self.sim.polls > self.sim.polls_until_found {
            self.sim.address.clone()
        } else {
            None
        }
    }
}

/// First IPv4 address in a result list, else the advertised hostname.
///
/// # Safety
/// `results` must be null or a valid list from the mDNS component.
#[cfg(target_os = "espidf")]
unsafe fn first_address(results: *mut esp_idf_svc::sys::mdns_result_t) -> Option<BridgeAddress> {
    use core::fmt::Write;
    let mut r = results;
    while !r.is_null() {
        // SAFETY: guaranteed by the caller.
        let entry = unsafe { &*r };
        let mut a = entry.addr;
        while !a.is_null() {
            // SAFETY: address list nodes are valid while the results live.
            let node = unsafe { &*a };
            if u32::from(node.addr.type_) == esp_idf_svc::sys::ESP_IPADDR_TYPE_V4 {
                // SAFETY: the type tag says the union holds an IPv4 address.
                let octets = unsafe { node.addr.u_addr.ip4.addr }.to_le_bytes();
                let mut out = BridgeAddress::new();
                let _ = write!(out, "{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
                return Some(out);
            }
            a = node.next;
        }
        if !entry.hostname.is_null() {
            // SAFETY: NUL-terminated string owned by the result.
            let host = unsafe { core::ffi::CStr::from_ptr(entry.hostname) };
            if let Ok(host) = host.to_str() {
                let mut out = BridgeAddress::new();
                if write!(out, "{}.local", host).is_ok() {
                    return Some(out);
                }
            }
        }
        r = entry.next;
    }
    None
}

impl DiscoveryPort for MdnsDiscovery {
    fn start(&mut self) {
        self.init();
        #[cfg(not(target_os = "espidf"))]
        {
            self.sim.polls = 0;
        }
        self.browsing = true;
        debug!("mDNS: browsing for {}.{}", BRIDGE_SERVICE, BRIDGE_PROTO);
    }

    fn poll(&mut self) -> Option<BridgeAddress> {
        if !self.browsing {
            return None;
        }
        self.platform_poll()
    }

    fn stop(&mut self) {
        if !self.browsing {
            return;
        }
        #[cfg(target_os = "espidf")]
        self.end_query();
        self.browsing = false;
        debug!("mDNS: browse stopped");
    }
}

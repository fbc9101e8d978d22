//! SmartPanel firmware library.
//!
//! Exposes the I/O services, the cross-core channel and the adapters for
//! integration testing and the firmware binary.  All ESP-IDF-specific code
//! is guarded by `#[cfg(target_os = "espidf")]` within each module, so the
//! whole library builds and tests on the host.

#![deny(unused_must_use)]

pub mod app;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod fsm;
pub mod io_task;
pub mod thermostat;
pub mod transport;
pub mod utils;

// Platform adapters; the ESP-IDF implementations are selected by cfg
// inside each module.
pub mod adapters;
pub mod drivers;

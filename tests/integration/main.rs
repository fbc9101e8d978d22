//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises one service through the
//! full I/O orchestrator against the simulated broker, bridge and cloud.
//! All tests run on the host (x86_64) with no real hardware required.

mod bridge_tests;
mod mocks;
mod orchestrator_tests;
mod thermostat_tests;
mod transport_tests;

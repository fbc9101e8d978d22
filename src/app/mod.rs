//! Application core: the panel's domain wiring, free of direct I/O.
//!
//! [`orchestrator`] runs the transport, bridge and thermostat services on
//! the I/O context; [`presentation`] folds what crosses the channel into a
//! model for the display.  Everything external is reached through the
//! **port traits** in [`ports`], so the whole core runs against mocks.

pub mod events;
pub mod intents;
pub mod orchestrator;
pub mod ports;
pub mod presentation;

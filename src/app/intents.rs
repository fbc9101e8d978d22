//! User intents travelling from the presentation context to the I/O context.
//!
//! These are what the touch UI asks for.  The I/O side turns each one into
//! a service call; room and zone changes are tracked like remote commands
//! and answered with a [`CommandAck`](super::events::CommandAck).

use crate::fsm::ServiceKind;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UserIntent {
    /// Start bridge discovery and link-button pairing.
    PairBridge,
    /// Start (or restart) the thermostat device-flow authorization.
    ConnectThermostat,
    /// Abort a pending pairing or device-flow wait.
    Cancel(ServiceKind),
    /// Clear a fatal broker error and try the broker again.
    ReconnectBroker,
    SetRoom {
        room_id: u16,
        on: Option<bool>,
        brightness_pct: Option<u8>,
    },
    SetZoneTemperature {
        zone_id: u32,
        target_c: f32,
    },
    SetAutoAdjust {
        zone_id: u32,
        enabled: bool,
        target_c: f32,
    },
}

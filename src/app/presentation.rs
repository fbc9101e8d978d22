//! Presentation-side view of the I/O context.
//!
//! The display task owns a [`PresentationLink`]: it drains events into a
//! [`PanelModel`] and pushes [`UserIntent`]s back.  Nothing here touches a
//! service directly; the model is rebuilt purely from copied snapshots.

use core::time::Duration;

use heapless::Vec;
use log::warn;

use crate::channel::CrossCoreChannel;
use crate::error::ErrorReason;
use crate::fsm::{ServiceKind, ServiceState};

use super::events::{AutoAdjustStatus, ChannelEvent, CommandAck, RoomState, SensorReading, ShortText, ZoneState};
use super::intents::UserIntent;

pub const MAX_ROOMS: usize = 16;
pub const MAX_ZONES: usize = 8;

/// Connectivity as last reported by one service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceView {
    pub state: ServiceState,
    pub reason: ErrorReason,
}

/// Device-flow prompt the display shows while approval is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthPromptView {
    pub user_code: ShortText<16>,
    pub verification_uri: ShortText<64>,
}

/// Folded snapshot of everything the panel renders.
#[derive(Debug, Clone, Default)]
pub struct PanelModel {
    pub sensor: Option<SensorReading>,
    pub rooms: Vec<RoomState, MAX_ROOMS>,
    pub zones: Vec<ZoneState, MAX_ZONES>,
    services: [ServiceView; 3],
    pub auth_prompt: Option<AuthPromptView>,
    pub last_ack: Option<CommandAck>,
    pub last_adjust: Option<AutoAdjustStatus>,
    /// Events the I/O side could not enqueue, as of the last poll.
    pub dropped_events: u32,
    pub events_seen: u32,
}

impl PanelModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the model.
    pub fn apply(&mut self, event: ChannelEvent) {
        self.events_seen = self.events_seen.wrapping_add(1);
        match event {
            ChannelEvent::SensorReading(r) => self.sensor = Some(r),
            ChannelEvent::BridgeRoomState(room) => {
                upsert(&mut self.rooms, room, |r| r.room_id == room.room_id);
            }
            ChannelEvent::ThermostatZoneState(zone) => {
                upsert(&mut self.zones, zone, |z| z.zone_id == zone.zone_id);
            }
            ChannelEvent::ConnectivityStatus {
                service,
                state,
                reason,
            } => {
                self.services[service as usize] = ServiceView { state, reason };
                if service == ServiceKind::Thermostat && state != ServiceState::AwaitingUserAction {
                    self.auth_prompt = None;
                }
                if service == ServiceKind::Bridge && state == ServiceState::Disconnected {
                    self.rooms.clear();
                }
            }
            ChannelEvent::CommandAck(ack) => self.last_ack = Some(ack),
            ChannelEvent::AutoAdjust(status) => self.last_adjust = Some(status),
            ChannelEvent::AuthPrompt {
                user_code,
                verification_uri,
            } => {
                self.auth_prompt = Some(AuthPromptView {
                    user_code,
                    verification_uri,
                });
            }
        }
    }

    pub fn service(&self, kind: ServiceKind) -> ServiceView {
        self.services[kind as usize]
    }

    pub fn room(&self, room_id: u16) -> Option<&RoomState> {
        self.rooms.iter().find(|r| r.room_id == room_id)
    }

    pub fn zone(&self, zone_id: u32) -> Option<&ZoneState> {
        self.zones.iter().find(|z| z.zone_id == zone_id)
    }
}

fn upsert<T: Copy, const N: usize>(list: &mut Vec<T, N>, item: T, same: impl Fn(&T) -> bool) {
    if let Some(slot) = list.iter_mut().find(|x| same(x)) {
        *slot = item;
    } else if list.push(item).is_err() {
        warn!("Panel: table full, update dropped");
    }
}

/// The presentation context's two channel ends.
pub struct PresentationLink<'a, const E: usize, const I: usize> {
    events: &'a CrossCoreChannel<ChannelEvent, E>,
    intents: &'a CrossCoreChannel<UserIntent, I>,
    model: PanelModel,
}

impl<'a, const E: usize, const I: usize> PresentationLink<'a, E, I> {
    pub fn new(
        events: &'a CrossCoreChannel<ChannelEvent, E>,
        intents: &'a CrossCoreChannel<UserIntent, I>,
    ) -> Self {
        Self {
            events,
            intents,
            model: PanelModel::new(),
        }
    }

    /// Wait up to `timeout` for the first event, then fold everything queued.
    /// Returns the number of events applied.
    pub fn poll(&mut self, timeout: Duration) -> usize {
        let Some(first) = self.events.receive(timeout) else {
            self.model.dropped_events = self.events.dropped();
            return 0;
        };
        self.model.apply(first);
        let mut applied = 1;
        let model = &mut self.model;
        self.events.drain(|ev| {
            model.apply(ev);
            applied += 1;
        });
        self.model.dropped_events = self.events.dropped();
        applied
    }

    /// Queue an intent for the I/O context.  `false` when the queue is full.
    pub fn send_intent(&self, intent: UserIntent) -> bool {
        let sent = self.intents.send(intent);
        if !sent {
            warn!("Panel: intent queue full, {:?} dropped", intent);
        }
        sent
    }

    pub fn model(&self) -> &PanelModel {
        &self.model
    }
}

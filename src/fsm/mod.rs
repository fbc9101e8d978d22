//! Generic finite-state container shared by every connectivity service.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  StateMachine<S, H>                                       │
//! │                                                           │
//! │  current ──▶ S          entered_at_ms ──▶ u64             │
//! │                                                           │
//! │  history (ring, H slots, oldest overwritten)              │
//! │  ┌──────────┬──────────┬──────────────────┬───────────┐   │
//! │  │ from     │ to       │ reason           │ at_ms     │   │
//! │  ├──────────┼──────────┼──────────────────┼───────────┤   │
//! │  │ Disc.    │ Discov.  │ "boot"           │ 0         │   │
//! │  │ Discov.  │ Error    │ "no bridge found"│ 10_000    │   │
//! │  └──────────┴──────────┴──────────────────┴───────────┘   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! There is no legality table: `transition` overwrites unconditionally.
//! Each owning service (bridge pairing, thermostat auth, transport link)
//! has its own valid graph and is responsible for only issuing legal
//! transitions.  Only [`ServiceState`] snapshots ever leave the owning
//! execution context.

use core::fmt;
use heapless::HistoryBuffer;
use log::info;

// ---------------------------------------------------------------------------
// Cross-core state snapshot
// ---------------------------------------------------------------------------

/// The coarse connectivity state every service reports to the presentation
/// context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ServiceState {
    #[default]
    Disconnected = 0,
    Discovering = 1,
    Authenticating = 2,
    AwaitingUserAction = 3,
    Connected = 4,
    Error = 5,
}

impl ServiceState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Discovering => "discovering",
            Self::Authenticating => "authenticating",
            Self::AwaitingUserAction => "awaiting_user_action",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

/// Which I/O-side service a snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceKind {
    Transport = 0,
    Bridge = 1,
    Thermostat = 2,
}

impl ServiceKind {
    pub const ALL: [Self; 3] = [Self::Transport, Self::Bridge, Self::Thermostat];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "mqtt",
            Self::Bridge => "hue",
            Self::Thermostat => "tado",
        }
    }
}

/// Implemented by each service's private state enum so the orchestrator
/// can publish a uniform snapshot.
pub trait Snapshot: Copy {
    fn snapshot(self) -> ServiceState;
}

// ---------------------------------------------------------------------------
// Transition log entry
// ---------------------------------------------------------------------------

/// One named state change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition<S> {
    pub from: S,
    pub to: S,
    pub reason: &'static str,
    pub at_ms: u64,
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Default history depth.
pub const HISTORY_DEPTH: usize = 8;

/// Current state plus a bounded ring of the most recent transitions.
pub struct StateMachine<S, const H: usize = HISTORY_DEPTH> {
    name: &'static str,
    current: S,
    entered_at_ms: u64,
    transitions: u32,
    history: HistoryBuffer<Transition<S>, H>,
}

impl<S: Copy + PartialEq + fmt::Debug, const H: usize> StateMachine<S, H> {
    /// Create a machine in `initial`.  `name` prefixes transition logs.
    pub fn new(name: &'static str, initial: S) -> Self {
        Self {
            name,
            current: initial,
            entered_at_ms: 0,
            transitions: 0,
            history: HistoryBuffer::new(),
        }
    }

    /// Overwrite the current state and record the change.
    ///
    /// A self-transition is still recorded (it restarts `entered_at_ms`),
    /// which services use to re-arm per-state deadlines.
    pub fn transition(&mut self, next: S, reason: &'static str, now_ms: u64) {
        info!("{}: {:?} -> {:?} ({})", self.name, self.current, next, reason);
        self.history.write(Transition {
            from: self.current,
            to: next,
            reason,
            at_ms: now_ms,
        });
        self.current = next;
        self.entered_at_ms = now_ms;
        self.transitions = self.transitions.wrapping_add(1);
    }

    pub fn is_in_state(&self, candidate: S) -> bool {
        self.current == candidate
    }

    pub fn current(&self) -> S {
        self.current
    }

    /// Milliseconds spent in the current state.
    pub fn time_in_state(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.entered_at_ms)
    }

    pub fn entered_at(&self) -> u64 {
        self.entered_at_ms
    }

    /// Total transitions since construction (not bounded by history depth).
    pub fn transition_count(&self) -> u32 {
        self.transitions
    }

    /// The most recent transition, if any.
    pub fn last_transition(&self) -> Option<&Transition<S>> {
        self.history.recent()
    }

    /// Recorded transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Transition<S>> {
        self.history.oldest_ordered()
    }
}

impl<S: Snapshot + PartialEq + fmt::Debug, const H: usize> StateMachine<S, H> {
    pub fn snapshot(&self) -> ServiceState {
        self.current.snapshot()
    }
}

//! In-flight command tracking with timeout, retention and id dedupe.
//!
//! ```text
//!  register ──▶ Pending ──mark_sent──▶ Sent ──acknowledge──▶ Acknowledged
//!                  │                     │
//!                  ├────────fail─────────┴──────────────────▶ Failed
//!                  └────────sweep (timeout)─────────────────▶ TimedOut
//!
//!  terminal + retention elapsed ──▶ removed, id kept in the recent cache
//! ```
//!
//! Every transition out of a non-terminal state yields exactly one
//! [`Completion`], which the caller turns into exactly one acknowledgment
//! (plus one per in-flight replay of the same id).

use heapless::{Deque, Vec};
use log::{debug, warn};

use crate::app::events::CommandId;
use crate::error::ErrorReason;

use super::commands::Command;

/// Commands tracked at once (pending + sent + retained terminal).
pub const MAX_IN_FLIGHT: usize = 16;

/// Completed ids remembered after their entries are evicted.
pub const RECENT_IDS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Failed,
    TimedOut,
}

impl CommandStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Acknowledged | Self::Failed | Self::TimedOut)
    }
}

/// Where a command came from: the broker or the panel's own UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOrigin {
    Remote,
    Local,
}

/// One tracked command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingCommand {
    pub seq: u32,
    pub id: CommandId,
    pub origin: CommandOrigin,
    pub command: Command,
    pub issued_at_ms: u64,
    pub sent_at_ms: Option<u64>,
    /// Set only when the status is `Acknowledged`.
    pub acknowledged_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    pub status: CommandStatus,
    pub reason: ErrorReason,
    /// Duplicate deliveries received while still in flight.
    pub replays: u8,
}

/// Result of registering an inbound id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// New command; dispatch it.
    Accepted(u32),
    /// Already completed; answer with the original outcome, do not execute.
    Replay { success: bool, reason: ErrorReason },
    /// Same id still running; its completion will answer for this copy too.
    InFlight,
    /// No free slot.
    Full,
}

/// Emitted once per command when it reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Completion {
    pub seq: u32,
    pub id: CommandId,
    pub origin: CommandOrigin,
    pub success: bool,
    pub reason: ErrorReason,
    pub replays: u8,
    pub command: Command,
}

#[derive(Debug, Clone, Copy)]
struct RecentOutcome {
    id: CommandId,
    success: bool,
    reason: ErrorReason,
}

pub struct CommandTracker {
    entries: Vec<PendingCommand, MAX_IN_FLIGHT>,
    recent: Deque<RecentOutcome, RECENT_IDS>,
    next_seq: u32,
    timeout_ms: u64,
    retention_ms: u64,
    timed_out: u32,
}

impl CommandTracker {
    pub fn new(timeout_ms: u32, retention_ms: u32) -> Self {
        Self {
            entries: Vec::new(),
            recent: Deque::new(),
            next_seq: 1,
            timeout_ms: u64::from(timeout_ms),
            retention_ms: u64::from(retention_ms.max(timeout_ms)),
            timed_out: 0,
        }
    }

    pub fn register(
        &mut self,
        id: CommandId,
        origin: CommandOrigin,
        command: Command,
        now_ms: u64,
    ) -> Registration {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            if entry.status.is_terminal() {
                return Registration::Replay {
                    success: entry.status == CommandStatus::Acknowledged,
                    reason: entry.reason,
                };
            }
            entry.replays = entry.replays.saturating_add(1);
            debug!("Cmd: duplicate {} while in flight", id);
            return Registration::InFlight;
        }
        if let Some(prev) = self.recent.iter().find(|r| r.id == id) {
            return Registration::Replay {
                success: prev.success,
                reason: prev.reason,
            };
        }

        if self.entries.is_full() && !self.evict_oldest_terminal() {
            warn!("Cmd: tracker full, refusing {}", id);
            return Registration::Full;
        }

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        let entry = PendingCommand {
            seq,
            id,
            origin,
            command,
            issued_at_ms: now_ms,
            sent_at_ms: None,
            acknowledged_at_ms: None,
            finished_at_ms: None,
            status: CommandStatus::Pending,
            reason: ErrorReason::None,
            replays: 0,
        };
        // Capacity was checked above.
        let _ = self.entries.push(entry);
        Registration::Accepted(seq)
    }

    /// The owning service accepted the command.
    pub fn mark_sent(&mut self, seq: u32, now_ms: u64) -> bool {
        match self.entry_mut(seq) {
            Some(e) if e.status == CommandStatus::Pending => {
                e.status = CommandStatus::Sent;
                e.sent_at_ms = Some(now_ms);
                true
            }
            _ => false,
        }
    }

    pub fn acknowledge(&mut self, seq: u32, now_ms: u64) -> Option<Completion> {
        self.finish(seq, CommandStatus::Acknowledged, ErrorReason::None, now_ms)
    }

    pub fn fail(&mut self, seq: u32, reason: ErrorReason, now_ms: u64) -> Option<Completion> {
        self.finish(seq, CommandStatus::Failed, reason, now_ms)
    }

    /// Time out overdue commands and evict expired terminal entries.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<Completion, MAX_IN_FLIGHT> {
        let mut expired = Vec::new();
        let overdue: Vec<u32, MAX_IN_FLIGHT> = self
            .entries
            .iter()
            .filter(|e| {
                !e.status.is_terminal() && now_ms.saturating_sub(e.issued_at_ms) >= self.timeout_ms
            })
            .map(|e| e.seq)
            .collect();
        for seq in overdue {
            if let Some(c) =
                self.finish(seq, CommandStatus::TimedOut, ErrorReason::CommandTimedOut, now_ms)
            {
                self.timed_out = self.timed_out.wrapping_add(1);
                warn!("Cmd: {} timed out", c.id);
                let _ = expired.push(c);
            }
        }

        let retention = self.retention_ms;
        while let Some(pos) = self.entries.iter().position(|e| {
            e.finished_at_ms
                .is_some_and(|t| now_ms.saturating_sub(t) >= retention)
        }) {
            let e = self.entries.swap_remove(pos);
            self.remember(&e);
        }
        expired
    }

    pub fn get(&self, seq: u32) -> Option<&PendingCommand> {
        self.entries.iter().find(|e| e.seq == seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingCommand> {
        self.entries.iter()
    }

    /// Commands not yet in a terminal state.
    pub fn in_flight(&self) -> usize {
        self.entries.iter().filter(|e| !e.status.is_terminal()).count()
    }

    pub fn timed_out(&self) -> u32 {
        self.timed_out
    }

    // ── internals ────────────────────────────────────────────

    fn entry_mut(&mut self, seq: u32) -> Option<&mut PendingCommand> {
        self.entries.iter_mut().find(|e| e.seq == seq)
    }

    fn finish(
        &mut self,
        seq: u32,
        status: CommandStatus,
        reason: ErrorReason,
        now_ms: u64,
    ) -> Option<Completion> {
        let e = self.entry_mut(seq)?;
        if e.status.is_terminal() {
            return None;
        }
        e.status = status;
        e.reason = reason;
        e.finished_at_ms = Some(now_ms);
        if status == CommandStatus::Acknowledged {
            e.acknowledged_at_ms = Some(now_ms);
        }
        Some(Completion {
            seq,
            id: e.id,
            origin: e.origin,
            success: status == CommandStatus::Acknowledged,
            reason,
            replays: e.replays,
            command: e.command,
        })
    }

    fn evict_oldest_terminal(&mut self) -> bool {
        let oldest = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status.is_terminal())
            .min_by_key(|(_, e)| e.finished_at_ms)
            .map(|(i, _)| i);
        match oldest {
            Some(i) => {
                let e = self.entries.swap_remove(i);
                self.remember(&e);
                true
            }
            None => false,
        }
    }

    fn remember(&mut self, e: &PendingCommand) {
        if self.recent.is_full() {
            self.recent.pop_front();
        }
        let _ = self.recent.push_back(RecentOutcome {
            id: e.id,
            success: e.status == CommandStatus::Acknowledged,
            reason: e.reason,
        });
    }
}

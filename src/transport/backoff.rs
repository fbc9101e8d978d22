//! Reconnect backoff: exponential, jittered, capped.
//!
//! `delay(n) = min(cap, initial · 2ⁿ · (1 + j))` with `j ∈ [0, jitter)`.
//!
//! Because the jitter fraction is below 1, `initial · 2ⁿ⁺¹` already exceeds
//! the largest jittered value of step `n`, so the sequence never decreases
//! and settles exactly on the cap.  The jitter is deterministic in the
//! attempt number and a per-device seed: devices that lost the same
//! router spread out without needing an RNG.

/// Backoff state for one connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_ms: u32,
    max_ms: u32,
    jitter_percent: u8,
    seed: u32,
    attempt: u32,
}

impl Backoff {
    /// `jitter_percent` is clamped to 0–50.
    pub fn new(initial_ms: u32, max_ms: u32, jitter_percent: u8, seed: u32) -> Self {
        Self {
            initial_ms: initial_ms.max(1),
            max_ms: max_ms.max(initial_ms.max(1)),
            jitter_percent: jitter_percent.min(50),
            seed,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> u32 {
        let d = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        d
    }

    /// Delay for a given attempt without advancing.
    pub fn delay_for(&self, attempt: u32) -> u32 {
        let base = u64::from(self.initial_ms) << attempt.min(32);
        let jitter = base * u64::from(self.jitter_fraction_permille(attempt)) / 1000;
        (base + jitter).min(u64::from(self.max_ms)) as u32
    }

    /// Back to the initial delay (after a successful connect).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cap_ms(&self) -> u32 {
        self.max_ms
    }

    fn jitter_fraction_permille(&self, attempt: u32) -> u32 {
        if self.jitter_percent == 0 {
            return 0;
        }
        // Sin-hash of (attempt, seed) onto [0, 1).
        let x = (attempt as f64 * 7.3) + (self.seed % 1000) as f64 * 0.618;
        let unit = x.sin().abs().min(0.999);
        (unit * f64::from(self.jitter_percent) * 10.0) as u32
    }
}

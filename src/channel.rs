//! Cross-core channel: the only memory shared between the I/O context and
//! the presentation context.
//!
//! ```text
//! ┌──────────────┐   send(ev) → bool     ┌──────────────────┐
//! │  I/O core    │──────────────────────▶│  bounded queue   │
//! │ (producers)  │   never blocks        │  (N slots, FIFO) │
//! └──────────────┘                       └────────┬─────────┘
//!                                                 │ receive(timeout)
//!                                        ┌────────▼─────────┐
//!                                        │ presentation core│
//!                                        │ (single consumer)│
//!                                        └──────────────────┘
//! ```
//!
//! Built on an `embassy-sync` bounded channel guarded by a critical-section
//! mutex, so it can live in a `static` and be used from both FreeRTOS tasks
//! without heap allocation.  Values cross by move; every payload type is a
//! small `Copy` value with no borrowed data.
//!
//! Overflow policy is *reject newest*: a full queue refuses the send, the
//! producer gets `false`, and `dropped()` increases by exactly one.

use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

/// Default depth for the I/O → presentation event channel.
pub const EVENT_DEPTH: usize = 32;

/// Default depth for the presentation → I/O intent channel.
pub const INTENT_DEPTH: usize = 8;

/// Bounded multi-producer, single-consumer queue with a drop counter.
pub struct CrossCoreChannel<T, const N: usize> {
    inner: Channel<CriticalSectionRawMutex, T, N>,
    dropped: AtomicU32,
    delivered: AtomicU32,
}

impl<T, const N: usize> CrossCoreChannel<T, N> {
    pub const fn new() -> Self {
        Self {
            inner: Channel::new(),
            dropped: AtomicU32::new(0),
            delivered: AtomicU32::new(0),
        }
    }

    /// Non-blocking enqueue.  Returns `false` (and counts a drop) when full.
    pub fn send(&self, value: T) -> bool {
        if self.inner.try_send(value).is_ok() {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Non-blocking dequeue.
    pub fn try_receive(&self) -> Option<T> {
        self.inner.try_receive().ok()
    }

    /// Dequeue, waiting at most `timeout` for a value to arrive.
    ///
    /// The wait is reactor-driven (`async-io-mini` timer raced against the
    /// channel's receive future), not a spin.
    pub fn receive(&self, timeout: Duration) -> Option<T> {
        if let Some(value) = self.try_receive() {
            return Some(value);
        }
        if timeout.is_zero() {
            return None;
        }
        futures_lite::future::block_on(futures_lite::future::or(
            async { Some(self.inner.receive().await) },
            async {
                async_io_mini::Timer::after(timeout).await;
                None
            },
        ))
    }

    /// Wake-on-send receive for async consumers on the I/O executor.
    pub async fn receive_async(&self) -> T {
        self.inner.receive().await
    }

    /// Drain everything currently queued into `handler`, FIFO.
    pub fn drain(&self, mut handler: impl FnMut(T)) {
        while let Some(value) = self.try_receive() {
            handler(value);
        }
    }

    /// Sends refused because the queue was full (monotonic).
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Sends accepted into the queue (monotonic).
    pub fn delivered(&self) -> u32 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Default for CrossCoreChannel<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

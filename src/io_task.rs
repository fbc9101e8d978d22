//! I/O context: the executor that owns every network service.
//!
//! Runs in a dedicated thread pinned to Core 0 (next to lwIP and the WiFi
//! driver) using `edge-executor` for cooperative scheduling and
//! `async-io-mini` for reactor-driven timers.  Two concurrent futures:
//!
//! 1. **Tick**: advances every service on a fixed period (`io_tick_ms`)
//! 2. **Intents**: truly async via `intents.receive_async().await`
//!    (wakes as soon as the presentation context sends)
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────────┐
//!  │  I/O Thread (Core 0)                                     │
//!  │  ┌────────────────────────────────────────────────────┐  │
//!  │  │  futures_lite::block_on                            │  │
//!  │  │  ┌──────────────────────────────────────────────┐  │  │
//!  │  │  │  edge_executor::LocalExecutor                │  │  │
//!  │  │  │   ┌───────────────┐   ┌──────────────────┐   │  │  │
//!  │  │  │   │ Tick          │   │ Intents (async)  │   │  │  │
//!  │  │  │   │ io_tick_ms ⏱  │   │ wake-on-send     │   │  │  │
//!  │  │  │   └───────┬───────┘   └────────┬─────────┘   │  │  │
//!  │  │  └───────────┼────────────────────┼─────────────┘  │  │
//!  │  └──────────────┼────────────────────┼────────────────┘  │
//!  │                 ▼                    ▼                   │
//!  │          Rc<RefCell<IoCore>>  ──emit──▶  event channel   │
//!  └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Both futures share the core through `Rc<RefCell<_>>`; neither holds the
//! borrow across an `.await`, so they never overlap.

use core::cell::RefCell;
use core::future::Future;
use core::time::Duration;
use std::rc::Rc;

use log::info;

use crate::adapters::http::HttpAdapter;
use crate::adapters::mdns::MdnsDiscovery;
use crate::adapters::mqtt::MqttAdapter;
use crate::adapters::nvs::NvsAdapter;
use crate::adapters::sensors::ClimateSensor;
use crate::adapters::system::DeviceSystem;
use crate::adapters::time::MonotonicClock;
use crate::adapters::wifi::WifiStation;
use crate::app::events::ChannelEvent;
use crate::app::intents::UserIntent;
use crate::app::orchestrator::IoOrchestrator;
use crate::app::ports::{
    DiscoveryPort, EventSink, HttpPort, MqttPort, SensorPort, StoragePort, SystemPort,
};
use crate::channel::CrossCoreChannel;
use crate::drivers::task_pin::{Core, spawn_on_core};

/// The orchestrator wired to the firmware's concrete adapters.
pub type PanelOrchestrator = IoOrchestrator<
    MqttAdapter,
    HttpAdapter,
    MdnsDiscovery,
    HttpAdapter,
    ClimateSensor,
    NvsAdapter,
    DeviceSystem,
>;

/// What the I/O executor drives.
pub trait IoCore {
    fn tick(&mut self, now_ms: u64, sink: &mut impl EventSink);

    fn handle_intent(&mut self, intent: UserIntent, now_ms: u64, sink: &mut impl EventSink);
}

impl<M, HB, D, HT, S, St, Sy> IoCore for IoOrchestrator<M, HB, D, HT, S, St, Sy>
where
    M: MqttPort,
    HB: HttpPort,
    D: DiscoveryPort,
    HT: HttpPort,
    S: SensorPort,
    St: StoragePort,
    Sy: SystemPort,
{
    fn tick(&mut self, now_ms: u64, sink: &mut impl EventSink) {
        IoOrchestrator::tick(self, now_ms, sink);
    }

    fn handle_intent(&mut self, intent: UserIntent, now_ms: u64, sink: &mut impl EventSink) {
        let _ = IoOrchestrator::handle_intent(self, intent, now_ms, sink);
    }
}

/// The firmware's I/O core: services plus the WiFi link they ride on.
pub struct PanelIo {
    pub orchestrator: PanelOrchestrator,
    pub wifi: Option<WifiStation>,
}

impl IoCore for PanelIo {
    fn tick(&mut self, now_ms: u64, sink: &mut impl EventSink) {
        if let Some(wifi) = self.wifi.as_mut() {
            wifi.watch(now_ms);
        }
        self.orchestrator.tick(now_ms, sink);
    }

    fn handle_intent(&mut self, intent: UserIntent, now_ms: u64, sink: &mut impl EventSink) {
        let _ = self.orchestrator.handle_intent(intent, now_ms, sink);
    }
}

// ── Async loops ──────────────────────────────────────────────

type Shared<C> = Rc<RefCell<C>>;

/// Tick task: reactor timer, not `thread::sleep`, so the intent task
/// runs between ticks.
async fn tick_loop<C: IoCore, const E: usize>(
    core: Shared<C>,
    events: &CrossCoreChannel<ChannelEvent, E>,
    clock: MonotonicClock,
    period: Duration,
) {
    loop {
        {
            let mut sink = events;
            core.borrow_mut().tick(clock.uptime_ms(), &mut sink);
        }
        async_io_mini::Timer::after(period).await;
    }
}

/// Intent task: wakes as soon as the presentation context sends.
async fn intent_loop<C: IoCore, const E: usize, const I: usize>(
    core: Shared<C>,
    events: &CrossCoreChannel<ChannelEvent, E>,
    intents: &CrossCoreChannel<UserIntent, I>,
    clock: MonotonicClock,
) {
    loop {
        let intent = intents.receive_async().await;
        let mut sink = events;
        core.borrow_mut()
            .handle_intent(intent, clock.uptime_ms(), &mut sink);
    }
}

/// Run both loops until `until` completes, returning its output.
pub fn drive<C, T, const E: usize, const I: usize>(
    core: Shared<C>,
    events: &CrossCoreChannel<ChannelEvent, E>,
    intents: &CrossCoreChannel<UserIntent, I>,
    period: Duration,
    until: impl Future<Output = T>,
) -> T
where
    C: IoCore,
{
    let executor: edge_executor::LocalExecutor<'_, 4> = edge_executor::LocalExecutor::new();
    let clock = MonotonicClock::new();

    executor
        .spawn(tick_loop(core.clone(), events, clock, period))
        .detach();
    executor
        .spawn(intent_loop(core, events, intents, clock))
        .detach();

    futures_lite::future::block_on(executor.run(until))
}

/// Entry point for the I/O thread.  Never returns.
pub fn run_io_loop<C: IoCore, const E: usize, const I: usize>(
    io: C,
    events: &CrossCoreChannel<ChannelEvent, E>,
    intents: &CrossCoreChannel<UserIntent, I>,
    period: Duration,
) {
    info!("IO task started (tick every {} ms)", period.as_millis());
    drive(
        Rc::new(RefCell::new(io)),
        events,
        intents,
        period,
        core::future::pending::<()>(),
    );
}

// ── Thread spawn ─────────────────────────────────────────────

/// Spawn the I/O context on Core 0 (PRO_CPU).
///
/// `build` runs on the new thread, so adapters that must not move between
/// tasks are created where they are used.
pub fn spawn<C, F, const E: usize, const I: usize>(
    build: F,
    events: &'static CrossCoreChannel<ChannelEvent, E>,
    intents: &'static CrossCoreChannel<UserIntent, I>,
    period: Duration,
) -> std::io::Result<std::thread::JoinHandle<()>>
where
    C: IoCore,
    F: FnOnce() -> C + Send + 'static,
{
    spawn_on_core(Core::Pro, 12, 24, "panel-io\0", move || {
        run_io_loop(build(), events, intents, period);
    })
}

// ── Tests ────────────────────────────────────────────────────

/*!
    The cyclic I/O engine: the loop exchanging the whole process image with the segment at a fixed period.

    The loop runs on its own thread with a single threaded runtime, so its timing does not depend on the caller's executor. Each cycle

    1. snapshots the process image in the outgoing frame (outputs as last written by the callers)
    2. sends the frame and receives its reply
    3. copies only the input ranges of the reply back in the image

    A failed exchange leaves the image untouched, it is reported and the loop goes on with the next cycle. Cycles are scheduled from a fixed origin, cycle `n` starting at `origin + (n-1) * period` whatever happened to the previous ones. Cycles that could not be started in time are skipped and counted, never silently.

    Stopping is cooperative: the [CancellationToken] is only checked between cycles, an exchange in progress always completes.
*/

use core::{
    ops::Range,
    time::Duration,
    };
use std::{
    io,
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::Instant,
    };
use tokio::{
    runtime::Runtime,
    sync::{broadcast, oneshot, watch},
    time::MissedTickBehavior,
    };

use crate::{
    bus::Bus,
    error::{CycleError, Error},
    image::ProcessImage,
    };


/// capacity of the cycle report channel, slower subscribers miss reports
const REPORTS_CAPACITY: usize = 256;


/**
    cooperative cancellation signal, cheap to clone

    all clones observe the same cancellation
*/
#[derive(Clone, Debug)]
pub struct CancellationToken {
    flag: Arc<watch::Sender<bool>>,
}
impl CancellationToken {
    pub fn new() -> Self {
        Self {flag: Arc::new(watch::channel(false).0)}
    }
    /// request cancellation, this is idempotent
    pub fn cancel(&self)  {self.flag.send_replace(true);}
    pub fn is_cancelled(&self) -> bool  {*self.flag.borrow()}
    /// clear a previous cancellation, for every clone of this token
    pub(crate) fn reset(&self)  {self.flag.send_replace(false);}
    /// wait until cancellation is requested
    pub async fn cancelled(&self) {
        let mut receiver = self.flag.subscribe();
        // the sender lives as long as self, so this cannot fail
        let _ = receiver.wait_for(|&cancelled| cancelled).await;
    }
}
impl Default for CancellationToken {
    fn default() -> Self  {Self::new()}
}


/// timing parameters of the cyclic engine
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CycleSettings {
    /// nominal time between two cycle starts
    pub period: Duration,
    /// maximum time waiting for the reply of an exchange
    pub exchange_timeout: Duration,
    /// number of consecutive failed exchanges after which the bus is considered degraded
    pub degraded_threshold: u32,
    /// request a realtime scheduling priority for the engine thread
    pub realtime: bool,
}

/// outcome of one cycle
#[derive(Clone, Debug)]
pub enum CycleStatus {
    Ok,
    /// the exchange failed, the process image kept its previous values
    Failed(CycleError),
    /// the exchange failed and too many exchanges failed in a row
    Degraded {consecutive: u32, error: CycleError},
}
impl CycleStatus {
    pub fn is_ok(&self) -> bool  {matches!(self, Self::Ok)}
    /// session level error for this cycle, if any
    pub fn error(&self) -> Option<Error> {
        match self {
            Self::Ok => None,
            Self::Failed(error) => Some(Error::Cycle(error.clone())),
            Self::Degraded {consecutive, ..} => Some(Error::BusDegraded {consecutive: *consecutive}),
        }
    }
}

/// report published at the end of every cycle
#[derive(Clone, Debug)]
pub struct CycleReport {
    /// number of the cycle, starting at 1, cycles skipped are numbers never reported
    pub cycle: u64,
    /// time the cycle was scheduled to start
    pub scheduled: Instant,
    /// time the cycle actually started
    pub started: Instant,
    /// duration of the exchange
    pub duration: Duration,
    pub status: CycleStatus,
}

/// timing and failure bookkeeping of the engine
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleStats {
    /// cycles whose exchange succeeded
    pub completed: u64,
    /// cycles whose exchange failed
    pub failed: u64,
    /// cycles skipped because the previous ones overran their schedule
    pub missed: u64,
    /// current number of failed exchanges in a row
    pub consecutive_failures: u32,
    /// time between the starts of the last two cycles
    pub last_period: Duration,
    /// mean time between cycle starts since the engine started
    pub mean_period: Duration,
    /// maximum time between two consecutive cycle starts
    pub max_period: Duration,
    /// maximum delay between a cycle schedule and its actual start
    pub max_latency: Duration,
    first_start: Option<Instant>,
    last_start: Option<Instant>,
}
impl CycleStats {
    /// cycles run so far, successful or not
    pub fn cycles(&self) -> u64  {self.completed + self.failed}

    fn record_start(&mut self, scheduled: Instant, started: Instant) {
        self.max_latency = self.max_latency.max(started.saturating_duration_since(scheduled));
        if let (Some(first), Some(last)) = (self.first_start, self.last_start) {
            self.last_period = started.saturating_duration_since(last);
            self.max_period = self.max_period.max(self.last_period);
            // cycles() is not yet counting this start
            let intervals = u32::try_from(self.cycles()).unwrap_or(u32::MAX).max(1);
            self.mean_period = started.saturating_duration_since(first) / intervals;
        }
        self.first_start.get_or_insert(started);
        self.last_start = Some(started);
    }
}

/**
    read side of the engine state, usable from any thread while the engine is running

    it survives the engine, holding the final statistics once it stopped
*/
#[derive(Clone, Debug)]
pub struct CycleMonitor {
    stats: Arc<Mutex<CycleStats>>,
    reports: broadcast::Sender<CycleReport>,
    threshold: u32,
}
impl CycleMonitor {
    fn new(threshold: u32) -> Self {
        Self {
            stats: Arc::new(Mutex::new(CycleStats::default())),
            reports: broadcast::channel(REPORTS_CAPACITY).0,
            threshold,
        }
    }
    /// receive the reports of the cycles ending from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CycleReport>  {self.reports.subscribe()}
    /// copy of the current statistics
    pub fn stats(&self) -> CycleStats {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
    /// `Err(BusDegraded)` as long as the last `degraded_threshold` exchanges or more all failed
    pub fn health(&self) -> Result<(), Error> {
        let consecutive = self.stats().consecutive_failures;
        if self.threshold != 0 && consecutive >= self.threshold
            {Err(Error::BusDegraded {consecutive})}
        else
            {Ok(())}
    }
    fn update<R>(&self, callback: impl FnOnce(&mut CycleStats) -> R) -> R {
        callback(&mut self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}


/**
    the cyclic exchange loop, before it is started

    it holds everything the loop needs, and is moved into the engine thread by [Self::spawn]
*/
pub struct CyclicEngine {
    bus: Arc<dyn Bus>,
    image: Arc<ProcessImage>,
    /// ranges of the image written by the devices
    inputs: Vec<Range<usize>>,
    settings: CycleSettings,
    token: CancellationToken,
    monitor: CycleMonitor,
}
impl CyclicEngine {
    pub fn new(
            bus: Arc<dyn Bus>,
            image: Arc<ProcessImage>,
            inputs: Vec<Range<usize>>,
            settings: CycleSettings,
            token: CancellationToken,
            ) -> Self {
        Self {
            monitor: CycleMonitor::new(settings.degraded_threshold),
            bus,
            image,
            inputs,
            settings,
            token,
        }
    }
    pub fn monitor(&self) -> &CycleMonitor  {&self.monitor}

    /**
        start the loop on a dedicated thread

        it returns once the loop runtime is ready, an error creating the thread or its runtime is returned and no cycle is run
    */
    pub fn spawn(self) -> io::Result<EngineHandle> {
        self.spawn_with(|| tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build())
    }

    fn spawn_with<F>(self, build: F) -> io::Result<EngineHandle>
    where F: FnOnce() -> io::Result<Runtime> + Send + 'static
    {
        let token = self.token.clone();
        let monitor = self.monitor.clone();
        let (done, finished) = oneshot::channel();
        // the runtime is created and dropped on the engine thread, the caller only waits for its creation
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);

        let thread = std::thread::Builder::new()
            .name("ecmaster-cyclic".into())
            .spawn(move || {
                let runtime = match build() {
                    Ok(runtime) => runtime,
                    Err(error) => {
                        let _ = ready_tx.send(Err(error));
                        return;
                    },
                };
                let _ = ready_tx.send(Ok(()));
                if self.settings.realtime {
                    raise_priority();
                }
                let stats = runtime.block_on(self.run());
                let _ = done.send(stats);
            })?;

        let ready = ready_rx.recv()
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "cyclic thread ended before starting")));
        if let Err(error) = ready {
            log::error!("cannot start the cyclic runtime: {}", error);
            if thread.join().is_err() {
                log::error!("cyclic thread panicked");
            }
            return Err(error);
        }
        Ok(EngineHandle {
            token,
            monitor,
            finished: Some(finished),
            thread: Some(thread),
        })
    }

    /// the loop, ending on cancellation with the final statistics
    async fn run(self) -> CycleStats {
        let period = self.settings.period;
        let origin = tokio::time::Instant::now();
        let mut interval = tokio::time::interval_at(origin, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut frame = vec![0u8; self.image.size()];
        let mut last_cycle = 0;
        log::info!("cyclic exchange started, period {:?}, {} bytes", period, frame.len());

        loop {
            let scheduled = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                scheduled = interval.tick() => scheduled,
            };
            let started = Instant::now();
            let cycle = cycle_number(scheduled.duration_since(origin), period);
            let skipped = cycle.saturating_sub(last_cycle + 1);
            if skipped != 0 {
                log::warn!("cycle {}: {} cycles skipped, exchange overran its period", cycle, skipped);
            }
            last_cycle = cycle;
            self.monitor.update(|stats| {
                stats.missed += skipped;
                stats.record_start(scheduled.into_std(), started);
            });

            let result = self.exchange(&mut frame).await;
            let duration = started.elapsed();

            let status = self.monitor.update(|stats|  match result {
                Ok(()) => {
                    stats.completed += 1;
                    if stats.consecutive_failures >= self.settings.degraded_threshold && self.settings.degraded_threshold != 0 {
                        log::info!("cycle {}: bus recovered after {} failed exchanges", cycle, stats.consecutive_failures);
                    }
                    stats.consecutive_failures = 0;
                    CycleStatus::Ok
                },
                Err(error) => {
                    stats.failed += 1;
                    stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
                    let consecutive = stats.consecutive_failures;
                    if self.settings.degraded_threshold != 0 && consecutive >= self.settings.degraded_threshold {
                        if consecutive == self.settings.degraded_threshold {
                            log::error!("cycle {}: bus degraded, {} exchanges failed in a row", cycle, consecutive);
                        }
                        CycleStatus::Degraded {consecutive, error}
                    }
                    else {
                        log::warn!("cycle {}: exchange failed: {}", cycle, error);
                        CycleStatus::Failed(error)
                    }
                },
            });
            // no subscriber is not an error
            let _ = self.monitor.reports.send(CycleReport {cycle, scheduled: scheduled.into_std(), started, duration, status});
        }

        let stats = self.monitor.stats();
        log::info!("cyclic exchange stopped after {} cycles ({} failed, {} missed)",
            stats.cycles(), stats.failed, stats.missed);
        stats
    }

    /// one exchange of the whole process image
    async fn exchange(&self, frame: &mut [u8]) -> Result<(), CycleError> {
        self.image.snapshot_into(frame);
        self.bus.send_frame(frame).await
            .map_err(|e|  CycleError::Io(Arc::new(e)))?;
        let received = self.bus.receive_frame(frame, self.settings.exchange_timeout).await?;
        if received < frame.len()
            {return Err(CycleError::PartialReply {received, expected: frame.len()})}
        self.image.refresh(frame, &self.inputs);
        Ok(())
    }
}

/// number of the cycle scheduled at the given time since origin, first cycle being 1
fn cycle_number(since_origin: Duration, period: Duration) -> u64 {
    let period = period.as_nanos().max(1);
    // ticks are exact multiples of the period, rounding absorbs clock granularity
    u64::try_from((since_origin.as_nanos() + period / 2) / period).unwrap_or(u64::MAX) + 1
}

#[cfg(target_os = "linux")]
fn raise_priority() {
    use thread_priority::*;
    let result = set_thread_priority_and_policy(
        thread_native_id(),
        ThreadPriority::Max,
        ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        );
    match result {
        Ok(()) => log::debug!("cyclic thread running with realtime priority"),
        Err(error) => log::warn!("cannot raise the cyclic thread priority: {:?}", error),
    }
}
#[cfg(not(target_os = "linux"))]
fn raise_priority() {
    log::warn!("realtime priority is not supported on this platform");
}


/**
    handle on a running engine

    [Self::stop] cancels the loop and waits for its end. Dropping the handle does the same, blocking the current thread.
*/
pub struct EngineHandle {
    token: CancellationToken,
    monitor: CycleMonitor,
    finished: Option<oneshot::Receiver<CycleStats>>,
    thread: Option<JoinHandle<()>>,
}
impl EngineHandle {
    pub fn token(&self) -> &CancellationToken  {&self.token}
    pub fn monitor(&self) -> &CycleMonitor  {&self.monitor}

    /// wait for the loop to end by itself, which happens after a cancellation through the token
    pub async fn join(mut self) -> CycleStats {
        let stats = match self.finished.take() {
            Some(finished) => finished.await.ok(),
            None => None,
        };
        if let Some(thread) = self.thread.take() {
            // the loop already returned, the thread is only releasing its runtime
            if thread.join().is_err() {
                log::error!("cyclic thread panicked");
            }
        }
        stats.unwrap_or_else(|| self.monitor.stats())
    }
    /// cancel the loop and wait for the end of the exchange in progress
    pub async fn stop(self) -> CycleStats {
        self.token.cancel();
        self.join().await
    }
}
impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("cyclic thread panicked");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimulatedBus;

    #[test]
    fn cycle_numbering() {
        let period = Duration::from_millis(10);
        assert_eq!(cycle_number(Duration::ZERO, period), 1);
        assert_eq!(cycle_number(Duration::from_millis(40), period), 5);
        assert_eq!(cycle_number(Duration::from_micros(40_001), period), 5);
    }

    #[test]
    fn period_bookkeeping() {
        let origin = Instant::now();
        let mut stats = CycleStats::default();
        for (i, delay) in [0u64, 1, 3].into_iter().enumerate() {
            let scheduled = origin + Duration::from_millis(10 * i as u64);
            stats.record_start(scheduled, scheduled + Duration::from_millis(delay));
            stats.completed += 1;
        }
        assert_eq!(stats.max_latency, Duration::from_millis(3));
        assert_eq!(stats.last_period, Duration::from_millis(12));
        assert_eq!(stats.max_period, Duration::from_millis(12));
        assert_eq!(stats.mean_period, Duration::from_micros(11_500));
    }

    #[tokio::test]
    async fn token() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(! clone.is_cancelled());
        let waiter = tokio::spawn(async move { clone.cancelled().await });
        token.cancel();
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn health_threshold() {
        let monitor = CycleMonitor::new(3);
        monitor.update(|stats| stats.consecutive_failures = 2);
        assert!(monitor.health().is_ok());
        monitor.update(|stats| stats.consecutive_failures = 3);
        assert!(matches!(monitor.health(), Err(Error::BusDegraded {consecutive: 3})));
    }

    async fn engine(bus: &Arc<SimulatedBus>) -> CyclicEngine {
        bus.open("sim0").await.unwrap();
        CyclicEngine::new(
            bus.clone(),
            Arc::new(ProcessImage::new(4)),
            vec![0 .. 2],
            CycleSettings {
                period: Duration::from_millis(5),
                exchange_timeout: Duration::from_millis(5),
                degraded_threshold: 0,
                realtime: false,
            },
            CancellationToken::new(),
            )
    }

    #[tokio::test]
    async fn runtime_failure_is_returned() {
        let bus = Arc::new(SimulatedBus::new().device(1, 1));
        let result = engine(&bus).await
            .spawn_with(|| Err(io::Error::new(io::ErrorKind::Other, "no timer available")));
        assert_eq!(result.err().map(|error| error.kind()), Some(io::ErrorKind::Other));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.exchanges(), 0);
    }

    #[tokio::test]
    async fn spawned_engine_exchanges_until_stopped() {
        let bus = Arc::new(SimulatedBus::new().device(1, 1));
        let handle = engine(&bus).await.spawn().unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while bus.exchanges() < 2 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }).await.unwrap();
        let stats = handle.stop().await;
        assert!(stats.cycles() >= 2);
        let exchanges = bus.exchanges();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.exchanges(), exchanges);
    }
}

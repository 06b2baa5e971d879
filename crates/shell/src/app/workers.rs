use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::host::Sleeper;

pub const IO_HIGH_WATER_MARK: usize = 1000;
const IO_BACKOFF_DIVISOR: usize = 100;
const IO_BACKOFF_MAX_MS: usize = 100;
const MAX_DRAIN_SLICE: Duration = Duration::from_millis(5);
const DRAIN_SHARE_OF_FRAME: f64 = 0.05;
const IO_FLUSH_POLL: Duration = Duration::from_millis(100);

/// A background pool the scheduler can nudge but does not own.
pub trait WorkerPool {
    /// Processes up to `max_iterations` queued items (zero means none) and
    /// returns how many remain pending.
    fn update(&mut self, max_iterations: usize) -> usize;
    fn pause(&mut self);
    fn resume(&mut self);
}

/// The five pools drained after every tick.
pub struct WorkerPools {
    pub texture_cache: Box<dyn WorkerPool>,
    pub image_decode: Box<dyn WorkerPool>,
    pub texture_fetch: Box<dyn WorkerPool>,
    pub vfs: Box<dyn WorkerPool>,
    pub lfs: Box<dyn WorkerPool>,
}

impl WorkerPools {
    fn pause_interactive(&mut self) {
        self.texture_cache.pause();
        self.image_decode.pause();
    }

    fn resume_interactive(&mut self) {
        self.texture_cache.resume();
        self.image_decode.resume();
    }
}

/// Keeps the texture cache and decode pools paused while alive.
pub struct BackgroundPause<'a> {
    pools: &'a mut WorkerPools,
}

impl<'a> BackgroundPause<'a> {
    pub fn new(pools: &'a mut WorkerPools) -> Self {
        pools.pause_interactive();
        Self { pools }
    }
}

impl Drop for BackgroundPause<'_> {
    fn drop(&mut self) {
        self.pools.resume_interactive();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub passes: u32,
    pub work_pending: usize,
    pub io_pending: usize,
    pub io_backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed,
    TimedOut { pending: usize },
}

/// Wall-clock slice for one drain: 5% of the frame interval, at most 5 ms.
/// Zero when pools run on their own threads, which still allows one pass.
pub fn drain_budget(frame_interval: Duration, run_multiple_threads: bool) -> Duration {
    if run_multiple_threads {
        return Duration::ZERO;
    }
    frame_interval
        .mul_f64(DRAIN_SHARE_OF_FRAME)
        .min(MAX_DRAIN_SLICE)
}

/// Updates every pool one item at a time until the work pools are empty or
/// the budget is spent. I/O backlog does not extend the slice; a large one
/// costs one proportional sleep per pass.
pub fn drain_slice(
    pools: &mut WorkerPools,
    budget: Duration,
    sleeper: &mut dyn Sleeper,
) -> DrainReport {
    let started = Instant::now();
    let mut report = DrainReport::default();

    loop {
        report.passes = report.passes.saturating_add(1);
        report.work_pending = pools.texture_cache.update(1)
            + pools.image_decode.update(1)
            + pools.texture_fetch.update(1);
        report.io_pending = pools.vfs.update(1) + pools.lfs.update(1);

        if report.io_pending > IO_HIGH_WATER_MARK {
            let backoff_ms = (report.io_pending / IO_BACKOFF_DIVISOR).min(IO_BACKOFF_MAX_MS);
            let backoff = Duration::from_millis(backoff_ms as u64);
            sleeper.sleep(backoff);
            report.io_backoff = report.io_backoff.saturating_add(backoff);
        }

        if report.work_pending == 0 || started.elapsed() >= budget {
            break;
        }
    }

    report
}

/// Waits for the two I/O pools to empty, polling every 100 ms.
pub fn flush_io(pools: &mut WorkerPools, timeout: Duration, sleeper: &mut dyn Sleeper) -> FlushOutcome {
    let mut waited = Duration::ZERO;
    loop {
        let pending = pools.vfs.update(0) + pools.lfs.update(0);
        if pending == 0 {
            debug!(waited_ms = waited.as_millis() as u64, "io_flushed");
            return FlushOutcome::Flushed;
        }
        if waited >= timeout {
            warn!(pending, timeout_ms = timeout.as_millis() as u64, "io_flush_timed_out");
            return FlushOutcome::TimedOut { pending };
        }
        sleeper.sleep(IO_FLUSH_POLL);
        waited = waited.saturating_add(IO_FLUSH_POLL);
    }
}

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::callbacks::{CallbackId, CallbackList};
use super::config::LoopConfig;
use super::host::{Collaborators, StartupState, TickError};
use super::idle::{IdleEnv, IdlePhaseRunner};
use super::lifecycle::{FinalSnapshot, Lifecycle};
use super::metrics::{LoopTotals, MetricsAccumulator, MetricsHandle};
use super::phase_stats::{PhaseStats, PhaseStatsSnapshot};
use super::watchdog::{abort_on_expiry, WatchdogError, WatchdogKiller, WatchdogProbe, WatchdogTimeout};
use super::workers::{drain_budget, drain_slice, flush_io, BackgroundPause, FlushOutcome};

#[cfg(debug_assertions)]
const PERIODIC_SLOW_FRAME_EVERY: u64 = 10;
#[cfg(debug_assertions)]
const PERIODIC_SLOW_FRAME: Duration = Duration::from_millis(500);
#[cfg(debug_assertions)]
const MAX_RANDOM_FRAME_JITTER_MS: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Exit,
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("fatal error in main loop: {0}")]
    Fatal(#[source] TickError),
    #[error("main loop panicked: {message}")]
    Panic { message: String },
}

/// Drives one tick at a time: input, idle, render, pacing sleep and the
/// background worker drain.
pub struct MainLoopScheduler {
    config: LoopConfig,
    host: Collaborators,
    lifecycle: Lifecycle,
    watchdog: Option<WatchdogTimeout>,
    idle: IdlePhaseRunner,
    frame_events: CallbackList,
    snapshot: FinalSnapshot,
    disconnected: bool,
    frame_timer: Instant,
    tick_count: u64,
    foreground_frame_count: u64,
    frame_stalls: u64,
    metrics_handle: MetricsHandle,
    metrics_accumulator: MetricsAccumulator,
    phase_stats: PhaseStats,
}

impl MainLoopScheduler {
    /// Creates the scheduler and, when enabled, the process watchdog. Without
    /// a killer, an expired watchdog aborts the process.
    pub fn new(
        config: LoopConfig,
        host: Collaborators,
        lifecycle: Lifecycle,
        killer: Option<WatchdogKiller>,
    ) -> Result<Self, WatchdogError> {
        let watchdog = if config.watchdog_enabled {
            Some(WatchdogTimeout::new(
                config.mainloop_timeout(),
                config.watchdog_check_interval(),
                killer.unwrap_or_else(abort_on_expiry),
            )?)
        } else {
            None
        };

        info!(
            watchdog_enabled = watchdog.is_some(),
            mainloop_timeout_ms = config.mainloop_timeout().as_millis() as u64,
            background_yield_ms = config.background_yield(false).as_millis() as u64,
            yield_time_ms = ?config.yield_time_ms,
            message_budget_ms = config.message_budget().as_secs_f32() * 1000.0,
            max_messages_per_tick = config.max_messages_per_tick(),
            run_multiple_threads = config.run_multiple_threads,
            "loop_config"
        );

        let now = Instant::now();
        Ok(Self {
            idle: IdlePhaseRunner::new(&config, now),
            metrics_accumulator: MetricsAccumulator::new(config.metrics_log_interval(), now),
            config,
            host,
            lifecycle,
            watchdog,
            frame_events: CallbackList::new(),
            snapshot: FinalSnapshot::default(),
            disconnected: false,
            frame_timer: now,
            tick_count: 0,
            foreground_frame_count: 0,
            frame_stalls: 0,
            metrics_handle: MetricsHandle::default(),
            phase_stats: PhaseStats::new(),
        })
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn metrics_handle(&self) -> MetricsHandle {
        self.metrics_handle.clone()
    }

    pub fn watchdog_probe(&self) -> Option<WatchdogProbe> {
        self.watchdog.as_ref().map(WatchdogTimeout::probe)
    }

    pub fn idle(&self) -> &IdlePhaseRunner {
        &self.idle
    }

    pub fn idle_mut(&mut self) -> &mut IdlePhaseRunner {
        &mut self.idle
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn foreground_frame_count(&self) -> u64 {
        self.foreground_frame_count
    }

    pub fn frame_stalls(&self) -> u64 {
        self.frame_stalls
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn phase_stats(&self) -> PhaseStatsSnapshot {
        self.phase_stats.snapshot()
    }

    /// Subscribes to the payload-free event posted after input each tick.
    pub fn add_frame_listener(&mut self, listener: impl FnMut() + 'static) -> CallbackId {
        self.frame_events.add(listener)
    }

    pub fn remove_frame_listener(&mut self, id: CallbackId) -> bool {
        self.frame_events.remove(id)
    }

    pub fn tick(&mut self) -> Result<LoopControl, TickError> {
        self.ping("Main:MiscNativeWindowEvents");
        self.host.window.process_native_events();

        self.ping("Main:GatherInput");
        self.host.window.gather_input();

        self.frame_events.call_all();

        let mut idle_time = Duration::ZERO;
        let mut render_time = Duration::ZERO;
        if !self.lifecycle.is_exiting() {
            self.ping("Main:JoystickKeyboard");
            if self.input_scan_allowed() {
                self.host.window.scan_input();
            }

            self.pause_watchdog();
            let idle_started = Instant::now();
            let idle_result = self.idle.run(
                idle_started,
                &mut self.host,
                IdleEnv {
                    lifecycle: &self.lifecycle,
                    snapshot: &mut self.snapshot,
                    watchdog: self.watchdog.as_ref(),
                    disconnected: self.disconnected,
                },
            );
            idle_time = idle_started.elapsed();
            self.resume_watchdog();
            idle_result?;

            if self.lifecycle.disconnect_requested() && !self.disconnected && self.is_started() {
                self.disconnect()?;
            }

            if !self.lifecycle.is_exiting() {
                let render_started = Instant::now();
                self.ping("Main:Display");
                self.host.renderer.render_frame()?;
                self.ping("Main:Snapshot");
                self.host.renderer.poll_snapshots();
                render_time = render_started.elapsed();
            }
        }

        self.ping("Main:Sleep");
        self.pause_watchdog();

        let background_started = Instant::now();
        self.pace();
        let budget = drain_budget(
            self.idle.frame_clock().frame_interval(),
            self.config.run_multiple_threads,
        );
        let drain = drain_slice(&mut self.host.workers, budget, self.host.sleeper.as_mut());
        let background_time = background_started.elapsed();
        if drain.io_backoff > Duration::ZERO {
            debug!(
                io_pending = drain.io_pending,
                backoff_ms = drain.io_backoff.as_millis() as u64,
                "io_backlog_backoff"
            );
        }

        self.finish_frame(idle_time, render_time, background_time);

        self.resume_watchdog();
        self.ping("Main:End");

        if self.lifecycle.is_exiting() {
            Ok(LoopControl::Exit)
        } else {
            Ok(LoopControl::Continue)
        }
    }

    /// Exit-time cleanup: final snapshot, I/O flush, watchdog teardown.
    pub fn finish(&mut self) {
        self.pause_watchdog();
        if self.is_started() {
            if let Err(err) = self.snapshot.save(self.host.snapshot.as_mut()) {
                warn!(error = %err, "final_snapshot_failed");
            }
        }
        match flush_io(
            &mut self.host.workers,
            self.config.io_flush_timeout(),
            self.host.sleeper.as_mut(),
        ) {
            FlushOutcome::Flushed => {}
            FlushOutcome::TimedOut { pending } => {
                warn!(pending, "exiting with unflushed io");
            }
        }
        self.watchdog = None;
        info!(
            ticks = self.tick_count,
            frame_stalls = self.frame_stalls,
            "main_loop_finished"
        );
    }

    fn handle_tick_error(&mut self, err: TickError) -> Result<(), LoopError> {
        match err {
            TickError::Continuable { .. } => {
                warn!(context = err.context(), error = %err, "continuable_tick_error");
                Ok(())
            }
            TickError::OutOfMemory { .. } => {
                self.host.memory.log_memory_info();
                if self.host.memory.simulator_active() {
                    self.host.memory.stop_simulator();
                    warn!(context = err.context(), "allocation failure; memory simulator stopped");
                    Ok(())
                } else {
                    error!(context = err.context(), "out_of_memory");
                    self.host.crash_reporter.report(&err.to_string());
                    Err(LoopError::Fatal(err))
                }
            }
            TickError::Fatal { .. } => {
                error!(context = err.context(), error = %err, "fatal_tick_error");
                self.host.crash_reporter.report(&err.to_string());
                Err(LoopError::Fatal(err))
            }
        }
    }

    fn report_panic(&mut self, message: &str) {
        error!(message, "main_loop_panicked");
        self.host.crash_reporter.report(message);
        self.pause_watchdog();
        self.watchdog = None;
    }

    fn disconnect(&mut self) -> Result<(), TickError> {
        self.pause_watchdog();
        let saved = self.snapshot.save(self.host.snapshot.as_mut());
        self.host.session.disconnect();
        self.disconnected = true;
        info!("disconnected");
        self.resume_watchdog();
        saved.map(|_| ())
    }

    fn pace(&mut self) {
        if let Some(yield_time) = self.config.yield_time() {
            self.host.sleeper.sleep(yield_time);
        }

        if !self.host.window.is_visible() || !self.host.window.has_focus() {
            let in_login_auth = self.host.startup.current_state().in_login_auth();
            let background_yield = self.config.background_yield(in_login_auth);
            if !background_yield.is_zero() {
                let _pause = BackgroundPause::new(&mut self.host.workers);
                self.host.sleeper.sleep(background_yield);
            }
        }

        #[cfg(debug_assertions)]
        self.debug_pacing();
    }

    #[cfg(debug_assertions)]
    fn debug_pacing(&mut self) {
        if self.config.randomize_framerate {
            self.host.sleeper.sleep(random_frame_jitter());
        }
        if self.config.periodic_slow_frame && self.tick_count % PERIODIC_SLOW_FRAME_EVERY == 0 {
            info!(sleep_ms = PERIODIC_SLOW_FRAME.as_millis() as u64, "periodic_slow_frame");
            self.host.sleeper.sleep(PERIODIC_SLOW_FRAME);
        }
    }

    fn finish_frame(&mut self, idle: Duration, render: Duration, background: Duration) {
        let now = Instant::now();
        let frame_elapsed = now.saturating_duration_since(self.frame_timer);
        self.frame_timer = now;

        if self.host.startup.current_state() >= StartupState::Cleanup
            && frame_elapsed > self.config.frame_stall_threshold()
        {
            self.frame_stalls += 1;
            warn!(
                frame_ms = frame_elapsed.as_millis() as u64,
                frame_stalls = self.frame_stalls,
                "frame_stall"
            );
        }

        self.tick_count += 1;
        if self.host.window.is_visible() && self.host.window.has_focus() {
            self.foreground_frame_count += 1;
        }

        self.phase_stats.record_tick(idle, render, background);
        self.metrics_accumulator.record_frame(frame_elapsed);
        let totals = LoopTotals {
            smoothed_fps: self.idle.frame_clock().smoothed_fps(),
            frame_count: self.tick_count,
            foreground_frame_count: self.foreground_frame_count,
            frame_stalls: self.frame_stalls,
            message_budget: self.idle.message_budget().current(),
        };
        if let Some(snapshot) = self.metrics_accumulator.maybe_snapshot(now, totals) {
            self.metrics_handle.publish(snapshot);
            let phases = self.phase_stats.snapshot();
            info!(
                fps = snapshot.fps,
                smoothed_fps = snapshot.smoothed_fps,
                frame_time_ms = snapshot.frame_time_ms,
                frame_stalls = snapshot.frame_stalls,
                message_budget_ms = snapshot.message_budget_ms,
                idle_avg_ms = phases.idle.avg_ms,
                render_avg_ms = phases.render.avg_ms,
                background_max_ms = phases.background.max_ms,
                "loop_metrics"
            );
        }
    }

    fn input_scan_allowed(&self) -> bool {
        let window = &self.host.window;
        window.is_visible()
            && window.has_focus()
            && !window.is_minimized()
            && self.is_started()
            && !self.host.ui.progress_visible()
    }

    fn is_started(&self) -> bool {
        self.host.startup.current_state().is_started()
    }

    fn ping(&self, label: &str) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.ping(label);
        }
    }

    fn pause_watchdog(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.pause();
        }
    }

    fn resume_watchdog(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.resume("");
        }
    }
}

/// Runs ticks until exit or a fatal error.
///
/// Continuable errors and allocation failures under the memory simulator are
/// logged and the loop carries on. Anything else reports a crash and ends
/// the loop with an error. A clean exit runs [`MainLoopScheduler::finish`].
pub fn run_main_loop(scheduler: &mut MainLoopScheduler) -> Result<(), LoopError> {
    info!("main_loop_started");
    let outcome = loop {
        match panic::catch_unwind(AssertUnwindSafe(|| scheduler.tick())) {
            Ok(Ok(LoopControl::Continue)) => {}
            Ok(Ok(LoopControl::Exit)) => break Ok(()),
            Ok(Err(err)) => {
                if let Err(fatal) = scheduler.handle_tick_error(err) {
                    break Err(fatal);
                }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                scheduler.report_panic(&message);
                break Err(LoopError::Panic { message });
            }
        }
    };

    if outcome.is_ok() {
        scheduler.finish();
    }
    outcome
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(debug_assertions)]
fn random_frame_jitter() -> Duration {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos())
        .unwrap_or(0);
    Duration::from_millis(u64::from(nanos % MAX_RANDOM_FRAME_JITTER_MS))
}

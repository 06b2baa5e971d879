//! Main-thread liveness watchdog.
//!
//! The owning thread pings with a diagnostic label; a monitor thread compares
//! the stored deadline against the clock and fires the killer once if the
//! owner stops pinging while the timeout is running.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error};

pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(20);
const MONITOR_THREAD_NAME: &str = "watchdog-monitor";

static WATCHDOG_ALIVE: AtomicBool = AtomicBool::new(false);

/// Invoked on the monitor thread when the owner misses its deadline.
pub type WatchdogKiller = Box<dyn FnOnce(&WatchdogExpiry) + Send + 'static>;

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("a watchdog timeout already exists in this process")]
    AlreadyExists,
    #[error("failed to spawn watchdog monitor thread: {0}")]
    SpawnMonitor(#[source] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogExpiry {
    pub state: String,
    pub overdue: Duration,
}

#[derive(Debug)]
struct SharedState {
    origin: Instant,
    running: AtomicBool,
    deadline_nanos: AtomicU64,
    fired: AtomicBool,
    shutdown: AtomicBool,
    state: Mutex<String>,
}

impl SharedState {
    fn new(origin: Instant) -> Self {
        Self {
            origin,
            running: AtomicBool::new(false),
            deadline_nanos: AtomicU64::new(0),
            fired: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            state: Mutex::new(String::new()),
        }
    }

    fn label(&self) -> MutexGuard<'_, String> {
        // The label is diagnostic only, so a poisoned guard is still usable.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, label: &str, timeout: Duration, now: Instant) {
        if !label.is_empty() {
            let mut state = self.label();
            state.clear();
            state.push_str(label);
        }
        let offset = now.saturating_duration_since(self.origin).saturating_add(timeout);
        let nanos = u64::try_from(offset.as_nanos()).unwrap_or(u64::MAX);
        self.deadline_nanos.store(nanos, Ordering::Release);
    }

    fn check_expired(&self, now: Instant) -> Option<WatchdogExpiry> {
        if !self.running.load(Ordering::Acquire) {
            return None;
        }
        let deadline = Duration::from_nanos(self.deadline_nanos.load(Ordering::Acquire));
        let elapsed = now.saturating_duration_since(self.origin);
        if elapsed <= deadline {
            return None;
        }
        Some(WatchdogExpiry {
            state: self.label().clone(),
            overdue: elapsed - deadline,
        })
    }
}

/// Read-only view of a watchdog for diagnostics.
#[derive(Debug, Clone)]
pub struct WatchdogProbe {
    shared: Arc<SharedState>,
}

impl WatchdogProbe {
    pub fn state(&self) -> String {
        self.shared.label().clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn has_fired(&self) -> bool {
        self.shared.fired.load(Ordering::Acquire)
    }
}

/// Process-wide singleton timeout for the main thread.
pub struct WatchdogTimeout {
    shared: Arc<SharedState>,
    default_timeout: Duration,
    monitor: Option<JoinHandle<()>>,
}

impl WatchdogTimeout {
    /// Starts stopped. A zero `default_timeout` falls back to 20 seconds.
    pub fn new(
        default_timeout: Duration,
        check_interval: Duration,
        killer: WatchdogKiller,
    ) -> Result<Self, WatchdogError> {
        if WATCHDOG_ALIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WatchdogError::AlreadyExists);
        }

        let shared = Arc::new(SharedState::new(Instant::now()));
        let monitor_shared = Arc::clone(&shared);
        let check_interval = check_interval.max(Duration::from_millis(1));
        let spawned = thread::Builder::new()
            .name(MONITOR_THREAD_NAME.to_string())
            .spawn(move || run_monitor(monitor_shared, check_interval, killer));

        let monitor = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                WATCHDOG_ALIVE.store(false, Ordering::Release);
                return Err(WatchdogError::SpawnMonitor(err));
            }
        };

        let default_timeout = if default_timeout.is_zero() {
            DEFAULT_WATCHDOG_TIMEOUT
        } else {
            default_timeout
        };
        debug!(
            timeout_ms = default_timeout.as_millis() as u64,
            check_interval_ms = check_interval.as_millis() as u64,
            "watchdog_created"
        );

        Ok(Self {
            shared,
            default_timeout,
            monitor: Some(monitor),
        })
    }

    pub fn ping(&self, label: &str) {
        self.ping_for(label, self.default_timeout);
    }

    /// Records the label and pushes the deadline out. Stopped timeouts stay stopped.
    pub fn ping_for(&self, label: &str, timeout: Duration) {
        self.shared.record(label, timeout, Instant::now());
    }

    pub fn pause(&self) {
        self.shared.running.store(false, Ordering::Release);
    }

    pub fn resume(&self, label: &str) {
        self.resume_for(label, self.default_timeout);
    }

    pub fn resume_for(&self, label: &str, timeout: Duration) {
        self.shared.record(label, timeout, Instant::now());
        self.shared.running.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> String {
        self.shared.label().clone()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn check_expired(&self, now: Instant) -> Option<WatchdogExpiry> {
        self.shared.check_expired(now)
    }

    pub fn probe(&self) -> WatchdogProbe {
        WatchdogProbe {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for WatchdogTimeout {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(monitor) = self.monitor.take() {
            monitor.thread().unpark();
            if monitor.join().is_err() {
                error!("watchdog monitor thread panicked");
            }
        }
        WATCHDOG_ALIVE.store(false, Ordering::Release);
        debug!("watchdog_destroyed");
    }
}

fn run_monitor(shared: Arc<SharedState>, check_interval: Duration, killer: WatchdogKiller) {
    let mut killer = Some(killer);
    while !shared.shutdown.load(Ordering::Acquire) {
        if let Some(expiry) = shared.check_expired(Instant::now()) {
            if !shared.fired.swap(true, Ordering::AcqRel) {
                error!(
                    state = expiry.state.as_str(),
                    overdue_ms = expiry.overdue.as_millis() as u64,
                    "watchdog_expired"
                );
                if let Some(killer) = killer.take() {
                    killer(&expiry);
                }
            }
        }
        thread::park_timeout(check_interval);
    }
}

/// Logs the expiry and aborts the process.
pub fn abort_on_expiry() -> WatchdogKiller {
    Box::new(|expiry: &WatchdogExpiry| {
        error!(state = expiry.state.as_str(), "main thread stalled; aborting");
        std::process::abort();
    })
}

#[cfg(test)]
static TEST_SERIAL_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
pub(crate) fn test_serial_guard() -> MutexGuard<'static, ()> {
    TEST_SERIAL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

mod callbacks;
mod config;
mod frame_clock;
mod host;
mod idle;
mod lifecycle;
mod loop_runner;
mod metrics;
mod network;
mod phase_stats;
mod render_info;
mod shutdown;
#[cfg(test)]
mod testing;
mod watchdog;
mod workers;

pub use callbacks::{CallbackId, CallbackList, DeferredTasks};
pub use config::{
    load_settings, ConfigError, LoopConfig, BACKGROUND_YIELD_ENV_VAR,
    LOGIN_BACKGROUND_YIELD_CAP_MS, MAX_BACKGROUND_YIELD_MS, QUIT_AFTER_ENV_VAR,
    YIELD_TIME_ENV_VAR,
};
pub use frame_clock::{FrameClock, MAX_FRAME_RATE, MIN_FRAME_RATE};
pub use host::{
    AgentLink, Collaborators, CrashReporter, MemoryDiagnostics, NetworkPump, RenderFrame,
    SessionLink, Sleeper, SnapshotSaver, StartupState, StartupStepper, Telemetry, ThreadSleeper,
    TickError, UiState, WindowHost, WorldUpdate,
};
pub use idle::{IdleEnv, IdleOutcome, IdlePhaseRunner};
pub use lifecycle::{FinalSnapshot, Lifecycle};
pub use loop_runner::{run_main_loop, LoopControl, LoopError, MainLoopScheduler};
pub use metrics::{LoopMetricsSnapshot, MetricsHandle};
pub use network::{
    drain_messages, BudgetClock, MessageBudget, MessageDrainReport, MESSAGE_BUDGET_GROWTH,
};
pub use phase_stats::{PhaseStatsSnapshot, RollingMsStats};
pub use render_info::{RegionId, RegionStatus, RenderInfoRegions, RenderInfoScheduler};
pub use shutdown::{ShutdownContext, ShutdownSequencer, ShutdownState, ShutdownTimings};
pub use watchdog::{
    abort_on_expiry, WatchdogError, WatchdogExpiry, WatchdogKiller, WatchdogProbe,
    WatchdogTimeout, DEFAULT_WATCHDOG_TIMEOUT,
};
pub use workers::{
    drain_budget, drain_slice, flush_io, BackgroundPause, DrainReport, FlushOutcome, WorkerPool,
    WorkerPools, IO_HIGH_WATER_MARK,
};

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub mod app;

pub use app::{
    abort_on_expiry, drain_budget, drain_messages, drain_slice, flush_io, load_settings,
    run_main_loop, AgentLink, BackgroundPause, BudgetClock, CallbackId, CallbackList,
    Collaborators, ConfigError, CrashReporter, DeferredTasks, DrainReport, FinalSnapshot,
    FlushOutcome, FrameClock, IdleEnv, IdleOutcome, IdlePhaseRunner, Lifecycle, LoopConfig,
    LoopControl, LoopError, LoopMetricsSnapshot, MainLoopScheduler, MemoryDiagnostics,
    MessageBudget, MessageDrainReport, MetricsHandle, NetworkPump, PhaseStatsSnapshot, RegionId,
    RegionStatus, RenderFrame, RenderInfoRegions, RenderInfoScheduler, RollingMsStats,
    SessionLink, ShutdownContext, ShutdownSequencer, ShutdownState, ShutdownTimings, Sleeper,
    SnapshotSaver, StartupState, StartupStepper, Telemetry, ThreadSleeper, TickError, UiState,
    WatchdogError, WatchdogExpiry, WatchdogKiller, WatchdogProbe, WatchdogTimeout, WindowHost,
    WorkerPool, WorkerPools, WorldUpdate, BACKGROUND_YIELD_ENV_VAR, DEFAULT_WATCHDOG_TIMEOUT,
    IO_HIGH_WATER_MARK, LOGIN_BACKGROUND_YIELD_CAP_MS, MAX_BACKGROUND_YIELD_MS, MAX_FRAME_RATE,
    MESSAGE_BUDGET_GROWTH, MIN_FRAME_RATE, QUIT_AFTER_ENV_VAR, YIELD_TIME_ENV_VAR,
};

pub const ROOT_ENV_VAR: &str = "VIEWER_ROOT";
pub const SETTINGS_ENV_VAR: &str = "VIEWER_SETTINGS";
pub const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub root: PathBuf,
    pub settings_file: Option<PathBuf>,
    pub cache_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to read environment variable {var}: {source}")]
    EnvVar {
        var: &'static str,
        #[source]
        source: env::VarError,
    },
    #[error("failed to resolve current executable path: {0}")]
    CurrentExe(#[source] std::io::Error),
    #[error("current executable path has no parent directory: {0}")]
    ExeHasNoParent(PathBuf),
    #[error("failed to create cache directory at {path}: {source}")]
    CreateCacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "VIEWER_ROOT is set but does not point to a directory: {path}\n\
Point it at the directory holding settings.json, or unset it to use the executable directory."
    )]
    InvalidEnvRoot { path: PathBuf },
    #[error("VIEWER_SETTINGS points to a file that does not exist: {path}")]
    MissingSettingsFile { path: PathBuf },
}

/// Resolves the viewer root, the optional settings file and the cache directory.
///
/// The root comes from `VIEWER_ROOT` when set. Otherwise the executable's
/// ancestors are searched for a directory holding `settings.json` or a
/// workspace `Cargo.toml`, falling back to the executable directory itself.
pub fn resolve_app_paths() -> Result<AppPaths, StartupError> {
    let root = resolve_root()?;
    let settings_file = resolve_settings_file(&root)?;
    let cache_dir = root.join("cache");

    fs::create_dir_all(&cache_dir).map_err(|source| StartupError::CreateCacheDir {
        path: cache_dir.clone(),
        source,
    })?;

    Ok(AppPaths {
        root,
        settings_file,
        cache_dir,
    })
}

fn resolve_root() -> Result<PathBuf, StartupError> {
    match env::var(ROOT_ENV_VAR) {
        Ok(value) => {
            let normalized = normalize_path(&PathBuf::from(value));
            if normalized.is_dir() {
                Ok(normalized)
            } else {
                Err(StartupError::InvalidEnvRoot { path: normalized })
            }
        }
        Err(env::VarError::NotPresent) => {
            let exe = env::current_exe().map_err(StartupError::CurrentExe)?;
            let exe_dir = exe
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| StartupError::ExeHasNoParent(exe.clone()))?;

            for candidate in exe_dir.ancestors() {
                if is_root_marker(candidate) {
                    return Ok(normalize_path(candidate));
                }
            }

            Ok(normalize_path(&exe_dir))
        }
        Err(source) => Err(StartupError::EnvVar {
            var: ROOT_ENV_VAR,
            source,
        }),
    }
}

fn resolve_settings_file(root: &Path) -> Result<Option<PathBuf>, StartupError> {
    match env::var(SETTINGS_ENV_VAR) {
        Ok(value) => {
            let path = PathBuf::from(value);
            if path.is_file() {
                Ok(Some(normalize_path(&path)))
            } else {
                Err(StartupError::MissingSettingsFile { path })
            }
        }
        Err(env::VarError::NotPresent) => {
            let candidate = root.join(SETTINGS_FILE_NAME);
            Ok(candidate.is_file().then_some(candidate))
        }
        Err(source) => Err(StartupError::EnvVar {
            var: SETTINGS_ENV_VAR,
            source,
        }),
    }
}

fn is_root_marker(path: &Path) -> bool {
    if path.join(SETTINGS_FILE_NAME).is_file() {
        return true;
    }
    path.join("Cargo.toml").is_file() && path.join("crates").is_dir()
}

fn normalize_path(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

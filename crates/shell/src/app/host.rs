//! Collaborator seams the main loop drives.
//!
//! Everything outside the scheduler (window, login state machine, message
//! system, renderer, session, UI) is reached through these traits. Only the
//! calls the scheduler makes are modelled here.

use std::thread;
use std::time::Duration;

use thiserror::Error;

use super::network::BudgetClock;
use super::render_info::RenderInfoRegions;
use super::workers::WorkerPools;

/// Error kinds that can escape one tick.
///
/// The loop boundary decides what happens next by kind: continuable errors
/// are logged and the tick counts as complete, out-of-memory is fatal unless
/// the memory pressure simulator caused it, everything else is fatal.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("continuable error in {context}: {message}")]
    Continuable {
        context: &'static str,
        message: String,
    },
    #[error("out of memory in {context}")]
    OutOfMemory { context: &'static str },
    #[error("fatal error in {context}: {message}")]
    Fatal {
        context: &'static str,
        message: String,
    },
}

impl TickError {
    pub fn continuable(context: &'static str, message: impl Into<String>) -> Self {
        Self::Continuable {
            context,
            message: message.into(),
        }
    }

    pub fn out_of_memory(context: &'static str) -> Self {
        Self::OutOfMemory { context }
    }

    pub fn fatal(context: &'static str, message: impl Into<String>) -> Self {
        Self::Fatal {
            context,
            message: message.into(),
        }
    }

    pub fn context(&self) -> &'static str {
        match self {
            Self::Continuable { context, .. }
            | Self::OutOfMemory { context }
            | Self::Fatal { context, .. } => context,
        }
    }
}

/// Login/startup progression. Ordered so range checks read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StartupState {
    FirstLaunch,
    LoginShow,
    LoginWait,
    LoginCleanup,
    LoginAuthInit,
    LoginProcessResponse,
    WorldInit,
    Seed,
    Precache,
    Cleanup,
    Started,
}

impl StartupState {
    pub fn is_started(self) -> bool {
        self == StartupState::Started
    }

    /// Between auth init and fully started: long sleeps read as stalls here.
    pub fn in_login_auth(self) -> bool {
        self >= StartupState::LoginAuthInit && self < StartupState::Started
    }
}

pub trait WindowHost {
    fn process_native_events(&mut self);
    fn gather_input(&mut self);
    /// Polls held movement keys and joystick axes.
    fn scan_input(&mut self);
    fn is_visible(&self) -> bool;
    fn has_focus(&self) -> bool;
    fn is_minimized(&self) -> bool;
}

pub trait StartupStepper {
    fn current_state(&self) -> StartupState;
    /// Advances the login state machine. `false` means there is no world yet.
    fn step_idle(&mut self) -> Result<bool, TickError>;
}

pub trait NetworkPump {
    /// Decodes and dispatches the next queued message, `false` when none is left.
    fn check_next_message(&mut self, clock: &BudgetClock) -> bool;
    fn process_acks(&mut self, collect_window: Duration);
}

pub trait AgentLink {
    fn control_flags(&self) -> u32;
    fn send_agent_update(&mut self);
}

/// Fire-and-forget reporting; nothing returned is consumed by the loop.
pub trait Telemetry {
    fn send_metrics(&mut self, enabled: bool);
    fn send_session_stats(&mut self);
}

pub trait RenderFrame {
    fn render_frame(&mut self) -> Result<(), TickError>;
    fn poll_snapshots(&mut self) {}
}

pub trait SnapshotSaver {
    fn save_final_snapshot(&mut self) -> Result<(), TickError>;
}

pub trait SessionLink {
    fn has_region(&self) -> bool;
    fn send_logout_request(&mut self);
    fn has_logout_reply(&self) -> bool;
    fn pending_uploads(&self) -> usize;
    fn disconnect(&mut self);
}

pub trait UiState {
    fn modal_dialog_count(&self) -> usize;
    fn open_floater_count(&self) -> usize;
    fn close_all_floaters(&mut self);
    fn show_progress(&mut self, percent: f32, message: &str);
    fn progress_visible(&self) -> bool;
}

pub trait WorldUpdate {
    fn update_world(&mut self, frame_dt_seconds: f32) -> Result<(), TickError>;
}

pub trait MemoryDiagnostics {
    fn log_memory_info(&mut self);
    fn simulator_active(&self) -> bool;
    fn stop_simulator(&mut self);
}

pub trait CrashReporter {
    fn report(&mut self, reason: &str);
}

pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

/// The full set of collaborators one scheduler owns.
pub struct Collaborators {
    pub window: Box<dyn WindowHost>,
    pub startup: Box<dyn StartupStepper>,
    pub network: Box<dyn NetworkPump>,
    pub agent: Box<dyn AgentLink>,
    pub telemetry: Box<dyn Telemetry>,
    pub renderer: Box<dyn RenderFrame>,
    pub snapshot: Box<dyn SnapshotSaver>,
    pub session: Box<dyn SessionLink>,
    pub ui: Box<dyn UiState>,
    pub world: Box<dyn WorldUpdate>,
    pub render_info: Box<dyn RenderInfoRegions>,
    pub memory: Box<dyn MemoryDiagnostics>,
    pub crash_reporter: Box<dyn CrashReporter>,
    pub workers: WorkerPools,
    pub sleeper: Box<dyn Sleeper>,
}

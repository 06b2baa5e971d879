use std::time::{Duration, Instant};

use tracing::info;

use super::config::LoopConfig;
use super::host::{SessionLink, SnapshotSaver, TickError, UiState};
use super::lifecycle::{FinalSnapshot, Lifecycle};

const SAVING_SETTINGS_LABEL: &str = "SavingSettings";
const LOGGING_OUT_LABEL: &str = "LoggingOut";

/// Logout progression. Ordered; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShutdownState {
    Running,
    SnapshotPending,
    LogoutRequested,
    AwaitingLogoutReply,
    ForceQuit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownTimings {
    /// How long pending uploads may hold back the logout request.
    pub upload_grace: Duration,
    /// How long to wait for a logout reply once the request is sent.
    pub logout_max_wait: Duration,
}

impl Default for ShutdownTimings {
    fn default() -> Self {
        Self {
            upload_grace: Duration::from_secs(5),
            logout_max_wait: Duration::from_secs(6),
        }
    }
}

impl ShutdownTimings {
    pub fn from_config(config: &LoopConfig) -> Self {
        Self {
            upload_grace: config.shutdown_upload_grace(),
            logout_max_wait: config.logout_request_time(),
        }
    }
}

/// Collaborators one shutdown step touches.
pub struct ShutdownContext<'a> {
    pub ui: &'a mut dyn UiState,
    pub session: &'a mut dyn SessionLink,
    pub snapshot_saver: &'a mut dyn SnapshotSaver,
    pub snapshot: &'a mut FinalSnapshot,
    pub lifecycle: &'a Lifecycle,
}

#[derive(Debug, Clone)]
pub struct ShutdownSequencer {
    state: ShutdownState,
    timings: ShutdownTimings,
    began_at: Option<Instant>,
    logout_sent_at: Option<Instant>,
    max_pending_uploads: usize,
}

impl ShutdownSequencer {
    pub fn new(timings: ShutdownTimings) -> Self {
        Self {
            state: ShutdownState::Running,
            timings,
            began_at: None,
            logout_sent_at: None,
            max_pending_uploads: 0,
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.state
    }

    pub fn logout_sent(&self) -> bool {
        self.logout_sent_at.is_some()
    }

    /// Records the quit intent. Has no effect once shutdown has begun.
    pub fn begin(&mut self, now: Instant) {
        if self.state == ShutdownState::Running {
            self.began_at = Some(now);
            self.transition(ShutdownState::SnapshotPending);
        }
    }

    pub fn extend_logout_wait(&mut self, extra: Duration) {
        self.timings.logout_max_wait = self.timings.logout_max_wait.saturating_add(extra);
        info!(
            logout_max_wait_ms = self.timings.logout_max_wait.as_millis() as u64,
            "logout_wait_extended"
        );
    }

    /// Jumps to `ForceQuit` once the session is gone; no reply can arrive.
    pub fn session_lost(&mut self, lifecycle: &Lifecycle) -> ShutdownState {
        if self.state != ShutdownState::ForceQuit {
            info!(state = ?self.state, "shutdown_session_lost");
            self.transition(ShutdownState::ForceQuit);
        }
        lifecycle.force_quit();
        self.state
    }

    /// Re-evaluates the current state, making at most one transition.
    pub fn step(
        &mut self,
        now: Instant,
        ctx: ShutdownContext<'_>,
    ) -> Result<ShutdownState, TickError> {
        match self.state {
            ShutdownState::Running => {}
            ShutdownState::SnapshotPending => {
                if ctx.ui.modal_dialog_count() > 0 || ctx.ui.open_floater_count() > 0 {
                    return Ok(self.state);
                }
                let saved = ctx.snapshot.save(ctx.snapshot_saver);
                self.transition(ShutdownState::LogoutRequested);
                saved?;
            }
            ShutdownState::LogoutRequested => {
                let pending = ctx.session.pending_uploads();
                let since_begin = self
                    .began_at
                    .map_or(Duration::ZERO, |began| now.saturating_duration_since(began));
                if pending > 0 && since_begin < self.timings.upload_grace {
                    self.max_pending_uploads = self.max_pending_uploads.max(pending);
                    let finished = self.max_pending_uploads - pending;
                    let percent = 100.0 * finished as f32 / self.max_pending_uploads as f32;
                    ctx.ui.show_progress(percent, SAVING_SETTINGS_LABEL);
                    return Ok(self.state);
                }
                if self.logout_sent_at.is_none() {
                    ctx.session.send_logout_request();
                    self.logout_sent_at = Some(now);
                    info!(pending_uploads = pending, "logout_request_sent");
                }
                ctx.ui.show_progress(100.0, LOGGING_OUT_LABEL);
                self.transition(ShutdownState::AwaitingLogoutReply);
            }
            ShutdownState::AwaitingLogoutReply => {
                let waited = self
                    .logout_sent_at
                    .map_or(Duration::ZERO, |sent| now.saturating_duration_since(sent));
                let replied = ctx.session.has_logout_reply();
                if replied || waited >= self.timings.logout_max_wait {
                    if !replied {
                        info!(waited_ms = waited.as_millis() as u64, "logout_reply_timed_out");
                    }
                    self.transition(ShutdownState::ForceQuit);
                    ctx.lifecycle.force_quit();
                }
            }
            ShutdownState::ForceQuit => ctx.lifecycle.force_quit(),
        }
        Ok(self.state)
    }

    fn transition(&mut self, next: ShutdownState) {
        debug_assert!(next > self.state, "shutdown must move forward");
        info!(from = ?self.state, to = ?next, "shutdown_state_changed");
        self.state = next;
    }
}

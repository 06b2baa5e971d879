use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::Serialize;
use shell::{
    AgentLink, BudgetClock, CrashReporter, MemoryDiagnostics, NetworkPump, RegionId,
    RegionStatus, RenderFrame, RenderInfoRegions, SessionLink, StartupState, StartupStepper,
    Telemetry, TickError, UiState, WorldUpdate,
};
use tracing::{debug, error, info};

use super::settings::GridSettings;
use super::workers::PoolQueues;

const OPEN_FLOATERS_AT_LOGIN: usize = 2;
const CONTROL_FLAG_PERIOD_SECONDS: f64 = 5.0;
const WALKING_FLAG: u32 = 0x1;

/// Counters written to `last_session.json` on exit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct SessionSummary {
    pub startup_state: String,
    pub frames_rendered: u64,
    pub messages_decoded: u64,
    pub ack_passes: u64,
    pub agent_updates: u64,
    pub session_stats_sent: u64,
    pub world_seconds: f64,
    pub render_info_sent: u64,
    pub render_info_requested: u64,
    pub disconnected: bool,
}

struct GridState {
    settings: GridSettings,
    queues: PoolQueues,
    startup: StartupState,
    steps_in_state: u32,
    message_backlog: f64,
    last_refill: Instant,
    messages_decoded: u64,
    ack_passes: u64,
    agent_updates: u64,
    session_stats_sent: u64,
    frames_rendered: u64,
    world_seconds: f64,
    render_info_sent: u64,
    render_info_requested: u64,
    logout_sent_at: Option<Instant>,
    disconnected: bool,
    floaters: usize,
    progress: Option<(f32, String)>,
    regions: Vec<RegionStatus>,
    new_capabilities: Vec<RegionId>,
    pending_uploads: usize,
}

/// In-process stand-in for a grid session: login progression, a synthetic
/// message stream, regions and a logout handshake.
#[derive(Clone)]
pub(crate) struct LoopbackGrid {
    state: Rc<RefCell<GridState>>,
}

impl LoopbackGrid {
    pub(crate) fn new(settings: GridSettings, queues: PoolQueues) -> Self {
        let regions = (0..settings.region_count)
            .map(|id| RegionStatus {
                id: RegionId(id),
                alive: true,
                capabilities_received: false,
            })
            .collect();
        let pending_uploads = settings.pending_uploads_on_quit;
        Self {
            state: Rc::new(RefCell::new(GridState {
                settings,
                queues,
                startup: StartupState::FirstLaunch,
                steps_in_state: 0,
                message_backlog: 0.0,
                last_refill: Instant::now(),
                messages_decoded: 0,
                ack_passes: 0,
                agent_updates: 0,
                session_stats_sent: 0,
                frames_rendered: 0,
                world_seconds: 0.0,
                render_info_sent: 0,
                render_info_requested: 0,
                logout_sent_at: None,
                disconnected: false,
                floaters: 0,
                progress: None,
                regions,
                new_capabilities: Vec::new(),
                pending_uploads,
            })),
        }
    }

    pub(crate) fn summary(&self) -> SessionSummary {
        let state = self.state.borrow();
        SessionSummary {
            startup_state: format!("{:?}", state.startup),
            frames_rendered: state.frames_rendered,
            messages_decoded: state.messages_decoded,
            ack_passes: state.ack_passes,
            agent_updates: state.agent_updates,
            session_stats_sent: state.session_stats_sent,
            world_seconds: state.world_seconds,
            render_info_sent: state.render_info_sent,
            render_info_requested: state.render_info_requested,
            disconnected: state.disconnected,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut GridState) -> R) -> R {
        f(&mut self.state.borrow_mut())
    }
}

fn next_startup_state(state: StartupState) -> StartupState {
    use StartupState::*;
    match state {
        FirstLaunch => LoginShow,
        LoginShow => LoginWait,
        LoginWait => LoginCleanup,
        LoginCleanup => LoginAuthInit,
        LoginAuthInit => LoginProcessResponse,
        LoginProcessResponse => WorldInit,
        WorldInit => Seed,
        Seed => Precache,
        Precache => Cleanup,
        Cleanup | Started => Started,
    }
}

impl GridState {
    fn queue_login_work(&mut self) {
        for job in 0..self.settings.texture_jobs_on_login {
            let seed = job as u64;
            self.queues.texture_fetch.submit(move || {
                std::hint::black_box(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15));
            });
            self.queues.image_decode.submit(move || {
                let checksum = (0..256u64).fold(seed, |acc, byte| acc.rotate_left(5) ^ byte);
                std::hint::black_box(checksum);
            });
            self.queues.texture_cache.submit(|| {});
        }
        self.queues.vfs.submit(|| {});
        self.queues.lfs.submit(|| {});
        debug!(jobs = self.settings.texture_jobs_on_login, "login_work_queued");
    }

    fn refill_messages(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        if self.startup.is_started() && !self.disconnected {
            self.message_backlog += elapsed * f64::from(self.settings.messages_per_second);
        }
    }
}

impl StartupStepper for LoopbackGrid {
    fn current_state(&self) -> StartupState {
        self.with(|state| state.startup)
    }

    fn step_idle(&mut self) -> Result<bool, TickError> {
        self.with(|state| {
            state.steps_in_state += 1;
            if state.steps_in_state < state.settings.steps_per_startup_state {
                return Ok(state.startup.is_started());
            }
            state.steps_in_state = 0;
            let from = state.startup;
            state.startup = next_startup_state(from);
            info!(from = ?from, to = ?state.startup, "startup_state_changed");

            if state.startup.is_started() {
                state.floaters = OPEN_FLOATERS_AT_LOGIN;
                state.last_refill = Instant::now();
                for region in &mut state.regions {
                    region.capabilities_received = true;
                    state.new_capabilities.push(region.id);
                }
                state.queue_login_work();
            }
            Ok(state.startup.is_started())
        })
    }
}

impl NetworkPump for LoopbackGrid {
    fn check_next_message(&mut self, clock: &BudgetClock) -> bool {
        if clock.is_exhausted() {
            return false;
        }
        self.with(|state| {
            if state.message_backlog < 1.0 {
                state.refill_messages(Instant::now());
            }
            if state.message_backlog < 1.0 {
                return false;
            }
            state.message_backlog -= 1.0;
            state.messages_decoded += 1;
            true
        })
    }

    fn process_acks(&mut self, _collect_window: Duration) {
        self.with(|state| state.ack_passes += 1);
    }
}

impl AgentLink for LoopbackGrid {
    fn control_flags(&self) -> u32 {
        self.with(|state| {
            let phase = (state.world_seconds / CONTROL_FLAG_PERIOD_SECONDS) as u64;
            if phase % 2 == 1 {
                WALKING_FLAG
            } else {
                0
            }
        })
    }

    fn send_agent_update(&mut self) {
        self.with(|state| state.agent_updates += 1);
    }
}

impl Telemetry for LoopbackGrid {
    fn send_metrics(&mut self, enabled: bool) {
        let summary = self.summary();
        info!(
            enabled,
            frames_rendered = summary.frames_rendered,
            messages_decoded = summary.messages_decoded,
            "viewer_metrics_sent"
        );
    }

    fn send_session_stats(&mut self) {
        self.with(|state| {
            state.session_stats_sent += 1;
            debug!(
                agent_updates = state.agent_updates,
                world_seconds = state.world_seconds,
                "session_stats"
            );
        });
    }
}

impl RenderFrame for LoopbackGrid {
    fn render_frame(&mut self) -> Result<(), TickError> {
        self.with(|state| state.frames_rendered += 1);
        Ok(())
    }
}

impl SessionLink for LoopbackGrid {
    fn has_region(&self) -> bool {
        self.with(|state| !state.disconnected && state.regions.iter().any(|region| region.alive))
    }

    fn send_logout_request(&mut self) {
        self.with(|state| {
            if state.logout_sent_at.is_none() {
                state.logout_sent_at = Some(Instant::now());
            }
        });
    }

    fn has_logout_reply(&self) -> bool {
        self.with(|state| {
            let delay = Duration::from_millis(state.settings.logout_reply_delay_ms);
            state
                .logout_sent_at
                .is_some_and(|sent| sent.elapsed() >= delay)
        })
    }

    fn pending_uploads(&self) -> usize {
        self.with(|state| state.pending_uploads)
    }

    fn disconnect(&mut self) {
        self.with(|state| {
            if !state.disconnected {
                state.disconnected = true;
                for region in &mut state.regions {
                    region.alive = false;
                }
                info!(messages_decoded = state.messages_decoded, "grid_disconnected");
            }
        });
    }
}

impl UiState for LoopbackGrid {
    fn modal_dialog_count(&self) -> usize {
        0
    }

    fn open_floater_count(&self) -> usize {
        self.with(|state| state.floaters)
    }

    fn close_all_floaters(&mut self) {
        self.with(|state| state.floaters = 0);
    }

    fn show_progress(&mut self, percent: f32, message: &str) {
        self.with(|state| {
            let changed = state
                .progress
                .as_ref()
                .map_or(true, |(_, shown)| shown != message);
            if changed {
                info!(percent, message, "progress_shown");
            }
            state.progress = Some((percent, message.to_string()));
        });
    }

    fn progress_visible(&self) -> bool {
        self.with(|state| state.progress.is_some())
    }
}

impl WorldUpdate for LoopbackGrid {
    fn update_world(&mut self, frame_dt_seconds: f32) -> Result<(), TickError> {
        self.with(|state| {
            state.world_seconds += f64::from(frame_dt_seconds);
            state.pending_uploads = state.pending_uploads.saturating_sub(1);
        });
        Ok(())
    }
}

impl RenderInfoRegions for LoopbackGrid {
    fn regions(&self) -> Vec<RegionStatus> {
        self.with(|state| state.regions.clone())
    }

    fn avatar_count(&self) -> usize {
        self.with(|state| state.settings.avatar_count)
    }

    fn send_render_info(&mut self, region: RegionId) {
        self.with(|state| state.render_info_sent += 1);
        debug!(region = region.0, "render_info_sent");
    }

    fn request_render_info(&mut self, region: RegionId) {
        self.with(|state| state.render_info_requested += 1);
        debug!(region = region.0, "render_info_requested");
    }

    fn take_new_capabilities(&mut self) -> Vec<RegionId> {
        self.with(|state| std::mem::take(&mut state.new_capabilities))
    }
}

impl MemoryDiagnostics for LoopbackGrid {
    fn log_memory_info(&mut self) {
        let summary = self.summary();
        info!(
            frames_rendered = summary.frames_rendered,
            messages_decoded = summary.messages_decoded,
            "memory_info"
        );
    }

    fn simulator_active(&self) -> bool {
        false
    }

    fn stop_simulator(&mut self) {}
}

impl CrashReporter for LoopbackGrid {
    fn report(&mut self, reason: &str) {
        error!(reason, startup_state = ?self.current_state(), "crash_report");
    }
}

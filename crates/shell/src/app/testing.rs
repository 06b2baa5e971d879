//! Scriptable collaborators shared by the scheduler tests.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use super::host::{
    AgentLink, Collaborators, CrashReporter, MemoryDiagnostics, NetworkPump, RenderFrame,
    SessionLink, Sleeper, SnapshotSaver, StartupState, StartupStepper, Telemetry, TickError,
    UiState, WindowHost, WorldUpdate,
};
use super::network::BudgetClock;
use super::render_info::{RegionId, RegionStatus, RenderInfoRegions};
use super::watchdog::WatchdogProbe;
use super::workers::{WorkerPool, WorkerPools};

pub(crate) const POOL_NAMES: [&str; 5] = ["texture_cache", "image_decode", "texture_fetch", "vfs", "lfs"];

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Event {
    pub name: String,
    pub watchdog_running: Option<bool>,
    pub watchdog_state: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PoolState {
    pub pending: usize,
    pub paused: bool,
    pub pauses: u32,
    pub resumes: u32,
    pub updates: u32,
}

pub(crate) enum RenderScript {
    Ok,
    Fail(TickError),
    Panic,
}

pub(crate) struct FakeWorld {
    pub events: Vec<Event>,
    pub watchdog: Option<WatchdogProbe>,

    pub visible: bool,
    pub focused: bool,
    pub minimized: bool,
    pub scan_inputs: u32,

    pub startup_state: StartupState,
    pub steps_until_started: u32,

    pub queued_messages: u32,
    pub decoded_messages: u32,
    pub ack_windows: Vec<Duration>,

    pub control_flags: u32,
    pub agent_updates: u32,
    pub metrics_sent: Vec<bool>,
    pub session_stats_sent: u32,

    pub render: RenderScript,
    pub frames_rendered: u32,
    pub snapshot_polls: u32,

    pub snapshots_saved: u32,
    pub fail_snapshot: bool,

    pub has_region: bool,
    pub logout_requests: u32,
    pub logout_reply: bool,
    pub pending_uploads: usize,
    pub disconnects: u32,

    pub modal_dialogs: usize,
    pub floaters: usize,
    pub floaters_closed: u32,
    pub progress: Vec<(f32, String)>,
    pub progress_visible: bool,

    pub world_updates: Vec<f32>,
    pub world_error: Option<TickError>,

    pub memory_dumps: u32,
    pub simulator_active: bool,
    pub simulator_stops: u32,
    pub crash_reports: Vec<String>,

    pub sleeps: Vec<Duration>,
    pub pools: [PoolState; 5],

    pub regions: Vec<RegionStatus>,
    pub render_info_requests: Vec<RegionId>,
}

impl Default for FakeWorld {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            watchdog: None,
            visible: true,
            focused: true,
            minimized: false,
            scan_inputs: 0,
            startup_state: StartupState::Started,
            steps_until_started: 0,
            queued_messages: 0,
            decoded_messages: 0,
            ack_windows: Vec::new(),
            control_flags: 0,
            agent_updates: 0,
            metrics_sent: Vec::new(),
            session_stats_sent: 0,
            render: RenderScript::Ok,
            frames_rendered: 0,
            snapshot_polls: 0,
            snapshots_saved: 0,
            fail_snapshot: false,
            has_region: true,
            logout_requests: 0,
            logout_reply: false,
            pending_uploads: 0,
            disconnects: 0,
            modal_dialogs: 0,
            floaters: 0,
            floaters_closed: 0,
            progress: Vec::new(),
            progress_visible: false,
            world_updates: Vec::new(),
            world_error: None,
            memory_dumps: 0,
            simulator_active: false,
            simulator_stops: 0,
            crash_reports: Vec::new(),
            sleeps: Vec::new(),
            pools: [PoolState::default(); 5],
            regions: Vec::new(),
            render_info_requests: Vec::new(),
        }
    }
}

impl FakeWorld {
    pub fn record(&mut self, name: impl Into<String>) {
        let watchdog_running = self.watchdog.as_ref().map(WatchdogProbe::is_running);
        let watchdog_state = self.watchdog.as_ref().map(WatchdogProbe::state);
        self.events.push(Event {
            name: name.into(),
            watchdog_running,
            watchdog_state,
        });
    }

    pub fn event_names(&self) -> Vec<&str> {
        self.events.iter().map(|event| event.name.as_str()).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.iter().filter(|event| event.name == name).count()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.events.iter().position(|event| event.name == name)
    }
}

pub(crate) type SharedWorld = Rc<RefCell<FakeWorld>>;

pub(crate) fn shared_world() -> SharedWorld {
    Rc::new(RefCell::new(FakeWorld::default()))
}

#[derive(Clone)]
pub(crate) struct FakeHost {
    world: SharedWorld,
}

impl FakeHost {
    pub fn new(world: &SharedWorld) -> Self {
        Self {
            world: Rc::clone(world),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut FakeWorld) -> R) -> R {
        f(&mut self.world.borrow_mut())
    }
}

impl WindowHost for FakeHost {
    fn process_native_events(&mut self) {
        self.with(|w| w.record("process_native_events"));
    }

    fn gather_input(&mut self) {
        self.with(|w| w.record("gather_input"));
    }

    fn scan_input(&mut self) {
        self.with(|w| {
            w.scan_inputs += 1;
            w.record("scan_input");
        });
    }

    fn is_visible(&self) -> bool {
        self.with(|w| w.visible)
    }

    fn has_focus(&self) -> bool {
        self.with(|w| w.focused)
    }

    fn is_minimized(&self) -> bool {
        self.with(|w| w.minimized)
    }
}

impl StartupStepper for FakeHost {
    fn current_state(&self) -> StartupState {
        self.with(|w| w.startup_state)
    }

    fn step_idle(&mut self) -> Result<bool, TickError> {
        self.with(|w| {
            w.record("step_idle");
            if w.steps_until_started == 0 {
                w.startup_state = StartupState::Started;
                Ok(true)
            } else {
                w.steps_until_started -= 1;
                Ok(false)
            }
        })
    }
}

impl NetworkPump for FakeHost {
    fn check_next_message(&mut self, _clock: &BudgetClock) -> bool {
        self.with(|w| {
            w.record("check_next_message");
            if w.queued_messages == 0 {
                return false;
            }
            w.queued_messages -= 1;
            w.decoded_messages += 1;
            true
        })
    }

    fn process_acks(&mut self, collect_window: Duration) {
        self.with(|w| {
            w.ack_windows.push(collect_window);
            w.record("process_acks");
        });
    }
}

impl AgentLink for FakeHost {
    fn control_flags(&self) -> u32 {
        self.with(|w| w.control_flags)
    }

    fn send_agent_update(&mut self) {
        self.with(|w| {
            w.agent_updates += 1;
            w.record("send_agent_update");
        });
    }
}

impl Telemetry for FakeHost {
    fn send_metrics(&mut self, enabled: bool) {
        self.with(|w| {
            w.metrics_sent.push(enabled);
            w.record("send_metrics");
        });
    }

    fn send_session_stats(&mut self) {
        self.with(|w| {
            w.session_stats_sent += 1;
            w.record("send_session_stats");
        });
    }
}

impl RenderFrame for FakeHost {
    fn render_frame(&mut self) -> Result<(), TickError> {
        let script = self.with(|w| {
            w.record("render_frame");
            std::mem::replace(&mut w.render, RenderScript::Ok)
        });
        match script {
            RenderScript::Ok => {
                self.with(|w| w.frames_rendered += 1);
                Ok(())
            }
            RenderScript::Fail(err) => Err(err),
            RenderScript::Panic => panic!("renderer exploded"),
        }
    }

    fn poll_snapshots(&mut self) {
        self.with(|w| {
            w.snapshot_polls += 1;
            w.record("poll_snapshots");
        });
    }
}

impl SnapshotSaver for FakeHost {
    fn save_final_snapshot(&mut self) -> Result<(), TickError> {
        self.with(|w| {
            w.snapshots_saved += 1;
            w.record("save_final_snapshot");
            if w.fail_snapshot {
                Err(TickError::continuable("snapshot", "disk full"))
            } else {
                Ok(())
            }
        })
    }
}

impl SessionLink for FakeHost {
    fn has_region(&self) -> bool {
        self.with(|w| w.has_region)
    }

    fn send_logout_request(&mut self) {
        self.with(|w| {
            w.logout_requests += 1;
            w.record("send_logout_request");
        });
    }

    fn has_logout_reply(&self) -> bool {
        self.with(|w| w.logout_reply)
    }

    fn pending_uploads(&self) -> usize {
        self.with(|w| w.pending_uploads)
    }

    fn disconnect(&mut self) {
        self.with(|w| {
            w.disconnects += 1;
            w.record("disconnect");
        });
    }
}

impl UiState for FakeHost {
    fn modal_dialog_count(&self) -> usize {
        self.with(|w| w.modal_dialogs)
    }

    fn open_floater_count(&self) -> usize {
        self.with(|w| w.floaters)
    }

    fn close_all_floaters(&mut self) {
        self.with(|w| {
            w.floaters_closed += 1;
            w.record("close_all_floaters");
        });
    }

    fn show_progress(&mut self, percent: f32, message: &str) {
        self.with(|w| {
            w.progress_visible = true;
            w.progress.push((percent, message.to_string()));
        });
    }

    fn progress_visible(&self) -> bool {
        self.with(|w| w.progress_visible)
    }
}

impl WorldUpdate for FakeHost {
    fn update_world(&mut self, frame_dt_seconds: f32) -> Result<(), TickError> {
        self.with(|w| {
            w.world_updates.push(frame_dt_seconds);
            w.record("update_world");
            match w.world_error.take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }
}

impl RenderInfoRegions for FakeHost {
    fn regions(&self) -> Vec<RegionStatus> {
        self.with(|w| w.regions.clone())
    }

    fn avatar_count(&self) -> usize {
        0
    }

    fn send_render_info(&mut self, _region: RegionId) {}

    fn request_render_info(&mut self, region: RegionId) {
        self.with(|w| w.render_info_requests.push(region));
    }
}

impl MemoryDiagnostics for FakeHost {
    fn log_memory_info(&mut self) {
        self.with(|w| w.memory_dumps += 1);
    }

    fn simulator_active(&self) -> bool {
        self.with(|w| w.simulator_active)
    }

    fn stop_simulator(&mut self) {
        self.with(|w| {
            w.simulator_active = false;
            w.simulator_stops += 1;
        });
    }
}

impl CrashReporter for FakeHost {
    fn report(&mut self, reason: &str) {
        self.with(|w| w.crash_reports.push(reason.to_string()));
    }
}

impl Sleeper for FakeHost {
    fn sleep(&mut self, duration: Duration) {
        self.with(|w| {
            w.sleeps.push(duration);
            let paused = w.pools[0].paused && w.pools[1].paused;
            w.record(if paused { "sleep_paused" } else { "sleep" });
        });
    }
}

struct FakePool {
    index: usize,
    world: SharedWorld,
}

impl WorkerPool for FakePool {
    fn update(&mut self, max_iterations: usize) -> usize {
        let mut world = self.world.borrow_mut();
        assert!(
            !world.pools[self.index].paused,
            "{} drained while paused",
            POOL_NAMES[self.index]
        );
        world.record(format!("update:{}", POOL_NAMES[self.index]));
        let pool = &mut world.pools[self.index];
        pool.updates += 1;
        pool.pending = pool.pending.saturating_sub(max_iterations);
        pool.pending
    }

    fn pause(&mut self) {
        let mut world = self.world.borrow_mut();
        let pool = &mut world.pools[self.index];
        pool.paused = true;
        pool.pauses += 1;
    }

    fn resume(&mut self) {
        let mut world = self.world.borrow_mut();
        let pool = &mut world.pools[self.index];
        pool.paused = false;
        pool.resumes += 1;
    }
}

pub(crate) fn fake_pools(world: &SharedWorld) -> WorkerPools {
    let pool = |index: usize| -> Box<dyn WorkerPool> {
        Box::new(FakePool {
            index,
            world: Rc::clone(world),
        })
    };
    WorkerPools {
        texture_cache: pool(0),
        image_decode: pool(1),
        texture_fetch: pool(2),
        vfs: pool(3),
        lfs: pool(4),
    }
}

pub(crate) fn collaborators(world: &SharedWorld) -> Collaborators {
    let host = FakeHost::new(world);
    Collaborators {
        window: Box::new(host.clone()),
        startup: Box::new(host.clone()),
        network: Box::new(host.clone()),
        agent: Box::new(host.clone()),
        telemetry: Box::new(host.clone()),
        renderer: Box::new(host.clone()),
        snapshot: Box::new(host.clone()),
        session: Box::new(host.clone()),
        ui: Box::new(host.clone()),
        world: Box::new(host.clone()),
        render_info: Box::new(host.clone()),
        memory: Box::new(host.clone()),
        crash_reporter: Box::new(host.clone()),
        workers: fake_pools(world),
        sleeper: Box::new(host),
    }
}

use std::process::ExitCode;

use shell::{
    run_main_loop, AppPaths, Collaborators, ConfigError, Lifecycle, LoopError, MainLoopScheduler,
    SessionLink, StartupError, ThreadSleeper, WatchdogError, WindowHost, WorkerPools,
};
use thiserror::Error;
use tracing::{error, info};

use super::bootstrap::AppWiring;
use super::grid::LoopbackGrid;
use super::hooks::HookRegistry;
use super::settings::ViewerSettings;
use super::snapshot::SessionSnapshotWriter;
use super::window::{HeadlessWindow, WindowHostError, WinitWindowHost};
use super::workers::spawn_pools;

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Settings(#[from] ConfigError),
    #[error("failed to start worker pools: {0}")]
    WorkerPools(#[source] std::io::Error),
    #[error(transparent)]
    Window(#[from] WindowHostError),
    #[error(transparent)]
    Watchdog(#[from] WatchdogError),
    #[error(transparent)]
    MainLoop(#[from] LoopError),
}

pub(crate) fn run(app: AppWiring) -> ExitCode {
    match run_viewer(app) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "viewer_failed");
            ExitCode::FAILURE
        }
    }
}

fn run_viewer(app: AppWiring) -> Result<(), AppError> {
    let AppWiring { paths, settings } = app;
    let lifecycle = Lifecycle::new();

    let (workers, queues) =
        spawn_pools(settings.main_loop.run_multiple_threads).map_err(AppError::WorkerPools)?;
    let grid = LoopbackGrid::new(settings.grid.clone(), queues);

    let mut hooks = HookRegistry::<AppError>::new();
    let region_count = settings.grid.region_count;
    hooks.on_init("grid_session", move || {
        info!(region_count, "grid_session_opened");
        Ok(())
    });
    let mut session = grid.clone();
    hooks.on_cleanup("grid_session", move || session.disconnect());
    let summary_source = grid.clone();
    hooks.on_cleanup("session_summary", move || {
        let summary = summary_source.summary();
        info!(
            frames_rendered = summary.frames_rendered,
            messages_decoded = summary.messages_decoded,
            agent_updates = summary.agent_updates,
            world_seconds = summary.world_seconds,
            "session_summary"
        );
    });

    hooks.run_init()?;
    let outcome = drive_loop(&paths, settings, lifecycle, grid, workers);
    hooks.run_cleanup();
    outcome
}

fn drive_loop(
    paths: &AppPaths,
    settings: ViewerSettings,
    lifecycle: Lifecycle,
    grid: LoopbackGrid,
    workers: WorkerPools,
) -> Result<(), AppError> {
    let window: Box<dyn WindowHost> = if settings.window.headless {
        Box::new(HeadlessWindow::new(settings.window.headless_focused))
    } else {
        Box::new(WinitWindowHost::open(&settings.window, lifecycle.clone())?)
    };

    let host = Collaborators {
        window,
        startup: Box::new(grid.clone()),
        network: Box::new(grid.clone()),
        agent: Box::new(grid.clone()),
        telemetry: Box::new(grid.clone()),
        renderer: Box::new(grid.clone()),
        snapshot: Box::new(SessionSnapshotWriter::new(&paths.cache_dir, grid.clone())),
        session: Box::new(grid.clone()),
        ui: Box::new(grid.clone()),
        world: Box::new(grid.clone()),
        render_info: Box::new(grid.clone()),
        memory: Box::new(grid.clone()),
        crash_reporter: Box::new(grid),
        workers,
        sleeper: Box::new(ThreadSleeper),
    };

    let mut scheduler = MainLoopScheduler::new(settings.main_loop, host, lifecycle, None)?;
    let outcome = run_main_loop(&mut scheduler);

    let metrics = scheduler.metrics_handle().snapshot();
    info!(
        ticks = scheduler.tick_count(),
        foreground_frames = scheduler.foreground_frame_count(),
        frame_stalls = scheduler.frame_stalls(),
        smoothed_fps = metrics.smoothed_fps,
        "main_loop_exited"
    );

    Ok(outcome?)
}

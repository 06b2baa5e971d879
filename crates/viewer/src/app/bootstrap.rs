use shell::{load_settings, resolve_app_paths, AppPaths};
use tracing::info;
use tracing_subscriber::EnvFilter;

use super::loop_runner::AppError;
use super::settings::ViewerSettings;

pub(crate) struct AppWiring {
    pub(crate) paths: AppPaths,
    pub(crate) settings: ViewerSettings,
}

pub(crate) fn build_app() -> Result<AppWiring, AppError> {
    init_tracing();
    info!("=== Viewer Startup ===");

    let paths = resolve_app_paths()?;
    let mut settings = match &paths.settings_file {
        Some(path) => load_settings::<ViewerSettings>(path)?,
        None => ViewerSettings::default(),
    };
    settings.main_loop.apply_env_overrides();

    info!(
        root = %paths.root.display(),
        settings_file = ?paths.settings_file,
        headless = settings.window.headless,
        "settings_loaded"
    );

    Ok(AppWiring { paths, settings })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}

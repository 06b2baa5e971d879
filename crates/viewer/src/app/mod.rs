mod bootstrap;
mod grid;
mod hooks;
mod loop_runner;
mod settings;
mod snapshot;
mod window;
mod workers;

use std::process::ExitCode;

use tracing::error;

pub(crate) fn run() -> ExitCode {
    match bootstrap::build_app() {
        Ok(app) => loop_runner::run(app),
        Err(err) => {
            error!(error = %err, "startup_failed");
            ExitCode::FAILURE
        }
    }
}

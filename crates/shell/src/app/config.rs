use std::env;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const YIELD_TIME_ENV_VAR: &str = "VIEWER_YIELD_TIME_MS";
pub const BACKGROUND_YIELD_ENV_VAR: &str = "VIEWER_BACKGROUND_YIELD_MS";
pub const QUIT_AFTER_ENV_VAR: &str = "VIEWER_QUIT_AFTER_SECONDS";

pub const MAX_BACKGROUND_YIELD_MS: i64 = 1000;
pub const LOGIN_BACKGROUND_YIELD_CAP_MS: i64 = 250;

const METRICS_INTERVAL_QA_SECS: f32 = 30.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings in {path} at `{field}`: {source}")]
    Parse {
        path: PathBuf,
        field: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Tunables for the main loop, idle phase, watchdog and shutdown.
///
/// Every field has a default, so a settings file only names what it changes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopConfig {
    /// Unconditional per-tick yield. `None` disables it.
    pub yield_time_ms: Option<u64>,
    /// Sleep while the window is hidden or unfocused, clamped to `[0, 1000]`.
    pub background_yield_time_ms: i64,
    pub run_multiple_threads: bool,
    pub watchdog_enabled: bool,
    pub mainloop_timeout_secs: f32,
    pub watchdog_check_interval_ms: u64,
    /// Zero disables the policy.
    pub quit_after_seconds: f32,
    pub agent_updates_per_second: u32,
    pub stats_send_period_secs: f32,
    pub metrics_interval_secs: f32,
    pub metrics_qa_mode: bool,
    pub message_budget_ms: f32,
    pub max_messages_per_tick: u32,
    pub ack_collect_time_secs: f32,
    pub logout_request_time_secs: f32,
    pub shutdown_upload_grace_secs: f32,
    pub frame_stall_threshold_secs: f32,
    pub io_flush_timeout_secs: f32,
    pub metrics_log_interval_secs: f32,
    /// Debug builds only: random extra sleep of up to 200 ms per tick.
    pub randomize_framerate: bool,
    /// Debug builds only: 500 ms sleep every tenth tick.
    pub periodic_slow_frame: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            yield_time_ms: None,
            background_yield_time_ms: 40,
            run_multiple_threads: false,
            watchdog_enabled: true,
            mainloop_timeout_secs: 20.0,
            watchdog_check_interval_ms: 1000,
            quit_after_seconds: 0.0,
            agent_updates_per_second: 10,
            stats_send_period_secs: 60.0,
            metrics_interval_secs: 600.0,
            metrics_qa_mode: false,
            message_budget_ms: 20.0,
            max_messages_per_tick: 200,
            ack_collect_time_secs: 0.1,
            logout_request_time_secs: 6.0,
            shutdown_upload_grace_secs: 5.0,
            frame_stall_threshold_secs: 1.0,
            io_flush_timeout_secs: 30.0,
            metrics_log_interval_secs: 5.0,
            randomize_framerate: false,
            periodic_slow_frame: false,
        }
    }
}

impl LoopConfig {
    pub fn yield_time(&self) -> Option<Duration> {
        self.yield_time_ms.map(Duration::from_millis)
    }

    /// Background yield after clamping; login/auth states cap it at 250 ms.
    pub fn background_yield(&self, in_login_auth: bool) -> Duration {
        let mut millis = self.background_yield_time_ms.clamp(0, MAX_BACKGROUND_YIELD_MS);
        if in_login_auth {
            millis = millis.min(LOGIN_BACKGROUND_YIELD_CAP_MS);
        }
        Duration::from_millis(millis as u64)
    }

    pub fn mainloop_timeout(&self) -> Duration {
        seconds_or(self.mainloop_timeout_secs, Duration::from_secs(20))
    }

    pub fn watchdog_check_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_check_interval_ms.max(1))
    }

    pub fn quit_after(&self) -> Option<Duration> {
        positive_seconds(self.quit_after_seconds)
    }

    pub fn agent_update_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.agent_updates_per_second.max(1)))
    }

    pub fn stats_send_period(&self) -> Duration {
        seconds_or(self.stats_send_period_secs, Duration::from_secs(60))
    }

    pub fn metrics_interval(&self) -> Duration {
        if self.metrics_qa_mode {
            seconds_or(METRICS_INTERVAL_QA_SECS, Duration::from_secs(30))
        } else {
            seconds_or(self.metrics_interval_secs, Duration::from_secs(600))
        }
    }

    pub fn message_budget(&self) -> Duration {
        seconds_or(self.message_budget_ms / 1000.0, Duration::from_millis(20))
    }

    pub fn max_messages_per_tick(&self) -> u32 {
        self.max_messages_per_tick.max(1)
    }

    pub fn ack_collect_time(&self) -> Duration {
        positive_seconds(self.ack_collect_time_secs).unwrap_or(Duration::ZERO)
    }

    pub fn logout_request_time(&self) -> Duration {
        seconds_or(self.logout_request_time_secs, Duration::from_secs(6))
    }

    pub fn shutdown_upload_grace(&self) -> Duration {
        positive_seconds(self.shutdown_upload_grace_secs).unwrap_or(Duration::ZERO)
    }

    pub fn frame_stall_threshold(&self) -> Duration {
        seconds_or(self.frame_stall_threshold_secs, Duration::from_secs(1))
    }

    pub fn io_flush_timeout(&self) -> Duration {
        positive_seconds(self.io_flush_timeout_secs).unwrap_or(Duration::ZERO)
    }

    pub fn metrics_log_interval(&self) -> Duration {
        seconds_or(self.metrics_log_interval_secs, Duration::from_secs(5))
    }

    /// Applies `VIEWER_*` overrides. Bad values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(ms) = read_env_override::<i64>(YIELD_TIME_ENV_VAR) {
            self.yield_time_ms = u64::try_from(ms).ok();
        }
        if let Some(ms) = read_env_override::<i64>(BACKGROUND_YIELD_ENV_VAR) {
            self.background_yield_time_ms = ms;
        }
        if let Some(seconds) = read_env_override::<f32>(QUIT_AFTER_ENV_VAR) {
            self.quit_after_seconds = seconds;
        }
    }
}

/// Reads a JSON settings file, naming the failing field on error.
pub fn load_settings<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_settings(path, &raw)
}

fn parse_settings<T: DeserializeOwned>(path: &Path, raw: &str) -> Result<T, ConfigError> {
    let mut deserializer = serde_json::Deserializer::from_str(raw);
    serde_path_to_error::deserialize(&mut deserializer).map_err(|error| {
        let field = error.path().to_string();
        ConfigError::Parse {
            path: path.to_path_buf(),
            field,
            source: error.into_inner(),
        }
    })
}

fn read_env_override<T>(var: &'static str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(var) {
        Ok(value) => match value.trim().parse::<T>() {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(
                    env_var = var,
                    value = value.as_str(),
                    error = %err,
                    "invalid env override; keeping configured value"
                );
                None
            }
        },
        Err(env::VarError::NotPresent) => None,
        Err(err) => {
            warn!(env_var = var, error = %err, "unable to read env override");
            None
        }
    }
}

fn positive_seconds(seconds: f32) -> Option<Duration> {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::try_from_secs_f32(seconds).ok()
    } else {
        None
    }
}

fn seconds_or(seconds: f32, fallback: Duration) -> Duration {
    positive_seconds(seconds).unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_yield_is_clamped() {
        let mut config = LoopConfig {
            background_yield_time_ms: 5000,
            ..LoopConfig::default()
        };
        assert_eq!(config.background_yield(false), Duration::from_millis(1000));
        assert_eq!(config.background_yield(true), Duration::from_millis(250));

        config.background_yield_time_ms = -20;
        assert_eq!(config.background_yield(false), Duration::ZERO);
    }

    #[test]
    fn default_background_yield_is_forty_ms() {
        let config = LoopConfig::default();
        assert_eq!(config.background_yield(false), Duration::from_millis(40));
        assert_eq!(config.background_yield(true), Duration::from_millis(40));
    }

    #[test]
    fn invalid_durations_fall_back_to_defaults() {
        let config = LoopConfig {
            mainloop_timeout_secs: -1.0,
            message_budget_ms: f32::NAN,
            quit_after_seconds: 0.0,
            ..LoopConfig::default()
        };
        assert_eq!(config.mainloop_timeout(), Duration::from_secs(20));
        assert_eq!(config.message_budget(), Duration::from_millis(20));
        assert_eq!(config.quit_after(), None);
    }

    #[test]
    fn qa_mode_shortens_metrics_interval() {
        let config = LoopConfig {
            metrics_qa_mode: true,
            ..LoopConfig::default()
        };
        assert_eq!(config.metrics_interval(), Duration::from_secs(30));
        assert_eq!(
            LoopConfig::default().metrics_interval(),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn agent_update_interval_tolerates_zero_rate() {
        let config = LoopConfig {
            agent_updates_per_second: 0,
            ..LoopConfig::default()
        };
        assert_eq!(config.agent_update_interval(), Duration::from_secs(1));
    }

    #[test]
    fn partial_settings_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "background_yield_time_ms": 10, "watchdog_enabled": false }"#)
            .expect("write settings");

        let config: LoopConfig = load_settings(&path).expect("settings should parse");
        assert_eq!(config.background_yield_time_ms, 10);
        assert!(!config.watchdog_enabled);
        assert_eq!(config.max_messages_per_tick, 200);
    }

    #[test]
    fn parse_error_names_the_field() {
        let path = Path::new("settings.json");
        let err = parse_settings::<LoopConfig>(path, r#"{ "max_messages_per_tick": "lots" }"#)
            .expect_err("should fail");

        match err {
            ConfigError::Parse { field, .. } => assert_eq!(field, "max_messages_per_tick"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let path = Path::new("settings.json");
        assert!(parse_settings::<LoopConfig>(path, r#"{ "yeild_time_ms": 5 }"#).is_err());
    }

    #[test]
    fn missing_file_reports_read_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_settings::<LoopConfig>(&dir.path().join("absent.json"))
            .expect_err("should fail");
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

use serde::Deserialize;
use shell::LoopConfig;

/// Top-level `settings.json` layout.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ViewerSettings {
    pub window: WindowSettings,
    pub main_loop: LoopConfig,
    pub grid: GridSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct WindowSettings {
    pub title: String,
    pub width: u32,
    pub height: u32,
    /// Runs without a native window; visibility and focus are fixed.
    pub headless: bool,
    pub headless_focused: bool,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            title: "Viewer".to_string(),
            width: 1280,
            height: 720,
            headless: false,
            headless_focused: true,
        }
    }
}

/// Knobs for the in-process loopback grid session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct GridSettings {
    /// Idle steps spent in each startup state before advancing.
    pub steps_per_startup_state: u32,
    pub messages_per_second: u32,
    pub region_count: u64,
    pub avatar_count: usize,
    pub logout_reply_delay_ms: u64,
    /// Texture jobs queued when the session reaches the started state.
    pub texture_jobs_on_login: usize,
    pub pending_uploads_on_quit: usize,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            steps_per_startup_state: 2,
            messages_per_second: 120,
            region_count: 1,
            avatar_count: 4,
            logout_reply_delay_ms: 500,
            texture_jobs_on_login: 64,
            pending_uploads_on_quit: 0,
        }
    }
}

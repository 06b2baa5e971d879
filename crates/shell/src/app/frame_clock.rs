use std::time::{Duration, Instant};

pub const MIN_FRAME_RATE: f32 = 1.0;
pub const MAX_FRAME_RATE: f32 = 200.0;

const INITIAL_SMOOTHED_FPS: f32 = 10.0;
const SMOOTHING_HISTORY_WEIGHT: f32 = 4.0;

/// Frame timing owned by the idle phase.
///
/// `clamped_delta_seconds` always lies in `[1/MAX_FRAME_RATE, 1/MIN_FRAME_RATE]`.
#[derive(Debug, Clone)]
pub struct FrameClock {
    session_start: Instant,
    last_update: Instant,
    raw_delta_seconds: f32,
    clamped_delta_seconds: f32,
    smoothed_fps: f32,
    frame_count: u64,
}

impl FrameClock {
    pub fn new(now: Instant) -> Self {
        Self {
            session_start: now,
            last_update: now,
            raw_delta_seconds: 0.0,
            clamped_delta_seconds: 1.0 / MAX_FRAME_RATE,
            smoothed_fps: INITIAL_SMOOTHED_FPS,
            frame_count: 0,
        }
    }

    pub fn update(&mut self, now: Instant) {
        let raw = now.saturating_duration_since(self.last_update);
        self.last_update = now;
        self.apply_raw_delta(raw.as_secs_f32());
    }

    fn apply_raw_delta(&mut self, raw_delta_seconds: f32) {
        self.raw_delta_seconds = raw_delta_seconds;

        // NaN and non-positive deltas read as the fastest frame.
        let fps = if raw_delta_seconds > 0.0 {
            (1.0 / raw_delta_seconds).clamp(MIN_FRAME_RATE, MAX_FRAME_RATE)
        } else {
            MAX_FRAME_RATE
        };
        self.clamped_delta_seconds = 1.0 / fps;
        self.smoothed_fps =
            (fps + SMOOTHING_HISTORY_WEIGHT * self.smoothed_fps) / (SMOOTHING_HISTORY_WEIGHT + 1.0);
        self.frame_count = self.frame_count.saturating_add(1);
    }

    pub fn raw_delta_seconds(&self) -> f32 {
        self.raw_delta_seconds
    }

    pub fn clamped_delta_seconds(&self) -> f32 {
        self.clamped_delta_seconds
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f32(self.clamped_delta_seconds)
    }

    pub fn smoothed_fps(&self) -> f32 {
        self.smoothed_fps
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn session_elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.session_start)
    }
}

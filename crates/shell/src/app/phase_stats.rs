use std::time::Duration;

pub(crate) const PHASE_WINDOW_LEN: usize = 120;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RollingMsStats {
    pub last_ms: f32,
    pub avg_ms: f32,
    pub max_ms: f32,
}

/// Rolling timings of the three tick phases that can run long.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseStatsSnapshot {
    pub idle: RollingMsStats,
    pub render: RollingMsStats,
    pub background: RollingMsStats,
}

#[derive(Debug, Default)]
pub(crate) struct PhaseStats {
    idle: RollingWindowMs,
    render: RollingWindowMs,
    background: RollingWindowMs,
}

impl PhaseStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_tick(&mut self, idle: Duration, render: Duration, background: Duration) {
        self.idle.push_ms(duration_to_ms(idle));
        self.render.push_ms(duration_to_ms(render));
        self.background.push_ms(duration_to_ms(background));
    }

    pub(crate) fn snapshot(&self) -> PhaseStatsSnapshot {
        PhaseStatsSnapshot {
            idle: self.idle.snapshot(),
            render: self.render.snapshot(),
            background: self.background.snapshot(),
        }
    }
}

#[derive(Debug)]
struct RollingWindowMs {
    samples_ms: [f32; PHASE_WINDOW_LEN],
    head: usize,
    count: usize,
    sum_ms: f32,
    last_ms: f32,
}

impl Default for RollingWindowMs {
    fn default() -> Self {
        Self {
            samples_ms: [0.0; PHASE_WINDOW_LEN],
            head: 0,
            count: 0,
            sum_ms: 0.0,
            last_ms: 0.0,
        }
    }
}

impl RollingWindowMs {
    fn push_ms(&mut self, value_ms: f32) {
        self.last_ms = value_ms;
        let evicted = if self.count < PHASE_WINDOW_LEN {
            self.count += 1;
            0.0
        } else {
            self.samples_ms[self.head]
        };
        self.samples_ms[self.head] = value_ms;
        self.head = (self.head + 1) % PHASE_WINDOW_LEN;
        self.sum_ms += value_ms - evicted;
    }

    fn snapshot(&self) -> RollingMsStats {
        if self.count == 0 {
            return RollingMsStats::default();
        }

        let max_ms = self.samples_ms[..self.count]
            .iter()
            .copied()
            .fold(f32::MIN, f32::max);

        RollingMsStats {
            last_ms: self.last_ms,
            avg_ms: self.sum_ms / self.count as f32,
            max_ms,
        }
    }
}

fn duration_to_ms(duration: Duration) -> f32 {
    duration.as_secs_f32() * 1000.0
}

use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::host::NetworkPump;
use super::lifecycle::Lifecycle;

pub const MESSAGE_BUDGET_GROWTH: f64 = 1.035;

/// Per-tick wall-clock allowance for decoding messages.
///
/// Each tick that spends its whole allowance grows the next one by
/// `growth`, so a backlog is eventually cleared. The first tick that finishes
/// under budget resets it to the default.
#[derive(Debug, Clone)]
pub struct MessageBudget {
    default: Duration,
    growth: f64,
    over_budget_streak: u32,
}

impl MessageBudget {
    pub fn new(default: Duration) -> Self {
        Self::with_growth(default, MESSAGE_BUDGET_GROWTH)
    }

    pub fn with_growth(default: Duration, growth: f64) -> Self {
        let growth = if growth.is_finite() && growth >= 1.0 {
            growth
        } else {
            1.0
        };
        Self {
            default,
            growth,
            over_budget_streak: 0,
        }
    }

    pub fn default_budget(&self) -> Duration {
        self.default
    }

    pub fn over_budget_streak(&self) -> u32 {
        self.over_budget_streak
    }

    /// `default × growth^streak`.
    pub fn current(&self) -> Duration {
        let exponent = i32::try_from(self.over_budget_streak).unwrap_or(i32::MAX);
        let seconds = self.default.as_secs_f64() * self.growth.powi(exponent);
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }

    pub fn record(&mut self, spent: Duration) {
        if spent >= self.current() {
            self.over_budget_streak = self.over_budget_streak.saturating_add(1);
        } else {
            self.over_budget_streak = 0;
        }
    }
}

/// Start time and allowance of one drain, handed to the network collaborator.
#[derive(Debug, Clone, Copy)]
pub struct BudgetClock {
    started: Instant,
    budget: Duration,
}

impl BudgetClock {
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_exhausted(&self) -> bool {
        self.elapsed() >= self.budget
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageDrainReport {
    pub decoded: u32,
    pub spent: Duration,
    pub budget: Duration,
    pub cap_hit: bool,
}

/// Decodes queued messages until the queue is empty, the count cap or time
/// budget is reached, or a disconnect is requested. Acks are processed after.
pub fn drain_messages(
    network: &mut dyn NetworkPump,
    budget: &mut MessageBudget,
    max_messages: u32,
    ack_collect_time: Duration,
    lifecycle: &Lifecycle,
) -> MessageDrainReport {
    let clock = BudgetClock::start(budget.current());
    let mut decoded = 0u32;
    let mut spent = Duration::ZERO;

    while decoded < max_messages && !lifecycle.disconnect_requested() {
        if !network.check_next_message(&clock) {
            break;
        }
        decoded += 1;
        spent = clock.elapsed();
        if spent >= clock.budget() {
            break;
        }
    }

    network.process_acks(ack_collect_time);
    budget.record(spent);

    let cap_hit = decoded >= max_messages;
    if cap_hit {
        info!(max_messages, "message_cap_hit");
    }
    if budget.over_budget_streak() > 0 {
        debug!(
            streak = budget.over_budget_streak(),
            next_budget_ms = budget.current().as_secs_f64() * 1000.0,
            "message_budget_grown"
        );
    }

    MessageDrainReport {
        decoded,
        spent,
        budget: clock.budget(),
        cap_hit,
    }
}

use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::callbacks::{CallbackId, CallbackList, DeferredTasks};
use super::config::LoopConfig;
use super::frame_clock::FrameClock;
use super::host::{Collaborators, TickError};
use super::lifecycle::{FinalSnapshot, Lifecycle};
use super::network::{drain_messages, MessageBudget, MessageDrainReport};
use super::render_info::RenderInfoScheduler;
use super::shutdown::{ShutdownContext, ShutdownSequencer, ShutdownState, ShutdownTimings};
use super::watchdog::WatchdogTimeout;

/// How far one idle call got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// Startup has not produced a world yet.
    StartingUp,
    /// The session is gone; world work was skipped and a pending shutdown
    /// was forced to quit.
    Disconnected { shutdown: Option<ShutdownState> },
    Completed {
        messages: Option<MessageDrainReport>,
        shutdown: Option<ShutdownState>,
    },
}

/// Loop state the idle phase reads or updates but does not own.
pub struct IdleEnv<'a> {
    pub lifecycle: &'a Lifecycle,
    pub snapshot: &'a mut FinalSnapshot,
    pub watchdog: Option<&'a WatchdogTimeout>,
    pub disconnected: bool,
}

#[derive(Debug, Clone)]
struct IdleSettings {
    quit_after: Option<Duration>,
    agent_update_interval: Duration,
    stats_send_period: Duration,
    metrics_interval: Duration,
    max_messages: u32,
    ack_collect_time: Duration,
    shutdown: ShutdownTimings,
}

impl IdleSettings {
    fn from_config(config: &LoopConfig) -> Self {
        Self {
            quit_after: config.quit_after(),
            agent_update_interval: config.agent_update_interval(),
            stats_send_period: config.stats_send_period(),
            metrics_interval: config.metrics_interval(),
            max_messages: config.max_messages_per_tick(),
            ack_collect_time: config.ack_collect_time(),
            shutdown: ShutdownTimings::from_config(config),
        }
    }
}

/// Per-tick non-render work: timers, agent updates, messages, callbacks,
/// world update and the shutdown sequencer.
pub struct IdlePhaseRunner {
    settings: IdleSettings,
    frame_clock: FrameClock,
    message_budget: MessageBudget,
    render_info: RenderInfoScheduler,
    shutdown: Option<ShutdownSequencer>,
    idle_callbacks: CallbackList,
    deferred: DeferredTasks,
    last_agent_update: Option<Instant>,
    last_control_flags: Option<u32>,
    last_stats_sent: Option<Instant>,
    last_metrics_sent: Instant,
}

impl IdlePhaseRunner {
    pub fn new(config: &LoopConfig, now: Instant) -> Self {
        Self {
            settings: IdleSettings::from_config(config),
            frame_clock: FrameClock::new(now),
            message_budget: MessageBudget::new(config.message_budget()),
            render_info: RenderInfoScheduler::new(),
            shutdown: None,
            idle_callbacks: CallbackList::new(),
            deferred: DeferredTasks::new(),
            last_agent_update: None,
            last_control_flags: None,
            last_stats_sent: None,
            last_metrics_sent: now,
        }
    }

    pub fn frame_clock(&self) -> &FrameClock {
        &self.frame_clock
    }

    pub fn message_budget(&self) -> &MessageBudget {
        &self.message_budget
    }

    pub fn shutdown_state(&self) -> Option<ShutdownState> {
        self.shutdown.as_ref().map(ShutdownSequencer::state)
    }

    pub fn quit_pending(&self) -> bool {
        self.shutdown.is_some()
    }

    pub fn shutdown_mut(&mut self) -> Option<&mut ShutdownSequencer> {
        self.shutdown.as_mut()
    }

    pub fn render_info_mut(&mut self) -> &mut RenderInfoScheduler {
        &mut self.render_info
    }

    pub fn add_idle_callback(&mut self, callback: impl FnMut() + 'static) -> CallbackId {
        self.idle_callbacks.add(callback)
    }

    pub fn remove_idle_callback(&mut self, id: CallbackId) -> bool {
        self.idle_callbacks.remove(id)
    }

    /// Handle for queueing one-shot tasks run at the end of an idle call.
    pub fn deferred_tasks(&self) -> DeferredTasks {
        self.deferred.clone()
    }

    pub fn run(
        &mut self,
        now: Instant,
        host: &mut Collaborators,
        env: IdleEnv<'_>,
    ) -> Result<IdleOutcome, TickError> {
        if let Some(watchdog) = env.watchdog {
            watchdog.ping("Main:Idle");
        }

        self.frame_clock.update(now);

        if let Some(limit) = self.settings.quit_after {
            if self.frame_clock.session_elapsed(now) > limit {
                info!(quit_after_secs = limit.as_secs_f32(), "quit_after_elapsed");
                env.lifecycle.force_quit();
            }
        }

        if env.lifecycle.take_quit_request() {
            self.handle_quit_request(now, host, env.lifecycle, env.disconnected);
        }

        if !host.startup.current_state().is_started() && !host.startup.step_idle()? {
            return Ok(IdleOutcome::StartingUp);
        }

        if !env.disconnected {
            self.update_agent(now, host);
        }

        let stats_due = self
            .last_stats_sent
            .map_or(true, |sent| now.saturating_duration_since(sent) >= self.settings.stats_send_period);
        if stats_due && !env.disconnected {
            info!("session_stats_sent");
            host.telemetry.send_session_stats();
            self.last_stats_sent = Some(now);
        }

        let messages = if env.disconnected {
            None
        } else {
            Some(drain_messages(
                host.network.as_mut(),
                &mut self.message_budget,
                self.settings.max_messages,
                self.settings.ack_collect_time,
                env.lifecycle,
            ))
        };

        self.idle_callbacks.call_all();

        if now.saturating_duration_since(self.last_metrics_sent) >= self.settings.metrics_interval {
            host.telemetry.send_metrics(!env.disconnected);
            self.last_metrics_sent = now;
        }

        if env.disconnected {
            let shutdown = self
                .shutdown
                .as_mut()
                .map(|sequencer| sequencer.session_lost(env.lifecycle));
            return Ok(IdleOutcome::Disconnected { shutdown });
        }

        if self.shutdown.is_none() {
            host.world.update_world(self.frame_clock.clamped_delta_seconds())?;
        }

        self.render_info.idle(host.render_info.as_mut(), now);

        let ran = self.deferred.run();
        if ran > 0 {
            debug!(tasks = ran, "deferred_tasks_ran");
        }

        let shutdown = match self.shutdown.as_mut() {
            Some(sequencer) => Some(sequencer.step(
                now,
                ShutdownContext {
                    ui: host.ui.as_mut(),
                    session: host.session.as_mut(),
                    snapshot_saver: host.snapshot.as_mut(),
                    snapshot: env.snapshot,
                    lifecycle: env.lifecycle,
                },
            )?),
            None => None,
        };

        Ok(IdleOutcome::Completed { messages, shutdown })
    }

    fn handle_quit_request(
        &mut self,
        now: Instant,
        host: &mut Collaborators,
        lifecycle: &Lifecycle,
        disconnected: bool,
    ) {
        info!("quit_requested");
        let has_region = host.session.has_region();
        if !host.startup.current_state().is_started() || !has_region {
            if has_region {
                host.session.send_logout_request();
            }
            lifecycle.force_quit();
            return;
        }
        if self.shutdown.is_some() {
            return;
        }

        host.telemetry.send_metrics(!disconnected);
        host.ui.close_all_floaters();
        host.telemetry.send_session_stats();
        self.last_stats_sent = Some(now);

        let mut sequencer = ShutdownSequencer::new(self.settings.shutdown);
        sequencer.begin(now);
        self.shutdown = Some(sequencer);
    }

    fn update_agent(&mut self, now: Instant, host: &mut Collaborators) {
        let flags = host.agent.control_flags();
        let flags_changed = self.last_control_flags != Some(flags);
        let interval_elapsed = self.last_agent_update.map_or(true, |sent| {
            now.saturating_duration_since(sent) > self.settings.agent_update_interval
        });
        if flags_changed || interval_elapsed {
            self.last_control_flags = Some(flags);
            host.agent.send_agent_update();
            self.last_agent_update = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::app::host::StartupState;
    use crate::app::render_info::{RegionId, RegionStatus};
    use crate::app::testing::{collaborators, shared_world, SharedWorld};

    struct Rig {
        world: SharedWorld,
        host: Collaborators,
        lifecycle: Lifecycle,
        snapshot: FinalSnapshot,
        runner: IdlePhaseRunner,
        start: Instant,
    }

    impl Rig {
        fn new(config: LoopConfig) -> Self {
            let world = shared_world();
            let start = Instant::now();
            Self {
                host: collaborators(&world),
                world,
                lifecycle: Lifecycle::new(),
                snapshot: FinalSnapshot::default(),
                runner: IdlePhaseRunner::new(&config, start),
                start,
            }
        }

        fn run_at(&mut self, offset: Duration, disconnected: bool) -> IdleOutcome {
            self.runner
                .run(
                    self.start + offset,
                    &mut self.host,
                    IdleEnv {
                        lifecycle: &self.lifecycle,
                        snapshot: &mut self.snapshot,
                        watchdog: None,
                        disconnected,
                    },
                )
                .expect("idle run")
        }
    }

    fn millis(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn startup_returning_false_skips_the_rest() {
        let mut rig = Rig::new(LoopConfig::default());
        {
            let mut world = rig.world.borrow_mut();
            world.startup_state = StartupState::LoginWait;
            world.steps_until_started = 1;
            world.queued_messages = 5;
        }

        assert_eq!(rig.run_at(millis(10), false), IdleOutcome::StartingUp);
        let world = rig.world.borrow();
        assert_eq!(world.decoded_messages, 0);
        assert!(world.world_updates.is_empty());
        assert_eq!(world.count("step_idle"), 1);
    }

    #[test]
    fn startup_completing_falls_through_to_world_update() {
        let mut rig = Rig::new(LoopConfig::default());
        rig.world.borrow_mut().startup_state = StartupState::Precache;

        let outcome = rig.run_at(millis(10), false);
        assert!(matches!(outcome, IdleOutcome::Completed { .. }));
        assert_eq!(rig.world.borrow().world_updates.len(), 1);
    }

    #[test]
    fn idle_steps_run_in_order() {
        let mut rig = Rig::new(LoopConfig::default());
        rig.world.borrow_mut().queued_messages = 2;

        rig.run_at(millis(10), false);
        let world = rig.world.borrow();
        let agent = world.position("send_agent_update").expect("agent update");
        let stats = world.position("send_session_stats").expect("stats");
        let acks = world.position("process_acks").expect("acks");
        let update = world.position("update_world").expect("world update");
        assert!(agent < stats && stats < acks && acks < update);
        assert_eq!(world.decoded_messages, 2);
    }

    #[test]
    fn world_update_receives_clamped_delta() {
        let mut rig = Rig::new(LoopConfig::default());
        rig.run_at(Duration::from_secs(5), false);

        let world = rig.world.borrow();
        assert_eq!(world.world_updates, vec![1.0]);
    }

    #[test]
    fn agent_updates_follow_cadence_or_flag_changes() {
        let mut rig = Rig::new(LoopConfig::default());
        rig.run_at(millis(10), false);
        rig.run_at(millis(20), false);
        assert_eq!(rig.world.borrow().agent_updates, 1);

        rig.world.borrow_mut().control_flags = 0b10;
        rig.run_at(millis(30), false);
        assert_eq!(rig.world.borrow().agent_updates, 2);

        rig.run_at(millis(140), false);
        assert_eq!(rig.world.borrow().agent_updates, 3);
    }

    #[test]
    fn session_stats_are_sent_first_then_periodically() {
        let mut rig = Rig::new(LoopConfig::default());
        rig.run_at(millis(10), false);
        rig.run_at(Duration::from_secs(30), false);
        assert_eq!(rig.world.borrow().session_stats_sent, 1);

        rig.run_at(Duration::from_secs(61), false);
        assert_eq!(rig.world.borrow().session_stats_sent, 2);
    }

    #[test]
    fn metrics_follow_the_configured_interval() {
        let config = LoopConfig {
            metrics_qa_mode: true,
            ..LoopConfig::default()
        };
        let mut rig = Rig::new(config);
        rig.run_at(Duration::from_secs(10), false);
        assert!(rig.world.borrow().metrics_sent.is_empty());

        rig.run_at(Duration::from_secs(31), true);
        assert_eq!(rig.world.borrow().metrics_sent, vec![false]);
    }

    #[test]
    fn disconnected_session_skips_network_and_world() {
        let mut rig = Rig::new(LoopConfig::default());
        rig.world.borrow_mut().queued_messages = 5;

        assert_eq!(
            rig.run_at(millis(10), true),
            IdleOutcome::Disconnected { shutdown: None }
        );
        let world = rig.world.borrow();
        assert_eq!(world.decoded_messages, 0);
        assert_eq!(world.agent_updates, 0);
        assert_eq!(world.session_stats_sent, 0);
        assert!(world.world_updates.is_empty());
    }

    #[test]
    fn quit_after_forces_exit() {
        let config = LoopConfig {
            quit_after_seconds: 2.0,
            ..LoopConfig::default()
        };
        let mut rig = Rig::new(config);
        rig.run_at(Duration::from_secs(1), false);
        assert!(!rig.lifecycle.is_exiting());

        rig.run_at(Duration::from_secs(3), false);
        assert!(rig.lifecycle.is_exiting());
    }

    #[test]
    fn quit_before_started_logs_out_and_exits_immediately() {
        let mut rig = Rig::new(LoopConfig::default());
        rig.world.borrow_mut().startup_state = StartupState::LoginAuthInit;
        rig.world.borrow_mut().steps_until_started = 5;
        rig.lifecycle.request_quit();

        rig.run_at(millis(10), false);
        assert!(rig.lifecycle.is_exiting());
        assert_eq!(rig.world.borrow().logout_requests, 1);
        assert!(!rig.runner.quit_pending());
    }

    #[test]
    fn quit_without_region_exits_without_logout() {
        let mut rig = Rig::new(LoopConfig::default());
        rig.world.borrow_mut().has_region = false;
        rig.lifecycle.request_quit();

        rig.run_at(millis(10), false);
        assert!(rig.lifecycle.is_exiting());
        assert_eq!(rig.world.borrow().logout_requests, 0);
    }

    #[test]
    fn quit_when_started_runs_the_sequencer() {
        let mut rig = Rig::new(LoopConfig::default());
        rig.lifecycle.request_quit();

        let outcome = rig.run_at(millis(10), false);
        assert!(matches!(
            outcome,
            IdleOutcome::Completed {
                shutdown: Some(ShutdownState::LogoutRequested),
                ..
            }
        ));
        let world = rig.world.borrow();
        assert_eq!(world.floaters_closed, 1);
        assert_eq!(world.metrics_sent, vec![true]);
        assert_eq!(world.snapshots_saved, 1);
        assert!(world.world_updates.is_empty());
        assert!(!rig.lifecycle.is_exiting());
    }

    #[test]
    fn repeated_quit_requests_keep_one_sequencer() {
        let mut rig = Rig::new(LoopConfig::default());
        rig.lifecycle.request_quit();
        rig.run_at(millis(10), false);
        rig.lifecycle.request_quit();
        rig.run_at(millis(20), false);

        assert_eq!(rig.world.borrow().floaters_closed, 1);
        assert_eq!(
            rig.runner.shutdown_state(),
            Some(ShutdownState::AwaitingLogoutReply)
        );
    }

    #[test]
    fn sequencer_reaches_force_quit_without_reply() {
        let mut rig = Rig::new(LoopConfig::default());
        rig.lifecycle.request_quit();
        let mut offset = millis(10);
        while !rig.lifecycle.is_exiting() {
            assert!(offset < Duration::from_secs(15), "shutdown not bounded");
            rig.run_at(offset, false);
            offset += millis(250);
        }
        assert_eq!(rig.runner.shutdown_state(), Some(ShutdownState::ForceQuit));
        assert_eq!(rig.world.borrow().logout_requests, 1);
    }

    #[test]
    fn disconnect_during_shutdown_forces_quit() {
        let mut rig = Rig::new(LoopConfig::default());
        rig.lifecycle.request_quit();
        rig.run_at(millis(10), false);
        rig.run_at(millis(20), false);
        assert_eq!(
            rig.runner.shutdown_state(),
            Some(ShutdownState::AwaitingLogoutReply)
        );

        assert_eq!(
            rig.run_at(millis(30), true),
            IdleOutcome::Disconnected {
                shutdown: Some(ShutdownState::ForceQuit)
            }
        );
        assert!(rig.lifecycle.is_exiting());
    }

    #[test]
    fn idle_callbacks_and_deferred_tasks_run() {
        let mut rig = Rig::new(LoopConfig::default());
        let idle_hits = Rc::new(Cell::new(0));
        let deferred_hits = Rc::new(Cell::new(0));

        let counter = Rc::clone(&idle_hits);
        let id = rig
            .runner
            .add_idle_callback(move || counter.set(counter.get() + 1));
        let counter = Rc::clone(&deferred_hits);
        rig.runner
            .deferred_tasks()
            .defer(move || counter.set(counter.get() + 1));

        rig.run_at(millis(10), false);
        rig.run_at(millis(20), false);
        assert_eq!(idle_hits.get(), 2);
        assert_eq!(deferred_hits.get(), 1);

        assert!(rig.runner.remove_idle_callback(id));
        rig.run_at(millis(30), false);
        assert_eq!(idle_hits.get(), 2);
    }

    #[test]
    fn render_info_hook_requests_ready_regions() {
        let mut rig = Rig::new(LoopConfig::default());
        rig.world.borrow_mut().regions = vec![RegionStatus {
            id: RegionId(7),
            alive: true,
            capabilities_received: true,
        }];

        rig.run_at(millis(10), false);
        rig.run_at(millis(20), false);
        assert_eq!(rig.world.borrow().render_info_requests, vec![RegionId(7)]);
    }

    #[test]
    fn world_update_error_propagates() {
        let mut rig = Rig::new(LoopConfig::default());
        rig.world.borrow_mut().world_error = Some(TickError::continuable("world", "bad object"));

        let result = rig.runner.run(
            rig.start + millis(10),
            &mut rig.host,
            IdleEnv {
                lifecycle: &rig.lifecycle,
                snapshot: &mut rig.snapshot,
                watchdog: None,
                disconnected: false,
            },
        );
        assert!(matches!(result, Err(TickError::Continuable { .. })));
    }
}

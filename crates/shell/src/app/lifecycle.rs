use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use super::host::{SnapshotSaver, TickError};

#[derive(Debug, Default)]
struct LifecycleFlags {
    quit_requested: AtomicBool,
    exiting: AtomicBool,
    disconnect_requested: AtomicBool,
}

/// Process-level quit and disconnect flags.
///
/// Cloned into any collaborator that needs to ask the loop to stop. The loop
/// only consults them at fixed points: start of idle and end of tick.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    flags: Arc<LifecycleFlags>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks for an orderly logout. Consumed once by the idle phase.
    pub fn request_quit(&self) {
        self.flags.quit_requested.store(true, Ordering::Release);
    }

    /// Whether a quit request is waiting for the next idle call.
    pub fn quit_requested(&self) -> bool {
        self.flags.quit_requested.load(Ordering::Acquire)
    }

    pub(crate) fn take_quit_request(&self) -> bool {
        self.flags.quit_requested.swap(false, Ordering::AcqRel)
    }

    /// Sets the exit flag; the current tick returns `Exit`.
    pub fn force_quit(&self) {
        if !self.flags.exiting.swap(true, Ordering::AcqRel) {
            info!("force_quit");
        }
    }

    pub fn is_exiting(&self) -> bool {
        self.flags.exiting.load(Ordering::Acquire)
    }

    /// Returns `false` when a disconnect was already requested.
    pub fn request_disconnect(&self) -> bool {
        !self.flags.disconnect_requested.swap(true, Ordering::AcqRel)
    }

    pub fn disconnect_requested(&self) -> bool {
        self.flags.disconnect_requested.load(Ordering::Acquire)
    }
}

/// One-shot guard around saving the final snapshot.
///
/// Shared by the disconnect path, the shutdown sequencer and loop exit. The
/// save is attempted at most once even when it fails.
#[derive(Debug, Default)]
pub struct FinalSnapshot {
    attempted: bool,
}

impl FinalSnapshot {
    /// Returns `Ok(true)` when this call performed the save.
    pub fn save(&mut self, saver: &mut dyn SnapshotSaver) -> Result<bool, TickError> {
        if self.attempted {
            return Ok(false);
        }
        self.attempted = true;
        saver.save_final_snapshot()?;
        info!("final_snapshot_saved");
        Ok(true)
    }

    pub fn is_saved(&self) -> bool {
        self.attempted
    }
}

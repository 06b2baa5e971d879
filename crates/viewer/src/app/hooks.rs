use tracing::{info, warn};

type InitHook<E> = Box<dyn FnOnce() -> Result<(), E>>;
type CleanupHook = Box<dyn FnOnce()>;

/// Named init and cleanup steps around the main loop.
///
/// Init hooks run in registration order and stop at the first failure.
/// Cleanup hooks run in reverse registration order, all of them.
pub(crate) struct HookRegistry<E> {
    init: Vec<(&'static str, InitHook<E>)>,
    cleanup: Vec<(&'static str, CleanupHook)>,
}

impl<E: std::fmt::Display> HookRegistry<E> {
    pub(crate) fn new() -> Self {
        Self {
            init: Vec::new(),
            cleanup: Vec::new(),
        }
    }

    pub(crate) fn on_init(&mut self, name: &'static str, hook: impl FnOnce() -> Result<(), E> + 'static) {
        self.init.push((name, Box::new(hook)));
    }

    pub(crate) fn on_cleanup(&mut self, name: &'static str, hook: impl FnOnce() + 'static) {
        self.cleanup.push((name, Box::new(hook)));
    }

    pub(crate) fn run_init(&mut self) -> Result<(), E> {
        for (name, hook) in self.init.drain(..) {
            if let Err(err) = hook() {
                warn!(hook = name, error = %err, "init_hook_failed");
                return Err(err);
            }
            info!(hook = name, "init_hook_done");
        }
        Ok(())
    }

    pub(crate) fn run_cleanup(&mut self) {
        while let Some((name, hook)) = self.cleanup.pop() {
            hook();
            info!(hook = name, "cleanup_hook_done");
        }
    }
}

use std::time::Duration;

use shell::{Lifecycle, WindowHost};
use tracing::{debug, info};
use winit::dpi::LogicalSize;
use winit::error::{EventLoopError, OsError};
use winit::event::{ElementState, Event, WindowEvent};
use winit::event_loop::EventLoop;
use winit::keyboard::{Key, NamedKey};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowBuilder};

use super::settings::WindowSettings;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct WindowFlags {
    focused: bool,
    occluded: bool,
    minimized: bool,
    key_presses: u32,
}

impl WindowFlags {
    fn apply(&mut self, event: &WindowEvent, lifecycle: &Lifecycle) {
        match event {
            WindowEvent::CloseRequested => {
                info!(reason = "window_close", "shutdown_requested");
                lifecycle.request_quit();
            }
            WindowEvent::Focused(focused) => self.focused = *focused,
            WindowEvent::Occluded(occluded) => self.occluded = *occluded,
            WindowEvent::Resized(size) => self.minimized = size.width == 0 || size.height == 0,
            WindowEvent::KeyboardInput { event, .. } if event.state == ElementState::Pressed => {
                if event.logical_key == Key::Named(NamedKey::Escape) {
                    info!(reason = "escape_key", "shutdown_requested");
                    lifecycle.request_quit();
                } else {
                    self.key_presses = self.key_presses.saturating_add(1);
                }
            }
            _ => {}
        }
    }
}

/// Native window driven by `pump_events`, one non-blocking pump per tick.
pub(crate) struct WinitWindowHost {
    event_loop: EventLoop<()>,
    window: Window,
    lifecycle: Lifecycle,
    flags: WindowFlags,
    gathered_presses: u32,
}

impl WinitWindowHost {
    pub(crate) fn open(
        settings: &WindowSettings,
        lifecycle: Lifecycle,
    ) -> Result<Self, WindowHostError> {
        let event_loop = EventLoop::new()?;
        let window = WindowBuilder::new()
            .with_title(settings.title.as_str())
            .with_inner_size(LogicalSize::new(
                f64::from(settings.width),
                f64::from(settings.height),
            ))
            .build(&event_loop)?;
        info!(
            width = settings.width,
            height = settings.height,
            "window_opened"
        );
        Ok(Self {
            event_loop,
            window,
            lifecycle,
            flags: WindowFlags {
                focused: true,
                ..WindowFlags::default()
            },
            gathered_presses: 0,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum WindowHostError {
    #[error("failed to create event loop: {0}")]
    EventLoop(#[from] EventLoopError),
    #[error("failed to create window: {0}")]
    Window(#[from] OsError),
}

impl WindowHost for WinitWindowHost {
    fn process_native_events(&mut self) {
        let Self {
            event_loop,
            window,
            lifecycle,
            flags,
            ..
        } = self;
        let window_id = window.id();
        let status = event_loop.pump_events(Some(Duration::ZERO), |event, _target| {
            if let Event::WindowEvent { window_id: id, event } = event {
                if id == window_id {
                    flags.apply(&event, lifecycle);
                }
            }
        });
        if let PumpStatus::Exit(code) = status {
            info!(code, "event_loop_exited");
            lifecycle.force_quit();
        }
    }

    fn gather_input(&mut self) {
        self.gathered_presses = std::mem::take(&mut self.flags.key_presses);
    }

    fn scan_input(&mut self) {
        if self.gathered_presses > 0 {
            debug!(presses = self.gathered_presses, "keyboard_scanned");
            self.gathered_presses = 0;
        }
    }

    fn is_visible(&self) -> bool {
        !self.flags.occluded && !self.flags.minimized && self.window.is_visible().unwrap_or(true)
    }

    fn has_focus(&self) -> bool {
        self.flags.focused
    }

    fn is_minimized(&self) -> bool {
        self.flags.minimized || self.window.is_minimized().unwrap_or(false)
    }
}

/// Window stand-in for runs without a display.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeadlessWindow {
    focused: bool,
}

impl HeadlessWindow {
    pub(crate) fn new(focused: bool) -> Self {
        Self { focused }
    }
}

impl WindowHost for HeadlessWindow {
    fn process_native_events(&mut self) {}

    fn gather_input(&mut self) {}

    fn scan_input(&mut self) {}

    fn is_visible(&self) -> bool {
        true
    }

    fn has_focus(&self) -> bool {
        self.focused
    }

    fn is_minimized(&self) -> bool {
        false
    }
}

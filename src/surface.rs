//! Progress surface and the thread that services it
//!
//! A batch owns one surface thread. The thread owns the
//! [`ProgressSurface`], shows it, and then runs an event loop until the
//! session tells it to quit, so the surface stays responsive while files are
//! processed one after another on the session thread.

use crate::error::{BatchError, ErrorCategory, ErrorKind, Result};
use crate::file_ops::Direction;
use crossbeam::channel::{self, Receiver, Sender};
use std::io::{self, IsTerminal, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Something that shows which file is being processed and how far along it is.
///
/// All methods are called on the surface thread.
pub trait ProgressSurface: Send {
    /// Called once before any other method. `cancel` stays valid for the
    /// whole batch and is how the surface reports that the user gave up.
    fn show(&mut self, direction: Direction, cancel: CancelHandle);

    fn set_filename(&mut self, name: &str);

    /// Position in the range 0..=100.
    fn set_position(&mut self, position: u8);

    fn close(&mut self);
}

/// Produces a fresh surface for every batch.
pub type SurfaceFactory = Arc<dyn Fn() -> Box<dyn ProgressSurface> + Send + Sync>;

enum SurfaceEvent {
    Filename(String),
    Position(u8),
    Cancel,
    HostShutdown,
    Quit,
}

/// Requests cancellation of the batch a surface belongs to.
///
/// Requests are delivered through the surface thread's event loop. Repeated
/// requests have the same effect as one.
#[derive(Clone)]
pub struct CancelHandle {
    events: Sender<SurfaceEvent>,
}

impl CancelHandle {
    /// The user asked to stop.
    pub fn request_cancel(&self) {
        let _ = self.events.send(SurfaceEvent::Cancel);
    }

    /// The host is shutting down; handled exactly like a user cancel.
    pub fn host_shutdown(&self) {
        let _ = self.events.send(SurfaceEvent::HostShutdown);
    }
}

/// Cancel handles of the batches currently on screen, for delivering a host
/// shutdown to all of them at once.
///
/// Once [`shutdown`](Self::shutdown) has run, every handle registered later
/// is shut down on registration.
#[derive(Clone, Default)]
pub struct ShutdownRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    shutting_down: bool,
    next_id: u64,
    handles: Vec<(u64, CancelHandle)>,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Tracks `handle` until [`unregister`](Self::unregister) is called with
    /// the returned id.
    pub fn register(&self, handle: CancelHandle) -> u64 {
        let mut state = self.lock();
        if state.shutting_down {
            handle.host_shutdown();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.handles.push((id, handle));
        id
    }

    pub fn unregister(&self, id: u64) {
        self.lock().handles.retain(|(registered, _)| *registered != id);
    }

    /// Delivers a host shutdown to every registered handle.
    ///
    /// When nothing is registered, `when_idle` runs instead. Registration is
    /// blocked while it runs, so no batch can start writing output in the
    /// meantime.
    pub fn shutdown(&self, when_idle: impl FnOnce()) {
        let mut state = self.lock();
        state.shutting_down = true;
        if state.handles.is_empty() {
            when_idle();
            return;
        }
        for (_, handle) in &state.handles {
            handle.host_shutdown();
        }
    }

    /// True once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

/// Handle to a running surface thread.
pub(crate) struct SurfaceThread {
    events: Sender<SurfaceEvent>,
    cancelled: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SurfaceThread {
    /// Starts the surface thread and waits until the surface is shown.
    ///
    /// `notify` runs on the surface thread every time cancellation is
    /// requested, after the flag is set.
    pub fn spawn(
        surface: Box<dyn ProgressSurface>,
        direction: Direction,
        notify: Box<dyn Fn() + Send>,
    ) -> Result<Self> {
        let (events, receiver) = channel::unbounded();
        let (ready_tx, ready_rx) = channel::bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        let cancel = CancelHandle {
            events: events.clone(),
        };
        let flag = Arc::clone(&cancelled);
        let failure = Arc::clone(&failed);
        let handle = thread::Builder::new()
            .name("saltybatch-progress".to_string())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    run_event_loop(surface, direction, cancel, receiver, ready_tx, &flag, &*notify)
                }));
                if result.is_err() {
                    error!("progress surface thread panicked");
                    failure.store(true, Ordering::SeqCst);
                }
            })
            .map_err(|e| {
                BatchError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::ThreadSpawn,
                    "Progress thread creation failed",
                    e,
                )
            })?;

        // An error here means the surface died before showing; the batch
        // proceeds without a display.
        let _ = ready_rx.recv();

        Ok(Self {
            events,
            cancelled,
            failed,
            handle: Some(handle),
        })
    }

    pub fn set_filename(&self, name: &str) {
        let _ = self.events.send(SurfaceEvent::Filename(name.to_string()));
    }

    pub fn set_position(&self, position: u8) {
        let _ = self.events.send(SurfaceEvent::Position(position.min(100)));
    }

    /// True once cancellation has been requested. Never reverts.
    pub fn was_cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_flag(&self) -> &AtomicBool {
        &self.cancelled
    }

    /// The error to report if the surface thread died, once it has.
    pub fn failure(&self) -> Option<BatchError> {
        self.failed.load(Ordering::SeqCst).then(|| {
            BatchError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                "Unexpected error in progress surface thread",
            )
        })
    }

    /// Stops the event loop, closes the surface and waits for the thread.
    ///
    /// Returns the surface thread's failure, if it died at any point.
    pub fn finish(mut self) -> Option<BatchError> {
        self.shutdown();
        self.failure()
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.events.send(SurfaceEvent::Quit);
            let _ = handle.join();
        }
    }
}

impl Drop for SurfaceThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_event_loop(
    mut surface: Box<dyn ProgressSurface>,
    direction: Direction,
    cancel: CancelHandle,
    events: Receiver<SurfaceEvent>,
    ready: Sender<()>,
    cancelled: &AtomicBool,
    notify: &dyn Fn(),
) {
    surface.show(direction, cancel);
    let _ = ready.send(());

    while let Ok(event) = events.recv() {
        match event {
            SurfaceEvent::Filename(name) => surface.set_filename(&name),
            SurfaceEvent::Position(position) => surface.set_position(position),
            SurfaceEvent::Cancel => {
                if !cancelled.swap(true, Ordering::SeqCst) {
                    info!("cancellation requested");
                }
                notify();
            }
            SurfaceEvent::HostShutdown => {
                if !cancelled.swap(true, Ordering::SeqCst) {
                    info!("host shutdown, cancelling batch");
                }
                notify();
            }
            SurfaceEvent::Quit => break,
        }
    }

    debug!("progress surface closing");
    surface.close();
}

/// Renders progress on a single stderr line.
///
/// Draws nothing when stderr is not a terminal. With a [`ShutdownRegistry`]
/// attached, the batch's cancel handle is registered while the surface is
/// shown.
pub struct TerminalSurface {
    enabled: bool,
    label: &'static str,
    filename: String,
    position: u8,
    shutdown: Option<ShutdownRegistry>,
    registration: Option<u64>,
}

impl TerminalSurface {
    pub fn new() -> Self {
        Self {
            enabled: io::stderr().is_terminal(),
            label: "",
            filename: String::new(),
            position: 0,
            shutdown: None,
            registration: None,
        }
    }

    pub fn with_shutdown(registry: ShutdownRegistry) -> Self {
        Self {
            shutdown: Some(registry),
            ..Self::new()
        }
    }

    fn redraw(&self) {
        if !self.enabled {
            return;
        }
        let mut stderr = io::stderr().lock();
        let _ = write!(
            stderr,
            "\r\x1b[2K{} {} {:>3}%",
            self.label, self.filename, self.position
        );
        let _ = stderr.flush();
    }
}

impl Default for TerminalSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSurface for TerminalSurface {
    fn show(&mut self, direction: Direction, cancel: CancelHandle) {
        self.label = direction.progress_label();
        if let Some(registry) = &self.shutdown {
            self.registration = Some(registry.register(cancel));
        }
        self.redraw();
    }

    fn set_filename(&mut self, name: &str) {
        self.filename = name.to_string();
        self.redraw();
    }

    fn set_position(&mut self, position: u8) {
        self.position = position;
        self.redraw();
    }

    fn close(&mut self) {
        if let (Some(registry), Some(id)) = (&self.shutdown, self.registration.take()) {
            registry.unregister(id);
        }
        if self.enabled {
            let _ = writeln!(io::stderr());
        }
    }
}

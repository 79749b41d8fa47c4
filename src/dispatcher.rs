//! Request dispatcher and session thread lifecycle
//!
//! Every accepted request gets its own session thread. The thread is spawned
//! while the dispatcher lock is held and the request is queued under the
//! new thread's id, so the session finds it as soon as it can take the lock.
//! Finished sessions leave their join handles in a reap queue; whichever
//! session starts next joins them, and [`Dispatcher::wait_idle`] joins the
//! rest.

use crate::config::BatchConfig;
use crate::engine::EngineFactory;
use crate::error::{BatchError, ErrorCategory, ErrorKind};
use crate::file_ops::{Batch, BatchOutcome, Direction};
use crate::passphrase::{PassphraseReader, convert_passphrase};
use crate::relay::Signal;
use crate::report::{ErrorReporter, report_error};
use crate::surface::{SurfaceFactory, SurfaceThread};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, info};
use zeroize::Zeroizing;

struct Request {
    session: ThreadId,
    handle: JoinHandle<()>,
    files: Vec<PathBuf>,
    password: Zeroizing<Vec<u8>>,
    direction: Direction,
}

#[derive(Default)]
struct DispatchState {
    busy: usize,
    pending: VecDeque<Request>,
    finished: VecDeque<JoinHandle<()>>,
}

struct Shared {
    config: BatchConfig,
    engines: EngineFactory,
    surfaces: SurfaceFactory,
    reporter: Arc<dyn ErrorReporter>,
    state: Mutex<DispatchState>,
    idle: Condvar,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, DispatchState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn report(&self, err: &BatchError) {
        report_error(&*self.reporter, &self.config.error_title(), err);
    }
}

/// Accepts encrypt/decrypt requests and runs each one in the background.
///
/// Dropping the dispatcher waits for every running session to finish.
pub struct Dispatcher {
    shared: Arc<Shared>,
    passphrase: Mutex<Box<dyn PassphraseReader>>,
}

impl Dispatcher {
    pub fn new(
        config: BatchConfig,
        engines: EngineFactory,
        passphrase: Box<dyn PassphraseReader>,
        surfaces: SurfaceFactory,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                engines,
                surfaces,
                reporter,
                state: Mutex::new(DispatchState::default()),
                idle: Condvar::new(),
            }),
            passphrase: Mutex::new(passphrase),
        }
    }

    /// True while at least one session is running.
    pub fn is_busy(&self) -> bool {
        self.shared.lock_state().busy > 0
    }

    /// Asks for a passphrase and starts a session for `files`.
    ///
    /// Returns once the session is started, or immediately if there is
    /// nothing to do, the prompt was dismissed, or the request was rejected.
    /// Failures are delivered to the error reporter, never returned.
    pub fn process_files(&self, files: Vec<PathBuf>, direction: Direction) {
        if files.is_empty() {
            return;
        }

        let captured = {
            let mut reader = self
                .passphrase
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            reader.read_passphrase(direction)
        };
        let captured = match captured {
            Ok(Some(captured)) => captured,
            Ok(None) => {
                debug!("passphrase prompt dismissed");
                return;
            }
            Err(err) => {
                self.shared.report(&err);
                return;
            }
        };
        let password = match convert_passphrase(&captured) {
            Ok(password) => password,
            Err(err) => {
                self.shared.report(&err);
                return;
            }
        };
        drop(captured);

        let mut state = self.shared.lock_state();
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("saltybatch-session".to_string())
            .spawn(move || run_session(&shared));

        match spawned {
            Ok(handle) => {
                state.pending.push_back(Request {
                    session: handle.thread().id(),
                    handle,
                    files,
                    password,
                    direction,
                });
                state.busy += 1;
            }
            Err(e) => {
                drop(state);
                let err = BatchError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::ThreadSpawn,
                    "Unable to start worker thread",
                    e,
                );
                self.shared.report(&err);
            }
        }
    }

    /// Blocks until no session is running, then joins every finished one.
    pub fn wait_idle(&self) {
        let mut state = self.shared.lock_state();
        loop {
            state = self
                .shared
                .idle
                .wait_while(state, |s| s.busy > 0)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(handle) = state.finished.pop_front() else {
                break;
            };
            drop(state);
            let _ = handle.join();
            state = self.shared.lock_state();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.wait_idle();
    }
}

fn run_session(shared: &Shared) {
    let me = thread::current().id();

    let mut state = shared.lock_state();
    while let Some(handle) = state.finished.pop_front() {
        drop(state);
        let _ = handle.join();
        state = shared.lock_state();
    }

    let claimed = state
        .pending
        .iter()
        .position(|request| request.session == me)
        .and_then(|index| state.pending.remove(index));
    let Some(request) = claimed else {
        state.busy = state.busy.saturating_sub(1);
        drop(state);
        shared.idle.notify_all();
        shared.report(&BatchError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::Rendezvous,
            "Worker thread rendezvous failed",
        ));
        return;
    };
    drop(state);

    let Request {
        handle,
        files,
        password,
        direction,
        ..
    } = request;
    info!(files = files.len(), direction = direction.verb(), "session started");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        run_batch(shared, &files, direction, &password)
    }))
    .unwrap_or_else(|_| {
        shared.report(&BatchError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            "Unexpected error in worker thread",
        ));
        BatchOutcome::Aborted
    });
    drop(password);
    info!(?outcome, "session finished");

    let mut state = shared.lock_state();
    state.busy = state.busy.saturating_sub(1);
    state.finished.push_back(handle);
    drop(state);
    shared.idle.notify_all();
}

fn run_batch(shared: &Shared, files: &[PathBuf], direction: Direction, password: &[u8]) -> BatchOutcome {
    let signal = Arc::new(Signal::new());
    let waker = Arc::clone(&signal);
    let surface = match SurfaceThread::spawn(
        (shared.surfaces)(),
        direction,
        Box::new(move || waker.notify()),
    ) {
        Ok(surface) => surface,
        Err(err) => {
            shared.report(&err);
            return BatchOutcome::Aborted;
        }
    };

    let batch = Batch {
        config: &shared.config,
        engines: &shared.engines,
        reporter: &*shared.reporter,
        surface: &surface,
        signal: &signal,
    };
    let outcome = batch.run(files, direction, password);
    match surface.finish() {
        Some(err) if outcome != BatchOutcome::Aborted => {
            shared.report(&err);
            BatchOutcome::Aborted
        }
        _ => outcome,
    }
}

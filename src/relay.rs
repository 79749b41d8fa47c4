//! Transfer thread and progress relay
//!
//! Every engine call runs on its own scoped transfer thread. The session
//! thread stays in [`run_transfer`] as the controller: it sleeps on the
//! batch's [`Signal`] and wakes when the transfer advanced, finished, or the
//! batch was cancelled.

use crate::config::MINIMAL_INTERVAL;
use crate::engine::{CryptoEngine, Outcome};
use crate::error::{BatchError, ErrorCategory, ErrorKind, Result};
use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Condition variable shared by everything that can wake a session thread.
///
/// Waiters re-check their predicate under the lock, so notifiers also take
/// the lock before notifying.
#[derive(Debug, Default)]
pub struct Signal {
    lock: Mutex<()>,
    changed: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let _guard = self.guard();
        self.changed.notify_all();
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        let guard = self.guard();
        let _guard = self
            .changed
            .wait_while(guard, |_| !ready())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }
}

/// Which engine call a transfer makes.
pub enum TransferJob<'a> {
    Encrypt {
        password: &'a [u8],
        kdf_iterations: u32,
        metadata: &'a [(String, String)],
    },
    Decrypt {
        password: &'a [u8],
    },
}

/// Converts byte positions into throttled percentages.
#[derive(Debug)]
pub(crate) struct ProgressThrottle {
    input_size: u64,
    min_period: Duration,
    last_signal: Instant,
}

impl ProgressThrottle {
    pub(crate) fn new(input_size: u64, min_period: Duration) -> Self {
        Self {
            input_size,
            min_period,
            last_signal: Instant::now(),
        }
    }

    /// Returns the percentage to publish for `position`, if any.
    ///
    /// The final position is always published; anything else only once
    /// `min_period` has passed since the previous publication. Nothing is
    /// published when the input size is unknown.
    pub(crate) fn update(&mut self, position: u64) -> Option<u8> {
        if self.input_size == 0 {
            return None;
        }
        let now = Instant::now();
        let is_final = position == self.input_size;
        if !is_final && now.duration_since(self.last_signal) < self.min_period {
            return None;
        }
        self.last_signal = now;
        Some(percent_of(position, self.input_size))
    }
}

fn percent_of(position: u64, total: u64) -> u8 {
    let percent = u128::from(position.min(total)) * 100 / u128::from(total);
    percent as u8
}

/// Byte interval handed to the engine between progress callbacks.
///
/// Inputs too small to be worth a hundred updates report only at the end.
pub(crate) fn update_interval(input_size: u64) -> u64 {
    let interval = input_size / 100;
    if interval < MINIMAL_INTERVAL && input_size > 0 {
        u64::MAX
    } else {
        interval
    }
}

/// Runs one engine call on a transfer thread and supervises it.
///
/// `on_position` is called from the current thread with every new, strictly
/// larger percentage. When `cancelled` becomes true the engine is asked to
/// stop and the transfer thread is waited for; the engine decides whether
/// that ends in [`Outcome::Cancelled`] or something else.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_transfer(
    engine: &dyn CryptoEngine,
    job: TransferJob<'_>,
    input: &mut (dyn Read + Send),
    output: &mut (dyn Write + Send),
    input_size: u64,
    min_period: Duration,
    signal: &Signal,
    cancelled: &AtomicBool,
    on_position: &mut dyn FnMut(u8),
) -> Result<Outcome> {
    let percent = AtomicU8::new(0);
    let done = AtomicBool::new(false);
    let interval = update_interval(input_size);

    thread::scope(|scope| {
        let worker = thread::Builder::new()
            .name("saltybatch-transfer".to_string())
            .spawn_scoped(scope, || {
                let mut throttle = ProgressThrottle::new(input_size, min_period);
                let mut progress = |position: u64| {
                    if let Some(value) = throttle.update(position) {
                        percent.store(value, Ordering::SeqCst);
                        signal.notify();
                    }
                };
                let result = panic::catch_unwind(AssertUnwindSafe(|| match job {
                    TransferJob::Encrypt {
                        password,
                        kdf_iterations,
                        metadata,
                    } => engine.encrypt(
                        password,
                        kdf_iterations,
                        input,
                        output,
                        metadata,
                        &mut progress,
                        interval,
                    ),
                    TransferJob::Decrypt { password } => {
                        engine.decrypt(password, input, output, &mut progress, interval)
                    }
                }));
                done.store(true, Ordering::SeqCst);
                signal.notify();
                result
            })
            .map_err(|e| {
                BatchError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::ThreadSpawn,
                    "Transfer thread creation failed",
                    e,
                )
            })?;

        let mut shown = 0u8;
        loop {
            signal.wait_until(|| {
                done.load(Ordering::SeqCst)
                    || cancelled.load(Ordering::SeqCst)
                    || percent.load(Ordering::SeqCst) > shown
            });

            let current = percent.load(Ordering::SeqCst);
            if current > shown {
                shown = current;
                on_position(current);
            }
            if done.load(Ordering::SeqCst) {
                break;
            }
            if cancelled.load(Ordering::SeqCst) {
                debug!("asking engine to stop");
                engine.cancel();
                break;
            }
        }

        let joined = worker.join();
        // A final update may have landed between the last wakeup and exit.
        let current = percent.load(Ordering::SeqCst);
        if current > shown {
            on_position(current);
        }

        match joined {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => Err(BatchError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                "Unexpected error in transfer thread",
            )),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ProgressFn;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_update_interval() {
        assert_eq!(update_interval(0), 0);
        assert_eq!(update_interval(1), u64::MAX);
        assert_eq!(update_interval(159_999), u64::MAX);
        assert_eq!(update_interval(160_000), 1600);
        assert_eq!(update_interval(10_000_000), 100_000);
    }

    #[test]
    fn test_throttle_unknown_size_is_silent() {
        let mut throttle = ProgressThrottle::new(0, Duration::ZERO);
        assert_eq!(throttle.update(0), None);
        assert_eq!(throttle.update(100), None);
    }

    #[test]
    fn test_throttle_always_publishes_final_position() {
        let mut throttle = ProgressThrottle::new(1000, Duration::from_secs(3600));
        assert_eq!(throttle.update(500), None);
        assert_eq!(throttle.update(1000), Some(100));
    }

    #[test]
    fn test_throttle_publishes_after_period() {
        let mut throttle = ProgressThrottle::new(1000, Duration::ZERO);
        assert_eq!(throttle.update(250), Some(25));
        assert_eq!(throttle.update(999), Some(99));
    }

    /// Reports positions in tenths of `size` and waits for cancellation
    /// after `pause_at` tenths when set.
    struct SteppingEngine {
        size: u64,
        pause_at: Option<u64>,
        cancelled: AtomicBool,
        cancel_calls: AtomicUsize,
        panics: bool,
    }

    impl SteppingEngine {
        fn new(size: u64) -> Self {
            Self {
                size,
                pause_at: None,
                cancelled: AtomicBool::new(false),
                cancel_calls: AtomicUsize::new(0),
                panics: false,
            }
        }

        fn step(&self, progress: &mut ProgressFn<'_>) -> Result<Outcome> {
            if self.panics {
                panic!("engine exploded");
            }
            for tenth in 1..=10 {
                if Some(tenth) == self.pause_at {
                    while !self.cancelled.load(Ordering::SeqCst) {
                        thread::yield_now();
                    }
                }
                if self.cancelled.load(Ordering::SeqCst) {
                    return Ok(Outcome::Cancelled);
                }
                progress(self.size * tenth / 10);
            }
            Ok(Outcome::Completed)
        }
    }

    impl CryptoEngine for SteppingEngine {
        fn encrypt(
            &self,
            _password: &[u8],
            _kdf_iterations: u32,
            _input: &mut dyn Read,
            _output: &mut dyn Write,
            _metadata: &[(String, String)],
            progress: &mut ProgressFn<'_>,
            _update_interval: u64,
        ) -> Result<Outcome> {
            self.step(progress)
        }

        fn decrypt(
            &self,
            _password: &[u8],
            _input: &mut dyn Read,
            _output: &mut dyn Write,
            progress: &mut ProgressFn<'_>,
            _update_interval: u64,
        ) -> Result<Outcome> {
            self.step(progress)
        }

        fn cancel(&self) {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    fn transfer(
        engine: &SteppingEngine,
        input_size: u64,
        cancelled: &AtomicBool,
    ) -> (Result<Outcome>, Vec<u8>) {
        let signal = Signal::new();
        let mut input = io::empty();
        let mut output = io::sink();
        let mut positions = Vec::new();
        let result = run_transfer(
            engine,
            TransferJob::Decrypt { password: b"pw" },
            &mut input,
            &mut output,
            input_size,
            Duration::ZERO,
            &signal,
            cancelled,
            &mut |p| positions.push(p),
        );
        (result, positions)
    }

    #[test]
    fn test_positions_are_increasing_and_end_at_100() {
        let engine = SteppingEngine::new(1000);
        let cancelled = AtomicBool::new(false);
        let (result, positions) = transfer(&engine, 1000, &cancelled);
        assert_eq!(result.unwrap(), Outcome::Completed);
        assert_eq!(positions.last(), Some(&100));
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_unknown_size_reports_no_positions() {
        let engine = SteppingEngine::new(1000);
        let cancelled = AtomicBool::new(false);
        let (result, positions) = transfer(&engine, 0, &cancelled);
        assert_eq!(result.unwrap(), Outcome::Completed);
        assert!(positions.is_empty());
    }

    #[test]
    fn test_cancellation_reaches_engine() {
        let mut engine = SteppingEngine::new(1000);
        engine.pause_at = Some(3);
        let engine = Arc::new(engine);
        let cancelled = Arc::new(AtomicBool::new(false));
        let signal = Arc::new(Signal::new());

        let canceller = {
            let cancelled = Arc::clone(&cancelled);
            let signal = Arc::clone(&signal);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                cancelled.store(true, Ordering::SeqCst);
                signal.notify();
            })
        };

        let mut input = io::empty();
        let mut output = io::sink();
        let result = run_transfer(
            &*engine,
            TransferJob::Decrypt { password: b"pw" },
            &mut input,
            &mut output,
            1000,
            Duration::ZERO,
            &signal,
            &cancelled,
            &mut |_| {},
        );
        canceller.join().unwrap();

        assert_eq!(result.unwrap(), Outcome::Cancelled);
        assert_eq!(engine.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_engine_becomes_internal_error() {
        let mut engine = SteppingEngine::new(10);
        engine.panics = true;
        let cancelled = AtomicBool::new(false);
        let (result, _) = transfer(&engine, 10, &cancelled);
        let err = result.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Internal);
        assert_eq!(err.kind, Some(ErrorKind::InternalInvariant));
    }
}

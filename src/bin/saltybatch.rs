//! saltybatch CLI - encrypt or decrypt many files with one passphrase
//!
//! Files are processed in the background by the dispatcher while progress
//! is drawn on stderr. The process exits non-zero if any error was reported.
//! SIGINT or SIGTERM cancels the running batch, removes its partial output
//! and exits with status 130.

use clap::Parser;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Exit status after an interrupt, as shells report death by SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

use saltybatch::config::DEFAULT_KDF_ITERATIONS;
use saltybatch::passphrase::{PassphraseReader, ReaderPassphraseReader, TerminalPassphraseReader};
use saltybatch::report::{ErrorReporter, StderrReporter};
use saltybatch::secretcrypt::SecretboxEngine;
use saltybatch::surface::{ShutdownRegistry, TerminalSurface};
use saltybatch::{BatchConfig, CryptoEngine, Direction, Dispatcher, ProgressSurface};

#[derive(Parser)]
#[command(name = "saltybatch")]
#[command(version)]
#[command(about = "Passphrase-based bulk file encryption.", long_about = None)]
struct Cli {
    /// Encrypt the files, writing FILE.salty next to each
    #[arg(short, long, conflicts_with = "decrypt")]
    encrypt: bool,

    /// Decrypt .salty files, writing each next to its input without the suffix
    #[arg(short, long)]
    decrypt: bool,

    /// Read passphrase from stdin instead of from terminal
    #[arg(long)]
    passphrase_stdin: bool,

    /// scrypt cost (N) used when encrypting; a power of two
    #[arg(long, value_name = "N", default_value_t = DEFAULT_KDF_ITERATIONS)]
    kdf_iterations: u32,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Files to process. Without -e or -d, the files are encrypted unless
    /// all of them already end in .salty.
    #[arg(required = true, value_name = "FILE")]
    files: Vec<PathBuf>,
}

/// Forwards to stderr and remembers whether anything was reported.
#[derive(Default)]
struct CountingReporter {
    inner: StderrReporter,
    count: AtomicUsize,
}

impl CountingReporter {
    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl ErrorReporter for CountingReporter {
    fn report(&self, title: &str, message: &str) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner.report(title, message);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let direction = if cli.encrypt {
        Direction::Encrypt
    } else if cli.decrypt {
        Direction::Decrypt
    } else {
        Direction::infer(&cli.files)
    };

    let config = BatchConfig {
        kdf_iterations: cli.kdf_iterations,
        ..BatchConfig::default()
    };
    let shutdown = ShutdownRegistry::new();
    if let Err(e) = forward_signals(shutdown.clone()) {
        warn!(error = %e, "signal handlers not installed");
    }

    let reporter = Arc::new(CountingReporter::default());
    let surfaces = {
        let shutdown = shutdown.clone();
        Arc::new(move || Box::new(TerminalSurface::with_shutdown(shutdown.clone())) as Box<dyn ProgressSurface>)
    };
    let dispatcher = Dispatcher::new(
        config,
        Arc::new(|| Arc::new(SecretboxEngine::new()) as Arc<dyn CryptoEngine>),
        passphrase_reader(cli.passphrase_stdin),
        surfaces,
        reporter.clone(),
    );

    dispatcher.process_files(cli.files, direction);
    dispatcher.wait_idle();

    if shutdown.is_shutting_down() {
        ExitCode::from(EXIT_INTERRUPTED)
    } else if reporter.count() > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn init_logging(verbose: u8) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        match verbose {
            0 => tracing_subscriber::EnvFilter::new("warn"),
            1 => tracing_subscriber::EnvFilter::new("info"),
            2 => tracing_subscriber::EnvFilter::new("debug"),
            _ => tracing_subscriber::EnvFilter::new("trace"),
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Turns SIGINT and SIGTERM into a host shutdown of the running batch.
///
/// With no batch on screen (for example while the passphrase prompt is
/// open) there is no output to clean up, so the process exits right away.
#[cfg(unix)]
fn forward_signals(shutdown: ShutdownRegistry) -> io::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::Builder::new()
        .name("saltybatch-signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                tracing::info!(signal, "shutdown requested");
                shutdown.shutdown(|| std::process::exit(EXIT_INTERRUPTED.into()));
            }
        })?;
    Ok(())
}

#[cfg(not(unix))]
fn forward_signals(_shutdown: ShutdownRegistry) -> io::Result<()> {
    Ok(())
}

fn passphrase_reader(use_stdin: bool) -> Box<dyn PassphraseReader> {
    if use_stdin {
        Box::new(ReaderPassphraseReader::new(Box::new(io::stdin())))
    } else {
        Box::new(TerminalPassphraseReader::new())
    }
}

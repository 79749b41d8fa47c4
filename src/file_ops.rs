//! Per-file pipeline of a batch
//!
//! Files are processed one at a time, in request order. The first failure
//! is reported and ends the batch; files after it are never touched.

use crate::config::{BatchConfig, ENCRYPTED_SUFFIX};
use crate::engine::{EngineFactory, Outcome};
use crate::error::{BatchError, ErrorCategory, ErrorKind, Result};
use crate::relay::{Signal, TransferJob, run_transfer};
use crate::report::{ErrorReporter, report_error};
use crate::surface::SurfaceThread;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Whether a batch encrypts or decrypts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

impl Direction {
    pub fn verb(self) -> &'static str {
        match self {
            Direction::Encrypt => "encrypt",
            Direction::Decrypt => "decrypt",
        }
    }

    /// Heading shown by progress surfaces.
    pub fn progress_label(self) -> &'static str {
        match self {
            Direction::Encrypt => "Encrypting",
            Direction::Decrypt => "Decrypting",
        }
    }

    /// Encrypt if any file lacks the encrypted suffix, decrypt otherwise.
    pub fn infer<P: AsRef<Path>>(files: &[P]) -> Direction {
        if files.iter().any(|f| !has_encrypted_suffix(f.as_ref())) {
            Direction::Encrypt
        } else {
            Direction::Decrypt
        }
    }
}

/// How a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every file was processed.
    Completed,
    /// Cancellation was requested; later files were skipped.
    Cancelled,
    /// A failure was reported; later files were skipped.
    Aborted,
}

/// True if the file name ends in [`ENCRYPTED_SUFFIX`], compared
/// case-insensitively, and has something in front of it.
pub fn has_encrypted_suffix(path: &Path) -> bool {
    strip_encrypted_suffix(path).is_some()
}

/// Name of the file a transfer of `input` writes.
///
/// Encryption appends the suffix. Decryption removes exactly one trailing
/// suffix and returns `None` when there is none.
pub fn output_path(direction: Direction, input: &Path) -> Option<PathBuf> {
    match direction {
        Direction::Encrypt => {
            let mut name = OsString::from(input.as_os_str());
            name.push(ENCRYPTED_SUFFIX);
            Some(PathBuf::from(name))
        }
        Direction::Decrypt => strip_encrypted_suffix(input),
    }
}

fn strip_encrypted_suffix(path: &Path) -> Option<PathBuf> {
    let extension = path.extension()?;
    let stem = path.file_stem()?;
    if !extension.eq_ignore_ascii_case(ENCRYPTED_SUFFIX.trim_start_matches('.')) {
        return None;
    }
    Some(path.with_file_name(stem))
}

/// Everything a session thread lends to the pipeline for one batch.
pub(crate) struct Batch<'a> {
    pub config: &'a BatchConfig,
    pub engines: &'a EngineFactory,
    pub reporter: &'a dyn ErrorReporter,
    pub surface: &'a SurfaceThread,
    pub signal: &'a Signal,
}

impl Batch<'_> {
    /// Processes `files` in order and reports the first failure.
    ///
    /// A dead surface thread counts as a failure once it is noticed between
    /// files. The caller checks once more after the surface is finished.
    pub(crate) fn run(&self, files: &[PathBuf], direction: Direction, password: &[u8]) -> BatchOutcome {
        if direction == Direction::Decrypt {
            if let Some(file) = files.iter().find(|f| !has_encrypted_suffix(f)) {
                let err = BatchError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::MissingSuffix,
                    format!(
                        "Files to decrypt must end in {}: {}",
                        ENCRYPTED_SUFFIX,
                        file.display()
                    ),
                );
                self.report(&err);
                return BatchOutcome::Aborted;
            }
        }

        for file in files {
            if let Some(err) = self.surface.failure() {
                self.report(&err);
                return BatchOutcome::Aborted;
            }
            match self.process_file(file, direction, password) {
                Ok(Outcome::Completed) => {}
                Ok(Outcome::Cancelled) => return BatchOutcome::Cancelled,
                Err(err) => {
                    self.report(&err);
                    return BatchOutcome::Aborted;
                }
            }
            if self.surface.was_cancel_requested() {
                return BatchOutcome::Cancelled;
            }
        }

        BatchOutcome::Completed
    }

    fn report(&self, err: &BatchError) {
        report_error(self.reporter, &self.config.error_title(), err);
    }

    fn process_file(&self, input_path: &Path, direction: Direction, password: &[u8]) -> Result<Outcome> {
        self.surface.set_position(0);
        self.surface.set_filename(&input_path.display().to_string());
        info!(file = %input_path.display(), "{}", direction.progress_label());

        let input_meta = fs::metadata(input_path).ok();
        if input_meta.as_ref().is_some_and(|m| m.is_dir()) {
            return Err(BatchError::with_kind(
                ErrorCategory::User,
                ErrorKind::Io,
                format!("Unable to open input file {}: is a directory", input_path.display()),
            ));
        }
        let input_size = input_meta.map(|m| m.len()).unwrap_or(0);

        let input_file = File::open(input_path).map_err(|e| {
            io_error(format!("Unable to open input file {}", input_path.display()), e)
        })?;

        let output_path = output_path(direction, input_path).ok_or_else(|| {
            BatchError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                format!("No output name for {}", input_path.display()),
            )
        })?;

        let remove_on_failure = match fs::metadata(&output_path) {
            Ok(meta) if meta.is_file() => {
                return Err(BatchError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::OutputExists,
                    format!("Output file already exists: {}", output_path.display()),
                ));
            }
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                return Err(io_error(
                    format!("Unable to check output file {}", output_path.display()),
                    e,
                ));
            }
        };

        let output_file = open_output(&output_path).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                BatchError::with_kind_and_source(
                    ErrorCategory::User,
                    ErrorKind::OutputExists,
                    format!("Output file already exists: {}", output_path.display()),
                    e,
                )
            } else {
                io_error(format!("Unable to open output file {}", output_path.display()), e)
            }
        })?;

        let mut reader = BufReader::with_capacity(self.config.io_buffer_size, input_file);
        let mut writer = BufWriter::with_capacity(self.config.io_buffer_size, output_file);
        let metadata = self.config.metadata();
        let job = match direction {
            Direction::Encrypt => TransferJob::Encrypt {
                password,
                kdf_iterations: self.config.kdf_iterations,
                metadata: &metadata,
            },
            Direction::Decrypt => TransferJob::Decrypt { password },
        };

        let engine = (self.engines)();
        let result = run_transfer(
            &*engine,
            job,
            &mut reader,
            &mut writer,
            input_size,
            self.config.progress_interval,
            self.signal,
            self.surface.cancel_flag(),
            &mut |position| self.surface.set_position(position),
        );

        drop(reader);
        if let Err(e) = writer.flush() {
            warn!(file = %output_path.display(), error = %e, "flushing output failed");
        }
        drop(writer);

        if !matches!(result, Ok(Outcome::Completed)) {
            if remove_on_failure {
                match fs::remove_file(&output_path) {
                    Ok(()) => debug!(file = %output_path.display(), "removed partial output"),
                    Err(e) => debug!(file = %output_path.display(), error = %e, "could not remove partial output"),
                }
            }
            if matches!(result, Ok(Outcome::Cancelled)) {
                info!(file = %input_path.display(), "transfer cancelled");
            }
        }

        result.map_err(|e| e.with_context(format!("Failed to {}", direction.verb())))
    }
}

/// Creates `path` for writing, readable only by the owner on Unix.
///
/// Fails if anything already exists at `path`, including a symlink.
fn open_output(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    options.open(path)
}

fn io_error(msg: String, err: io::Error) -> BatchError {
    let category = match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => ErrorCategory::User,
        _ => ErrorCategory::Internal,
    };
    BatchError::with_kind_and_source(category, ErrorKind::Io, msg, err)
}

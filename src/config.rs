//! Tunables shared by the dispatcher, the file pipeline and the engine.

use std::time::Duration;

/// Suffix appended to encrypted files and required on files to decrypt.
pub const ENCRYPTED_SUFFIX: &str = ".salty";

/// Longest accepted passphrase, in characters.
pub const MAX_PASSWORD_LENGTH: usize = 4096;

/// Default scrypt N parameter (CPU/memory cost).
pub const DEFAULT_KDF_ITERATIONS: u32 = 32768;

/// Size in octets of the buffers used for file I/O.
pub const BUFFERED_IO_SIZE: usize = 131_072;

/// Minimum time between two progress notifications for one file.
pub const PROGRESS_UPDATE_MINIMUM: Duration = Duration::from_millis(250);

/// Smallest byte interval worth asking the engine to report progress at.
/// Files too small to reach this per percent report only their final position.
pub const MINIMAL_INTERVAL: u64 = 16 * 100;

/// Name and version recorded in the metadata of every encrypted file.
pub const PROGRAM_NAME: &str = env!("CARGO_PKG_NAME");
pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Settings for one dispatcher and every batch it runs.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Title used for error notifications.
    pub application_name: String,
    /// KDF cost handed to the engine when encrypting.
    pub kdf_iterations: u32,
    /// Throttle for progress notifications.
    pub progress_interval: Duration,
    /// Capacity of the buffered reader/writer around each file.
    pub io_buffer_size: usize,
}

impl BatchConfig {
    /// Title for error notifications, e.g. "saltybatch Error".
    pub fn error_title(&self) -> String {
        format!("{} Error", self.application_name)
    }

    /// Metadata pairs written alongside encrypted output.
    pub fn metadata(&self) -> Vec<(String, String)> {
        vec![(
            "CREATED_BY".to_string(),
            format!("{} {}", PROGRAM_NAME, PROGRAM_VERSION),
        )]
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            application_name: PROGRAM_NAME.to_string(),
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            progress_interval: PROGRESS_UPDATE_MINIMUM,
            io_buffer_size: BUFFERED_IO_SIZE,
        }
    }
}

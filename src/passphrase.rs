//! Passphrase reading functionality

use crate::config::MAX_PASSWORD_LENGTH;
use crate::error::{BatchError, ErrorCategory, ErrorKind, Result};
use crate::file_ops::Direction;
use std::io::{self, IsTerminal, Read, Write};
use zeroize::Zeroizing;

/// Trait for reading passphrases from various sources
pub trait PassphraseReader: Send {
    /// Read a passphrase for the given operation as arbitrary bytes
    ///
    /// Returns `Ok(None)` when the user declined to enter one. The passphrase
    /// is wrapped in `Zeroizing` to ensure it is securely wiped from memory
    /// when dropped.
    fn read_passphrase(&mut self, direction: Direction) -> Result<Option<Zeroizing<Vec<u8>>>>;
}

/// Returns a fixed passphrase (for testing)
pub struct ConstantPassphraseReader {
    passphrase: Zeroizing<Vec<u8>>,
}

impl ConstantPassphraseReader {
    pub fn new(passphrase: Vec<u8>) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase),
        }
    }
}

impl PassphraseReader for ConstantPassphraseReader {
    fn read_passphrase(&mut self, _direction: Direction) -> Result<Option<Zeroizing<Vec<u8>>>> {
        Ok(Some(Zeroizing::new((*self.passphrase).clone())))
    }
}

/// Reads passphrase from any io::Read source
///
/// The source is consumed on first use; later reads find it empty and
/// are treated as the user declining.
pub struct ReaderPassphraseReader {
    reader: Box<dyn Read + Send>,
}

impl ReaderPassphraseReader {
    pub fn new(reader: Box<dyn Read + Send>) -> Self {
        Self { reader }
    }
}

impl PassphraseReader for ReaderPassphraseReader {
    fn read_passphrase(&mut self, _direction: Direction) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let mut data = Zeroizing::new(Vec::new());
        self.reader.read_to_end(&mut data).map_err(|e| {
            BatchError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "error reading passphrase",
                e,
            )
        })?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(data))
    }
}

/// Reads passphrase from terminal with no echo
///
/// When encrypting the passphrase is asked for twice and both entries must
/// match. Entering an empty passphrase cancels.
pub struct TerminalPassphraseReader;

impl TerminalPassphraseReader {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TerminalPassphraseReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PassphraseReader for TerminalPassphraseReader {
    /// Read passphrase from terminal.
    ///
    /// Note: Terminal input is limited to UTF-8 due to rpassword library constraints.
    fn read_passphrase(&mut self, direction: Direction) -> Result<Option<Zeroizing<Vec<u8>>>> {
        if !io::stdin().is_terminal() {
            return Err(BatchError::with_kind(
                ErrorCategory::User,
                ErrorKind::PassphraseUnavailable,
                "cannot read passphrase from terminal - stdin is not a terminal",
            ));
        }

        let passphrase = prompt_no_echo(&format!("Passphrase to {} files: ", direction.verb()))?;
        if passphrase.is_empty() {
            return Ok(None);
        }

        if direction == Direction::Encrypt {
            let confirmation = prompt_no_echo("Confirm passphrase: ")?;
            if *confirmation != *passphrase {
                return Err(BatchError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::PassphraseUnavailable,
                    "passphrases do not match",
                ));
            }
        }

        Ok(Some(passphrase))
    }
}

fn prompt_no_echo(prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
    io::stderr()
        .write_all(prompt.as_bytes())
        .and_then(|_| io::stderr().flush())
        .map_err(|e| {
            BatchError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "failed to write prompt",
                e,
            )
        })?;

    // Read password *without echo*
    // Note: rpassword returns String (UTF-8 only), not zeroized
    let passphrase = rpassword::read_password().map_err(|e| {
        BatchError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::PassphraseUnavailable,
            "failure reading passphrase",
            e,
        )
    })?;

    Ok(Zeroizing::new(passphrase.into_bytes()))
}

/// Convert a captured passphrase into the encoding the engine expects.
///
/// The engine takes UTF-8. A single trailing line terminator (as left by
/// piped input) is removed. Invalid UTF-8, an empty result, or more than
/// [`MAX_PASSWORD_LENGTH`] characters are all rejected.
pub fn convert_passphrase(raw: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let text = std::str::from_utf8(raw).map_err(|_| conversion_error())?;
    let text = text
        .strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text);

    if text.is_empty() || text.chars().count() > MAX_PASSWORD_LENGTH {
        return Err(conversion_error());
    }

    Ok(Zeroizing::new(text.as_bytes().to_vec()))
}

fn conversion_error() -> BatchError {
    BatchError::with_kind(
        ErrorCategory::User,
        ErrorKind::PassphraseEncoding,
        "Password could not be converted to UTF-8",
    )
}

//! Error type shared by every layer of a batch

use std::error::Error as StdError;
use std::fmt::Write as _;

use thiserror::Error;

/// Who is most likely responsible for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// Anything not clearly caused by the user, such as OS failures or
    /// panics caught at a thread boundary. A user mistake may still end up
    /// here when the code cannot tell.
    Internal,

    /// Bad input from the user, for example a wrong passphrase or an output
    /// file that already exists.
    User,
}

/// Fine-grained condition flags for consumers that want to branch on error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Engine parameters were rejected: an empty password, a KDF cost that is
    /// not an accepted power of two, or metadata too large for the header.
    InvalidInput,
    /// A file selected for decryption does not carry the encrypted suffix.
    MissingSuffix,
    /// Passphrase could not be obtained from the configured reader.
    PassphraseUnavailable,
    /// The captured passphrase could not be converted to the engine encoding.
    PassphraseEncoding,
    /// The destination of a transfer already exists as a regular file.
    OutputExists,
    /// Interaction with the filesystem, stdin/stdout, or other I/O failed.
    Io,
    /// Header fields, chunk lengths or the binary layout are invalid.
    BinaryFormat,
    /// Input data ended before the expected component could be read.
    TruncatedInput,
    /// Additional bytes were present after the final chunk.
    TrailingData,
    /// Authentication failed due to an incorrect passphrase or tampering
    /// or corruption.
    AuthenticationFailed,
    /// Low-level scrypt key derivation failed.
    ScryptFailure,
    /// NaCl secretbox (XSalsa20Poly1305) failed to seal data.
    SecretboxFailure,
    /// The operating system refused to start a worker thread.
    ThreadSpawn,
    /// A session thread could not find the request it was started for.
    Rendezvous,
    /// Unexpected state reached within saltybatch logic.
    InternalInvariant,
}

#[derive(Debug, Error)]
#[error("{msg}")]
pub struct BatchError {
    /// Broad error category, always provided.
    pub category: ErrorCategory,
    /// Optional specific condition tag for consumers that need to
    /// branch their behavior. Any code consuming errors MUST handle
    /// the absence of a defined kind.
    pub kind: Option<ErrorKind>,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    msg: String,
}

impl BatchError {
    /// Creates a new error that also tags the failure with a kind.
    pub fn with_kind(category: ErrorCategory, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that carries both a kind tag and the originating source error.
    pub fn with_kind_and_source(
        category: ErrorCategory,
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: Some(Box::new(source)),
            msg: msg.into(),
        }
    }

    /// The user-facing message carried by the error.
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Returns the preserved source error if present.
    pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Wraps the current error with a higher-level message while preserving the original as source.
    pub fn with_context(self, msg: impl Into<String>) -> Self {
        let category = self.category;
        let kind = self.kind;
        Self {
            category,
            kind,
            source: Some(Box::new(self)),
            msg: msg.into(),
        }
    }

    /// Renders the message followed by every source in the chain,
    /// separated by `": "`. This is the text shown in error notifications.
    pub fn display_chain(&self) -> String {
        let mut out = self.msg.clone();
        let mut next = StdError::source(self);
        while let Some(err) = next {
            let _ = write!(out, ": {}", err);
            next = err.source();
        }
        out
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, BatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_context_preserves_kind_and_category() {
        let err = BatchError::with_kind(
            ErrorCategory::User,
            ErrorKind::AuthenticationFailed,
            "bad passphrase",
        )
        .with_context("failed to decrypt");

        assert_eq!(err.category, ErrorCategory::User);
        assert_eq!(err.kind, Some(ErrorKind::AuthenticationFailed));
        assert_eq!(err.message(), "failed to decrypt");
        assert!(err.source_error().is_some());
    }

    #[test]
    fn test_display_chain_includes_sources() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = BatchError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::Io,
            "unable to open the input file a.txt",
            io_err,
        );

        assert_eq!(
            err.display_chain(),
            "unable to open the input file a.txt: access denied"
        );
    }
}

//! User-facing error notifications

use crate::error::BatchError;
use std::io::{self, Write};
use std::sync::Mutex;

/// Presents an error to the user.
///
/// Each failed batch produces exactly one call. Implementations may block
/// until the user acknowledges the message, the way a modal dialog does.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, title: &str, message: &str);
}

/// Writes notifications to stderr.
#[derive(Debug, Default)]
pub struct StderrReporter;

impl ErrorReporter for StderrReporter {
    fn report(&self, title: &str, message: &str) {
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{}: {}", title, message);
    }
}

/// Keeps every notification in memory, for callers that inspect them later.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    reports: Mutex<Vec<(String, String)>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the `(title, message)` pairs reported so far.
    pub fn reports(&self) -> Vec<(String, String)> {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, title: &str, message: &str) {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((title.to_string(), message.to_string()));
    }
}

/// Logs `err` and hands it to `reporter` with its full source chain.
pub(crate) fn report_error(reporter: &dyn ErrorReporter, title: &str, err: &BatchError) {
    let message = err.display_chain();
    tracing::info!(kind = ?err.kind, "reported: {}", message);
    reporter.report(title, &message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCategory, ErrorKind};

    #[test]
    fn test_collecting_reporter_keeps_order() {
        let reporter = CollectingReporter::new();
        reporter.report("t", "first");
        reporter.report("t", "second");
        let messages: Vec<String> = reporter.reports().into_iter().map(|(_, m)| m).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    #[test]
    fn test_report_error_uses_chain() {
        let reporter = CollectingReporter::new();
        let err = BatchError::with_kind(ErrorCategory::User, ErrorKind::OutputExists, "exists")
            .with_context("Failed to encrypt");
        report_error(&reporter, "saltybatch Error", &err);
        assert_eq!(
            reporter.reports(),
            vec![(
                "saltybatch Error".to_string(),
                "Failed to encrypt: exists".to_string()
            )]
        );
    }
}

//! Interface between the worker threads and a streaming crypto engine.

use crate::error::Result;
use std::io::{Read, Write};
use std::sync::Arc;

/// How a transfer ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The whole input was processed and the output is complete.
    Completed,
    /// `cancel()` was observed before the transfer finished. The output is
    /// partial and must not be kept.
    Cancelled,
}

/// Callback receiving the number of input bytes consumed so far.
pub type ProgressFn<'a> = dyn FnMut(u64) + 'a;

/// A blocking, streaming encryption engine.
///
/// `encrypt` and `decrypt` run on a transfer thread while `cancel` is
/// invoked from the controlling thread, so implementations must be `Sync`.
/// Progress is reported roughly every `update_interval` input bytes, and
/// always once for the final position.
pub trait CryptoEngine: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn encrypt(
        &self,
        password: &[u8],
        kdf_iterations: u32,
        input: &mut dyn Read,
        output: &mut dyn Write,
        metadata: &[(String, String)],
        progress: &mut ProgressFn<'_>,
        update_interval: u64,
    ) -> Result<Outcome>;

    fn decrypt(
        &self,
        password: &[u8],
        input: &mut dyn Read,
        output: &mut dyn Write,
        progress: &mut ProgressFn<'_>,
        update_interval: u64,
    ) -> Result<Outcome>;

    /// Asks an in-progress call to stop at its next opportunity.
    fn cancel(&self);
}

/// Produces a fresh engine for every file of a batch.
pub type EngineFactory = Arc<dyn Fn() -> Arc<dyn CryptoEngine> + Send + Sync>;

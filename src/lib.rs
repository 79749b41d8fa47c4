//! saltybatch - background bulk file encryption with cancellable progress
//!
//! A [`Dispatcher`] accepts requests to encrypt or decrypt a list of files
//! and processes each request on its own session thread, reporting
//! progress to a [`ProgressSurface`] and failures to an [`ErrorReporter`].
//! The engine, passphrase prompt, surface and reporter are traits so hosts
//! can supply their own.

#![forbid(unsafe_code)]

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod file_ops;
pub mod passphrase;
mod relay;
pub mod report;
pub mod secretcrypt;
pub mod surface;

pub use config::BatchConfig;
pub use dispatcher::Dispatcher;
pub use engine::{CryptoEngine, EngineFactory, Outcome};
pub use error::{BatchError, ErrorCategory, ErrorKind, Result};
pub use file_ops::{BatchOutcome, Direction};
pub use passphrase::PassphraseReader;
pub use report::ErrorReporter;
pub use surface::{CancelHandle, ProgressSurface, ShutdownRegistry, SurfaceFactory};

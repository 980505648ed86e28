//! Startup errors and the per-cache error sink.
//!
//! Runtime failures at the store/bus boundary never escape as `Err`: they are
//! reported through an [`ErrorSink`] and the caller sees `false`, `None`, or `0`.
//! Only lifecycle preconditions surface as [`CacheError`].

use thiserror::Error;
use tracing::{debug, error};

use crate::bus::BusError;
use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache '{0}' is already running")]
    AlreadyRunning(String),
    #[error("cache '{0}' is not running")]
    NotRunning(String),
    #[error("database '{0}' is not running")]
    DatabaseNotRunning(String),
    #[error("database '{0}' was shut down; build a new one to restart")]
    DatabaseStopped(String),
    #[error("cache '{cache}' depends on '{dependency}', which is not running")]
    DependencyNotRunning { cache: String, dependency: String },
    #[error("cache '{0}' has no instantiator")]
    MissingInstantiator(String),
    #[error("a cache named '{0}' is already registered")]
    DuplicateCache(String),
    #[error("destructive operation refused outside development mode")]
    Forbidden,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Per-cache reporting channel for swallowed failures.
///
/// `debug` is for expected, benign conditions ("updater disabled");
/// `capture` is for anything a maintainer should look at.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    scope: String,
    verbose: bool,
}

impl ErrorSink {
    pub fn new(scope: impl Into<String>, verbose: bool) -> Self {
        Self { scope: scope.into(), verbose }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn debug(&self, message: &str) {
        if self.verbose {
            debug!(scope = %self.scope, "{}", message);
        }
    }

    pub fn capture(&self, message: &str) {
        error!(scope = %self.scope, "{}", message);
        crate::metrics::record_error(&self.scope, "capture");
    }

    pub fn capture_err(&self, err: &dyn std::error::Error, message: &str) {
        error!(scope = %self.scope, error = %err, "{}", message);
        crate::metrics::record_error(&self.scope, "capture");
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for steward-core.
//!
//! Every error belongs to one [`ErrorKind`]; callers that only need to know
//! *what sort* of failure happened match on [`Error::kind`].

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::retry::{Cancelled, Fatal};
use crate::server::ServerError;

/// Result type using the supervisor [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad or missing configuration.
    Config,
    /// Generic lifecycle failure of one application.
    Application,
    /// A worker process exited unexpectedly.
    ApplicationCrash,
    /// Path or IO failure.
    Filesystem,
    /// Verification or TLS failure.
    Security,
    /// Violated invariant. Usually a panic; listed for completeness.
    Unexpected,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Config => "CONFIG",
            ErrorKind::Application => "APPLICATION",
            ErrorKind::ApplicationCrash => "APPLICATION_CRASH",
            ErrorKind::Filesystem => "FILESYSTEM",
            ErrorKind::Security => "SECURITY",
            ErrorKind::Unexpected => "UNEXPECTED",
        };
        f.write_str(name)
    }
}

/// Supervisor errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading or interpretation failed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle failure of one application.
    #[error("application '{app}': {message}")]
    Application {
        /// Application id.
        app: String,
        /// What went wrong.
        message: String,
    },

    /// A worker process exited while it was expected to run.
    #[error("application '{app}' crashed: {message}")]
    ApplicationCrash {
        /// Application id.
        app: String,
        /// Exit description.
        message: String,
    },

    /// Configure was called on a stopped application.
    #[error("application '{0}' is not running")]
    AppNotRunning(String),

    /// IO failure on a specific path.
    #[error("filesystem error at {}: {source}", .path.display())]
    Filesystem {
        /// Offending path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Artifact verification failed.
    #[error("security error: {0}")]
    Security(String),

    /// Control-plane failure.
    #[error("control plane: {0}")]
    Server(#[from] ServerError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The governing cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Wraps an error that must not be retried.
    #[error("{0}")]
    Fatal(Box<Error>),

    /// Several independent failures, e.g. from a best-effort stop.
    #[error("{}", join(.0))]
    Multiple(Vec<Error>),
}

fn join(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Lifecycle error tagged with the application id.
    pub fn application(app: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Application {
            app: app.into(),
            message: message.to_string(),
        }
    }

    /// IO error tagged with the path it happened on.
    pub fn filesystem(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Error::Filesystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Mark `self` as non-retryable.
    pub fn fatal(self) -> Self {
        match self {
            Error::Fatal(_) => self,
            other => Error::Fatal(Box::new(other)),
        }
    }

    /// Collapse a list of errors: none is `Ok`, one is itself.
    pub fn from_many(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }

    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Application { .. } | Error::AppNotRunning(_) | Error::Cancelled => {
                ErrorKind::Application
            }
            Error::ApplicationCrash { .. } => ErrorKind::ApplicationCrash,
            Error::Filesystem { .. } => ErrorKind::Filesystem,
            Error::Security(_) => ErrorKind::Security,
            Error::Server(e) => e.kind(),
            Error::Json(_) => ErrorKind::Config,
            Error::Fatal(inner) => inner.kind(),
            Error::Multiple(errors) => errors
                .first()
                .map(Error::kind)
                .unwrap_or(ErrorKind::Unexpected),
        }
    }

    /// Stable error code string.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Application { .. } => "APPLICATION_ERROR",
            Error::ApplicationCrash { .. } => "APPLICATION_CRASHED",
            Error::AppNotRunning(_) => "APP_NOT_RUNNING",
            Error::Filesystem { .. } => "FILESYSTEM_ERROR",
            Error::Security(_) => "SECURITY_ERROR",
            Error::Server(e) => e.error_code(),
            Error::Json(_) => "JSON_ERROR",
            Error::Cancelled => "CANCELLED",
            Error::Fatal(inner) => inner.error_code(),
            Error::Multiple(_) => "MULTIPLE_ERRORS",
        }
    }
}

impl Fatal for Error {
    fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_) | Error::Cancelled)
    }
}

impl From<Cancelled> for Error {
    fn from(_: Cancelled) -> Self {
        Error::Cancelled
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(e: crate::config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

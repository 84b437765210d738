//! Error types for vmorch.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using vmorch's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vmorch operations.
#[derive(Error, Debug)]
pub enum Error {
    // Protocol errors
    /// A synchronous response reported a non-success status.
    #[error("{operation} rejected ({status}): {reason}")]
    Rejected {
        /// Operation that was rejected.
        operation: String,
        /// Status reported by the service.
        status: String,
        /// Reason reported by the service.
        reason: String,
    },

    /// A notification reported a failed terminal status.
    #[error("{operation} failed ({status}): {reason}")]
    Failed {
        /// Operation that failed.
        operation: String,
        /// Terminal status reported by the service.
        status: String,
        /// Reason reported by the service.
        reason: String,
    },

    /// No matching terminal notification arrived before the deadline.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The caller cancelled the wait.
    #[error("cancelled while waiting for {0}")]
    Cancelled(String),

    /// A notification payload could not be decoded.
    #[error("failed to decode {signal} notification: {reason}")]
    Decode {
        /// Signal the payload was delivered under.
        signal: String,
        /// Decoder error.
        reason: String,
    },

    /// The bus or method-call machinery failed.
    #[error("transport error: {operation}: {reason}")]
    Transport {
        /// Transport operation.
        operation: String,
        /// Error message.
        reason: String,
    },

    // VM lifecycle errors
    /// VM has not been started, so it has no allocated resources.
    #[error("vm {0} is not allocated (not started)")]
    Unallocated(String),

    /// VM is in an invalid state for the requested operation.
    #[error("invalid vm state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    // Command execution errors
    /// Remote command failed.
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load config {}: {reason}", path.display())]
    ConfigLoad {
        /// Config file path.
        path: PathBuf,
        /// Error message.
        reason: String,
    },

    /// Failed to save configuration.
    #[error("failed to save config: {0}")]
    ConfigSave(String),

    /// Error with operation context attached.
    #[error("{context}: {source}")]
    Context {
        /// Which VM/container and which phase.
        context: String,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a protocol rejection error.
    pub fn rejected(
        operation: impl Into<String>,
        status: impl std::fmt::Debug,
        reason: impl Into<String>,
    ) -> Self {
        Self::Rejected {
            operation: operation.into(),
            status: format!("{:?}", status),
            reason: reason.into(),
        }
    }

    /// Create a terminal failure error.
    pub fn failed(
        operation: impl Into<String>,
        status: impl std::fmt::Debug,
        reason: impl Into<String>,
    ) -> Self {
        Self::Failed {
            operation: operation.into(),
            status: format!("{:?}", status),
            reason: reason.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a decode error.
    pub fn decode(signal: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            signal: signal.into(),
            reason: reason.into(),
        }
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Attach operation context.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip context wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the root cause is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::Timeout(_))
    }

    /// Whether the root cause is an undecodable notification.
    pub fn is_decode(&self) -> bool {
        matches!(self.root(), Error::Decode { .. })
    }

    /// Whether the root cause is a protocol rejection.
    pub fn is_rejected(&self) -> bool {
        matches!(self.root(), Error::Rejected { .. })
    }
}

/// Attach context to a fallible result.
pub trait ResultExt<T> {
    /// Wrap the error with operation context.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Wrap the error with lazily built operation context.
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}

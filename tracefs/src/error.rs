//! Error taxonomy for control-plane operations
//!
//! Four classes matter to callers: requests rejected locally before any
//! kernel write, writes the kernel parser or registry refused, operations
//! attempted in the wrong lifecycle state, and lookups that found nothing.
//! Kernel rejections always carry the kernel's own message.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Caller supplied inconsistent arguments; rejected before any kernel
    /// write.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The kernel refused a well-formed control string (duplicate name,
    /// unknown target, invalid expression). The message combines the OS
    /// error with the kernel's own diagnostic where one was logged.
    #[error("kernel rejected write to {path}: {message}")]
    Kernel { path: String, message: String },

    /// A control file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Operation attempted in the wrong lifecycle state, e.g. reading a
    /// histogram that was never activated or closing a handle twice.
    #[error("lifecycle violation: {0}")]
    Lifecycle(String),

    /// A trace event could not be resolved in the live event database.
    #[error("event {system}/{name} not found")]
    EventNotFound { system: String, name: String },

    /// No tracing pseudo-filesystem could be located.
    #[error("tracefs is not mounted (looked at {0})")]
    NoTracefs(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

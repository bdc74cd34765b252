//! Tracefs control-file gateway
//!
//! Low-level access to the kernel's tracing pseudo-filesystem: locating the
//! tracing directory, reading and writing control files, resolving event ids,
//! and managing tracing instances. The event builders that compose control
//! strings live in the `traceforge-dynevents` crate.

mod control;
pub mod dir;
pub mod error;
pub mod instance;
pub mod resource;

// Re-export commonly used types
pub use dir::TraceDir;
pub use error::{Error, Result};
pub use instance::Instance;
pub use resource::{KernelResource, ResourceId, ResourceTracker};

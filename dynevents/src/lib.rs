//! Dynamic trace-event definition and lifecycle management
//!
//! This crate compiles high-level descriptions of kernel trace
//! instrumentation (function probes, event-derived probes, synthetic
//! correlated events, in-kernel histograms) into the exact control strings
//! the tracing filesystem accepts, and manages the lifecycle of the
//! kernel-side objects those strings create. Raw control-file access lives
//! in `traceforge-tracefs`.

pub mod event;
pub mod fields;
pub mod hist;
pub mod probe;
pub mod synth;

// Re-export commonly used types
pub use event::EventHandle;
pub use fields::{AddressSpace, FieldSpec, ProbeFields};
pub use hist::{AxisDisplay, HistState, Histogram, SortDirection};
pub use probe::{Eprobe, Kprobe};
pub use synth::{DerivedField, EventItem, SynthEvent};
pub use traceforge_tracefs::{Error, Result};

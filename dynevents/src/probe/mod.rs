//! Dynamic probes: kernel function probes and event-derived probes

mod eprobe;
mod kprobe;

pub use eprobe::Eprobe;
pub use kprobe::Kprobe;

/// Event group the kernel assigns to kprobe events.
pub const KPROBE_GROUP: &str = "kprobes";

/// Event group the kernel assigns to eprobe events.
pub const EPROBE_GROUP: &str = "eprobes";

/// Control file that accepts dynamic-event definitions.
pub(crate) const DYNAMIC_EVENTS: &str = "dynamic_events";

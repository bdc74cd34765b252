//! Trace event identity

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use traceforge_tracefs::{Result, TraceDir};

/// Id carried by a dynamic event that has not been registered yet.
pub const UNRESOLVED_ID: i32 = -1;

/// Identity of one trace event: `(system, name)` plus the numeric id the
/// kernel assigns. Identity is the pair; dynamic events carry
/// [`UNRESOLVED_ID`] until their definition is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHandle {
    system: String,
    name: String,
    id: i32,
}

impl EventHandle {
    /// Look up a static event in the live event database. Fails when the
    /// event does not exist.
    pub fn lookup(dir: &TraceDir, system: &str, name: &str) -> Result<Self> {
        let id = dir.resolve_event_id(system, name)?;
        Ok(Self {
            system: system.to_owned(),
            name: name.to_owned(),
            id,
        })
    }

    /// Handle for a dynamic event that is not registered yet.
    pub fn dynamic(system: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            name: name.into(),
            id: UNRESOLVED_ID,
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn is_resolved(&self) -> bool {
        self.id != UNRESOLVED_ID
    }

    /// Resolve the id from the live event database. Once resolved the id
    /// never changes.
    pub fn refresh_id(&mut self, dir: &TraceDir) -> Result<i32> {
        if !self.is_resolved() {
            self.id = dir.resolve_event_id(&self.system, &self.name)?;
        }
        Ok(self.id)
    }

    pub(crate) fn invalidate_id(&mut self) {
        self.id = UNRESOLVED_ID;
    }

    /// `events/SYSTEM/NAME`, relative to a scope root.
    pub fn control_dir(&self) -> PathBuf {
        Path::new("events").join(&self.system).join(&self.name)
    }

    /// Switch the event on in the given scope.
    pub fn enable(&self, scope: &TraceDir) -> Result<()> {
        scope.write_control(self.control_dir().join("enable"), "1")
    }

    /// Switch the event off in the given scope.
    pub fn disable(&self, scope: &TraceDir) -> Result<()> {
        scope.write_control(self.control_dir().join("enable"), "0")
    }

    /// Install a filter expression for this event in the given scope.
    pub fn set_filter(&self, scope: &TraceDir, filter: &str) -> Result<()> {
        scope.write_control(self.control_dir().join("filter"), filter)
    }

    /// Remove any installed filter in the given scope.
    pub fn clear_filter(&self, scope: &TraceDir) -> Result<()> {
        scope.write_control(self.control_dir().join("filter"), "0")
    }
}

impl std::fmt::Display for EventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.system, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use traceforge_tracefs::Error;

    fn fake_event(root: &Path, system: &str, name: &str, id: i32) {
        let dir = root.join("events").join(system).join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("id"), format!("{}\n", id)).unwrap();
        fs::write(dir.join("enable"), "0\n").unwrap();
        fs::write(dir.join("filter"), "none\n").unwrap();
    }

    #[test]
    fn test_lookup_resolves_id() {
        let tmp = TempDir::new().unwrap();
        fake_event(tmp.path(), "sched", "sched_switch", 316);
        let dir = TraceDir::at(tmp.path());

        let event = EventHandle::lookup(&dir, "sched", "sched_switch").unwrap();
        assert_eq!(event.id(), 316);
        assert!(event.is_resolved());
        assert_eq!(event.to_string(), "sched/sched_switch");
    }

    #[test]
    fn test_lookup_missing_event() {
        let tmp = TempDir::new().unwrap();
        let dir = TraceDir::at(tmp.path());
        assert!(matches!(
            EventHandle::lookup(&dir, "sched", "nope"),
            Err(Error::EventNotFound { .. })
        ));
    }

    #[test]
    fn test_dynamic_is_unresolved_until_refreshed() {
        let tmp = TempDir::new().unwrap();
        let dir = TraceDir::at(tmp.path());

        let mut event = EventHandle::dynamic("kprobes", "open");
        assert_eq!(event.id(), UNRESOLVED_ID);
        assert!(!event.is_resolved());

        fake_event(tmp.path(), "kprobes", "open", 2001);
        assert_eq!(event.refresh_id(&dir).unwrap(), 2001);

        // A resolved id is pinned even if the database moves on.
        fs::write(
            tmp.path().join("events/kprobes/open/id"),
            "9999\n",
        )
        .unwrap();
        assert_eq!(event.refresh_id(&dir).unwrap(), 2001);
    }

    #[test]
    fn test_enable_disable_and_filter() {
        let tmp = TempDir::new().unwrap();
        fake_event(tmp.path(), "kmem", "kmalloc", 100);
        let dir = TraceDir::at(tmp.path());
        let event = EventHandle::lookup(&dir, "kmem", "kmalloc").unwrap();

        event.enable(&dir).unwrap();
        event.set_filter(&dir, "bytes_req > 256").unwrap();
        event.disable(&dir).unwrap();

        let enable = fs::read_to_string(tmp.path().join("events/kmem/kmalloc/enable")).unwrap();
        assert!(enable.ends_with("1\n0\n"));
        let filter = fs::read_to_string(tmp.path().join("events/kmem/kmalloc/filter")).unwrap();
        assert!(filter.contains("bytes_req > 256"));
    }
}

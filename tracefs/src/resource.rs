//! Ownership tracking and ordered teardown of kernel-resident objects
//!
//! Probes, synthetic events, histograms, and tracing instances all outlive
//! the handles that created them unless someone destroys them. Every handle
//! therefore carries an owned flag: an owned handle destroys its kernel
//! object on `close`/teardown, a detached one deliberately leaves it alive.
//! The tracker adds explicit dependency edges so graphs spanning several
//! handles are torn down dependents-first.

use tracing::warn;

use crate::error::{Error, Result};

/// Common surface of every handle that owns kernel-side state (probe,
/// synthetic event, histogram, tracing instance).
pub trait KernelResource {
    /// Human-readable identity, e.g. `kprobe kprobes/open`.
    fn describe(&self) -> String;

    /// Whether the kernel-side object currently exists through this handle.
    fn is_registered(&self) -> bool;

    /// Whether this handle is responsible for destroying the kernel object.
    fn is_owned(&self) -> bool;

    /// Make this handle responsible for destruction. Idempotent.
    fn attach(&mut self);

    /// Release responsibility: the kernel object outlives this handle.
    /// Idempotent.
    fn detach(&mut self);

    /// Destroy the kernel object if owned, exactly once. Tearing down an
    /// already-closed handle is a lifecycle violation.
    fn teardown(&mut self) -> Result<()>;
}

/// Opaque handle into a [`ResourceTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceId(usize);

struct Tracked {
    resource: Box<dyn KernelResource>,
    /// Resources this entry references kernel-side.
    deps: Vec<ResourceId>,
}

/// Registry of kernel resources with explicit dependency edges.
///
/// Teardown destroys dependents before the resources they depend on, and
/// refuses to destroy a resource that a live dependent still references.
#[derive(Default)]
pub struct ResourceTracker {
    entries: Vec<Tracked>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a resource handle.
    pub fn track(&mut self, resource: Box<dyn KernelResource>) -> ResourceId {
        self.entries.push(Tracked {
            resource,
            deps: Vec::new(),
        });
        ResourceId(self.entries.len() - 1)
    }

    /// Declare that `dependent` references `dependency` kernel-side and must
    /// be destroyed first.
    pub fn depends_on(&mut self, dependent: ResourceId, dependency: ResourceId) -> Result<()> {
        if dependent == dependency {
            return Err(Error::Malformed(
                "a resource cannot depend on itself".to_owned(),
            ));
        }
        if dependency.0 >= self.entries.len() || dependent.0 >= self.entries.len() {
            return Err(Error::Malformed("unknown resource id".to_owned()));
        }
        let deps = &mut self.entries[dependent.0].deps;
        if !deps.contains(&dependency) {
            deps.push(dependency);
        }
        Ok(())
    }

    /// Mutable access to a tracked resource, e.g. to attach or detach it.
    pub fn resource_mut(&mut self, id: ResourceId) -> Option<&mut (dyn KernelResource + '_)> {
        match self.entries.get_mut(id.0) {
            Some(e) => Some(e.resource.as_mut()),
            None => None,
        }
    }

    /// Tear down one resource. Refused while a live dependent still
    /// references it.
    pub fn close(&mut self, id: ResourceId) -> Result<()> {
        let entry = self
            .entries
            .get(id.0)
            .ok_or_else(|| Error::Malformed("unknown resource id".to_owned()))?;

        if entry.resource.is_registered() {
            let dependents: Vec<String> = self
                .entries
                .iter()
                .filter(|e| e.resource.is_registered() && e.deps.contains(&id))
                .map(|e| e.resource.describe())
                .collect();
            if !dependents.is_empty() {
                return Err(Error::Lifecycle(format!(
                    "{} is still referenced by {}",
                    entry.resource.describe(),
                    dependents.join(", ")
                )));
            }
        }

        self.entries[id.0].resource.teardown()
    }

    /// Tear down every live resource in reverse dependency order.
    ///
    /// Teardown continues past individual failures; the first error is
    /// returned after the pass completes. A set of entries that can never be
    /// unblocked indicates a dependency cycle.
    pub fn close_all(&mut self) -> Result<()> {
        let mut finished: Vec<bool> = self
            .entries
            .iter()
            .map(|e| !e.resource.is_registered())
            .collect();
        let mut first_err: Option<Error> = None;

        loop {
            if finished.iter().all(|f| *f) {
                break;
            }

            let mut progressed = false;
            for idx in 0..self.entries.len() {
                if finished[idx] {
                    continue;
                }
                let id = ResourceId(idx);
                let blocked = self
                    .entries
                    .iter()
                    .enumerate()
                    .any(|(j, other)| !finished[j] && j != idx && other.deps.contains(&id));
                if blocked {
                    continue;
                }

                if let Err(err) = self.entries[idx].resource.teardown() {
                    warn!(
                        "teardown of {} failed: {}",
                        self.entries[idx].resource.describe(),
                        err
                    );
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                finished[idx] = true;
                progressed = true;
            }

            if !progressed {
                let stuck: Vec<String> = self
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| !finished[*j])
                    .map(|(_, e)| e.resource.describe())
                    .collect();
                let err = Error::Lifecycle(format!(
                    "dependency cycle between {}",
                    stuck.join(", ")
                ));
                if first_err.is_none() {
                    first_err = Some(err);
                }
                break;
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct FakeResource {
        name: &'static str,
        registered: bool,
        owned: bool,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl FakeResource {
        fn new(name: &'static str, log: &Rc<RefCell<Vec<&'static str>>>) -> Box<Self> {
            Box::new(Self {
                name,
                registered: true,
                owned: true,
                log: log.clone(),
            })
        }
    }

    impl KernelResource for FakeResource {
        fn describe(&self) -> String {
            self.name.to_owned()
        }
        fn is_registered(&self) -> bool {
            self.registered
        }
        fn is_owned(&self) -> bool {
            self.owned
        }
        fn attach(&mut self) {
            self.owned = true;
        }
        fn detach(&mut self) {
            self.owned = false;
        }
        fn teardown(&mut self) -> Result<()> {
            if !self.registered {
                return Err(Error::Lifecycle(format!("{} already closed", self.name)));
            }
            self.registered = false;
            if self.owned {
                self.log.borrow_mut().push(self.name);
            }
            Ok(())
        }
    }

    #[test]
    fn test_close_all_destroys_dependents_first() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut tracker = ResourceTracker::new();

        let synth = tracker.track(FakeResource::new("synth", &log));
        let probe = tracker.track(FakeResource::new("probe", &log));
        tracker.depends_on(probe, synth).unwrap();

        tracker.close_all().unwrap();
        assert_eq!(*log.borrow(), vec!["probe", "synth"]);
    }

    #[test]
    fn test_close_refuses_while_dependents_live() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut tracker = ResourceTracker::new();

        let synth = tracker.track(FakeResource::new("synth", &log));
        let probe = tracker.track(FakeResource::new("probe", &log));
        tracker.depends_on(probe, synth).unwrap();

        let err = tracker.close(synth).unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));

        tracker.close(probe).unwrap();
        tracker.close(synth).unwrap();
        assert_eq!(*log.borrow(), vec!["probe", "synth"]);
    }

    #[test]
    fn test_detached_resources_are_not_destroyed() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut tracker = ResourceTracker::new();

        let a = tracker.track(FakeResource::new("a", &log));
        tracker.track(FakeResource::new("b", &log));
        tracker.resource_mut(a).unwrap().detach();

        tracker.close_all().unwrap();
        assert_eq!(*log.borrow(), vec!["b"]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut tracker = ResourceTracker::new();

        let a = tracker.track(FakeResource::new("a", &log));
        let b = tracker.track(FakeResource::new("b", &log));
        tracker.depends_on(a, b).unwrap();
        tracker.depends_on(b, a).unwrap();

        let err = tracker.close_all().unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut tracker = ResourceTracker::new();
        let a = tracker.track(FakeResource::new("a", &log));
        assert!(matches!(
            tracker.depends_on(a, a),
            Err(Error::Malformed(_))
        ));
    }
}

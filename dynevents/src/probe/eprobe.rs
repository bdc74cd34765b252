//! Eprobes: dynamic probes attached to existing trace events
//!
//! An eprobe re-derives fields from a target event, addressing them with
//! `$field` expressions instead of function arguments. When the target is a
//! synthetic event, the synthetic event must be registered first and
//! destroyed only after the eprobe; the kernel enforces the ordering and
//! this layer surfaces its errors.

use tracing::{debug, info, warn};

use traceforge_tracefs::{Error, KernelResource, Result, TraceDir};

use crate::event::EventHandle;
use crate::fields::ProbeFields;
use crate::probe::{DYNAMIC_EVENTS, EPROBE_GROUP};

/// Dynamic probe on an existing trace event.
#[derive(Debug)]
pub struct Eprobe {
    handle: EventHandle,
    target: EventHandle,
    fields: ProbeFields,
    registered: bool,
    owned: bool,
    reg_dir: Option<TraceDir>,
}

impl Eprobe {
    pub fn new(name: &str, target: EventHandle, fields: ProbeFields) -> Eprobe {
        Eprobe {
            handle: EventHandle::dynamic(EPROBE_GROUP, name),
            target,
            fields,
            registered: false,
            owned: true,
            reg_dir: None,
        }
    }

    pub fn handle(&self) -> &EventHandle {
        &self.handle
    }

    pub fn target(&self) -> &EventHandle {
        &self.target
    }

    pub fn fields(&self) -> &ProbeFields {
        &self.fields
    }

    /// The definition string written to the dynamic-event control file.
    pub fn definition(&self) -> String {
        let mut def = format!(
            "e:{}/{} {}.{}",
            EPROBE_GROUP,
            self.handle.name(),
            self.target.system(),
            self.target.name()
        );
        if !self.fields.is_empty() {
            def.push(' ');
            def.push_str(&self.fields.render());
        }
        def
    }

    /// Register the eprobe with the kernel. An unknown or not-yet-registered
    /// target event is a kernel-level failure carrying the kernel's message.
    pub fn register(&mut self, top: &TraceDir) -> Result<()> {
        if self.registered {
            return Err(Error::Lifecycle(format!(
                "eprobe '{}' is already registered",
                self.handle.name()
            )));
        }
        top.write_control(DYNAMIC_EVENTS, &self.definition())?;
        self.handle.refresh_id(top)?;
        self.registered = true;
        self.reg_dir = Some(top.clone());
        info!("registered {}", self.describe());
        Ok(())
    }

    /// Remove the eprobe from the kernel. The probe can be registered again
    /// afterwards.
    pub fn unregister(&mut self) -> Result<()> {
        if !self.registered {
            return Err(Error::Lifecycle(format!(
                "eprobe '{}' is not registered",
                self.handle.name()
            )));
        }
        let Some(top) = self.reg_dir.clone() else {
            return Err(Error::Lifecycle(format!(
                "eprobe '{}' has no registration scope",
                self.handle.name()
            )));
        };
        top.write_control(
            DYNAMIC_EVENTS,
            &format!("-:{}/{}", EPROBE_GROUP, self.handle.name()),
        )?;
        self.handle.invalidate_id();
        self.registered = false;
        self.reg_dir = None;
        info!("unregistered eprobe {}", self.handle.name());
        Ok(())
    }

    /// Switch the probe event on in the given scope.
    pub fn enable(&self, scope: &TraceDir) -> Result<()> {
        self.check_registered("enable")?;
        self.handle.enable(scope)
    }

    /// Switch the probe event off in the given scope.
    pub fn disable(&self, scope: &TraceDir) -> Result<()> {
        self.check_registered("disable")?;
        self.handle.disable(scope)
    }

    /// Install a filter on the probe event in the given scope.
    pub fn set_filter(&self, scope: &TraceDir, filter: &str) -> Result<()> {
        self.check_registered("filter")?;
        self.handle.set_filter(scope, filter)
    }

    /// Remove any filter on the probe event in the given scope.
    pub fn clear_filter(&self, scope: &TraceDir) -> Result<()> {
        self.check_registered("filter")?;
        self.handle.clear_filter(scope)
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Make this handle responsible for destroying the probe. Idempotent.
    pub fn attach(&mut self) {
        self.owned = true;
    }

    /// The probe outlives this handle. Idempotent.
    pub fn detach(&mut self) {
        self.owned = false;
    }

    /// Destroy the kernel probe if this handle owns it. Exactly once.
    pub fn close(&mut self) -> Result<()> {
        if !self.registered {
            return Err(Error::Lifecycle(format!(
                "eprobe '{}' is already closed",
                self.handle.name()
            )));
        }
        if self.owned {
            self.unregister()
        } else {
            debug!(
                "eprobe '{}' is detached; leaving the kernel probe alive",
                self.handle.name()
            );
            self.registered = false;
            self.reg_dir = None;
            Ok(())
        }
    }

    fn check_registered(&self, what: &str) -> Result<()> {
        if !self.registered {
            return Err(Error::Lifecycle(format!(
                "cannot {} eprobe '{}': not registered",
                what,
                self.handle.name()
            )));
        }
        Ok(())
    }
}

impl KernelResource for Eprobe {
    fn describe(&self) -> String {
        format!("eprobe {}/{}", EPROBE_GROUP, self.handle.name())
    }
    fn is_registered(&self) -> bool {
        self.registered
    }
    fn is_owned(&self) -> bool {
        self.owned
    }
    fn attach(&mut self) {
        Eprobe::attach(self);
    }
    fn detach(&mut self) {
        Eprobe::detach(self);
    }
    fn teardown(&mut self) -> Result<()> {
        self.close()
    }
}

impl Drop for Eprobe {
    fn drop(&mut self) {
        if self.registered && self.owned {
            warn!(
                "eprobe '{}' dropped without close(); kernel probe leaked",
                self.handle.name()
            );
        }
    }
}

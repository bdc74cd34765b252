//! Kprobes and kretprobes
//!
//! A kprobe attaches to a kernel function entry and records an ordered set
//! of field expressions; a kretprobe attaches to the function return and
//! carries no fields (return probes cannot address call-site arguments).

use tracing::{debug, info, warn};

use traceforge_tracefs::{Error, KernelResource, Result, TraceDir};

use crate::event::EventHandle;
use crate::fields::ProbeFields;
use crate::probe::{DYNAMIC_EVENTS, KPROBE_GROUP};

/// Dynamic probe on a kernel function.
#[derive(Debug)]
pub struct Kprobe {
    handle: EventHandle,
    function: String,
    fields: ProbeFields,
    ret_probe: bool,
    registered: bool,
    owned: bool,
    reg_dir: Option<TraceDir>,
}

impl Kprobe {
    /// Probe on function entry, recording the given fields.
    pub fn new(name: &str, function: &str, fields: ProbeFields) -> Kprobe {
        Kprobe {
            handle: EventHandle::dynamic(KPROBE_GROUP, name),
            function: function.to_owned(),
            fields,
            ret_probe: false,
            registered: false,
            owned: true,
            reg_dir: None,
        }
    }

    /// Probe on function return. Field expressions are omitted.
    pub fn new_return(name: &str, function: &str) -> Kprobe {
        Kprobe {
            handle: EventHandle::dynamic(KPROBE_GROUP, name),
            function: function.to_owned(),
            fields: ProbeFields::new(),
            ret_probe: true,
            registered: false,
            owned: true,
            reg_dir: None,
        }
    }

    /// Locate an already-registered kprobe by name. The returned handle is
    /// detached: the registering process stays responsible for teardown.
    pub fn find(top: &TraceDir, name: &str) -> Result<Kprobe> {
        let content = top.read_control(DYNAMIC_EVENTS)?;
        let target = format!("{}/{}", KPROBE_GROUP, name);

        for line in content.lines() {
            let mut tokens = line.split_whitespace();
            let Some(head) = tokens.next() else { continue };
            let ret_probe = match head.split_once(':') {
                Some(("p", rest)) if rest == target => false,
                Some(("r", rest)) if rest == target => true,
                _ => continue,
            };
            let Some(function) = tokens.next() else { continue };

            let mut fields = ProbeFields::new();
            for token in tokens {
                if let Some((fname, expr)) = token.split_once('=') {
                    fields.push_raw(fname, expr)?;
                }
            }

            let mut handle = EventHandle::dynamic(KPROBE_GROUP, name);
            handle.refresh_id(top)?;
            return Ok(Kprobe {
                handle,
                function: function.to_owned(),
                fields,
                ret_probe,
                registered: true,
                owned: false,
                reg_dir: Some(top.clone()),
            });
        }

        Err(Error::EventNotFound {
            system: KPROBE_GROUP.to_owned(),
            name: name.to_owned(),
        })
    }

    pub fn handle(&self) -> &EventHandle {
        &self.handle
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn fields(&self) -> &ProbeFields {
        &self.fields
    }

    pub fn is_return_probe(&self) -> bool {
        self.ret_probe
    }

    /// The definition string written to the dynamic-event control file.
    pub fn definition(&self) -> String {
        let prefix = if self.ret_probe { 'r' } else { 'p' };
        let mut def = format!(
            "{}:{}/{} {}",
            prefix,
            KPROBE_GROUP,
            self.handle.name(),
            self.function
        );
        if !self.fields.is_empty() {
            def.push(' ');
            def.push_str(&self.fields.render());
        }
        def
    }

    /// Register the probe with the kernel. Fails with the kernel's own
    /// message on duplicate names, malformed expressions, or unknown target
    /// functions; none of those are pre-validated here.
    pub fn register(&mut self, top: &TraceDir) -> Result<()> {
        if self.registered {
            return Err(Error::Lifecycle(format!(
                "kprobe '{}' is already registered",
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

    /// Remove the probe from the kernel. The probe can be registered again
    /// afterwards.
    pub fn unregister(&mut self) -> Result<()> {
        if !self.registered {
            return Err(Error::Lifecycle(format!(
                "kprobe '{}' is not registered",
                self.handle.name()
            )));
        }
        let Some(top) = self.reg_dir.clone() else {
            return Err(Error::Lifecycle(format!(
                "kprobe '{}' has no registration scope",
                self.handle.name()
            )));
        };
        top.write_control(
            DYNAMIC_EVENTS,
            &format!("-:{}/{}", KPROBE_GROUP, self.handle.name()),
        )?;
        self.handle.invalidate_id();
        self.registered = false;
        self.reg_dir = None;
        info!("unregistered kprobe {}", self.handle.name());
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
                "kprobe '{}' is already closed",
                self.handle.name()
            )));
        }
        if self.owned {
            self.unregister()
        } else {
            debug!(
                "kprobe '{}' is detached; leaving the kernel probe alive",
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
                "cannot {} kprobe '{}': not registered",
                what,
                self.handle.name()
            )));
        }
        Ok(())
    }

    fn describe_kind(&self) -> &'static str {
        if self.ret_probe {
            "kretprobe"
        } else {
            "kprobe"
        }
    }
}

impl KernelResource for Kprobe {
    fn describe(&self) -> String {
        format!(
            "{} {}/{}",
            self.describe_kind(),
            KPROBE_GROUP,
            self.handle.name()
        )
    }
    fn is_registered(&self) -> bool {
        self.registered
    }
    fn is_owned(&self) -> bool {
        self.owned
    }
    fn attach(&mut self) {
        Kprobe::attach(self);
    }
    fn detach(&mut self) {
        Kprobe::detach(self);
    }
    fn teardown(&mut self) -> Result<()> {
        self.close()
    }
}

impl Drop for Kprobe {
    fn drop(&mut self) {
        if self.registered && self.owned {
            warn!(
                "kprobe '{}' dropped without close(); kernel probe leaked",
                self.handle.name()
            );
        }
    }
}

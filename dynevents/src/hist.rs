//! In-kernel histograms
//!
//! Compiles axis/value/sort specifications into a `hist:` trigger string
//! and drives the trigger file through the pause/active/clear protocol.
//! The kernel's dump is returned opaque; it is not reparsed here.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use traceforge_tracefs::{Error, KernelResource, Result, TraceDir};

use crate::event::EventHandle;

/// How an axis key is displayed in the kernel's dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisDisplay {
    Normal,
    Hex,
    Sym,
    SymOffset,
    Syscall,
    Execname,
    Log2,
}

impl AxisDisplay {
    /// Suffix token appended to the key in the trigger string.
    fn suffix(self) -> &'static str {
        match self {
            AxisDisplay::Normal => "",
            AxisDisplay::Hex => ".hex",
            AxisDisplay::Sym => ".sym",
            AxisDisplay::SymOffset => ".sym-offset",
            AxisDisplay::Syscall => ".syscall",
            AxisDisplay::Execname => ".execname",
            AxisDisplay::Log2 => ".log2",
        }
    }
}

impl std::str::FromStr for AxisDisplay {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "n" | "normal" => Ok(AxisDisplay::Normal),
            "x" | "hex" => Ok(AxisDisplay::Hex),
            "sym" => Ok(AxisDisplay::Sym),
            "sym-offset" => Ok(AxisDisplay::SymOffset),
            "syscall" => Ok(AxisDisplay::Syscall),
            "execname" | "comm" => Ok(AxisDisplay::Execname),
            "log2" => Ok(AxisDisplay::Log2),
            other => Err(Error::Malformed(format!(
                "unknown axis display type '{}'",
                other
            ))),
        }
    }
}

/// Per-key sort direction. Keys without an explicit direction carry no
/// suffix and get the kernel default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    fn suffix(self) -> &'static str {
        match self {
            SortDirection::Ascending => ".ascending",
            SortDirection::Descending => ".descending",
        }
    }
}

impl std::str::FromStr for SortDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "asc" | "ascending" => Ok(SortDirection::Ascending),
            "desc" | "descending" => Ok(SortDirection::Descending),
            other => Err(Error::Malformed(format!(
                "unknown sort direction '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle of a histogram trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistState {
    Unregistered,
    Paused,
    Active,
}

/// A named in-kernel histogram over one event.
#[derive(Debug)]
pub struct Histogram {
    name: String,
    event: EventHandle,
    axes: Vec<(String, AxisDisplay)>,
    values: Vec<String>,
    sort_keys: Vec<String>,
    sort_dirs: Vec<(String, SortDirection)>,
    state: HistState,
    owned: bool,
    scope: Option<TraceDir>,
}

impl Histogram {
    pub fn new(name: &str, event: EventHandle) -> Histogram {
        Histogram {
            name: name.to_owned(),
            event,
            axes: Vec::new(),
            values: Vec::new(),
            sort_keys: Vec::new(),
            sort_dirs: Vec::new(),
            state: HistState::Unregistered,
            owned: true,
            scope: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event(&self) -> &EventHandle {
        &self.event
    }

    pub fn state(&self) -> HistState {
        self.state
    }

    /// Add an axis (histogram key). Insertion order is rendering order.
    pub fn add_axis(&mut self, field: &str, display: AxisDisplay) -> Result<()> {
        self.check_unregistered("add an axis to")?;
        if self.axes.iter().any(|(f, _)| f == field) {
            return Err(Error::Malformed(format!("duplicate axis '{}'", field)));
        }
        self.axes.push((field.to_owned(), display));
        Ok(())
    }

    /// Add a value field, accumulated per bin after the implicit hit count.
    pub fn add_value(&mut self, field: &str) -> Result<()> {
        self.check_unregistered("add a value to")?;
        if self.values.iter().any(|f| f == field) {
            return Err(Error::Malformed(format!("duplicate value '{}'", field)));
        }
        self.values.push(field.to_owned());
        Ok(())
    }

    /// Replace the sort-key list. Every key must be an axis, a value, or
    /// the implicit `hitcount`.
    pub fn sort_keys(&mut self, keys: &[&str]) -> Result<()> {
        self.check_unregistered("sort")?;
        for key in keys {
            if !self.is_known_field(key) {
                return Err(Error::Malformed(format!(
                    "sort key '{}' is neither an axis nor a value",
                    key
                )));
            }
        }
        self.sort_keys = keys.iter().map(|k| (*k).to_owned()).collect();
        self.sort_dirs.clear();
        Ok(())
    }

    /// Set the direction of one sort key.
    pub fn sort_key_direction(&mut self, key: &str, direction: SortDirection) -> Result<()> {
        self.check_unregistered("sort")?;
        if !self.sort_keys.iter().any(|k| k == key) {
            return Err(Error::Malformed(format!(
                "'{}' is not a sort key",
                key
            )));
        }
        self.sort_dirs.retain(|(k, _)| k != key);
        self.sort_dirs.push((key.to_owned(), direction));
        Ok(())
    }

    /// The trigger string written to the event's trigger file.
    pub fn trigger(&self) -> Result<String> {
        if self.axes.is_empty() {
            return Err(Error::Malformed(format!(
                "histogram '{}' has no axes",
                self.name
            )));
        }

        let keys: Vec<String> = self
            .axes
            .iter()
            .map(|(field, display)| format!("{}{}", field, display.suffix()))
            .collect();

        let mut vals = vec!["hitcount".to_owned()];
        vals.extend(self.values.iter().cloned());

        let mut trigger = format!(
            "hist:name={}:keys={}:vals={}",
            self.name,
            keys.join(","),
            vals.join(",")
        );

        if !self.sort_keys.is_empty() {
            let sort: Vec<String> = self
                .sort_keys
                .iter()
                .map(|key| {
                    let suffix = self
                        .sort_dirs
                        .iter()
                        .find(|(k, _)| k == key)
                        .map(|(_, d)| d.suffix())
                        .unwrap_or("");
                    format!("{}{}", key, suffix)
                })
                .collect();
            trigger.push_str(&format!(":sort={}", sort.join(",")));
        }

        Ok(trigger)
    }

    /// Register the histogram paused, without taking data yet.
    pub fn register(&mut self, scope: &TraceDir) -> Result<()> {
        if self.state != HistState::Unregistered {
            return Err(Error::Lifecycle(format!(
                "histogram '{}' is already registered",
                self.name
            )));
        }
        let trigger = self.trigger()?;
        scope.write_control(self.trigger_path(), &format!("{}:pause", trigger))?;
        self.state = HistState::Paused;
        self.scope = Some(scope.clone());
        info!("registered histogram '{}' (paused)", self.name);
        Ok(())
    }

    /// Register the histogram and start taking data.
    pub fn start(&mut self, scope: &TraceDir) -> Result<()> {
        if self.state != HistState::Unregistered {
            return Err(Error::Lifecycle(format!(
                "histogram '{}' is already registered; use resume()",
                self.name
            )));
        }
        let trigger = self.trigger()?;
        scope.write_control(self.trigger_path(), &trigger)?;
        self.state = HistState::Active;
        self.scope = Some(scope.clone());
        info!("started histogram '{}'", self.name);
        Ok(())
    }

    /// Pause data taking.
    pub fn stop(&mut self) -> Result<()> {
        let scope = self.live_scope("stop")?;
        let trigger = self.trigger()?;
        scope.write_control(self.trigger_path(), &format!("{}:pause", trigger))?;
        self.state = HistState::Paused;
        Ok(())
    }

    /// Continue taking data after a pause.
    pub fn resume(&mut self) -> Result<()> {
        if self.state != HistState::Paused {
            return Err(Error::Lifecycle(format!(
                "histogram '{}' is not paused",
                self.name
            )));
        }
        let scope = self.live_scope("resume")?;
        let trigger = self.trigger()?;
        scope.write_control(self.trigger_path(), &format!("{}:cont", trigger))?;
        self.state = HistState::Active;
        Ok(())
    }

    /// Reset all bins. The pause state is unchanged.
    pub fn clear(&mut self) -> Result<()> {
        let scope = self.live_scope("clear")?;
        let trigger = self.trigger()?;
        scope.write_control(self.trigger_path(), &format!("{}:clear", trigger))?;
        Ok(())
    }

    /// The kernel's textual dump of the histogram. Opaque to this layer.
    pub fn read(&self) -> Result<String> {
        let scope = self.live_scope("read")?;
        scope.read_control(self.event.control_dir().join("hist"))
    }

    pub fn is_registered(&self) -> bool {
        self.state != HistState::Unregistered
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Make this handle responsible for destroying the histogram.
    /// Idempotent.
    pub fn attach(&mut self) {
        self.owned = true;
    }

    /// The histogram outlives this handle. Idempotent.
    pub fn detach(&mut self) {
        self.owned = false;
    }

    /// Remove the histogram from the kernel if this handle owns it.
    /// Exactly once.
    pub fn close(&mut self) -> Result<()> {
        if self.state == HistState::Unregistered {
            return Err(Error::Lifecycle(format!(
                "histogram '{}' is not registered",
                self.name
            )));
        }
        if self.owned {
            let scope = self.live_scope("close")?;
            let trigger = self.trigger()?;
            scope.write_control(self.trigger_path(), &format!("!{}", trigger))?;
            info!("removed histogram '{}'", self.name);
        } else {
            debug!(
                "histogram '{}' is detached; leaving the kernel histogram alive",
                self.name
            );
        }
        self.state = HistState::Unregistered;
        self.scope = None;
        Ok(())
    }

    /// Locate an already-registered histogram with this definition in the
    /// given scope. The returned handle is detached.
    pub fn find(mut self, scope: &TraceDir) -> Result<Histogram> {
        if self.state != HistState::Unregistered {
            return Err(Error::Lifecycle(format!(
                "histogram '{}' is already registered",
                self.name
            )));
        }
        let content = scope.read_control(self.trigger_path())?;
        let wanted = self.trigger()?;
        let line = content
            .lines()
            .find(|line| line.starts_with(&wanted))
            .ok_or_else(|| {
                Error::Lifecycle(format!(
                    "no histogram '{}' is registered on {}",
                    self.name, self.event
                ))
            })?;

        self.state = if line.contains("[paused]") {
            HistState::Paused
        } else {
            HistState::Active
        };
        self.owned = false;
        self.scope = Some(scope.clone());
        Ok(self)
    }

    fn trigger_path(&self) -> PathBuf {
        self.event.control_dir().join("trigger")
    }

    fn live_scope(&self, what: &str) -> Result<TraceDir> {
        if self.state == HistState::Unregistered {
            return Err(Error::Lifecycle(format!(
                "cannot {} histogram '{}': not registered",
                what, self.name
            )));
        }
        self.scope.clone().ok_or_else(|| {
            Error::Lifecycle(format!(
                "histogram '{}' has no registration scope",
                self.name
            ))
        })
    }

    fn check_unregistered(&self, what: &str) -> Result<()> {
        if self.state != HistState::Unregistered {
            return Err(Error::Lifecycle(format!(
                "cannot {} histogram '{}': definition is frozen after registration",
                what, self.name
            )));
        }
        Ok(())
    }

    fn is_known_field(&self, key: &str) -> bool {
        key == "hitcount"
            || self.axes.iter().any(|(f, _)| f == key)
            || self.values.iter().any(|f| f == key)
    }
}

impl KernelResource for Histogram {
    fn describe(&self) -> String {
        format!("histogram '{}' on {}", self.name, self.event)
    }
    fn is_registered(&self) -> bool {
        Histogram::is_registered(self)
    }
    fn is_owned(&self) -> bool {
        self.owned
    }
    fn attach(&mut self) {
        Histogram::attach(self);
    }
    fn detach(&mut self) {
        Histogram::detach(self);
    }
    fn teardown(&mut self) -> Result<()> {
        self.close()
    }
}

impl Drop for Histogram {
    fn drop(&mut self) {
        if self.state != HistState::Unregistered && self.owned {
            warn!(
                "histogram '{}' dropped without close(); kernel histogram leaked",
                self.name
            );
        }
    }
}

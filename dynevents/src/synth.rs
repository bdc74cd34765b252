//! Synthetic events: correlated start/end event pairs
//!
//! One logical synthetic event is three coordinated kernel definitions: the
//! event-format declaration written to `synthetic_events`, a histogram
//! trigger on the start event that saves exported fields into sequentially
//! numbered variables, and a histogram trigger on the end event that
//! recomputes the correlation key, derives any computed fields, and emits
//! the `trace(...)` action. Field order is identical across all three
//! surfaces: declaration order is trace-action argument order.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use traceforge_tracefs::{Error, KernelResource, Result, TraceDir};

use crate::event::EventHandle;

/// Event group the kernel assigns to synthetic events.
pub const SYNTH_GROUP: &str = "synthetic";

/// Control file that accepts synthetic-event declarations.
const SYNTHETIC_EVENTS: &str = "synthetic_events";

/// Variable holding the start-event timestamp for time deltas.
const START_TS_VAR: &str = "__ts0";

/// Default exported name of the time-delta field.
const DELTA_T_NAME: &str = "delta_T";

/// One exported field of a start or end event, optionally renamed in the
/// synthetic event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportField {
    source: String,
    rename: Option<String>,
}

impl ExportField {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The name this field carries in the synthetic event.
    pub fn exported_name(&self) -> &str {
        self.rename.as_deref().unwrap_or(&self.source)
    }
}

/// One side of a synthetic event: the event, the field it correlates on,
/// and the fields it exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventItem {
    event: EventHandle,
    match_field: String,
    fields: Vec<ExportField>,
}

impl EventItem {
    pub fn new(event: EventHandle, match_field: &str, fields: &[&str]) -> EventItem {
        EventItem {
            event,
            match_field: match_field.to_owned(),
            fields: fields
                .iter()
                .map(|f| ExportField {
                    source: (*f).to_owned(),
                    rename: None,
                })
                .collect(),
        }
    }

    /// Export `source` under a different name in the synthetic event.
    pub fn rename(mut self, source: &str, name: &str) -> Result<EventItem> {
        let field = self
            .fields
            .iter_mut()
            .find(|f| f.source == source)
            .ok_or_else(|| {
                Error::Malformed(format!(
                    "cannot rename '{}': not an exported field of {}",
                    source, self.event
                ))
            })?;
        field.rename = Some(name.to_owned());
        Ok(self)
    }

    pub fn event(&self) -> &EventHandle {
        &self.event
    }

    pub fn match_field(&self) -> &str {
        &self.match_field
    }

    pub fn fields(&self) -> &[ExportField] {
        &self.fields
    }
}

/// A field of the synthetic event computed at the end side from a
/// start-captured value and an end-side value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DerivedField {
    /// Time between the start and end events. `hd` selects nanosecond
    /// resolution instead of microseconds.
    DeltaT { name: Option<String>, hd: bool },
    /// `start_field - end_field`.
    DeltaStart {
        name: String,
        start_field: String,
        end_field: String,
    },
    /// `end_field - start_field`.
    DeltaEnd {
        name: String,
        start_field: String,
        end_field: String,
    },
    /// `start_field + end_field`.
    Sum {
        name: String,
        start_field: String,
        end_field: String,
    },
}

impl DerivedField {
    pub fn delta_t(hd: bool) -> DerivedField {
        DerivedField::DeltaT { name: None, hd }
    }

    pub fn delta_t_named(name: &str, hd: bool) -> DerivedField {
        DerivedField::DeltaT {
            name: Some(name.to_owned()),
            hd,
        }
    }

    pub fn delta_start(name: &str, start_field: &str, end_field: &str) -> DerivedField {
        DerivedField::DeltaStart {
            name: name.to_owned(),
            start_field: start_field.to_owned(),
            end_field: end_field.to_owned(),
        }
    }

    pub fn delta_end(name: &str, start_field: &str, end_field: &str) -> DerivedField {
        DerivedField::DeltaEnd {
            name: name.to_owned(),
            start_field: start_field.to_owned(),
            end_field: end_field.to_owned(),
        }
    }

    pub fn sum(name: &str, start_field: &str, end_field: &str) -> DerivedField {
        DerivedField::Sum {
            name: name.to_owned(),
            start_field: start_field.to_owned(),
            end_field: end_field.to_owned(),
        }
    }

    /// The name this field carries in the synthetic event.
    pub fn field_name(&self) -> &str {
        match self {
            DerivedField::DeltaT { name, .. } => name.as_deref().unwrap_or(DELTA_T_NAME),
            DerivedField::DeltaStart { name, .. }
            | DerivedField::DeltaEnd { name, .. }
            | DerivedField::Sum { name, .. } => name,
        }
    }

    fn start_operand(&self) -> Option<&str> {
        match self {
            DerivedField::DeltaT { .. } => None,
            DerivedField::DeltaStart { start_field, .. }
            | DerivedField::DeltaEnd { start_field, .. }
            | DerivedField::Sum { start_field, .. } => Some(start_field),
        }
    }
}

/// A synthetic event correlating a start and an end event on a matching
/// field value, with optional derived fields.
#[derive(Debug)]
pub struct SynthEvent {
    handle: EventHandle,
    start: EventItem,
    end: EventItem,
    match_name: Option<String>,
    derived: Vec<DerivedField>,
    registered: bool,
    owned: bool,
    reg_dir: Option<TraceDir>,
}

impl SynthEvent {
    pub fn new(name: &str, start: EventItem, end: EventItem) -> SynthEvent {
        SynthEvent {
            handle: EventHandle::dynamic(SYNTH_GROUP, name),
            start,
            end,
            match_name: None,
            derived: Vec::new(),
            registered: false,
            owned: true,
            reg_dir: None,
        }
    }

    /// Export the correlating value itself as a field of the synthetic
    /// event, in the first argument position.
    pub fn with_match_name(mut self, name: &str) -> SynthEvent {
        self.match_name = Some(name.to_owned());
        self
    }

    pub fn handle(&self) -> &EventHandle {
        &self.handle
    }

    pub fn start(&self) -> &EventItem {
        &self.start
    }

    pub fn end(&self) -> &EventItem {
        &self.end
    }

    /// Add a derived field. The definition freezes at registration.
    pub fn add_derived(&mut self, field: DerivedField) -> Result<()> {
        if self.registered {
            return Err(Error::Lifecycle(format!(
                "synthetic event '{}' is registered; its definition is frozen",
                self.handle.name()
            )));
        }

        let name = field.field_name();
        if !is_identifier(name) {
            return Err(Error::Malformed(format!(
                "derived field name '{}' is not a valid identifier",
                name
            )));
        }
        if self.derived.iter().any(|d| d.field_name() == name) {
            return Err(Error::Malformed(format!(
                "duplicate derived field '{}'",
                name
            )));
        }
        if matches!(field, DerivedField::DeltaT { .. })
            && self
                .derived
                .iter()
                .any(|d| matches!(d, DerivedField::DeltaT { .. }))
        {
            return Err(Error::Malformed(
                "a synthetic event carries at most one time delta".to_owned(),
            ));
        }
        if let Some(operand) = field.start_operand() {
            if self.start_var_for(operand).is_none() {
                return Err(Error::Malformed(format!(
                    "derived field '{}' references '{}', which is not captured from {}",
                    name, operand, self.start.event
                )));
            }
        }

        self.derived.push(field);
        Ok(())
    }

    pub fn derived(&self) -> &[DerivedField] {
        &self.derived
    }

    /// The event-format declaration written to `synthetic_events`. Field
    /// types come from the live `format` files of the source events;
    /// derived fields are `u64`.
    pub fn declaration(&self, top: &TraceDir) -> Result<String> {
        self.validate()?;
        let mut fields: Vec<String> = Vec::new();

        if let Some(match_name) = &self.match_name {
            let ty = top.event_field_type(
                self.start.event.system(),
                self.start.event.name(),
                &self.start.match_field,
            )?;
            fields.push(format!("{} {}", ty, match_name));
        }
        for field in &self.start.fields {
            let ty = top.event_field_type(
                self.start.event.system(),
                self.start.event.name(),
                &field.source,
            )?;
            fields.push(format!("{} {}", ty, field.exported_name()));
        }
        for field in &self.end.fields {
            let ty = top.event_field_type(
                self.end.event.system(),
                self.end.event.name(),
                &field.source,
            )?;
            fields.push(format!("{} {}", ty, field.exported_name()));
        }
        for derived in &self.derived {
            fields.push(format!("u64 {}", derived.field_name()));
        }

        Ok(format!("{} {}", self.handle.name(), fields.join("; ")))
    }

    /// The histogram trigger written to the start event. Saves the match
    /// value (when exported) and every exported start field into
    /// sequentially numbered variables, plus the timestamp when a time
    /// delta is requested.
    pub fn start_trigger(&self) -> String {
        let mut trigger = format!("hist:keys={}", self.start.match_field);
        for (var, source) in self.start_vars() {
            trigger.push_str(&format!(":{}={}", var, source));
        }
        if let Some(hd) = self.delta_t_resolution() {
            trigger.push_str(&format!(":{}={}", START_TS_VAR, timestamp_expr(hd)));
        }
        trigger
    }

    /// The histogram trigger written to the end event: recomputes the
    /// correlation key, derives computed fields, and emits the trace
    /// action with arguments in declaration order.
    pub fn end_trigger(&self) -> Result<String> {
        self.validate()?;
        let mut trigger = format!("hist:keys={}", self.end.match_field);

        for derived in &self.derived {
            trigger.push_str(&format!(
                ":{}={}",
                derived.field_name(),
                self.derived_expr(derived)?
            ));
        }

        let mut args: Vec<String> = self
            .start_vars()
            .iter()
            .map(|(var, _)| format!("${}", var))
            .collect();
        args.extend(self.end.fields.iter().map(|f| f.source.clone()));
        args.extend(
            self.derived
                .iter()
                .map(|d| format!("${}", d.field_name())),
        );

        trigger.push_str(&format!(
            ":onmatch({}.{}).trace({},{})",
            self.start.event.system(),
            self.start.event.name(),
            self.handle.name(),
            args.join(",")
        ));
        Ok(trigger)
    }

    /// Human-readable multi-line descriptor combining the three kernel
    /// definitions.
    pub fn descriptor(&self, top: &TraceDir) -> Result<String> {
        Ok(format!(
            "{}: {}\nevents/{}/{}/trigger: {}\nevents/{}/{}/trigger: {}",
            SYNTHETIC_EVENTS,
            self.declaration(top)?,
            self.start.event.system(),
            self.start.event.name(),
            self.start_trigger(),
            self.end.event.system(),
            self.end.event.name(),
            self.end_trigger()?,
        ))
    }

    /// Register the declaration and both triggers. A partial failure rolls
    /// back what was already written so the kernel is left untouched.
    pub fn register(&mut self, top: &TraceDir) -> Result<()> {
        if self.registered {
            return Err(Error::Lifecycle(format!(
                "synthetic event '{}' is already registered",
                self.handle.name()
            )));
        }
        let declaration = self.declaration(top)?;
        let start_trigger = self.start_trigger();
        let end_trigger = self.end_trigger()?;
        let start_path = self.start.event.control_dir().join("trigger");
        let end_path = self.end.event.control_dir().join("trigger");

        top.write_control(SYNTHETIC_EVENTS, &declaration)?;
        if let Err(err) = top.write_control(&start_path, &start_trigger) {
            let _ = top.write_control(SYNTHETIC_EVENTS, &format!("!{}", self.handle.name()));
            return Err(err);
        }
        if let Err(err) = top.write_control(&end_path, &end_trigger) {
            let _ = top.write_control(&start_path, &format!("!{}", start_trigger));
            let _ = top.write_control(SYNTHETIC_EVENTS, &format!("!{}", self.handle.name()));
            return Err(err);
        }

        self.handle.refresh_id(top)?;
        self.registered = true;
        self.reg_dir = Some(top.clone());
        info!("registered synthetic event {}", self.handle.name());
        Ok(())
    }

    /// Remove both triggers, then the declaration. Anything that references
    /// the synthetic event (e.g. an eprobe) must be destroyed first; the
    /// kernel refuses otherwise and the error is surfaced.
    pub fn unregister(&mut self) -> Result<()> {
        if !self.registered {
            return Err(Error::Lifecycle(format!(
                "synthetic event '{}' is not registered",
                self.handle.name()
            )));
        }
        let Some(top) = self.reg_dir.clone() else {
            return Err(Error::Lifecycle(format!(
                "synthetic event '{}' has no registration scope",
                self.handle.name()
            )));
        };

        let end_path = self.end.event.control_dir().join("trigger");
        top.write_control(&end_path, &format!("!{}", self.end_trigger()?))?;
        let start_path = self.start.event.control_dir().join("trigger");
        top.write_control(&start_path, &format!("!{}", self.start_trigger()))?;
        top.write_control(SYNTHETIC_EVENTS, &format!("!{}", self.handle.name()))?;

        self.handle.invalidate_id();
        self.registered = false;
        self.reg_dir = None;
        info!("unregistered synthetic event {}", self.handle.name());
        Ok(())
    }

    /// Switch the synthetic event on in the given scope.
    pub fn enable(&self, scope: &TraceDir) -> Result<()> {
        self.check_registered("enable")?;
        self.handle.enable(scope)
    }

    /// Switch the synthetic event off in the given scope.
    pub fn disable(&self, scope: &TraceDir) -> Result<()> {
        self.check_registered("disable")?;
        self.handle.disable(scope)
    }

    /// Install a filter on the synthetic event in the given scope.
    pub fn set_filter(&self, scope: &TraceDir, filter: &str) -> Result<()> {
        self.check_registered("filter")?;
        self.handle.set_filter(scope, filter)
    }

    /// Remove any filter on the synthetic event in the given scope.
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

    /// Make this handle responsible for destroying the event. Idempotent.
    pub fn attach(&mut self) {
        self.owned = true;
    }

    /// The event outlives this handle. Idempotent.
    pub fn detach(&mut self) {
        self.owned = false;
    }

    /// Destroy the kernel event if this handle owns it. Exactly once.
    pub fn close(&mut self) -> Result<()> {
        if !self.registered {
            return Err(Error::Lifecycle(format!(
                "synthetic event '{}' is already closed",
                self.handle.name()
            )));
        }
        if self.owned {
            self.unregister()
        } else {
            debug!(
                "synthetic event '{}' is detached; leaving the kernel event alive",
                self.handle.name()
            );
            self.registered = false;
            self.reg_dir = None;
            Ok(())
        }
    }

    /// Saved start-side variables in argument order: the match value first
    /// when exported, then every exported start field.
    fn start_vars(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        let mut seq = 1;
        if self.match_name.is_some() {
            vars.push((format!("__arg_{}", seq), self.start.match_field.clone()));
            seq += 1;
        }
        for field in &self.start.fields {
            vars.push((format!("__arg_{}", seq), field.source.clone()));
            seq += 1;
        }
        vars
    }

    /// The variable a start-side operand was saved into, matching either
    /// the source or the exported name.
    fn start_var_for(&self, operand: &str) -> Option<String> {
        let mut seq = 1;
        if let Some(match_name) = &self.match_name {
            if operand == self.start.match_field || operand == match_name {
                return Some(format!("__arg_{}", seq));
            }
            seq += 1;
        }
        for field in &self.start.fields {
            if field.source == operand || field.exported_name() == operand {
                return Some(format!("__arg_{}", seq));
            }
            seq += 1;
        }
        None
    }

    fn derived_expr(&self, derived: &DerivedField) -> Result<String> {
        let var_for = |operand: &str| {
            self.start_var_for(operand).ok_or_else(|| {
                Error::Malformed(format!(
                    "derived field '{}' references '{}', which is not captured from {}",
                    derived.field_name(),
                    operand,
                    self.start.event
                ))
            })
        };
        Ok(match derived {
            DerivedField::DeltaT { hd, .. } => {
                format!("{}-${}", timestamp_expr(*hd), START_TS_VAR)
            }
            DerivedField::DeltaStart {
                start_field,
                end_field,
                ..
            } => format!("${}-{}", var_for(start_field)?, end_field),
            DerivedField::DeltaEnd {
                start_field,
                end_field,
                ..
            } => format!("{}-${}", end_field, var_for(start_field)?),
            DerivedField::Sum {
                start_field,
                end_field,
                ..
            } => format!("${}+{}", var_for(start_field)?, end_field),
        })
    }

    fn delta_t_resolution(&self) -> Option<bool> {
        self.derived.iter().find_map(|d| match d {
            DerivedField::DeltaT { hd, .. } => Some(*hd),
            _ => None,
        })
    }

    fn validate(&self) -> Result<()> {
        let mut names: Vec<&str> = Vec::new();
        if let Some(match_name) = &self.match_name {
            names.push(match_name);
        }
        names.extend(self.start.fields.iter().map(|f| f.exported_name()));
        names.extend(self.end.fields.iter().map(|f| f.exported_name()));
        names.extend(self.derived.iter().map(|d| d.field_name()));

        if names.is_empty() {
            return Err(Error::Malformed(format!(
                "synthetic event '{}' exports no fields",
                self.handle.name()
            )));
        }

        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(Error::Malformed(format!(
                    "synthetic event '{}' exports field '{}' more than once",
                    self.handle.name(),
                    name
                )));
            }
        }
        Ok(())
    }

    fn check_registered(&self, what: &str) -> Result<()> {
        if !self.registered {
            return Err(Error::Lifecycle(format!(
                "cannot {} synthetic event '{}': not registered",
                what,
                self.handle.name()
            )));
        }
        Ok(())
    }
}

impl KernelResource for SynthEvent {
    fn describe(&self) -> String {
        format!("synthetic event {}/{}", SYNTH_GROUP, self.handle.name())
    }
    fn is_registered(&self) -> bool {
        self.registered
    }
    fn is_owned(&self) -> bool {
        self.owned
    }
    fn attach(&mut self) {
        SynthEvent::attach(self);
    }
    fn detach(&mut self) {
        SynthEvent::detach(self);
    }
    fn teardown(&mut self) -> Result<()> {
        self.close()
    }
}

impl Drop for SynthEvent {
    fn drop(&mut self) {
        if self.registered && self.owned {
            warn!(
                "synthetic event '{}' dropped without close(); kernel event leaked",
                self.handle.name()
            );
        }
    }
}

fn timestamp_expr(hd: bool) -> &'static str {
    if hd {
        "common_timestamp"
    } else {
        "common_timestamp.usecs"
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

//! Probe field expressions
//!
//! Turns a semantic field description (function-argument index, pointer
//! offset, type, address space) into the kernel's probe-argument
//! micro-expressions: `$argN:type`, `+OFF($argN):type`, `$field:type`,
//! `+OFF($field):type`. No type-tag validation happens here; invalid tags
//! are rejected by the kernel at registration.

use serde::{Deserialize, Serialize};
use traceforge_tracefs::{Error, Result};

/// Stride used when expanding array fields.
const POINTER_SIZE: u32 = std::mem::size_of::<usize>() as u32;

/// Which address space a string or pointer target lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressSpace {
    Kernel,
    User,
}

impl AddressSpace {
    fn string_type(self) -> &'static str {
        match self {
            AddressSpace::Kernel => "string",
            AddressSpace::User => "ustring",
        }
    }
}

/// One named probe field and its fetch expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub expr: String,
}

/// Ordered, name-unique collection of probe fields. Insertion order is the
/// order fields appear in the generated record format. Each builder owns a
/// fresh collection; nothing is shared between probes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeFields {
    specs: Vec<FieldSpec>,
}

impl ProbeFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a function argument directly: `$argN:TYPE`.
    pub fn add_arg(&mut self, name: &str, param_id: u32, param_type: &str) -> Result<()> {
        self.push(name, format!("$arg{}:{}", param_id, param_type))
    }

    /// Dereference a pointer argument at an offset: `+OFF($argN):TYPE`.
    pub fn add_ptr_arg(
        &mut self,
        name: &str,
        param_id: u32,
        param_type: &str,
        offset: u32,
    ) -> Result<()> {
        self.push(
            name,
            format!("+{}($arg{}):{}", offset, param_id, param_type),
        )
    }

    /// Decode the string a pointer argument points to.
    pub fn add_string_arg(&mut self, name: &str, param_id: u32, space: AddressSpace) -> Result<()> {
        self.add_ptr_arg(name, param_id, space.string_type(), 0)
    }

    /// Expand an array of pointers into `size` fields named
    /// `name0..name(size-1)`, one pointer stride apart.
    pub fn add_array_arg(
        &mut self,
        name: &str,
        param_id: u32,
        param_type: &str,
        offset: u32,
        size: u32,
    ) -> Result<()> {
        for i in 0..size {
            self.add_ptr_arg(
                &format!("{}{}", name, i),
                param_id,
                param_type,
                offset + i * POINTER_SIZE,
            )?;
        }
        Ok(())
    }

    /// Record a field of the target event directly: `$FIELD:TYPE`.
    pub fn add_field(&mut self, name: &str, target_field: &str, field_type: &str) -> Result<()> {
        self.push(name, format!("${}:{}", target_field, field_type))
    }

    /// Dereference a pointer field of the target event: `+OFF($FIELD):TYPE`.
    pub fn add_ptr_field(
        &mut self,
        name: &str,
        target_field: &str,
        field_type: &str,
        offset: u32,
    ) -> Result<()> {
        self.push(
            name,
            format!("+{}(${}):{}", offset, target_field, field_type),
        )
    }

    /// Decode the string a pointer field of the target event points to.
    pub fn add_string_field(
        &mut self,
        name: &str,
        target_field: &str,
        space: AddressSpace,
    ) -> Result<()> {
        self.add_ptr_field(name, target_field, space.string_type(), 0)
    }

    pub fn specs(&self) -> &[FieldSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Space-joined `name=expression` list, in insertion order.
    pub fn render(&self) -> String {
        self.specs
            .iter()
            .map(|f| format!("{}={}", f.name, f.expr))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Adopt an already-rendered expression, e.g. when reconstructing a
    /// probe definition read back from the kernel.
    pub(crate) fn push_raw(&mut self, name: &str, expr: &str) -> Result<()> {
        self.push(name, expr.to_owned())
    }

    fn push(&mut self, name: &str, expr: String) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Malformed("field name is empty".to_owned()));
        }
        if self.specs.iter().any(|f| f.name == name) {
            return Err(Error::Malformed(format!(
                "duplicate field name '{}'",
                name
            )));
        }
        self.specs.push(FieldSpec {
            name: name.to_owned(),
            expr,
        });
        Ok(())
    }
}

/// Whether a decoded field value is the textual null-pointer sentinel
/// (`0`, `0x0`, or any zero-valued decimal/hex rendering).
pub fn is_null_pointer(value: &str) -> bool {
    let value = value.trim();
    if value == "(nil)" {
        return true;
    }
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"));
    match digits {
        Some(hex) => u64::from_str_radix(hex, 16) == Ok(0),
        None => value.parse::<u64>() == Ok(0),
    }
}

/// Collect the decoded values of an expanded array field (`name0..`),
/// stopping at the first null-pointer sentinel. Never reads past `size`
/// elements; `size == 0` yields an empty sequence.
pub fn read_array_field<F>(lookup: F, name: &str, size: u32) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut values = Vec::new();
    for i in 0..size {
        match lookup(&format!("{}{}", name, i)) {
            Some(value) if !is_null_pointer(&value) => values.push(value),
            _ => break,
        }
    }
    values
}

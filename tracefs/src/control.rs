//! Raw control-file primitives
//!
//! Commands are newline-terminated and submitted as a single write in append
//! mode, the way the kernel's control files consume them. A failed write
//! harvests the newest `error_log` entry so the kernel's own diagnostic
//! travels with the error instead of being lost.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use tracing::debug;

use crate::dir::TraceDir;
use crate::error::{Error, Result};

impl TraceDir {
    /// Write one command to a control file under this scope.
    pub fn write_control(&self, rel: impl AsRef<Path>, text: &str) -> Result<()> {
        let path = self.path(rel);
        debug!("write {} <- {:?}", path.display(), text);

        let mut line = text.to_owned();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .map_err(|err| self.kernel_error(&path, err))
    }

    /// Read the full content of a control file under this scope.
    pub fn read_control(&self, rel: impl AsRef<Path>) -> Result<String> {
        let path = self.path(rel);
        std::fs::read_to_string(&path).map_err(|source| Error::Read {
            path: path.display().to_string(),
            source,
        })
    }

    /// Resolve the numeric id of an event against the live event database.
    pub fn resolve_event_id(&self, system: &str, name: &str) -> Result<i32> {
        let rel = Path::new("events").join(system).join(name).join("id");
        if !self.exists(&rel) {
            return Err(Error::EventNotFound {
                system: system.to_owned(),
                name: name.to_owned(),
            });
        }
        let text = self.read_control(&rel)?;
        text.trim().parse().map_err(|_| Error::Kernel {
            path: self.path(&rel).display().to_string(),
            message: format!("unparsable event id {:?}", text.trim()),
        })
    }

    /// Look up the C type of an event field from the event's `format` file.
    /// Only the type tag is extracted; record decoding happens elsewhere.
    pub fn event_field_type(&self, system: &str, name: &str, field: &str) -> Result<String> {
        let rel = Path::new("events").join(system).join(name).join("format");
        let format = self.read_control(rel)?;

        for line in format.lines() {
            let Some(spec) = line.trim().strip_prefix("field:") else {
                continue;
            };
            let Some(decl) = spec.split(';').next() else {
                continue;
            };
            // The field name is the last token of the declaration; strip
            // pointer stars and array brackets before comparing.
            let Some((ty, fname)) = decl.trim().rsplit_once(' ') else {
                continue;
            };
            let fname = fname.trim_start_matches('*');
            let fname = fname.split('[').next().unwrap_or(fname);
            if fname == field {
                return Ok(ty.trim().to_owned());
            }
        }

        Err(Error::Malformed(format!(
            "event {}/{} has no field '{}'",
            system, name, field
        )))
    }

    /// Newest entry of the kernel's error log for this scope, if any.
    pub fn last_error_log_entry(&self) -> Option<String> {
        let text = std::fs::read_to_string(self.path("error_log")).ok()?;
        // Entries start with a bracketed timestamp at the beginning of a
        // line; continuation lines (the echoed command and the caret) do not.
        let start = text
            .rfind("\n[")
            .map(|i| i + 1)
            .or_else(|| text.starts_with('[').then_some(0))?;
        let entry = text[start..].trim_end();
        (!entry.is_empty()).then(|| entry.to_owned())
    }

    fn kernel_error(&self, path: &Path, err: std::io::Error) -> Error {
        let mut message = err.to_string();
        if let Some(entry) = self.last_error_log_entry() {
            message = format!("{}; error_log: {}", message, entry);
        }
        Error::Kernel {
            path: path.display().to_string(),
            message,
        }
    }
}

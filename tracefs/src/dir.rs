//! Tracing directory discovery and scoped control paths

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use nix::unistd::Uid;
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Environment variable overriding tracing-directory discovery.
pub const TRACEFS_DIR_ENV: &str = "TRACEFS_DIR";

/// Well-known tracefs mount points, in probe order.
const MOUNT_CANDIDATES: &[&str] = &["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

static TOP_DIR: OnceCell<PathBuf> = OnceCell::new();

/// Root of one tracing scope: either the top-level tracing directory or the
/// directory of a named instance. Every control path is resolved relative to
/// a `TraceDir`, so independent callers can be isolated by handing them
/// distinct scopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceDir {
    root: PathBuf,
}

impl TraceDir {
    /// The top-level (global) tracing scope.
    ///
    /// Discovery order: `$TRACEFS_DIR`, `/sys/kernel/tracing`,
    /// `/sys/kernel/debug/tracing`, then the mount table. The result is
    /// cached for the lifetime of the process.
    pub fn top() -> Result<Self> {
        let root = TOP_DIR.get_or_try_init(|| {
            let dir = discover()?;
            debug!("using tracing directory {}", dir.display());
            if !Uid::effective().is_root() {
                warn!(
                    "not running as root; writes to {} will likely fail",
                    dir.display()
                );
            }
            Ok::<_, Error>(dir)
        })?;
        Ok(Self { root: root.clone() })
    }

    /// A scope rooted at an arbitrary directory. Used by tests and for
    /// pre-resolved instance directories.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The scope of the named instance under this directory.
    pub fn instance_dir(&self, name: &str) -> TraceDir {
        TraceDir {
            root: self.root.join("instances").join(name),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a control file within this scope.
    pub fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    pub fn exists(&self, rel: impl AsRef<Path>) -> bool {
        self.path(rel).exists()
    }
}

fn discover() -> Result<PathBuf> {
    if let Ok(dir) = env::var(TRACEFS_DIR_ENV) {
        let path = PathBuf::from(&dir);
        if path.is_dir() {
            return Ok(path);
        }
        return Err(Error::NoTracefs(format!("{} (from ${})", dir, TRACEFS_DIR_ENV)));
    }

    for candidate in MOUNT_CANDIDATES {
        let path = Path::new(candidate);
        if path.join("events").is_dir() {
            return Ok(path.to_path_buf());
        }
    }

    // Fall back to scanning the mount table for a tracefs entry.
    let mounts = fs::read_to_string("/proc/mounts")?;
    for line in mounts.lines() {
        let mut parts = line.split_whitespace();
        let (Some(_dev), Some(mount), Some(fstype)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if fstype == "tracefs" {
            return Ok(PathBuf::from(mount));
        }
    }

    Err(Error::NoTracefs(MOUNT_CANDIDATES.join(", ")))
}

//! Tracing instance lifecycle
//!
//! An instance is an isolated tracing namespace with its own buffer and
//! event configuration, created by making a directory under `instances/`.

use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::dir::TraceDir;
use crate::error::{Error, Result};
use crate::resource::KernelResource;

/// Length of auto-generated instance names.
const AUTO_NAME_LEN: usize = 16;

/// Handle to a kernel tracing instance rooted at `instances/NAME`.
#[derive(Debug)]
pub struct Instance {
    name: String,
    dir: TraceDir,
    registered: bool,
    owned: bool,
}

impl Instance {
    /// Create a new instance. A name is generated when none is given; with
    /// `tracing_on == false` the instance starts with tracing switched off.
    pub fn create(top: &TraceDir, name: Option<&str>, tracing_on: bool) -> Result<Instance> {
        let name = name.map(str::to_owned).unwrap_or_else(auto_name);
        let dir = top.instance_dir(&name);

        fs::create_dir(dir.root()).map_err(|err| Error::Kernel {
            path: dir.root().display().to_string(),
            message: format!("failed to create instance '{}': {}", name, err),
        })?;

        let instance = Instance {
            name,
            dir,
            registered: true,
            owned: true,
        };
        if !tracing_on {
            instance.tracing_off()?;
        }
        info!("created tracing instance '{}'", instance.name);
        Ok(instance)
    }

    /// Find an existing instance. The returned handle is detached: whoever
    /// created the instance stays responsible for destroying it.
    pub fn find(top: &TraceDir, name: &str) -> Result<Instance> {
        let dir = top.instance_dir(name);
        if !dir.root().is_dir() {
            return Err(Error::Lifecycle(format!(
                "tracing instance '{}' does not exist",
                name
            )));
        }
        Ok(Instance {
            name: name.to_owned(),
            dir,
            registered: true,
            owned: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The control-file scope of this instance.
    pub fn dir(&self) -> &TraceDir {
        &self.dir
    }

    /// Switch tracing on for this instance.
    pub fn tracing_on(&self) -> Result<()> {
        self.dir.write_control("tracing_on", "1")
    }

    /// Switch tracing off for this instance.
    pub fn tracing_off(&self) -> Result<()> {
        self.dir.write_control("tracing_on", "0")
    }

    pub fn is_tracing(&self) -> Result<bool> {
        Ok(self.dir.read_control("tracing_on")?.trim() == "1")
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Make this handle responsible for destroying the instance. Idempotent.
    pub fn attach(&mut self) {
        self.owned = true;
    }

    /// The instance outlives this handle. Idempotent.
    pub fn detach(&mut self) {
        self.owned = false;
    }

    /// Destroy the kernel instance if this handle owns it. Exactly once.
    pub fn close(&mut self) -> Result<()> {
        if !self.registered {
            return Err(Error::Lifecycle(format!(
                "instance '{}' is already closed",
                self.name
            )));
        }
        if self.owned {
            fs::remove_dir(self.dir.root()).map_err(|err| Error::Kernel {
                path: self.dir.root().display().to_string(),
                message: format!("failed to destroy instance '{}': {}", self.name, err),
            })?;
            info!("destroyed tracing instance '{}'", self.name);
        } else {
            debug!(
                "instance '{}' is detached; leaving the kernel instance alive",
                self.name
            );
        }
        self.registered = false;
        Ok(())
    }
}

impl KernelResource for Instance {
    fn describe(&self) -> String {
        format!("instance {}", self.name)
    }
    fn is_registered(&self) -> bool {
        self.registered
    }
    fn is_owned(&self) -> bool {
        self.owned
    }
    fn attach(&mut self) {
        Instance::attach(self);
    }
    fn detach(&mut self) {
        Instance::detach(self);
    }
    fn teardown(&mut self) -> Result<()> {
        self.close()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.registered && self.owned {
            warn!(
                "tracing instance '{}' dropped without close(); kernel instance leaked",
                self.name
            );
        }
    }
}

/// Scratch name for an unnamed instance: xorshift over an alphanumeric pool,
/// seeded from the wall clock.
fn auto_name() -> String {
    const POOL: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut state = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x5eed)
        | 1;
    (0..AUTO_NAME_LEN)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            POOL[(state % POOL.len() as u64) as usize] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn top() -> (TempDir, TraceDir) {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("instances")).unwrap();
        let dir = TraceDir::at(tmp.path());
        (tmp, dir)
    }

    #[test]
    fn test_auto_name_shape() {
        let name = auto_name();
        assert_eq!(name.len(), AUTO_NAME_LEN);
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_create_and_close() {
        let (tmp, top) = top();
        let mut instance = Instance::create(&top, Some("scratch"), true).unwrap();
        assert!(tmp.path().join("instances/scratch").is_dir());
        assert!(instance.is_owned());

        instance.close().unwrap();
        assert!(!tmp.path().join("instances/scratch").exists());
        assert!(matches!(instance.close(), Err(Error::Lifecycle(_))));
    }

    #[test]
    fn test_duplicate_create_is_kernel_error() {
        let (_tmp, top) = top();
        let mut first = Instance::create(&top, Some("dup"), true).unwrap();
        assert!(matches!(
            Instance::create(&top, Some("dup"), true),
            Err(Error::Kernel { .. })
        ));
        first.close().unwrap();
    }

    #[test]
    fn test_find_returns_detached() {
        let (tmp, top) = top();
        let mut creator = Instance::create(&top, Some("shared"), true).unwrap();

        let mut found = Instance::find(&top, "shared").unwrap();
        assert!(!found.is_owned());

        // Closing the detached handle leaves the kernel instance alive.
        found.close().unwrap();
        assert!(tmp.path().join("instances/shared").is_dir());

        // Re-attach and destroy for real.
        let mut found = Instance::find(&top, "shared").unwrap();
        found.attach();
        found.close().unwrap();
        assert!(!tmp.path().join("instances/shared").exists());

        creator.detach();
        creator.close().unwrap();
    }

    #[test]
    fn test_find_missing_instance() {
        let (_tmp, top) = top();
        assert!(matches!(
            Instance::find(&top, "ghost"),
            Err(Error::Lifecycle(_))
        ));
    }

    #[test]
    fn test_detach_attach_idempotent() {
        let (_tmp, top) = top();
        let mut instance = Instance::create(&top, None, true).unwrap();
        instance.detach();
        instance.detach();
        assert!(!instance.is_owned());
        instance.attach();
        assert!(instance.is_owned());
        instance.close().unwrap();
    }

    #[test]
    fn test_tracing_toggle() {
        let (tmp, top) = top();
        let mut instance = Instance::create(&top, Some("quiet"), true).unwrap();
        // The kernel pre-creates tracing_on inside a new instance; the fake
        // tree needs it seeded before the write lands.
        let switch = tmp.path().join("instances/quiet/tracing_on");
        fs::write(&switch, "1\n").unwrap();

        instance.tracing_off().unwrap();
        assert!(!instance.is_tracing().unwrap());

        // rmdir is the real destruction protocol; clear the seeded file so
        // the fake directory is removable.
        fs::remove_file(&switch).unwrap();
        instance.close().unwrap();
    }
}

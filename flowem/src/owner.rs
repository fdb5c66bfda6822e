//! Ownership of the pinned table.
//!
//! A running daemon writes the live table over the pin file after every reconciliation pass
//! and at shutdown, so edits made to the file behind its back are lost. The daemon publishes
//! its pid next to the pin file for as long as it runs, and administrative commands refuse to
//! edit a pin that a live process owns.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{bail, Context};
use tracing::{debug, warn};

/// Path of the pid file guarding `pin_path`.
pub fn pid_path(pin_path: &Path) -> PathBuf {
    let mut path = pin_path.as_os_str().to_owned();
    path.push(".pid");
    PathBuf::from(path)
}

/// The pid of the live process owning `pin_path`, if any.
pub fn owner(pin_path: &Path) -> Option<u32> {
    let pid: u32 = fs::read_to_string(pid_path(pin_path)).ok()?.trim().parse().ok()?;
    is_alive(pid).then_some(pid)
}

fn is_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }

    // `kill -0` tests for the process without signalling it.
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Claims `pin_path` for this process until dropped.
#[derive(Debug)]
pub struct PinOwner {
    path: PathBuf,
}

impl PinOwner {
    /// Publishes this process as the owner of `pin_path`. Fails if a live process already owns
    /// it; a pid file left behind by a dead process is taken over.
    pub fn acquire(pin_path: &Path) -> anyhow::Result<Self> {
        let path = pid_path(pin_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    debug!(path = %path.display(), "pinned table claimed");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if let Some(pid) = owner(pin_path) {
                        bail!("{} is owned by a running daemon (pid {pid})", pin_path.display());
                    }
                    warn!(path = %path.display(), "removing stale pid file");
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e).with_context(|| format!("failed to remove {}", path.display())),
                    }
                }
                Err(e) => return Err(e).with_context(|| format!("failed to create {}", path.display())),
            }
        }

        bail!("lost the race for {}", path.display())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PinOwner {
    fn drop(&mut self) {
        let ours = fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .is_some_and(|pid| pid == std::process::id());

        if ours {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(err = %e, path = %self.path.display(), "failed to remove pid file");
            }
        }
    }
}

/// Fails if a live process owns `pin_path`.
pub fn ensure_unowned(pin_path: &Path) -> anyhow::Result<()> {
    if let Some(pid) = owner(pin_path) {
        bail!(
            "{} is owned by a running daemon (pid {pid}) and would be overwritten; \
             change the link directory instead, or stop the daemon first",
            pin_path.display()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pin_path(test: &str) -> PathBuf {
        std::env::temp_dir().join(format!("flowem-owner-{test}-{}.pin", std::process::id()))
    }

    #[test]
    fn claim_is_exclusive_and_released_on_drop() {
        let path = pin_path("exclusive");

        let owner = PinOwner::acquire(&path).unwrap();
        assert_eq!(super::owner(&path), Some(std::process::id()));
        assert!(PinOwner::acquire(&path).is_err());
        assert!(ensure_unowned(&path).is_err());

        drop(owner);
        assert_eq!(super::owner(&path), None);
        assert!(!pid_path(&path).exists());
        ensure_unowned(&path).unwrap();
    }

    #[test]
    fn stale_pid_files_are_taken_over() {
        let path = pin_path("stale");
        // Above the kernel's pid limit, so no such process exists.
        fs::write(pid_path(&path), "4194305\n").unwrap();
        assert_eq!(owner(&path), None);

        let claim = PinOwner::acquire(&path).unwrap();
        assert_eq!(fs::read_to_string(claim.path()).unwrap().trim(), std::process::id().to_string());
    }
}

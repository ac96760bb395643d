//! The MAC labeler port (§4.F).
//!
//! Grounded on `examples/original_source/pkg/os-containers/selinux.go`
//! (`selabel_open`/`selabel_lookup_raw`/`lsetfilecon_raw` via cgo). No crate
//! in the pack binds libselinux, so the production implementation shells
//! out to `matchpathcon`/`chcon`, both already named in the teacher's
//! `workspace.metadata.binary-dependencies`.

use std::process::Command;

use anyhow::Result;
use camino::Utf8Path;

use crate::cmdext::CommandRunExt;

/// A MAC labeler handle: open once, label many paths, close.
pub trait Labeler: Send + Sync {
    /// Resolve and set the policy-defined context for `path`. A path that
    /// the policy has no entry for (ENOENT-equivalent) is tolerated, not an
    /// error.
    fn label(&self, path: &Utf8Path) -> Result<()>;
}

/// Production labeler: a no-op unless running as root with SELinux enabled,
/// per the original's `os.Getuid() == 0 && selinux.GetEnabled()` gate.
#[derive(Debug)]
pub struct SelinuxLabeler {
    enabled: bool,
}

impl SelinuxLabeler {
    /// Open a labeler. `privileged` mirrors the euid==0 check; `selinux_enabled`
    /// should come from `/sys/fs/selinux` presence (checked by the caller, to
    /// keep this constructor infallible and easy to fake in tests).
    pub fn open(privileged: bool, selinux_enabled: bool) -> Self {
        Self { enabled: privileged && selinux_enabled }
    }

    /// Is SELinux enforcement active on this host, per `/sys/fs/selinux/enforce`.
    pub fn host_selinux_enabled() -> bool {
        Utf8Path::new("/sys/fs/selinux/enforce").exists()
    }
}

impl Labeler for SelinuxLabeler {
    fn label(&self, path: &Utf8Path) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        // matchpathcon looks up the policy context for `path` based on its
        // mode; a non-zero exit with no match is the ENOENT-equivalent case
        // and is tolerated.
        let lookup = Command::new("matchpathcon").args(["-n", path.as_str()]).output()?;
        if !lookup.status.success() {
            tracing::debug!(%path, "no SELinux context in policy, skipping label");
            return Ok(());
        }
        let context = String::from_utf8_lossy(&lookup.stdout).trim().to_string();
        if context.is_empty() {
            return Ok(());
        }
        Command::new("chcon").args(["-h", &context, path.as_str()]).run()
    }
}

/// No-op labeler for unprivileged or SELinux-disabled hosts.
#[derive(Debug, Default)]
pub struct NullLabeler;

impl Labeler for NullLabeler {
    fn label(&self, _path: &Utf8Path) -> Result<()> {
        Ok(())
    }
}

//! The host supervisor port (§4.E): a thin adapter over systemd.
//!
//! Grounded on `examples/original_source/pkg/os-containers/os_containers.go`
//! (`systemctlCommand`/`systemdTmpFilesCommand`), translated from raw
//! `exec.Command` into [`crate::cmdext::CommandRunExt`].

use std::process::Command;

use anyhow::Result;

use crate::cmdext::CommandRunExt;

/// What `tmpfiles_apply` should do with the tmpfiles snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmpfilesMode {
    /// `systemd-tmpfiles --create <path>`
    Create,
    /// `systemd-tmpfiles --remove <path>`
    Delete,
}

/// The host service-supervisor port.
pub trait Supervisor: Send + Sync {
    /// Is `name` currently active?
    fn is_active(&self, name: &str) -> Result<bool>;
    /// Is `name` in the failed state?
    fn is_failed(&self, name: &str) -> Result<bool>;
    /// Enable `name`'s unit, optionally starting it immediately.
    fn enable(&self, name: &str, start_now: bool) -> Result<()>;
    /// Disable `name`'s unit, optionally stopping it immediately.
    fn disable(&self, name: &str, stop_now: bool) -> Result<()>;
    /// Reload unit files from disk.
    fn daemon_reload(&self) -> Result<()>;
    /// Apply (or tear down) a tmpfiles snippet at `path`.
    fn tmpfiles_apply(&self, path: &camino::Utf8Path, mode: TmpfilesMode) -> Result<()>;
}

/// Production [`Supervisor`] shelling out to `systemctl`/`systemd-tmpfiles`.
/// When the effective UID is non-zero, every invocation gets `--user`,
/// operating on the calling user's service manager instance instead of the
/// system one.
#[derive(Debug, Default)]
pub struct SystemdSupervisor {
    user_scope: bool,
}

impl SystemdSupervisor {
    /// Build a supervisor targeting the user scope if `privileged` is false.
    pub fn new(privileged: bool) -> Self {
        Self { user_scope: !privileged }
    }

    fn systemctl(&self, now: bool) -> Command {
        let mut cmd = Command::new("systemctl");
        if self.user_scope {
            cmd.arg("--user");
        }
        if now {
            cmd.arg("--now");
        }
        cmd
    }

    fn tmpfiles(&self) -> Command {
        let mut cmd = Command::new("systemd-tmpfiles");
        if self.user_scope {
            cmd.arg("--user");
        }
        cmd
    }
}

impl Supervisor for SystemdSupervisor {
    fn is_active(&self, name: &str) -> Result<bool> {
        let mut cmd = self.systemctl(false);
        cmd.args(["is-active", name]);
        Ok(cmd.output()?.status.success())
    }

    fn is_failed(&self, name: &str) -> Result<bool> {
        let mut cmd = self.systemctl(false);
        cmd.args(["is-failed", name]);
        Ok(cmd.output()?.status.success())
    }

    fn enable(&self, name: &str, start_now: bool) -> Result<()> {
        let mut cmd = self.systemctl(start_now);
        cmd.args(["enable", name]);
        tracing::debug!(name, start_now, "systemctl enable");
        cmd.run()
    }

    fn disable(&self, name: &str, stop_now: bool) -> Result<()> {
        let mut cmd = self.systemctl(stop_now);
        cmd.args(["disable", name]);
        tracing::debug!(name, stop_now, "systemctl disable");
        cmd.run()
    }

    fn daemon_reload(&self) -> Result<()> {
        let mut cmd = self.systemctl(false);
        cmd.arg("daemon-reload");
        tracing::debug!("systemctl daemon-reload");
        cmd.run()
    }

    fn tmpfiles_apply(&self, path: &camino::Utf8Path, mode: TmpfilesMode) -> Result<()> {
        let flag = match mode {
            TmpfilesMode::Create => "--create",
            TmpfilesMode::Delete => "--remove",
        };
        let mut cmd = self.tmpfiles();
        cmd.arg(flag).arg(path.as_str());
        tracing::debug!(%path, ?mode, "systemd-tmpfiles");
        cmd.run()
    }
}

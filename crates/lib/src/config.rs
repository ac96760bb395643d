//! Resolution of environment variables and on-disk paths (§6).
//!
//! Every path the engine touches is resolved through here rather than
//! hardcoded at the call site, mirroring the teacher's `composefs_consts`
//! module of path constants.

use camino::{Utf8Path, Utf8PathBuf};

/// Is the current process running as root (the "privileged" mode of §6)?
pub fn is_privileged() -> bool {
    rustix::process::geteuid().is_root()
}

/// `$HOME`, falling back to the empty string (callers that need it are
/// already running unprivileged, where `HOME` is expected to be set).
pub(crate) fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_default()
}

fn xdg_data_home() -> Utf8PathBuf {
    if let Ok(dir) = std::env::var("XDG_DATA_HOME") {
        if !dir.is_empty() {
            return Utf8PathBuf::from(dir);
        }
    }
    Utf8Path::new(&home_dir()).join(".local/share")
}

/// Root directory under which the object repository and checkouts live.
fn storage_root() -> Utf8PathBuf {
    if is_privileged() {
        Utf8PathBuf::from("/var/lib/containers/atomic")
    } else {
        xdg_data_home().join("containers/atomic")
    }
}

/// Path to the content-addressed object repository, honoring `OSTREE_REPO`.
pub fn repo_path() -> Utf8PathBuf {
    if let Ok(p) = std::env::var("OSTREE_REPO") {
        if !p.is_empty() {
            return Utf8PathBuf::from(p);
        }
    }
    storage_root().join(".storage/repo")
}

/// Path to the directory holding per-container deployment slots, honoring
/// `OS_CONTAINERS_CHECKOUT_PATH`.
pub fn checkouts_path() -> Utf8PathBuf {
    if let Ok(p) = std::env::var("OS_CONTAINERS_CHECKOUT_PATH") {
        if !p.is_empty() {
            return Utf8PathBuf::from(p);
        }
    }
    storage_root()
}

/// Path to the OCI runtime binary, honoring `RUNTIME`.
pub fn runtime_path() -> Utf8PathBuf {
    if let Ok(p) = std::env::var("RUNTIME") {
        if !p.is_empty() {
            return Utf8PathBuf::from(p);
        }
    }
    Utf8PathBuf::from("/usr/bin/runc")
}

/// Directory the host supervisor reads unit files from.
pub fn systemd_unit_dir() -> Utf8PathBuf {
    if is_privileged() {
        Utf8PathBuf::from("/etc/systemd/system")
    } else {
        Utf8Path::new(&home_dir()).join(".config/systemd/user")
    }
}

/// Directory the host supervisor reads tmpfiles.d fragments from.
pub fn tmpfiles_dir() -> Utf8PathBuf {
    if is_privileged() {
        Utf8PathBuf::from("/etc/tmpfiles.d")
    } else if let Ok(dir) = std::env::var("XDG_DATA_DIR") {
        if !dir.is_empty() {
            return Utf8Path::new(&dir).join("containers/tmpfiles");
        } else {
            Utf8Path::new(&home_dir()).join(".containers/tmpfiles")
        }
    } else {
        Utf8Path::new(&home_dir()).join(".containers/tmpfiles")
    }
}

/// `$XDG_RUNTIME_DIR`, falling back to `/run/user/<euid>`. Used both for the
/// amended `RUN_DIRECTORY` template value and as a generic runtime scratch root.
pub fn xdg_runtime_dir() -> Utf8PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !dir.is_empty() {
            return Utf8PathBuf::from(dir);
        }
    }
    Utf8PathBuf::from(format!(
        "/run/user/{}",
        rustix::process::geteuid().as_raw()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_path_honors_env_override() {
        temp_env::with_var("OSTREE_REPO", Some("/tmp/myrepo"), || {
            assert_eq!(repo_path(), Utf8PathBuf::from("/tmp/myrepo"));
        });
    }
}

#[cfg(test)]
mod temp_env {
    //! Minimal scoped-env-var helper so tests don't race each other via
    //! global process environment. Not a general-purpose abstraction;
    //! just enough for this module's single-threaded test.
    use std::sync::Mutex;

    static LOCK: Mutex<()> = Mutex::new(());

    /// Run `f` with `key` set to `value` (or unset if `None`), then restore it.
    pub fn with_var<F: FnOnce()>(key: &str, value: Option<&str>, f: F) {
        let _guard = LOCK.lock().unwrap();
        let prev = std::env::var(key).ok();
        match value {
            Some(v) => std::env::set_var(key, v),
            None => std::env::remove_var(key),
        }
        f();
        match prev {
            Some(v) => std::env::set_var(key, v),
            None => std::env::remove_var(key),
        }
    }
}

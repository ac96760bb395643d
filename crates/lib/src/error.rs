//! The fixed error taxonomy surfaced across the install/update/rollback/uninstall
//! state machine. Internal plumbing uses [`anyhow::Error`] with `.context()`;
//! this enum is attached at the points the specification names a specific kind,
//! and is what the CLI layer inspects to decide on a user-facing message.

use std::fmt;

/// One of the fixed error kinds a caller can distinguish by `downcast_ref`.
#[derive(thiserror::Error, Debug)]
pub enum SysContainerError {
    /// A CLI argument or `--set KEY=VAL` entry was malformed.
    InvalidArgs(String),
    /// `install` targeted a name that already has a checkout directory.
    AlreadyExists(String),
    /// A container record, slot, or branch was not found.
    NotFound(String),
    /// An image reference has no branch in the repo and fetching was not attempted or failed.
    ImageNotFound(String),
    /// A manifest failed to parse or named no layers.
    BadManifest(String),
    /// The template engine hit an unknown variable or a malformed `$`-escape.
    BadTemplate(String),
    /// The object repository backend failed.
    RepoFailure(String),
    /// The host supervisor (systemd) failed.
    SupervisorFailure(String),
    /// A filesystem operation failed outside of the above categories.
    FsFailure(String),
    /// Invoking the OCI runtime binary failed.
    RuntimeFailure(String),
    /// The requested operation is not supported given the current state,
    /// e.g. `run` on a throwaway image that exports host files.
    UnsupportedState(String),
}

impl fmt::Display for SysContainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, msg) = match self {
            Self::InvalidArgs(m) => ("invalid arguments", m),
            Self::AlreadyExists(m) => ("already exists", m),
            Self::NotFound(m) => ("not found", m),
            Self::ImageNotFound(m) => ("image not found", m),
            Self::BadManifest(m) => ("bad manifest", m),
            Self::BadTemplate(m) => ("bad template", m),
            Self::RepoFailure(m) => ("repo failure", m),
            Self::SupervisorFailure(m) => ("supervisor failure", m),
            Self::FsFailure(m) => ("filesystem failure", m),
            Self::RuntimeFailure(m) => ("runtime failure", m),
            Self::UnsupportedState(m) => ("unsupported state", m),
        };
        write!(f, "{kind}: {msg}")
    }
}

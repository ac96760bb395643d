//! Production [`super::ObjectRepo`] backed by libostree, via the `ostree`
//! and `glib` crates.
//!
//! Grounded on `examples/original_source/pkg/os-containers/ostree.go` (the
//! cgo bindings this module replaces one-for-one) and on the checkout-options
//! pattern in `examples/lukewarmtemp-ostree-rs-ext/lib/src/tar/write.rs`.

use std::collections::HashMap;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;
use fn_error_context::context;
use ostree::gio;
use ostree::prelude::*;

use crate::error::SysContainerError;

/// A libostree repository opened (or created) at a filesystem path.
pub struct OstreeRepo {
    inner: ostree::Repo,
}

impl std::fmt::Debug for OstreeRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OstreeRepo").field("path", &self.inner.path()).finish()
    }
}

impl OstreeRepo {
    /// Open an existing repo at `path`. Fails if the directory isn't an
    /// initialized ostree repo.
    #[context("opening object repo at {path}")]
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let gpath = gio::File::for_path(path.as_std_path());
        let repo = ostree::Repo::new(&gpath);
        repo.open(gio::Cancellable::NONE)
            .map_err(|e| SysContainerError::RepoFailure(e.to_string()))?;
        Ok(Self { inner: repo })
    }

    /// Open the repo at `path`, creating and initializing it first if
    /// missing. `bare-user` mode is used for unprivileged processes (the
    /// common case for a per-user repo under `$HOME`), archive-less bare
    /// mode otherwise.
    #[context("ensuring object repo at {path}")]
    pub fn ensure(path: &Utf8Path, privileged: bool) -> Result<Self> {
        if path.join("config").exists() {
            return Self::open(path);
        }
        std::fs::create_dir_all(path).with_context(|| format!("creating {path}"))?;
        let gpath = gio::File::for_path(path.as_std_path());
        let repo = ostree::Repo::new(&gpath);
        let mode = if privileged { ostree::RepoMode::Bare } else { ostree::RepoMode::BareUser };
        repo.create(mode, gio::Cancellable::NONE)
            .map_err(|e| SysContainerError::RepoFailure(e.to_string()))?;
        Ok(Self { inner: repo })
    }

    fn resolve_opt(&self, reference: &str) -> Result<Option<String>> {
        self.inner
            .resolve_rev(reference, true)
            .map(|g| g.map(|s| s.to_string()))
            .map_err(|e| SysContainerError::RepoFailure(e.to_string()).into())
    }
}

impl super::ObjectRepo for OstreeRepo {
    fn list_branches(&self, prefix: &str) -> Result<HashMap<String, String>> {
        let refs = self
            .inner
            .list_refs(Some(prefix), gio::Cancellable::NONE)
            .map_err(|e| SysContainerError::RepoFailure(e.to_string()))?;
        let mut out = HashMap::with_capacity(refs.len());
        let strip = format!("{prefix}/");
        for (full_ref, commit) in refs {
            let short = full_ref.strip_prefix(strip.as_str()).unwrap_or(&full_ref);
            out.insert(short.to_string(), commit);
        }
        Ok(out)
    }

    fn has_branch(&self, branch: &str) -> Result<bool> {
        Ok(self.resolve_opt(branch)?.is_some())
    }

    fn resolve(&self, branch: &str) -> Result<String> {
        self.resolve_opt(branch)?
            .ok_or_else(|| SysContainerError::NotFound(branch.to_string()).into())
    }

    fn read_metadata(&self, branch: &str, key: &str) -> Result<(bool, String)> {
        let Some(commit) = self.resolve_opt(branch)? else {
            return Ok((false, String::new()));
        };
        let variant = self
            .inner
            .load_variant(ostree::ObjectType::Commit, &commit)
            .map_err(|e| SysContainerError::RepoFailure(e.to_string()))?;
        let metadata = variant.child_value(0);
        let Some(value) = metadata.lookup_value(key, None) else {
            return Ok((false, String::new()));
        };
        let s = value
            .str()
            .ok_or_else(|| SysContainerError::RepoFailure(format!("metadata key {key} is not a string")))?;
        Ok((true, s.to_string()))
    }

    fn set_branch(&self, branch: &str, commit: &str) -> Result<()> {
        self.inner
            .set_ref_immediate(None, branch, Some(commit), gio::Cancellable::NONE)
            .map_err(|e| SysContainerError::RepoFailure(e.to_string()))?;
        Ok(())
    }

    fn delete_branch(&self, branch: &str) -> Result<()> {
        self.inner
            .set_ref_immediate(None, branch, None, gio::Cancellable::NONE)
            .map_err(|e| SysContainerError::RepoFailure(e.to_string()))?;
        Ok(())
    }

    fn union_checkout(
        &self,
        layer_short_name: &str,
        dest_dir: &Dir,
        dest_path: &Utf8Path,
    ) -> Result<()> {
        let branch = super::layer_branch(layer_short_name);
        let commit = self.resolve(&branch)?;
        let euid_is_root = rustix::process::geteuid().is_root();
        let opts = ostree::RepoCheckoutAtOptions {
            mode: if euid_is_root { ostree::RepoCheckoutMode::None } else { ostree::RepoCheckoutMode::User },
            overwrite_mode: ostree::RepoCheckoutOverwriteMode::UnionFiles,
            ..Default::default()
        };
        self.inner
            .checkout_at(
                Some(&opts),
                dest_dir.as_fd_owned_int(),
                dest_path.as_str(),
                &commit,
                gio::Cancellable::NONE,
            )
            .map_err(|e| SysContainerError::RepoFailure(e.to_string()))?;
        Ok(())
    }

    fn prune(&self) -> Result<u64> {
        let (_objects_total, _objects_pruned, freed) = self
            .inner
            .prune(ostree::RepoPruneFlags::REFS_ONLY, 0, gio::Cancellable::NONE)
            .map_err(|e| SysContainerError::RepoFailure(e.to_string()))?;
        Ok(freed as u64)
    }
}

/// `cap_std::fs::Dir` exposes a borrowed fd; libostree's `checkout_at` wants
/// a raw fd for `AT_FDCWD`-relative use.
trait DirFdExt {
    fn as_fd_owned_int(&self) -> i32;
}

impl DirFdExt for Dir {
    fn as_fd_owned_int(&self) -> i32 {
        use std::os::fd::AsRawFd;
        self.as_raw_fd()
    }
}

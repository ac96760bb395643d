//! The object-repo port (§4.D): open/create the repository, resolve and
//! mutate branches, read commit metadata, union-checkout a layer, and
//! prune unreferenced objects.
//!
//! This is a narrow trait — [`ObjectRepo`] — with a production
//! implementation backed by libostree ([`ostree_repo::OstreeRepo`]) and an
//! in-memory test double ([`memory::MemRepo`]), per the redesign note in
//! §9 ("native FFI behind a narrow repo port").

mod memory;
mod ostree_repo;

use std::collections::HashMap;

use anyhow::Result;
use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;

pub use memory::MemRepo;
pub use ostree_repo::OstreeRepo;

/// Branch namespace shared by image and layer branches.
pub const BRANCH_PREFIX: &str = "ociimage";

/// Commit metadata key holding the raw image manifest JSON.
pub const META_MANIFEST: &str = "docker.manifest";

/// Commit metadata key holding the decimal uncompressed size of a single layer.
pub const META_UNCOMPRESSED_SIZE: &str = "docker.uncompressed_size";

/// Commit metadata key holding the image digest (`sha256:...`), written by the fetch port.
pub const META_DIGEST: &str = "docker.digest";

/// Build the `ociimage/<encoded-reference>` branch name for an image.
pub fn image_branch(encoded_reference: &str) -> String {
    format!("{BRANCH_PREFIX}/{encoded_reference}")
}

/// Build the `ociimage/<digest-hex>` branch name for a single layer.
pub fn layer_branch(digest_hex: &str) -> String {
    format!("{BRANCH_PREFIX}/{digest_hex}")
}

/// Is `short_name` (the part of a branch after `ociimage/`) a layer digest,
/// i.e. 64 lowercase hex characters? Any other short name identifies a
/// top-level image.
pub fn is_layer_short_name(short_name: &str) -> bool {
    short_name.len() == 64
        && short_name.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// The object-repo port. All operations that mutate or walk native repo
/// state are intended to run on the dedicated thread owned by
/// [`crate::blocking::RepoWorker`].
pub trait ObjectRepo: Send + Sync {
    /// List every branch under `ociimage/`, keyed by the short name after the prefix.
    fn list_branches(&self, prefix: &str) -> Result<HashMap<String, String>>;
    /// Does `branch` currently resolve to a commit?
    fn has_branch(&self, branch: &str) -> Result<bool>;
    /// Resolve `branch` to its commit checksum (hex).
    fn resolve(&self, branch: &str) -> Result<String>;
    /// Read a metadata key from the commit `branch` resolves to. A missing
    /// commit is not an error; it returns `(false, "")`.
    fn read_metadata(&self, branch: &str, key: &str) -> Result<(bool, String)>;
    /// Point `branch` at `commit`, creating or replacing it.
    fn set_branch(&self, branch: &str, commit: &str) -> Result<()>;
    /// Remove `branch` entirely.
    fn delete_branch(&self, branch: &str) -> Result<()>;
    /// Materialize the layer named by `layer_short_name` on top of whatever
    /// exists at `dest_path` under `dest_dir`, with later-layer-wins union
    /// semantics at file granularity.
    fn union_checkout(
        &self,
        layer_short_name: &str,
        dest_dir: &Dir,
        dest_path: &Utf8Path,
    ) -> Result<()>;
    /// Garbage-collect unreachable objects. Returns bytes freed.
    fn prune(&self) -> Result<u64>;
}

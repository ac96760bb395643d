//! The fetch port (§6, port H): populate the object repo with an image by
//! reference. Explicitly out of scope per §1 ("the OCI image
//! fetch/transport/signature-verification pipeline... assumed available as
//! a primitive"); this module defines the narrow port the deployment engine
//! calls through and a production adapter over `skopeo`, already named in
//! the teacher's `workspace.metadata.binary-dependencies`.

use anyhow::{Context, Result};

use crate::cmdext::CommandRunExt;

/// Populate the object repo with the image named by `reference`, creating
/// or updating the `ociimage/<encoded-reference>` branch and every layer
/// branch it depends on. Implementations are expected to be idempotent.
pub trait FetchPort: Send + Sync {
    fn fetch(&self, reference: &str) -> Result<()>;

    /// As [`Self::fetch`], but skip TLS verification against the source
    /// registry (`pull --insecure`). Default implementation just calls
    /// `fetch`; adapters that can't reach an insecure registry without
    /// extra flags should override it.
    fn fetch_insecure(&self, reference: &str) -> Result<()> {
        self.fetch(reference)
    }
}

/// Default [`FetchPort`]: shells out to `skopeo copy` against an
/// `ostree:` destination transport targeting the configured repo.
#[derive(Debug)]
pub struct SkopeoFetch {
    repo_path: camino::Utf8PathBuf,
}

impl SkopeoFetch {
    /// Build a fetcher targeting the object repo at `repo_path`.
    pub fn new(repo_path: impl Into<camino::Utf8PathBuf>) -> Self {
        Self { repo_path: repo_path.into() }
    }

    fn normalize(reference: &str) -> String {
        if reference.contains("://") {
            reference.to_string()
        } else {
            format!("docker://{reference}")
        }
    }
}

impl FetchPort for SkopeoFetch {
    fn fetch(&self, reference: &str) -> Result<()> {
        let src = Self::normalize(reference);
        let dest = format!("ostree:{}@{}", reference, self.repo_path);
        tracing::info!(%src, %dest, "fetching image");
        std::process::Command::new("skopeo")
            .args(["copy", &src, &dest])
            .run()
            .with_context(|| format!("fetching {reference}"))
    }

    fn fetch_insecure(&self, reference: &str) -> Result<()> {
        let src = Self::normalize(reference);
        let dest = format!("ostree:{}@{}", reference, self.repo_path);
        tracing::info!(%src, %dest, "fetching image (insecure)");
        std::process::Command::new("skopeo")
            .args(["copy", "--src-tls-verify=false", &src, &dest])
            .run()
            .with_context(|| format!("fetching {reference} insecurely"))
    }
}

/// Test double: records which references were requested and lets the test
/// pre-seed the repo as if the fetch had already happened.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Records every reference passed to `fetch` instead of calling out.
    #[derive(Debug, Default)]
    pub struct FakeFetch {
        /// References requested so far, in order.
        pub requested: Mutex<Vec<String>>,
    }

    impl FetchPort for FakeFetch {
        fn fetch(&self, reference: &str) -> Result<()> {
            self.requested.lock().unwrap().push(reference.to_string());
            Ok(())
        }
    }

    #[test]
    fn records_requested_reference() {
        let fetch = FakeFetch::default();
        fetch.fetch("quay.io/example/app:latest").unwrap();
        assert_eq!(*fetch.requested.lock().unwrap(), vec!["quay.io/example/app:latest"]);
    }
}

/// Normalize a bare reference (no transport prefix) to `docker://...`, per §3.
pub fn normalize_reference(reference: &str) -> String {
    if reference.contains("://") {
        reference.to_string()
    } else {
        format!("docker://{reference}")
    }
}

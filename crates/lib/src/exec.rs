//! The execution dispatcher (§4.K): `run` against a live container's
//! supervisor-managed unit, or a throwaway bundle synthesized from an
//! installed-but-stopped container's slot, or from a bare image reference.
//!
//! Grounded on `examples/original_source/pkg/os-containers/exec.go`
//! (`RunContainer`); its not-running fallback has unreachable code after an
//! early return per §9(c), so the one-shot bundle synthesis below follows
//! §4.K's description rather than the source's dead branch.

use std::collections::BTreeMap;
use std::io::IsTerminal as _;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use oci_spec::runtime::Spec;

use crate::cmdext::CommandRunExt;
use crate::deploy::Engine;
use crate::error::SysContainerError;
use crate::record::Slot;
use crate::repo;
use crate::store;
use crate::supervisor::{Supervisor, TmpfilesMode};

impl Engine {
    /// Run `argv` against `target`.
    ///
    /// If no checkout named `target` exists, `target` is treated as an
    /// image reference and run once from a throwaway bundle; `set` must be
    /// empty in that case too, since a transient run has no persisted
    /// record to merge values into. Otherwise `target` must name an
    /// installed container, `set` must be empty, and the container is
    /// either `exec`'d into (if running) or started as a one-shot bundle
    /// built from its slot's `config.json` (if not).
    pub fn run(&self, target: &str, argv: &[String], set: &BTreeMap<String, String>) -> Result<()> {
        let checkouts = self.checkouts_dir()?;
        if !store::exists(&checkouts, target) {
            return self.run_transient_image(target, argv, set);
        }

        if !set.is_empty() {
            return Err(SysContainerError::InvalidArgs(
                "--set is not supported when running an already-installed container".to_string(),
            )
            .into());
        }

        // Confirms the record is readable before we commit to either branch below.
        store::read(&checkouts, target, None)?;
        let slot = self.current_slot(target)?;
        let unit = format!("{target}.service");

        if self.supervisor.is_active(&unit).unwrap_or(false) {
            let mut cmd = std::process::Command::new(self.runtime.as_str());
            cmd.arg("exec");
            if std::io::stdout().is_terminal() {
                cmd.arg("-t");
            }
            cmd.arg(target).args(argv);
            return cmd.run().with_context(|| format!("exec into {target}"));
        }

        let slot_dir = self.slot_dir(target, slot);
        let tmpfiles = self.tmpfiles_dir.join(format!("{target}.conf"));
        let tmpfiles = tmpfiles.exists().then_some(tmpfiles);
        self.run_one_shot_bundle(&slot_dir.join("config.json"), &slot_dir.join("rootfs"), argv, tmpfiles.as_deref())
    }

    fn run_transient_image(&self, image: &str, argv: &[String], set: &BTreeMap<String, String>) -> Result<()> {
        if !set.is_empty() {
            return Err(SysContainerError::InvalidArgs(
                "--set is not supported when running a throwaway image".to_string(),
            )
            .into());
        }

        let branch = Engine::image_branch(image);
        if !self.repo.has_branch(&branch)? {
            self.fetch.fetch(image)?;
        }
        let (found, digest) = self.repo.read_metadata(&branch, repo::META_DIGEST)?;
        if !found {
            return Err(SysContainerError::BadManifest(format!("{branch} has no recorded digest")).into());
        }
        let revision = digest.strip_prefix("sha256:").unwrap_or(&digest).to_string();

        // A scratch slot, reusing the same slot-directory machinery as
        // install/update; torn down unconditionally once the run finishes.
        let scratch_name = format!("tmp-run-{}", uuid::Uuid::new_v4());
        let slot = Slot(0);
        let _record = self.build_slot(&branch, &scratch_name, image, &revision, &BTreeMap::new(), slot)?;
        let slot_dir = self.slot_dir(&scratch_name, slot);
        let rootfs = slot_dir.join("rootfs");

        let result = self.run_transient_slot(&scratch_name, &slot_dir, &rootfs, argv);
        let _ = std::fs::remove_dir_all(&slot_dir);
        result
    }

    fn run_transient_slot(&self, scratch_name: &str, slot_dir: &Utf8Path, rootfs: &Utf8Path, argv: &[String]) -> Result<()> {
        if rootfs.join("exports/hostfs").exists() {
            return Err(SysContainerError::UnsupportedState(
                "image exports host files; install it instead of running it transiently".to_string(),
            )
            .into());
        }

        let tmpfiles = slot_dir.join(format!("tmpfiles-{scratch_name}.conf"));
        let tmpfiles = tmpfiles.exists().then_some(tmpfiles);
        self.run_one_shot_bundle(&slot_dir.join("config.json"), rootfs, argv, tmpfiles.as_deref())
    }

    /// Load `config_src`, override `process.args`/`process.terminal`/
    /// `root.path`, write the result to a fresh temp bundle directory
    /// alongside a symlink-free copy of `rootfs`'s path, apply `tmpfiles`
    /// if given, and `runtime run` the bundle.
    fn run_one_shot_bundle(&self, config_src: &Utf8Path, rootfs: &Utf8Path, argv: &[String], tmpfiles: Option<&Utf8Path>) -> Result<()> {
        let mut spec: Spec =
            Spec::load(config_src.as_std_path()).with_context(|| format!("loading runtime spec {config_src}"))?;

        let mut process = spec.process().clone().unwrap_or_default();
        process.set_args(Some(argv.to_vec()));
        process.set_terminal(Some(std::io::stdout().is_terminal()));
        spec.set_process(Some(process));

        let rootfs_real = std::fs::canonicalize(rootfs).with_context(|| format!("resolving {rootfs}"))?;
        let mut root = spec.root().clone().unwrap_or_default();
        root.set_path(rootfs_real);
        spec.set_root(Some(root));

        let bundle_dir = tempfile::Builder::new()
            .prefix("sysc-run-")
            .tempdir()
            .context("creating one-shot bundle directory")?;
        let bundle_path = Utf8PathBuf::try_from(bundle_dir.path().to_path_buf()).context("non-UTF-8 temp bundle path")?;
        spec.save(bundle_path.join("config.json").as_std_path())
            .with_context(|| format!("writing one-shot bundle config to {bundle_path}"))?;

        if let Some(tmpfiles) = tmpfiles {
            self.supervisor.tmpfiles_apply(tmpfiles, TmpfilesMode::Create)?;
        }

        let mut cmd = std::process::Command::new(self.runtime.as_str());
        cmd.arg("run").arg(bundle_path.as_str());
        cmd.run().with_context(|| format!("running one-shot bundle {bundle_path}"))
    }
}

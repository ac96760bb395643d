//! The deployment engine (§4.I): the atomic install/update/rollback/
//! uninstall state machine, host-file projection, and A/B slot selection.
//!
//! Grounded on `examples/original_source/pkg/os-containers/install.go`
//! (`InstallContainer`/`UpdateContainer`/`RollbackContainer`/
//! `UninstallContainer`) and `manifest.go` (`checkoutContainerTo`,
//! `makeDeploymentActive`, `copyFilesToHost`), with the corrected
//! flip-before-teardown ordering and logging mandated by §9's open
//! questions (a) and (b).

use std::collections::BTreeMap;
use std::io::Read as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use openssl::hash::{Hasher, MessageDigest};

use crate::blocking::RepoWorker;
use crate::config;
use crate::error::SysContainerError;
use crate::fetch::FetchPort;
use crate::labeler::Labeler;
use crate::manifest;
use crate::record::{ContainerManifest, ContainerRecord, Slot};
use crate::refcodec;
use crate::repo::{self, ObjectRepo};
use crate::store;
use crate::supervisor::{Supervisor, TmpfilesMode};
use crate::template;

const DEFAULT_SERVICE_UNIT: &str = "\n\
[Unit]\n\
Description=$NAME\n\
\n\
[Service]\n\
ExecStartPre=$EXEC_STARTPRE\n\
ExecStart=$EXEC_START\n\
ExecStop=$EXEC_STOP\n\
ExecStopPost=$EXEC_STOPPOST\n\
Restart=on-failure\n\
WorkingDirectory=$DESTDIR\n\
PIDFile=$PIDFILE\n\
\n\
[Install]\n\
WantedBy=multi-user.target\n";

/// The deployment engine: owns the repo/supervisor/labeler/fetch ports and
/// the on-disk locations everything is rooted under.
pub struct Engine {
    pub(crate) repo: Arc<dyn ObjectRepo>,
    pub(crate) worker: RepoWorker,
    pub(crate) supervisor: Arc<dyn Supervisor>,
    pub(crate) labeler: Arc<dyn Labeler>,
    pub(crate) fetch: Arc<dyn FetchPort>,
    pub(crate) checkouts_path: Utf8PathBuf,
    pub(crate) unit_dir: Utf8PathBuf,
    pub(crate) tmpfiles_dir: Utf8PathBuf,
    pub(crate) privileged: bool,
    pub(crate) runtime: Utf8PathBuf,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("checkouts_path", &self.checkouts_path)
            .field("privileged", &self.privileged)
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine from its constituent ports and on-disk locations.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn ObjectRepo>,
        supervisor: Arc<dyn Supervisor>,
        labeler: Arc<dyn Labeler>,
        fetch: Arc<dyn FetchPort>,
        checkouts_path: Utf8PathBuf,
        unit_dir: Utf8PathBuf,
        tmpfiles_dir: Utf8PathBuf,
        privileged: bool,
        runtime: Utf8PathBuf,
    ) -> Self {
        Self {
            repo,
            worker: RepoWorker::spawn(),
            supervisor,
            labeler,
            fetch,
            checkouts_path,
            unit_dir,
            tmpfiles_dir,
            privileged,
            runtime,
        }
    }

    /// The underlying object-repo port, for callers (the CLI's `images`
    /// subcommands) that need repo-level operations the engine itself
    /// doesn't expose.
    pub(crate) fn repo_ref(&self) -> &dyn ObjectRepo {
        self.repo.as_ref()
    }

    /// The underlying supervisor port, for status queries outside the
    /// install/update/rollback/uninstall state machine.
    pub(crate) fn supervisor_ref(&self) -> &dyn Supervisor {
        self.supervisor.as_ref()
    }

    /// The underlying fetch port, for `pull` (which populates the repo
    /// without deploying anything).
    pub(crate) fn fetch_ref(&self) -> &dyn FetchPort {
        self.fetch.as_ref()
    }

    pub(crate) fn checkouts_dir(&self) -> Result<Dir> {
        std::fs::create_dir_all(&self.checkouts_path)
            .with_context(|| format!("creating {}", self.checkouts_path))?;
        Dir::open_ambient_dir(self.checkouts_path.as_std_path(), cap_std_ext::cap_std::ambient_authority())
            .with_context(|| format!("opening {}", self.checkouts_path))
    }

    pub(crate) fn slot_dir(&self, name: &str, slot: Slot) -> Utf8PathBuf {
        self.checkouts_path.join(format!("{name}.{slot}"))
    }

    pub(crate) fn active_symlink(&self, name: &str) -> Utf8PathBuf {
        self.checkouts_path.join(name)
    }

    /// `docker://...` branch for `reference`, normalizing a bare string per §3.
    pub(crate) fn image_branch(reference: &str) -> String {
        let normalized = crate::fetch::normalize_reference(reference);
        repo::image_branch(&refcodec::encode(&normalized))
    }

    /// Read the slot number a container's active symlink currently points at.
    pub(crate) fn current_slot(&self, name: &str) -> Result<Slot> {
        let link = self.active_symlink(name);
        let target = std::fs::read_link(&link).with_context(|| format!("reading {link}"))?;
        let target = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SysContainerError::FsFailure(format!("invalid symlink target for {name}")))?;
        let suffix = target
            .rsplit_once('.')
            .map(|(_, s)| s)
            .ok_or_else(|| SysContainerError::FsFailure(format!("invalid checkout name {target}")))?;
        match suffix {
            "0" => Ok(Slot(0)),
            "1" => Ok(Slot(1)),
            other => Err(SysContainerError::FsFailure(format!("invalid slot suffix {other}")).into()),
        }
    }

    /// Install `image` (a reference, normalized per §3) under `name`
    /// (defaulted per §6 if absent), merging `set` over image defaults.
    pub fn install(&self, image: &str, name: Option<&str>, set: &BTreeMap<String, String>) -> Result<()> {
        let name = match name {
            Some(n) => n.to_string(),
            None => default_container_name(image),
        };

        let checkouts = self.checkouts_dir()?;
        if store::exists(&checkouts, &name) {
            return Err(SysContainerError::AlreadyExists(name).into());
        }

        let branch = Self::image_branch(image);
        if !self.repo.has_branch(&branch)? {
            self.fetch.fetch(image)?;
        }

        let (found, digest) = self.repo.read_metadata(&branch, repo::META_DIGEST)?;
        if !found {
            return Err(SysContainerError::BadManifest(format!("{branch} has no recorded digest")).into());
        }
        let revision = digest.strip_prefix("sha256:").unwrap_or(&digest).to_string();

        let slot = Slot(0);
        let outcome = self.build_slot(&branch, &name, image, &revision, set, slot)?;

        self.activate_slot(&name, slot, outcome, false)
    }

    /// Update `name` to the next slot, rebasing onto a different image if `rebase` is given.
    pub fn update(&self, name: &str, set: &BTreeMap<String, String>, rebase: Option<&str>) -> Result<()> {
        let checkouts = self.checkouts_dir()?;
        let current_record = store::read(&checkouts, name, None)?;
        let current_slot = self.current_slot(name)?;
        let next_slot = current_slot.flip();

        let image = rebase.unwrap_or(&current_record.image).to_string();
        let branch = Self::image_branch(&image);
        if !self.repo.has_branch(&branch)? {
            return Err(SysContainerError::ImageNotFound(image).into());
        }

        let (found, digest) = self.repo.read_metadata(&branch, repo::META_DIGEST)?;
        if !found {
            return Err(SysContainerError::BadManifest(format!("{branch} has no recorded digest")).into());
        }
        let revision = digest.strip_prefix("sha256:").unwrap_or(&digest).to_string();

        if revision == current_record.revision && set.is_empty() {
            tracing::info!("latest version already deployed");
            return Ok(());
        }

        let mut merged_set = current_record.values.clone();
        merged_set.extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));

        let outcome = self.build_slot(&branch, name, &image, &revision, &merged_set, next_slot)?;

        let service_active = self.supervisor.is_active(&format!("{name}.service")).unwrap_or(false);

        // §9(b): flip the symlink before tearing down the old slot, not after
        // (the source does the reverse, which can strand an active container
        // with no symlink if teardown fails partway through). The new slot's
        // unit now owns `{name}.service`, so teardown of the old slot must
        // not remove it.
        self.activate_slot(name, next_slot, outcome, false)?;
        self.teardown_active(name, &current_record, false)?;

        if service_active {
            self.supervisor.enable(&format!("{name}.service"), true)?;
        }
        Ok(())
    }

    /// Roll back to the previously active slot, which must still exist.
    pub fn rollback(&self, name: &str) -> Result<()> {
        let checkouts = self.checkouts_dir()?;
        let current_record = store::read(&checkouts, name, None)?;
        let current_slot = self.current_slot(name)?;
        let next_slot = current_slot.flip();

        let previous_record = store::read(&checkouts, name, Some(next_slot))
            .with_context(|| format!("slot {next_slot} has no record to roll back to"))?;

        let service_active = self.supervisor.is_active(&format!("{name}.service")).unwrap_or(false);

        // Reinstall the previous slot's unit/tmpfiles (already rendered when
        // that slot was built) before flipping, the same flip-before-teardown
        // order `update` uses, and for the same reason: a bare symlink flip
        // with no unit reinstall leaves `{name}.service` pointing at the
        // slot's stale rendering (wrong `WorkingDirectory`/`PIDFile`).
        self.activate_slot(name, next_slot, previous_record, false)?;
        self.teardown_active(name, &current_record, false)?;

        if service_active {
            self.supervisor.enable(&format!("{name}.service"), true)?;
        }
        Ok(())
    }

    /// Idempotent best-effort removal of `name`'s active deployment and both slots.
    pub fn uninstall(&self, name: &str) -> Result<()> {
        let checkouts = self.checkouts_dir()?;
        if let Ok(record) = store::read(&checkouts, name, None) {
            if self.current_slot(name).is_ok() {
                let _ = self.teardown_active(name, &record, true);
            }
        }
        let _ = std::fs::remove_file(self.active_symlink(name));
        for slot in [Slot(0), Slot(1)] {
            let dir = self.slot_dir(name, slot);
            if !dir.exists() {
                break;
            }
            std::fs::remove_dir_all(&dir).with_context(|| format!("removing {dir}"))?;
        }
        Ok(())
    }

    // ---- shared machinery -------------------------------------------------

    pub(crate) fn build_slot(
        &self,
        branch: &str,
        name: &str,
        image: &str,
        revision: &str,
        set: &BTreeMap<String, String>,
        slot: Slot,
    ) -> Result<ContainerRecord> {
        let (found, manifest_json) = self.repo.read_metadata(branch, repo::META_MANIFEST)?;
        if !found {
            return Err(SysContainerError::BadManifest(format!("no manifest for {branch}")).into());
        }
        let layers = manifest::layer_digests(manifest_json.as_bytes())?;

        let slot_dir = self.slot_dir(name, slot);
        let rootfs_rel = Utf8PathBuf::from(format!("{name}.{slot}/rootfs"));
        std::fs::create_dir_all(slot_dir.join("rootfs")).with_context(|| format!("creating {slot_dir}/rootfs"))?;

        // All repo calls for this install/update pin to one OS thread (§5).
        let repo = self.repo.clone();
        let checkouts = self.checkouts_dir()?;
        self.worker.run(move || -> Result<()> {
            for layer in &layers {
                repo.union_checkout(layer, &checkouts, &rootfs_rel)?;
            }
            Ok(())
        })?;

        let rootfs = slot_dir.join("rootfs");
        let container_manifest = read_container_manifest(&rootfs)?;

        let mut values = BTreeMap::new();
        if let Some(cm) = &container_manifest {
            values.extend(cm.default_values.clone());
        }
        values.extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
        amend_values(&mut values, name, image, revision, &slot_dir, self.privileged);

        let src_service = rootfs.join("exports/service.template");
        let service_content = read_template_or_default(&src_service, DEFAULT_SERVICE_UNIT)?;
        configure_systemd_startup(&self.runtime, name, has_pidfile_token(&service_content), &mut values);

        let values_map = to_hashmap(&values);

        let dest_service = slot_dir.join(format!("{name}.service"));
        template::render_file_with_default(&src_service, &dest_service, DEFAULT_SERVICE_UNIT, &values_map)
            .context("rendering service unit")?;

        let src_config = rootfs.join("exports/config.json.template");
        let dest_config = slot_dir.join("config.json");
        if src_config.exists() {
            template::render_file_with_default(&src_config, &dest_config, "", &values_map)
                .context("rendering config.json")?;
        } else {
            generate_default_oci_spec(&self.runtime, &dest_config, self.privileged)?;
        }
        if !self.privileged {
            let username = current_username();
            let euid = rustix::process::geteuid().as_raw();
            let egid = rustix::process::getegid().as_raw();
            crate::rootless::make_rootless(dest_config.as_std_path(), &username, euid, egid)
                .context("rewriting runtime spec for rootless execution")?;
        }

        let src_tmpfiles = rootfs.join("exports/tmpfiles.template");
        let has_tmpfiles = src_tmpfiles.exists();
        if has_tmpfiles {
            let dest_tmpfiles = slot_dir.join(format!("tmpfiles-{name}.conf"));
            template::render_file_with_default(&src_tmpfiles, &dest_tmpfiles, "", &values_map)
                .context("rendering tmpfiles snippet")?;
        }

        let (renamed, installed_files_template) = match &container_manifest {
            Some(cm) => (render_rename_map(&cm.rename_files, &values)?, cm.installed_files_template.clone()),
            None => (BTreeMap::new(), Vec::new()),
        };

        let has_container_service = container_manifest.as_ref().map(|m| !m.no_container_service).unwrap_or(true);
        let use_links = container_manifest.as_ref().map(|m| m.use_links).unwrap_or(false);

        Ok(ContainerRecord {
            name: name.to_string(),
            revision: revision.to_string(),
            image: image.to_string(),
            created: unix_now(),
            runtime: self.runtime.clone(),
            has_container_service,
            installed_files: Vec::new(),
            installed_files_template: installed_files_template.into_iter().map(Utf8PathBuf::from).collect(),
            installed_files_checksum: BTreeMap::new(),
            rename_installed_files: renamed,
            use_links,
            values,
        })
    }

    /// Run install steps 10-13: host-file projection, unit/tmpfiles
    /// install, daemon-reload/enable, and finally the symlink flip.
    fn activate_slot(&self, name: &str, slot: Slot, mut record: ContainerRecord, start_now: bool) -> Result<()> {
        let slot_dir = self.slot_dir(name, slot);
        let checkouts = self.checkouts_dir()?;

        if self.privileged {
            let hostfs = slot_dir.join("rootfs/exports/hostfs");
            let (files, checksums) = self.project_host_files(&hostfs, &record)?;
            record.installed_files = files;
            record.installed_files_checksum = checksums;
        }
        store::write(&checkouts, name, slot, &record)?;

        if record.has_container_service {
            let dest_service = self.unit_dir.join(format!("{name}.service"));
            std::fs::create_dir_all(&self.unit_dir)?;
            std::fs::copy(slot_dir.join(format!("{name}.service")), &dest_service)
                .with_context(|| format!("installing unit {dest_service}"))?;

            let src_tmpfiles = slot_dir.join(format!("tmpfiles-{name}.conf"));
            if src_tmpfiles.exists() {
                std::fs::create_dir_all(&self.tmpfiles_dir)?;
                let dest_tmpfiles = self.tmpfiles_dir.join(format!("{name}.conf"));
                std::fs::copy(&src_tmpfiles, &dest_tmpfiles)
                    .with_context(|| format!("installing tmpfiles snippet {dest_tmpfiles}"))?;
                self.supervisor.daemon_reload()?;
                self.supervisor.enable(&format!("{name}.service"), start_now)?;
                self.supervisor.tmpfiles_apply(&dest_tmpfiles, TmpfilesMode::Create)?;
            } else {
                self.supervisor.daemon_reload()?;
                self.supervisor.enable(&format!("{name}.service"), start_now)?;
            }
        }

        self.flip_symlink(name, slot)
    }

    fn flip_symlink(&self, name: &str, slot: Slot) -> Result<()> {
        let link = self.active_symlink(name);
        let target = format!("{name}.{slot}");
        let tmp = self.checkouts_path.join(format!(".{name}.tmp-symlink"));
        let _ = std::fs::remove_file(&tmp);
        std::os::unix::fs::symlink(&target, &tmp).with_context(|| format!("creating {tmp}"))?;
        std::fs::rename(&tmp, &link).with_context(|| format!("activating {link}"))
    }

    /// Teardown of a deposed record's host-level footprint: remove
    /// host-projected files whose checksum still matches (leaving anything
    /// admin-modified in place). Best-effort; logs and continues on
    /// per-file errors.
    ///
    /// `remove_unit` additionally disables and removes the service
    /// unit/tmpfiles snippet and the active symlink — only correct when
    /// nothing else is taking over `record`'s place, i.e. `uninstall`.
    /// `update` and `rollback` call this on the slot they just deposed
    /// *after* the replacement slot has already been activated under the
    /// same unit filename (§9(b)'s flip-before-teardown ordering), so for
    /// them `remove_unit` must be `false` — otherwise this would delete the
    /// unit/symlink the new slot just installed.
    fn teardown_active(&self, name: &str, record: &ContainerRecord, remove_unit: bool) -> Result<()> {
        if remove_unit && record.has_container_service {
            let unit = format!("{name}.service");
            let _ = self.supervisor.disable(&unit, true);
            let _ = std::fs::remove_file(self.unit_dir.join(format!("{name}.service")));

            let tmpfiles_path = self.tmpfiles_dir.join(format!("{name}.conf"));
            if tmpfiles_path.exists() {
                let _ = self.supervisor.tmpfiles_apply(&tmpfiles_path, TmpfilesMode::Delete);
                let _ = std::fs::remove_file(&tmpfiles_path);
            }
        }

        for path in &record.installed_files {
            let Some(expected) = record.installed_files_checksum.get(path) else { continue };
            let Ok(actual) = sha256_hex(path) else { continue };
            if &actual != expected {
                tracing::info!(%path, "file was modified, leaving in place");
                continue;
            }
            match std::fs::remove_file(path) {
                Ok(()) => tracing::info!(%path, "deleted"),
                Err(e) => tracing::warn!(%path, error = %e, "could not delete"),
            }
        }

        if remove_unit {
            let _ = std::fs::remove_file(self.active_symlink(name));
        }
        Ok(())
    }

    fn project_host_files(
        &self,
        hostfs: &Utf8Path,
        record: &ContainerRecord,
    ) -> Result<(Vec<Utf8PathBuf>, BTreeMap<Utf8PathBuf, String>)> {
        let mut files = Vec::new();
        let mut checksums = BTreeMap::new();
        if !hostfs.exists() {
            return Ok((files, checksums));
        }

        let templated: std::collections::HashSet<&Utf8Path> =
            record.installed_files_template.iter().map(|p| p.as_path()).collect();
        let values_map = to_hashmap(&record.values);

        for rel in walk_relative(hostfs)? {
            let canonical = Utf8PathBuf::from(format!("/{rel}"));
            let dest = record
                .rename_installed_files
                .get(&canonical)
                .cloned()
                .unwrap_or_else(|| canonical.clone());

            if dest.exists() {
                continue;
            }
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).with_context(|| format!("creating {parent}"))?;
            }

            let src = hostfs.join(&rel);
            if templated.contains(canonical.as_path()) {
                template::render_file_with_default(&src, &dest, "", &values_map)
                    .with_context(|| format!("rendering host file {dest}"))?;
            } else if record.use_links {
                std::fs::hard_link(&src, &dest).with_context(|| format!("linking host file {dest}"))?;
            } else {
                std::fs::copy(&src, &dest).with_context(|| format!("copying host file {dest}"))?;
            }
            self.labeler.label(&dest)?;

            let checksum = sha256_hex(&dest)?;
            tracing::info!(%dest, "copied");
            checksums.insert(dest.clone(), checksum);
            files.push(dest);
        }
        Ok((files, checksums))
    }
}

fn to_hashmap(values: &BTreeMap<String, String>) -> std::collections::HashMap<String, String> {
    values.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn sha256_hex(path: &Utf8Path) -> Result<String> {
    let mut file = std::fs::File::open(path).with_context(|| format!("opening {path}"))?;
    let mut hasher = Hasher::new(MessageDigest::sha256())?;
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n])?;
    }
    Ok(hex::encode(hasher.finish()?))
}

fn read_container_manifest(rootfs: &Utf8Path) -> Result<Option<ContainerManifest>> {
    let path = rootfs.join("exports/manifest.json");
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content).with_context(|| format!("parsing {path}"))?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {path}")),
    }
}

fn render_rename_map(
    rename_files: &BTreeMap<String, String>,
    values: &BTreeMap<String, String>,
) -> Result<BTreeMap<Utf8PathBuf, Utf8PathBuf>> {
    let values = to_hashmap(values);
    let mut out = BTreeMap::new();
    for (k, v) in rename_files {
        let rendered = template::render_string(v, &values).with_context(|| format!("rendering rename target for {k}"))?;
        out.insert(Utf8PathBuf::from(k), Utf8PathBuf::from(rendered));
    }
    Ok(out)
}

fn read_template_or_default(path: &Utf8Path, default: &str) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(default.to_string()),
        Err(e) => Err(e).with_context(|| format!("reading {path}")),
    }
}

fn has_pidfile_token(content: &str) -> bool {
    content.contains("PIDFILE")
}

fn configure_systemd_startup(runtime: &Utf8Path, name: &str, has_pidfile: bool, values: &mut BTreeMap<String, String>) {
    let (start, stop, prestart, stoppost);
    if has_pidfile {
        let run_dir = values_run_directory(values);
        let pidfile = values
            .entry("PIDFILE".to_string())
            .or_insert_with(|| format!("{run_dir}/container-{name}.pid"))
            .clone();
        start = format!("{runtime} run -d --pidfile {pidfile} '{name}'");
        stoppost = format!("{runtime} delete '{name}'");
        stop = String::new();
        prestart = String::new();
    } else {
        start = format!("{runtime} run '{name}'");
        stop = format!("{runtime} kill '{name}'");
        stoppost = String::new();
        prestart = String::new();
    }
    values.insert("EXEC_START".to_string(), start);
    values.insert("EXEC_STOP".to_string(), stop);
    values.insert("EXEC_STARTPRE".to_string(), prestart);
    values.insert("EXEC_STOPPOST".to_string(), stoppost);
}

fn values_run_directory(values: &BTreeMap<String, String>) -> String {
    values.get("RUN_DIRECTORY").cloned().unwrap_or_default()
}

fn amend_values(
    values: &mut BTreeMap<String, String>,
    name: &str,
    image: &str,
    image_id: &str,
    slot_dir: &Utf8Path,
    privileged: bool,
) {
    values.entry("RUN_DIRECTORY".to_string()).or_insert_with(|| {
        if privileged { "/run".to_string() } else { config::xdg_runtime_dir().to_string() }
    });
    values.entry("CONF_DIRECTORY".to_string()).or_insert_with(|| {
        if privileged { "/etc".to_string() } else { format!("{}/.config", config::home_dir()) }
    });
    values.entry("STATE_DIRECTORY".to_string()).or_insert_with(|| {
        if privileged { "/var/lib".to_string() } else { format!("{}/.data", config::home_dir()) }
    });
    values.entry("UUID".to_string()).or_insert_with(|| uuid::Uuid::new_v4().to_string());

    values.insert("HOST_UID".to_string(), rustix::process::geteuid().as_raw().to_string());
    values.insert("HOST_GID".to_string(), rustix::process::getegid().as_raw().to_string());
    values.insert("IMAGE_NAME".to_string(), image.to_string());
    values.insert("IMAGE_ID".to_string(), image_id.to_string());
    values.insert("NAME".to_string(), name.to_string());
    values.insert("DESTDIR".to_string(), slot_dir.to_string());
}

fn current_username() -> String {
    std::env::var("USER").unwrap_or_default()
}

fn generate_default_oci_spec(runtime: &Utf8Path, dest_config: &Utf8Path, privileged: bool) -> Result<()> {
    use crate::cmdext::CommandRunExt;
    let mut cmd = std::process::Command::new(runtime.as_str());
    cmd.arg("spec");
    if !privileged {
        cmd.arg("--rootless");
    }
    cmd.current_dir(dest_config.parent().unwrap_or(Utf8Path::new(".")));
    cmd.run().context("generating default runtime spec")
}

/// Default container name per §6: the last path segment of the reference,
/// suffixed `-<tag>` unless the tag is absent or `latest`.
pub fn default_container_name(reference: &str) -> String {
    let without_transport = reference.strip_prefix("docker://").unwrap_or(reference);
    let (path, tag) = match without_transport.rsplit_once('@') {
        Some((p, _digest)) => (p, None),
        None => match without_transport.rsplit_once(':') {
            Some((p, t)) if !t.contains('/') => (p, Some(t)),
            _ => (without_transport, None),
        },
    };
    let name = path.rsplit('/').next().unwrap_or(path);
    match tag {
        Some(t) if t != "latest" => format!("{name}-{t}"),
        _ => name.to_string(),
    }
}

/// Recursively list every regular-file path under `root`, relative to `root`.
fn walk_relative(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    fn walk(base: &Utf8Path, dir: &Utf8Path, out: &mut Vec<Utf8PathBuf>) -> Result<()> {
        for entry in std::fs::read_dir(dir).with_context(|| format!("reading {dir}"))? {
            let entry = entry?;
            let path = Utf8PathBuf::try_from(entry.path()).context("non-UTF-8 path under hostfs export")?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                walk(base, &path, out)?;
            } else {
                out.push(path.strip_prefix(base).unwrap_or(&path).to_path_buf());
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    walk(root, root, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::fake::FakeFetch;
    use crate::labeler::NullLabeler;
    use crate::supervisor::fake::FakeSupervisor;
    use std::collections::HashMap;

    /// A fresh in-memory engine with no on-disk state but real temp-dir
    /// paths, so `build_slot`'s non-repo filesystem writes land somewhere
    /// disposable rather than under `/`.
    fn test_engine(privileged: bool) -> (Engine, tempfile::TempDir, Arc<repo::MemRepo>, Arc<FakeSupervisor>) {
        let tmp = tempfile::tempdir().unwrap();
        let checkouts = Utf8PathBuf::try_from(tmp.path().join("checkouts")).unwrap();
        let unit_dir = Utf8PathBuf::try_from(tmp.path().join("units")).unwrap();
        let tmpfiles_dir = Utf8PathBuf::try_from(tmp.path().join("tmpfiles")).unwrap();
        let repo = Arc::new(repo::MemRepo::new());
        let supervisor = Arc::new(FakeSupervisor::default());
        let fetch = Arc::new(FakeFetch::default());
        let engine = Engine::new(
            repo.clone() as Arc<dyn ObjectRepo>,
            supervisor.clone() as Arc<dyn Supervisor>,
            Arc::new(NullLabeler) as Arc<dyn Labeler>,
            fetch as Arc<dyn FetchPort>,
            checkouts,
            unit_dir,
            tmpfiles_dir,
            privileged,
            Utf8PathBuf::from("/usr/bin/runc"),
        );
        (engine, tmp, repo, supervisor)
    }

    /// Seed `reference`'s image branch (pointing at a one-layer manifest)
    /// plus the layer branch backing it, with `layer_files` checked out
    /// under the slot's `rootfs/`.
    fn seed_image(repo: &repo::MemRepo, reference: &str, digest_hex: &str, layer_files: HashMap<String, Vec<u8>>) {
        let normalized = crate::fetch::normalize_reference(reference);
        let branch = repo::image_branch(&refcodec::encode(&normalized));
        let manifest = format!(r#"{{"layers":[{{"digest":"sha256:{digest_hex}"}}]}}"#);
        let mut meta = HashMap::new();
        meta.insert(repo::META_DIGEST.to_string(), format!("sha256:{digest_hex}"));
        meta.insert(repo::META_MANIFEST.to_string(), manifest);
        repo.seed_branch(&branch, meta, HashMap::new());
        repo.seed_branch(&repo::layer_branch(digest_hex), HashMap::new(), layer_files);
    }

    fn minimal_layer_files() -> HashMap<String, Vec<u8>> {
        HashMap::from([("exports/config.json.template".to_string(), b"{}".to_vec())])
    }

    fn sample_record(name: &str) -> ContainerRecord {
        ContainerRecord {
            name: name.to_string(),
            revision: "deadbeef".to_string(),
            image: "quay.io/example/app:latest".to_string(),
            created: 1_700_000_000,
            runtime: Utf8PathBuf::from("/usr/bin/runc"),
            has_container_service: false,
            installed_files: Vec::new(),
            installed_files_template: Vec::new(),
            installed_files_checksum: BTreeMap::new(),
            rename_installed_files: BTreeMap::new(),
            use_links: false,
            values: BTreeMap::new(),
        }
    }

    // E1: install -> list -> uninstall.
    #[test]
    fn install_list_uninstall_roundtrip() {
        let (engine, _tmp, repo, supervisor) = test_engine(true);
        let digest = "a".repeat(64);
        seed_image(&repo, "quay.io/example/app:latest", &digest, minimal_layer_files());

        engine.install("quay.io/example/app:latest", Some("app"), &BTreeMap::new()).unwrap();

        let checkouts = engine.checkouts_dir().unwrap();
        assert!(store::exists(&checkouts, "app"));
        let records = store::list(&checkouts).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "app");
        assert_eq!(records[0].revision, digest);
        assert!(supervisor.is_enabled("app.service"));

        engine.uninstall("app").unwrap();
        assert!(!store::exists(&checkouts, "app"));
    }

    #[test]
    fn install_rejects_duplicate_name() {
        let (engine, _tmp, repo, _supervisor) = test_engine(true);
        seed_image(&repo, "quay.io/example/app:latest", &"a".repeat(64), minimal_layer_files());
        engine.install("quay.io/example/app:latest", Some("app"), &BTreeMap::new()).unwrap();

        let err = engine.install("quay.io/example/app:latest", Some("app"), &BTreeMap::new()).unwrap_err();
        assert!(err.downcast_ref::<SysContainerError>().is_some());
    }

    // E2: update flips to the next slot when the image's digest changed.
    #[test]
    fn update_flips_slot_on_new_revision() {
        let (engine, _tmp, repo, _supervisor) = test_engine(true);
        let digest_a = "a".repeat(64);
        seed_image(&repo, "quay.io/example/app:latest", &digest_a, minimal_layer_files());
        engine.install("quay.io/example/app:latest", Some("app"), &BTreeMap::new()).unwrap();
        assert_eq!(engine.current_slot("app").unwrap(), Slot(0));

        let digest_b = "b".repeat(64);
        seed_image(&repo, "quay.io/example/app:latest", &digest_b, minimal_layer_files());
        engine.update("app", &BTreeMap::new(), None).unwrap();

        assert_eq!(engine.current_slot("app").unwrap(), Slot(1));
        let checkouts = engine.checkouts_dir().unwrap();
        let record = store::read(&checkouts, "app", None).unwrap();
        assert_eq!(record.revision, digest_b);
    }

    #[test]
    fn update_is_a_no_op_when_revision_unchanged() {
        let (engine, _tmp, repo, _supervisor) = test_engine(true);
        seed_image(&repo, "quay.io/example/app:latest", &"a".repeat(64), minimal_layer_files());
        engine.install("quay.io/example/app:latest", Some("app"), &BTreeMap::new()).unwrap();

        engine.update("app", &BTreeMap::new(), None).unwrap();
        assert_eq!(engine.current_slot("app").unwrap(), Slot(0));
    }

    // E3: rollback flips back to the still-intact previous slot.
    #[test]
    fn rollback_restores_previous_revision() {
        let (engine, _tmp, repo, _supervisor) = test_engine(true);
        let digest_a = "a".repeat(64);
        seed_image(&repo, "quay.io/example/app:latest", &digest_a, minimal_layer_files());
        engine.install("quay.io/example/app:latest", Some("app"), &BTreeMap::new()).unwrap();

        let digest_b = "b".repeat(64);
        seed_image(&repo, "quay.io/example/app:latest", &digest_b, minimal_layer_files());
        engine.update("app", &BTreeMap::new(), None).unwrap();
        assert_eq!(engine.current_slot("app").unwrap(), Slot(1));

        engine.rollback("app").unwrap();
        assert_eq!(engine.current_slot("app").unwrap(), Slot(0));

        let checkouts = engine.checkouts_dir().unwrap();
        let record = store::read(&checkouts, "app", None).unwrap();
        assert_eq!(record.revision, digest_a);
    }

    // E4: prune removes only commits no branch references any more, leaving
    // an installed container's image and layer alone.
    #[test]
    fn prune_preserves_layers_behind_installed_containers() {
        let (engine, _tmp, repo, _supervisor) = test_engine(true);
        let kept_digest = "a".repeat(64);
        seed_image(&repo, "quay.io/example/app:latest", &kept_digest, minimal_layer_files());
        engine.install("quay.io/example/app:latest", Some("app"), &BTreeMap::new()).unwrap();

        // An orphan layer left behind by an interrupted pull: a commit with
        // no branch pointing at it any more.
        let orphan_branch = repo::layer_branch(&"c".repeat(64));
        repo.seed_branch(&orphan_branch, HashMap::new(), HashMap::new());
        engine.repo_ref().delete_branch(&orphan_branch).unwrap();

        let freed = engine.repo_ref().prune().unwrap();
        assert_eq!(freed, 1);

        let app_branch = repo::image_branch(&refcodec::encode(&crate::fetch::normalize_reference("quay.io/example/app:latest")));
        assert!(engine.repo_ref().has_branch(&app_branch).unwrap());
        assert!(engine.repo_ref().has_branch(&repo::layer_branch(&kept_digest)).unwrap());
    }

    // E5: a template that references an unknown variable aborts the install
    // before the active symlink is ever created.
    #[test]
    fn install_aborts_before_symlink_on_bad_template() {
        let (engine, _tmp, repo, _supervisor) = test_engine(true);
        let layer_files = HashMap::from([("exports/config.json.template".to_string(), b"$NOPE".to_vec())]);
        seed_image(&repo, "quay.io/example/bad:latest", &"c".repeat(64), layer_files);

        let err = engine.install("quay.io/example/bad:latest", Some("bad"), &BTreeMap::new());
        assert!(err.is_err());

        let checkouts = engine.checkouts_dir().unwrap();
        assert!(!store::exists(&checkouts, "bad"));
    }

    // E6: a host-projected file is removed on teardown only while its
    // checksum still matches what was installed; a file the admin edited
    // in place is left alone.
    #[test]
    fn host_file_removed_only_if_unmodified_since_install() {
        let (engine, tmp, _repo, _supervisor) = test_engine(true);
        let hostfs = Utf8PathBuf::try_from(tmp.path().join("hostfs")).unwrap();
        std::fs::create_dir_all(hostfs.join("etc")).unwrap();
        std::fs::write(hostfs.join("etc/app.conf"), b"shipped default").unwrap();

        let dest = Utf8PathBuf::try_from(tmp.path().join("installed/app.conf")).unwrap();
        let mut rename = BTreeMap::new();
        rename.insert(Utf8PathBuf::from("/etc/app.conf"), dest.clone());
        let mut record = sample_record("x");
        record.rename_installed_files = rename;

        let (files, checksums) = engine.project_host_files(&hostfs, &record).unwrap();
        assert_eq!(files, vec![dest.clone()]);
        record.installed_files = files;
        record.installed_files_checksum = checksums;

        engine.teardown_active("x", &record, Slot(0)).unwrap();
        assert!(!dest.exists(), "unmodified host file should be removed on teardown");

        let (files, checksums) = engine.project_host_files(&hostfs, &record).unwrap();
        record.installed_files = files;
        record.installed_files_checksum = checksums;
        std::fs::write(&dest, b"admin edited this").unwrap();

        engine.teardown_active("x", &record, Slot(0)).unwrap();
        assert!(dest.exists(), "admin-modified host file must survive teardown");
    }

    #[test]
    fn default_name_strips_transport_and_registry_path() {
        assert_eq!(default_container_name("docker://quay.io/example/app"), "app");
    }

    #[test]
    fn default_name_keeps_non_latest_tag_suffix() {
        assert_eq!(default_container_name("docker://quay.io/example/app:v2"), "app-v2");
    }

    #[test]
    fn default_name_drops_latest_tag_suffix() {
        assert_eq!(default_container_name("quay.io/example/app:latest"), "app");
    }

    #[test]
    fn pidfile_token_detection() {
        assert!(has_pidfile_token(DEFAULT_SERVICE_UNIT));
        assert!(!has_pidfile_token("[Service]\nExecStart=/bin/true\n"));
    }

    #[test]
    fn startup_without_pidfile_uses_kill() {
        let mut values = BTreeMap::new();
        configure_systemd_startup(Utf8Path::new("/usr/bin/runc"), "app", false, &mut values);
        assert_eq!(values["EXEC_STOP"], "/usr/bin/runc kill 'app'");
        assert!(values["EXEC_STOPPOST"].is_empty());
    }

    #[test]
    fn startup_with_pidfile_sets_default_path() {
        let mut values = BTreeMap::new();
        values.insert("RUN_DIRECTORY".to_string(), "/run".to_string());
        configure_systemd_startup(Utf8Path::new("/usr/bin/runc"), "app", true, &mut values);
        assert_eq!(values["PIDFILE"], "/run/container-app.pid");
        assert!(values["EXEC_START"].contains("--pidfile /run/container-app.pid"));
    }
}

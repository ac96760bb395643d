//! The container record store (§4.J): read/write per-container `info`,
//! enumerate installed containers, and report supervisor-derived status.
//!
//! Grounded on `examples/original_source/pkg/os-containers/os_containers.go`
//! (`GetContainers`, `GetContainer`, status derivation in `ContainerStatus`).

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;

use crate::error::SysContainerError;
use crate::record::{ContainerRecord, ContainerStatus};
use crate::supervisor::Supervisor;

/// `<checkouts>/<name>.<slot>/info`, or `<checkouts>/<name>/info` when `slot` is `None`.
fn info_relpath(name: &str, slot: Option<crate::record::Slot>) -> Utf8PathBuf {
    match slot {
        Some(slot) => Utf8PathBuf::from(format!("{name}.{slot}/info")),
        None => Utf8PathBuf::from(format!("{name}/info")),
    }
}

/// Write `record` to `<checkouts>/<name>.<slot>/info`, truncate-create with
/// mode 0700, two-space-indented JSON.
pub fn write(checkouts: &Dir, name: &str, slot: crate::record::Slot, record: &ContainerRecord) -> Result<()> {
    let path = info_relpath(name, Some(slot));
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, serde_json::ser::PrettyFormatter::with_indent(b"  "));
    serde::Serialize::serialize(record, &mut ser).context("serializing container record")?;
    checkouts.atomic_write(&path, &buf).with_context(|| format!("writing {path}"))?;
    #[cfg(unix)]
    {
        use cap_std_ext::cap_std::fs::PermissionsExt as _;
        let mut perms = checkouts.metadata(&path)?.permissions();
        perms.set_mode(0o700);
        checkouts.set_permissions(&path, perms)?;
    }
    Ok(())
}

/// Read the record for `name`, either through the active symlink (`slot =
/// None`) or a specific slot. Returns `NOT_FOUND` if absent.
pub fn read(checkouts: &Dir, name: &str, slot: Option<crate::record::Slot>) -> Result<ContainerRecord> {
    let path = info_relpath(name, slot);
    let content = checkouts
        .read_to_string(&path)
        .map_err(|_| SysContainerError::NotFound(format!("container {name}")))?;
    let mut record: ContainerRecord =
        serde_json::from_str(&content).with_context(|| format!("parsing {path}"))?;
    record.name = name.to_string();
    Ok(record)
}

/// List records for every active deployment: every entry in `checkouts`
/// whose file type is a symlink (slot directories themselves are not
/// listed, only the active pointer).
pub fn list(checkouts: &Dir) -> Result<Vec<ContainerRecord>> {
    let mut out = Vec::new();
    for entry in checkouts.entries().context("listing checkouts directory")? {
        let entry = entry?;
        let file_type = entry.file_type().context("reading entry file type")?;
        if !file_type.is_symlink() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let info_path = format!("{name}/info");
        let Ok(content) = checkouts.read_to_string(&info_path) else {
            continue;
        };
        let Ok(mut record) = serde_json::from_str::<ContainerRecord>(&content) else {
            continue;
        };
        record.name = name;
        out.push(record);
    }
    Ok(out)
}

/// Derive a container's running status from the supervisor: active wins
/// over failed, failed over stopped, per §4.J.
pub fn status(sup: &dyn Supervisor, name: &str) -> ContainerStatus {
    let unit = format!("{name}.service");
    if sup.is_active(&unit).unwrap_or(false) {
        ContainerStatus::Running
    } else if sup.is_failed(&unit).unwrap_or(false) {
        ContainerStatus::Failed
    } else {
        ContainerStatus::Stopped
    }
}

/// Does `<checkouts>/<name>` exist (as any file type)? Used by install to
/// reject re-installing over an existing deployment.
pub fn exists(checkouts: &Dir, name: &str) -> bool {
    checkouts.symlink_metadata(name).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::fake::FakeSupervisor;
    use cap_std_ext::cap_std::ambient_authority;
    use std::collections::BTreeMap;

    fn sample_record(name: &str) -> ContainerRecord {
        ContainerRecord {
            name: name.to_string(),
            revision: "deadbeef".to_string(),
            image: "quay.io/example/app:latest".to_string(),
            created: 1_700_000_000,
            runtime: Utf8PathBuf::from("/usr/bin/runc"),
            has_container_service: true,
            installed_files: vec![],
            installed_files_template: vec![],
            installed_files_checksum: BTreeMap::new(),
            rename_installed_files: BTreeMap::new(),
            use_links: false,
            values: BTreeMap::new(),
        }
    }

    #[test]
    fn write_then_read_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        let rec = sample_record("app");
        write(&dir, "app", crate::record::Slot(0), &rec).unwrap();
        let back = read(&dir, "app", Some(crate::record::Slot(0))).unwrap();
        assert_eq!(back.revision, rec.revision);
        assert_eq!(back.name, "app");
    }

    #[test]
    fn read_missing_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        assert!(read(&dir, "nope", Some(crate::record::Slot(0))).is_err());
    }

    #[test]
    fn status_prefers_active_over_failed() {
        let sup = FakeSupervisor::default();
        sup.enable("app.service", true).unwrap();
        sup.mark_failed("app.service");
        assert_eq!(status(&sup, "app"), ContainerStatus::Running);
    }

    #[test]
    fn status_falls_back_to_stopped() {
        let sup = FakeSupervisor::default();
        assert_eq!(status(&sup, "app"), ContainerStatus::Stopped);
    }
}

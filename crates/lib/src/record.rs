//! Persisted container state (§3, §4.J): the per-slot `info` record and the
//! optional image-supplied `exports/manifest.json`.
//!
//! Grounded on `examples/original_source/pkg/os-containers/os_containers.go`
//! (the `Container` struct) and `manifest.go` (the container-manifest
//! schema), translated into `serde`-derived structs in the teacher's style
//! (`camino::Utf8PathBuf` for paths, `BTreeMap` for deterministic JSON
//! output ordering).

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Which of the two on-disk slots (`<name>.0` or `<name>.1`) a deployment occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(pub u8);

impl Slot {
    /// The other slot: `0 <-> 1`.
    pub fn flip(self) -> Slot {
        Slot(self.0 ^ 1)
    }

    /// The `<name>.<n>` directory suffix.
    pub fn suffix(self) -> String {
        self.0.to_string()
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.suffix())
    }
}

/// The persisted per-deployment record, written to `<slot>/info`.
///
/// `name` is deliberately not serialized: the spec calls it transient,
/// derived from the containing directory rather than stored in the JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    #[serde(skip)]
    pub name: String,
    pub revision: String,
    pub image: String,
    pub created: i64,
    pub runtime: Utf8PathBuf,
    #[serde(rename = "has-container-service")]
    pub has_container_service: bool,
    #[serde(rename = "installed-files")]
    pub installed_files: Vec<Utf8PathBuf>,
    #[serde(rename = "installed-files-template")]
    pub installed_files_template: Vec<Utf8PathBuf>,
    #[serde(rename = "installed-files-checksum")]
    pub installed_files_checksum: BTreeMap<Utf8PathBuf, String>,
    #[serde(rename = "rename-installed-files")]
    pub rename_installed_files: BTreeMap<Utf8PathBuf, Utf8PathBuf>,
    #[serde(rename = "use-links", default)]
    pub use_links: bool,
    pub values: BTreeMap<String, String>,
}

/// The observed runtime status of an installed container, per §4.J `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Failed,
    Stopped,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerStatus::Running => "Running",
            ContainerStatus::Failed => "Failed",
            ContainerStatus::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// The optional image-supplied `rootfs/exports/manifest.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerManifest {
    #[serde(default, rename = "defaultValues")]
    pub default_values: BTreeMap<String, String>,
    #[serde(default, rename = "renameFiles")]
    pub rename_files: BTreeMap<String, String>,
    #[serde(default, rename = "noContainerService")]
    pub no_container_service: bool,
    #[serde(default, rename = "useLinks")]
    pub use_links: bool,
    #[serde(default, rename = "installedFilesTemplate")]
    pub installed_files_template: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_flip_is_its_own_inverse() {
        let s = Slot(0);
        assert_eq!(s.flip(), Slot(1));
        assert_eq!(s.flip().flip(), s);
    }

    #[test]
    fn record_roundtrips_through_json_without_name() {
        let rec = ContainerRecord {
            name: "app".to_string(),
            revision: "deadbeef".to_string(),
            image: "quay.io/example/app:latest".to_string(),
            created: 1_700_000_000,
            runtime: Utf8PathBuf::from("/usr/bin/runc"),
            has_container_service: true,
            installed_files: vec![Utf8PathBuf::from("/etc/app.conf")],
            installed_files_template: vec![],
            installed_files_checksum: BTreeMap::from([(
                Utf8PathBuf::from("/etc/app.conf"),
                "abc123".to_string(),
            )]),
            rename_installed_files: BTreeMap::new(),
            use_links: false,
            values: BTreeMap::from([("PORT".to_string(), "8080".to_string())]),
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(!json.contains("\"name\""));
        let back: ContainerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.revision, rec.revision);
        assert_eq!(back.values.get("PORT").unwrap(), "8080");
    }

    #[test]
    fn container_manifest_defaults_are_empty() {
        let m: ContainerManifest = serde_json::from_str("{}").unwrap();
        assert!(m.default_values.is_empty());
        assert!(!m.no_container_service);
    }
}

//! The rootless OCI runtime-spec rewriter (§4.G).
//!
//! Grounded on `examples/original_source/pkg/os-containers/rootless.go`
//! (`makeOCIConfigurationRootless`, built on
//! `opencontainers/runtime-tools/generate`); ported here onto the typed
//! `oci-spec` crate, which the `archlinux-ostree-experiments-oci-chunker`
//! example already depends on for the same runtime-spec document.

use std::path::Path;

use anyhow::{Context, Result};
use oci_spec::runtime::{
    LinuxIdMapping, LinuxIdMappingBuilder, LinuxNamespace, LinuxNamespaceBuilder,
    LinuxNamespaceType, Mount, MountBuilder, Spec,
};

use crate::error::SysContainerError;

const DEVPTS_OPTIONS: &[&str] = &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"];

/// One entry of `/etc/subuid` or `/etc/subgid`: `name:start:count`.
struct SubRange {
    start: u32,
    count: u32,
}

fn read_sub_range(path: &Path, username: &str) -> Result<Option<SubRange>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    for line in content.lines() {
        let mut parts = line.splitn(3, ':');
        let (Some(name), Some(start), Some(count)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        if name != username {
            continue;
        }
        let start: u32 = start.parse().context("parsing subid start")?;
        let count: u32 = count.parse().context("parsing subid count")?;
        return Ok(Some(SubRange { start, count }));
    }
    Ok(None)
}

fn build_id_mappings(euid: u32, username: &str, sub_path: &Path) -> Result<Vec<LinuxIdMapping>> {
    let mut mappings = vec![LinuxIdMappingBuilder::default()
        .host_id(euid)
        .container_id(0u32)
        .size(1u32)
        .build()
        .map_err(|e| SysContainerError::RuntimeFailure(e.to_string()))?];
    if let Some(range) = read_sub_range(sub_path, username)? {
        mappings.push(
            LinuxIdMappingBuilder::default()
                .host_id(range.start)
                .container_id(1u32)
                .size(range.count)
                .build()
                .map_err(|e| SysContainerError::RuntimeFailure(e.to_string()))?,
        );
    }
    Ok(mappings)
}

fn devpts_mount() -> Result<Mount> {
    MountBuilder::default()
        .destination("/dev/pts")
        .typ("devpts".to_string())
        .source("devpts".to_string())
        .options(DEVPTS_OPTIONS.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        .build()
        .map_err(|e| SysContainerError::RuntimeFailure(e.to_string()).into())
}

/// Rewrite the OCI runtime-spec JSON at `path` in place so it can run
/// rootless: clear cgroup resources and path, force a readonly root and a
/// non-interactive terminal, add a user namespace (identity-mapping the
/// invoking euid/egid to 0 plus whatever range `/etc/subuid`/`/etc/subgid`
/// grants `username`), and replace `/dev/pts` with a `devpts` mount that
/// works unprivileged.
pub fn make_rootless(path: &Path, username: &str, euid: u32, egid: u32) -> Result<()> {
    let mut spec: Spec =
        Spec::load(path).with_context(|| format!("loading runtime spec {}", path.display()))?;

    let mut linux = spec.linux().clone().unwrap_or_default();
    linux.set_resources(None);

    let mut process = spec.process().clone().unwrap_or_default();
    process.set_terminal(Some(false));
    spec.set_process(Some(process));

    let mut root = spec.root().clone().unwrap_or_default();
    root.set_readonly(Some(true));
    spec.set_root(Some(root));

    let namespaces = linux.namespaces().clone().unwrap_or_default();
    let has_user_ns = namespaces.iter().any(|ns| ns.typ() == LinuxNamespaceType::User);
    if !has_user_ns {
        let mut namespaces = namespaces;
        let user_ns: LinuxNamespace = LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::User)
            .build()
            .map_err(|e| SysContainerError::RuntimeFailure(e.to_string()))?;
        namespaces.push(user_ns);
        linux.set_namespaces(Some(namespaces));

        linux.set_uid_mappings(Some(build_id_mappings(euid, username, Path::new("/etc/subuid"))?));
        linux.set_gid_mappings(Some(build_id_mappings(egid, username, Path::new("/etc/subgid"))?));
    }

    let mut mounts: Vec<Mount> =
        spec.mounts().clone().unwrap_or_default().into_iter().filter(|m| m.destination().as_os_str() != "/dev/pts").collect();
    mounts.push(devpts_mount()?);
    spec.set_mounts(Some(mounts));

    linux.set_cgroups_path(None);
    spec.set_linux(Some(linux));

    spec.save(path).with_context(|| format!("writing rewritten runtime spec {}", path.display()))?;
    Ok(())
}

//! The `sysc` command-line surface (§6).
//!
//! Grounded on `examples/original_source/pkg/os-containers/main.go` (the
//! subcommand table this mirrors) and, for the clap-derive shape itself, on
//! `examples/pyroth-sbx/bux-cli/src/main.rs`'s `Parser`/`Subcommand` tree —
//! the only complete clap CLI in the retrieval pack with a comparable
//! install/run/images/containers surface.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;

use crate::config;
use crate::deploy::Engine;
use crate::error::SysContainerError;
use crate::fetch::{FetchPort, SkopeoFetch};
use crate::labeler::{Labeler, NullLabeler, SelinuxLabeler};
use crate::manifest;
use crate::record::ContainerStatus;
use crate::refcodec;
use crate::repo::{self, ObjectRepo, OstreeRepo};
use crate::store;
use crate::supervisor::{Supervisor, SystemdSupervisor};

#[derive(Parser)]
#[command(name = "sysc", version, about = "Install, update, and run system containers")]
struct Cli {
    /// Override the OCI runtime binary (default: `$RUNTIME` or `/usr/bin/runc`).
    #[arg(long, global = true)]
    runtime: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage installed containers.
    Containers {
        #[command(subcommand)]
        action: ContainersAction,
    },
    /// Manage images in the object repository.
    Images {
        #[command(subcommand)]
        action: ImagesAction,
    },
    /// Fetch an image into the object repository without installing it.
    Pull {
        /// Image reference.
        reference: String,
        /// Skip TLS verification against the source registry.
        #[arg(long)]
        insecure: bool,
    },
    /// Install a system container from an image.
    Install {
        /// Image reference.
        image: String,
        /// Container name (default: derived from the reference, §6).
        #[arg(long)]
        name: Option<String>,
        /// `KEY=VAL` substitution value, repeatable.
        #[arg(long = "set", value_parser = parse_set)]
        set: Vec<(String, String)>,
    },
    /// Remove an installed container.
    Uninstall {
        /// Container name.
        name: String,
    },
    /// Deploy the next slot for an installed container.
    Update {
        /// Container name.
        name: String,
        /// `KEY=VAL` substitution value, repeatable; merged over the current values.
        #[arg(long = "set", value_parser = parse_set)]
        set: Vec<(String, String)>,
        /// Rebase onto a different image reference instead of re-pulling the current one.
        #[arg(long)]
        rebase: Option<String>,
    },
    /// Flip back to the previous slot.
    Rollback {
        /// Container name.
        name: String,
    },
    /// Run a command in an installed container, or transiently from an image.
    Run {
        /// Container name or image reference.
        target: String,
        /// `KEY=VAL` substitution value, repeatable. Only valid against a bare image reference.
        #[arg(long = "set", value_parser = parse_set)]
        set: Vec<(String, String)>,
        /// Command and arguments to run.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ContainersAction {
    /// List installed containers.
    List {
        /// Include containers whose active slot failed to resolve.
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum ImagesAction {
    /// List images (and, with `--all`, the layer branches backing them).
    List {
        /// Also list intermediate layer branches.
        #[arg(long)]
        all: bool,
        /// Don't truncate the image-id column.
        #[arg(long)]
        no_truncate: bool,
    },
    /// Delete an image branch.
    Delete {
        /// Image reference.
        reference: String,
    },
    /// Alias an image reference as another reference, sharing the same commit.
    Tag {
        /// Existing image reference.
        src: String,
        /// New image reference.
        dst: String,
    },
    /// Garbage-collect layer branches no image references.
    Prune,
}

fn parse_set(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) => Ok((k.to_string(), v.to_string())),
        None => Err(format!("malformed --set value {s:?}, expected KEY=VAL")),
    }
}

fn to_map(pairs: Vec<(String, String)>) -> BTreeMap<String, String> {
    pairs.into_iter().collect()
}

/// Build the engine from ambient configuration (§6 environment variables
/// and on-disk layout), honoring a `--runtime` override.
fn build_engine(runtime_override: Option<Utf8PathBuf>) -> Result<Engine> {
    let privileged = config::is_privileged();
    let repo_path = config::repo_path();
    let repo: Arc<dyn ObjectRepo> =
        Arc::new(OstreeRepo::ensure(&repo_path, privileged).with_context(|| format!("opening object repo at {repo_path}"))?);
    let supervisor: Arc<dyn Supervisor> = Arc::new(SystemdSupervisor::new(privileged));
    let labeler: Arc<dyn Labeler> = if privileged && SelinuxLabeler::host_selinux_enabled() {
        Arc::new(SelinuxLabeler::open(privileged, true))
    } else {
        Arc::new(NullLabeler)
    };
    let fetch: Arc<dyn FetchPort> = Arc::new(SkopeoFetch::new(repo_path));
    let runtime = runtime_override.unwrap_or_else(config::runtime_path);

    Ok(Engine::new(
        repo,
        supervisor,
        labeler,
        fetch,
        config::checkouts_path(),
        config::systemd_unit_dir(),
        config::tmpfiles_dir(),
        privileged,
        runtime,
    ))
}

/// Run the CLI against `args` (typically `std::env::args_os()`), returning
/// the same error taxonomy every other entry point uses.
pub fn run_from_iter<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    let engine = build_engine(cli.runtime)?;

    match cli.command {
        Command::Containers { action: ContainersAction::List { all } } => containers_list(&engine, all),
        Command::Images { action } => images(&engine, action),
        Command::Pull { reference, insecure } => {
            if insecure {
                engine_fetch_insecure(&engine, &reference)
            } else {
                engine_fetch(&engine, &reference)
            }
        }
        Command::Install { image, name, set } => engine.install(&image, name.as_deref(), &to_map(set)),
        Command::Uninstall { name } => engine.uninstall(&name),
        Command::Update { name, set, rebase } => engine.update(&name, &to_map(set), rebase.as_deref()),
        Command::Rollback { name } => engine.rollback(&name),
        Command::Run { target, set, command } => engine.run(&target, &command, &to_map(set)),
    }
}

/// Run the CLI against the process's real argv.
pub fn run() -> Result<()> {
    run_from_iter(std::env::args_os())
}

fn engine_fetch(engine: &Engine, reference: &str) -> Result<()> {
    engine.fetch_ref().fetch(reference)
}

fn engine_fetch_insecure(engine: &Engine, reference: &str) -> Result<()> {
    engine.fetch_ref().fetch_insecure(reference)
}

fn containers_list(engine: &Engine, all: bool) -> Result<()> {
    let checkouts = engine.checkouts_dir()?;
    let records = store::list(&checkouts)?;
    let mut seen = std::collections::HashSet::new();
    for record in &records {
        seen.insert(record.name.clone());
        let status = store::status(engine.supervisor_ref(), &record.name);
        let status_colored = match status {
            ContainerStatus::Running => status.to_string().green().to_string(),
            ContainerStatus::Failed => status.to_string().red().to_string(),
            ContainerStatus::Stopped => status.to_string(),
        };
        println!(
            "{}\t{}\t{}\t{}\t{}",
            record.name, record.image, record.created, status_colored, record.runtime
        );
    }

    // `--all` additionally surfaces entries whose active symlink exists but
    // whose `info` could not be read (e.g. a dangling symlink left by a
    // crash between teardown and slot removal); `store::list` silently
    // skips those.
    if all {
        for entry in checkouts.entries().context("listing checkouts directory")? {
            let entry = entry?;
            if !entry.file_type()?.is_symlink() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if seen.contains(&name) {
                continue;
            }
            println!("{name}\t<unreadable>\t-\t{}\t-", "Broken".red());
        }
    }
    Ok(())
}

struct ImageRow {
    name: String,
    branch: String,
    commit: String,
    intermediate: bool,
    image_id: String,
    size: u64,
}

fn images(engine: &Engine, action: ImagesAction) -> Result<()> {
    match action {
        ImagesAction::List { all, no_truncate } => images_list(engine, all, no_truncate),
        ImagesAction::Delete { reference } => images_delete(engine, &reference),
        ImagesAction::Tag { src, dst } => images_tag(engine, &src, &dst),
        ImagesAction::Prune => images_prune(engine),
    }
}

fn images_list(engine: &Engine, all: bool, no_truncate: bool) -> Result<()> {
    let repo = engine.repo_ref();
    let branches = repo.list_branches(repo::BRANCH_PREFIX)?;
    let mut rows = Vec::new();
    for (short_name, commit) in branches {
        let intermediate = repo::is_layer_short_name(&short_name);
        if intermediate && !all {
            continue;
        }
        let branch = repo::image_branch(&short_name);
        let (name, image_id, size) = if intermediate {
            (String::new(), short_name.clone(), read_layer_size(repo, &branch))
        } else {
            let name = refcodec::decode(&short_name);
            let (_, digest) = repo.read_metadata(&branch, repo::META_DIGEST).unwrap_or((false, String::new()));
            let id = digest.strip_prefix("sha256:").unwrap_or(&digest).to_string();
            (name, id, 0)
        };
        rows.push(ImageRow { name, branch, commit, intermediate, image_id, size });
    }
    rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.branch.cmp(&b.branch)));
    for row in rows {
        let id = if no_truncate || row.image_id.len() <= 12 { row.image_id.clone() } else { row.image_id[..12].to_string() };
        let kind = if row.intermediate { "layer" } else { "image" };
        println!("{}\t{}\t{}\t{}\t{}", kind, row.name, id, row.commit, row.size);
    }
    Ok(())
}

fn read_layer_size(repo: &dyn ObjectRepo, branch: &str) -> u64 {
    repo.read_metadata(branch, repo::META_UNCOMPRESSED_SIZE)
        .ok()
        .and_then(|(found, value)| found.then(|| value.parse().ok()).flatten())
        .unwrap_or(0)
}

fn images_delete(engine: &Engine, reference: &str) -> Result<()> {
    let repo = engine.repo_ref();
    let normalized = crate::fetch::normalize_reference(reference);
    let branch = repo::image_branch(&refcodec::encode(&normalized));
    if !repo.has_branch(&branch)? {
        return Err(SysContainerError::ImageNotFound(reference.to_string()).into());
    }
    repo.delete_branch(&branch)
}

fn images_tag(engine: &Engine, src: &str, dst: &str) -> Result<()> {
    let repo = engine.repo_ref();
    let src_branch = repo::image_branch(&refcodec::encode(&crate::fetch::normalize_reference(src)));
    let dst_branch = repo::image_branch(&refcodec::encode(&crate::fetch::normalize_reference(dst)));
    let commit = repo.resolve(&src_branch).map_err(|_| SysContainerError::ImageNotFound(src.to_string()))?;
    repo.set_branch(&dst_branch, &commit)
}

/// Delete layer branches no longer referenced by any image manifest, then
/// garbage-collect the now-unreferenced commits. Grounded on
/// `examples/original_source/pkg/os-containers/os_images.go`'s
/// `PruneImages`: every non-intermediate branch's `docker.manifest` is
/// read and its layer digests unioned into a "referenced" set; any
/// intermediate (layer) branch whose short name isn't in that set is
/// deleted. Layer branches are never touched while any image still names
/// them, matching the invariant in §3.
fn images_prune(engine: &Engine) -> Result<()> {
    let repo = engine.repo_ref();
    let branches = repo.list_branches(repo::BRANCH_PREFIX)?;

    let mut referenced = BTreeSet::new();
    for short_name in branches.keys() {
        if repo::is_layer_short_name(short_name) {
            continue;
        }
        let branch = repo::image_branch(short_name);
        let (found, raw) = repo.read_metadata(&branch, repo::META_MANIFEST)?;
        if !found {
            anyhow::bail!("cannot find manifest for {}", refcodec::decode(short_name));
        }
        referenced.extend(manifest::layer_digests(raw.as_bytes())?);
    }

    for short_name in branches.keys() {
        if !repo::is_layer_short_name(short_name) {
            continue;
        }
        let branch = repo::layer_branch(short_name);
        if referenced.contains(short_name) {
            tracing::debug!(layer = %short_name, "keep");
        } else {
            repo.delete_branch(&branch)?;
            tracing::info!(layer = %short_name, "delete");
        }
    }

    let freed = repo.prune()?;
    println!("freed {freed} bytes");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::fake::FakeFetch;
    use crate::supervisor::fake::FakeSupervisor;
    use std::collections::HashMap;

    fn test_engine() -> (Engine, tempfile::TempDir, Arc<repo::MemRepo>) {
        let tmp = tempfile::tempdir().unwrap();
        let repo = Arc::new(repo::MemRepo::new());
        let engine = Engine::new(
            repo.clone() as Arc<dyn ObjectRepo>,
            Arc::new(FakeSupervisor::default()) as Arc<dyn Supervisor>,
            Arc::new(NullLabeler) as Arc<dyn Labeler>,
            Arc::new(FakeFetch::default()) as Arc<dyn FetchPort>,
            Utf8PathBuf::try_from(tmp.path().join("checkouts")).unwrap(),
            Utf8PathBuf::try_from(tmp.path().join("units")).unwrap(),
            Utf8PathBuf::try_from(tmp.path().join("tmpfiles")).unwrap(),
            true,
            Utf8PathBuf::from("/usr/bin/runc"),
        );
        (engine, tmp, repo)
    }

    fn seed_image(repo: &repo::MemRepo, reference: &str, digest_hex: &str) -> String {
        let normalized = crate::fetch::normalize_reference(reference);
        let branch = repo::image_branch(&refcodec::encode(&normalized));
        let manifest = format!(r#"{{"layers":[{{"digest":"sha256:{digest_hex}"}}]}}"#);
        let mut meta = HashMap::new();
        meta.insert(repo::META_DIGEST.to_string(), format!("sha256:{digest_hex}"));
        meta.insert(repo::META_MANIFEST.to_string(), manifest);
        repo.seed_branch(&branch, meta, HashMap::new());
        repo.seed_branch(&repo::layer_branch(digest_hex), HashMap::new(), HashMap::new());
        branch
    }

    // E4: `images prune` deletes only the layer branch no image manifest
    // references any more, leaving referenced layers (shared or not) alone.
    #[test]
    fn prune_deletes_only_unreferenced_layer_branches() {
        let (engine, _tmp, repo) = test_engine();
        let shared = "a".repeat(64);
        let only_b = "b".repeat(64);
        let orphan = "c".repeat(64);

        seed_image(&repo, "quay.io/example/a:latest", &shared);
        let branch_b = repo::image_branch(&refcodec::encode(&crate::fetch::normalize_reference("quay.io/example/b:latest")));
        let manifest_b = format!(r#"{{"layers":[{{"digest":"sha256:{shared}"}},{{"digest":"sha256:{only_b}"}}]}}"#);
        let mut meta_b = HashMap::new();
        meta_b.insert(repo::META_DIGEST.to_string(), format!("sha256:{only_b}"));
        meta_b.insert(repo::META_MANIFEST.to_string(), manifest_b);
        repo.seed_branch(&branch_b, meta_b, HashMap::new());
        repo.seed_branch(&repo::layer_branch(&only_b), HashMap::new(), HashMap::new());
        repo.seed_branch(&repo::layer_branch(&orphan), HashMap::new(), HashMap::new());

        images_prune(&engine).unwrap();

        assert!(engine.repo_ref().has_branch(&repo::layer_branch(&shared)).unwrap());
        assert!(engine.repo_ref().has_branch(&repo::layer_branch(&only_b)).unwrap());
        assert!(!engine.repo_ref().has_branch(&repo::layer_branch(&orphan)).unwrap());
    }

    #[test]
    fn set_parses_key_equals_val() {
        assert_eq!(parse_set("PORT=8080").unwrap(), ("PORT".to_string(), "8080".to_string()));
    }

    #[test]
    fn set_rejects_missing_equals() {
        assert!(parse_set("PORT").is_err());
    }

    #[test]
    fn set_splits_on_first_equals_only() {
        assert_eq!(parse_set("URL=https://a=b").unwrap(), ("URL".to_string(), "https://a=b".to_string()));
    }
}

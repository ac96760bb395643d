//! In-memory [`super::ObjectRepo`] test double. Layer checkout is simulated
//! by copying a fixture's files rather than invoking libostree, so tests can
//! exercise the deployment engine without a real repo on disk.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;

use crate::error::SysContainerError;

#[derive(Debug, Default, Clone)]
struct Commit {
    metadata: HashMap<String, String>,
    /// Relative path -> file contents, checked out on top of the destination.
    files: HashMap<String, Vec<u8>>,
}

/// An in-memory stand-in for an ostree repository.
#[derive(Debug, Default)]
pub struct MemRepo {
    state: Mutex<MemRepoState>,
}

#[derive(Debug, Default)]
struct MemRepoState {
    branches: HashMap<String, String>,
    commits: HashMap<String, Commit>,
    next_commit_id: u64,
}

impl MemRepo {
    /// A fresh, empty repo.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a commit with the given metadata and checkout fixture files,
    /// then point `branch` at it. Intended for test setup.
    pub fn seed_branch(
        &self,
        branch: &str,
        metadata: HashMap<String, String>,
        files: HashMap<String, Vec<u8>>,
    ) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_commit_id += 1;
        let commit = format!("{:064x}", state.next_commit_id);
        state.commits.insert(commit.clone(), Commit { metadata, files });
        state.branches.insert(branch.to_string(), commit.clone());
        commit
    }
}

impl super::ObjectRepo for MemRepo {
    fn list_branches(&self, prefix: &str) -> Result<HashMap<String, String>> {
        let state = self.state.lock().unwrap();
        let strip = format!("{prefix}/");
        Ok(state
            .branches
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(strip.as_str()).map(|short| (short.to_string(), v.clone())))
            .collect())
    }

    fn has_branch(&self, branch: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().branches.contains_key(branch))
    }

    fn resolve(&self, branch: &str) -> Result<String> {
        self.state
            .lock()
            .unwrap()
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| SysContainerError::NotFound(branch.to_string()).into())
    }

    fn read_metadata(&self, branch: &str, key: &str) -> Result<(bool, String)> {
        let state = self.state.lock().unwrap();
        let Some(commit) = state.branches.get(branch) else {
            return Ok((false, String::new()));
        };
        let Some(value) = state.commits.get(commit).and_then(|c| c.metadata.get(key)) else {
            return Ok((false, String::new()));
        };
        Ok((true, value.clone()))
    }

    fn set_branch(&self, branch: &str, commit: &str) -> Result<()> {
        self.state.lock().unwrap().branches.insert(branch.to_string(), commit.to_string());
        Ok(())
    }

    fn delete_branch(&self, branch: &str) -> Result<()> {
        self.state.lock().unwrap().branches.remove(branch);
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
        let files = {
            let state = self.state.lock().unwrap();
            state.commits.get(&commit).map(|c| c.files.clone()).unwrap_or_default()
        };
        dest_dir.create_dir_all(dest_path)?;
        for (relpath, contents) in files {
            let target = dest_path.join(&relpath);
            if let Some(parent) = target.parent() {
                dest_dir.create_dir_all(parent)?;
            }
            dest_dir.write(&target, &contents)?;
        }
        Ok(())
    }

    fn prune(&self) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let referenced: std::collections::HashSet<String> = state.branches.values().cloned().collect();
        let before = state.commits.len();
        state.commits.retain(|k, _| referenced.contains(k));
        let removed = before - state.commits.len();
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::ObjectRepo;

    #[test]
    fn seeded_branch_resolves_and_reads_metadata() {
        let repo = MemRepo::new();
        let mut meta = HashMap::new();
        meta.insert("docker.digest".to_string(), "sha256:deadbeef".to_string());
        repo.seed_branch("ociimage/example", meta, HashMap::new());

        assert!(repo.has_branch("ociimage/example").unwrap());
        let (present, value) = repo.read_metadata("ociimage/example", "docker.digest").unwrap();
        assert!(present);
        assert_eq!(value, "sha256:deadbeef");
    }

    #[test]
    fn missing_branch_metadata_is_absent_not_error() {
        let repo = MemRepo::new();
        let (present, value) = repo.read_metadata("ociimage/nope", "docker.digest").unwrap();
        assert!(!present);
        assert_eq!(value, "");
    }

    #[test]
    fn prune_removes_only_unreferenced_commits() {
        let repo = MemRepo::new();
        let kept = repo.seed_branch("ociimage/keep", HashMap::new(), HashMap::new());
        repo.seed_branch("ociimage/transient", HashMap::new(), HashMap::new());
        repo.delete_branch("ociimage/transient").unwrap();

        let removed = repo.prune().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repo.resolve("ociimage/keep").unwrap(), kept);
    }

    #[test]
    fn list_branches_strips_prefix() {
        let repo = MemRepo::new();
        repo.seed_branch("ociimage/a", HashMap::new(), HashMap::new());
        repo.seed_branch("ociimage/b", HashMap::new(), HashMap::new());
        let branches = repo.list_branches("ociimage").unwrap();
        assert_eq!(branches.len(), 2);
        assert!(branches.contains_key("a"));
        assert!(branches.contains_key("b"));
    }
}

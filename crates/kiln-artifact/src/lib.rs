//! Artifact directory assembly, commit, and typed read accessors, built
//! on top of [`kiln_cas`]'s content store.
//!
//! An artifact is a directory tree with a fixed shape:
//!
//! ```text
//! <artifact-root>/
//!   files/                 # staged build output (optional)
//!   buildtree/             # sandbox build directory (optional)
//!   logs/
//!     build.log
//!   meta/
//!     public.yaml
//!     build-result.yaml
//!     keys.yaml
//!     dependencies.yaml
//!     workspaced.yaml
//!     workspaced-dependencies.yaml
//! ```
//!
//! `meta/` is always present and complete; `files/` and `buildtree/` may be
//! absent. Once assembled on disk, the whole tree is committed to the
//! content store under every key the element is currently known by (its
//! weak key, and its strict/strong key once computed), so a later lookup
//! under any of those keys finds the same artifact.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use kiln_cas::{Digest, Store};

/// How complete a cached artifact must be for [`ArtifactStore::cached`] to
/// report it present: the directory spine only, or the spine plus every
/// file blob it references. Surfaced from `kiln-config`; kept here as a
/// plain enum so `kiln-artifact` doesn't depend on `kiln-config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    DirectoriesOnly,
    FilesAndContents,
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Cas(#[from] kiln_cas::CasError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error("artifact not cached under key {0}")]
    NotCached(String),
    #[error("malformed artifact metadata: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BuildResult {
    pub success: bool,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Keys {
    pub strong: String,
    pub weak: String,
}

/// An artifact ref is resolved to a top-level tree digest recorded under a
/// cache key; `RefStore` is the small keyed lookup table in front of the
/// content store, laid out as `refs/<project>/<element>/<key>`.
pub trait RefStore {
    fn get_ref(&self, key: &str) -> Result<Option<Digest>>;
    fn set_ref(&self, key: &str, digest: &Digest) -> Result<()>;
}

/// An on-disk ref table sharing the cache directory with the `FsStore` it
/// fronts: one file per key under `refs/<key>` holding the JSON-encoded
/// root digest.
pub struct FsRefStore {
    root: std::path::PathBuf,
}

impl FsRefStore {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        FsRefStore { root: root.into() }
    }

    fn ref_path(&self, key: &str) -> std::path::PathBuf {
        self.root.join("refs").join(key)
    }
}

impl RefStore for FsRefStore {
    fn get_ref(&self, key: &str) -> Result<Option<Digest>> {
        let path = self.ref_path(key);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let digest: Digest = serde_json::from_slice(&bytes)
            .map_err(|e| ArtifactError::Malformed(format!("ref {key}: {e}")))?;
        Ok(Some(digest))
    }

    fn set_ref(&self, key: &str, digest: &Digest) -> Result<()> {
        let path = self.ref_path(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, serde_json::to_vec(digest).expect("Digest always serializes"))?;
        Ok(())
    }
}

/// Assembles, commits, and reads back artifacts. Generic over the
/// underlying [`Store`] so tests can swap in an in-memory store.
pub struct ArtifactStore<S: Store, R: RefStore> {
    store: S,
    refs: R,
}

impl<S: Store, R: RefStore> ArtifactStore<S, R> {
    pub fn new(store: S, refs: R) -> Self {
        ArtifactStore { store, refs }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Assembles the artifact layout from its constituent parts and commits
    /// it under every key in `keys`. Returns the number of bytes newly
    /// added to the content store (callers feed this into
    /// [`kiln_cas::CacheUsage::add_artifact_size`]).
    #[allow(clippy::too_many_arguments)]
    pub fn cache(
        &self,
        rootdir: &Path,
        sandbox_build_dir: Option<&Path>,
        collect_dir: Option<&Path>,
        build_log: Option<&str>,
        build_result: &BuildResult,
        keys: &Keys,
        dependencies: &BTreeMap<String, String>,
        public_data: &serde_json::Value,
        keys_to_commit: &[String],
    ) -> Result<u64> {
        if rootdir.exists() {
            fs::remove_dir_all(rootdir)?;
        }
        fs::create_dir_all(rootdir)?;

        if let Some(collect) = collect_dir {
            let files = rootdir.join("files");
            copy_tree(collect, &files)?;
        }
        if let Some(build_dir) = sandbox_build_dir {
            let buildtree = rootdir.join("buildtree");
            copy_tree(build_dir, &buildtree)?;
        }

        let logs = rootdir.join("logs");
        fs::create_dir_all(&logs)?;
        fs::write(logs.join("build.log"), build_log.unwrap_or_default())?;

        let meta = rootdir.join("meta");
        fs::create_dir_all(&meta)?;
        fs::write(meta.join("public.yaml"), serde_yaml::to_string(public_data)?)?;
        fs::write(meta.join("build-result.yaml"), serde_yaml::to_string(build_result)?)?;
        fs::write(meta.join("keys.yaml"), serde_yaml::to_string(keys)?)?;
        fs::write(meta.join("dependencies.yaml"), serde_yaml::to_string(dependencies)?)?;
        fs::write(meta.join("workspaced.yaml"), serde_yaml::to_string(&WorkspacedFlag { workspaced: false })?)?;
        fs::write(
            meta.join("workspaced-dependencies.yaml"),
            serde_yaml::to_string(&BTreeMap::<String, bool>::new())?,
        )?;

        let digest = self.store.add_tree(rootdir)?;
        for key in keys_to_commit {
            self.refs.set_ref(key, &digest)?;
        }
        Ok(digest.size_bytes)
    }

    /// True iff `meta/` is fully resolvable and, if the artifact has a
    /// `files/` subtree, it is present at the requested completeness.
    pub fn cached(&self, key: &str, completeness: Completeness) -> bool {
        let Ok(Some(digest)) = self.refs.get_ref(key) else { return false };
        let with_files = matches!(completeness, Completeness::FilesAndContents);
        self.store.contains_directory(&digest, with_files).unwrap_or(false)
    }

    pub fn cached_buildtree(&self, key: &str) -> bool {
        let Some(entries) = self.root_entries(key) else { return false };
        entries.iter().any(|e| e.name == "buildtree" && e.kind == kiln_cas::EntryKind::Directory)
    }

    pub fn cached_logs(&self, key: &str) -> bool {
        let Some(log_digest) = self.find_nested(key, &["logs", "build.log"]) else { return false };
        self.store.contains_blob(&log_digest).unwrap_or(false)
    }

    pub fn get_files(&self, key: &str) -> Result<Digest> {
        self.find_nested(key, &["files"]).ok_or_else(|| ArtifactError::NotCached(key.to_string()))
    }

    pub fn get_buildtree(&self, key: &str) -> Result<Digest> {
        self.find_nested(key, &["buildtree"]).ok_or_else(|| ArtifactError::NotCached(key.to_string()))
    }

    pub fn load_public_data(&self, key: &str) -> Result<serde_json::Value> {
        let bytes = self.read_meta_file(key, "public.yaml")?;
        Ok(serde_yaml::from_slice(&bytes)?)
    }

    pub fn load_build_result(&self, key: &str) -> Result<BuildResult> {
        let bytes = self.read_meta_file(key, "build-result.yaml")?;
        Ok(serde_yaml::from_slice(&bytes)?)
    }

    pub fn load_metadata_keys(&self, key: &str) -> Result<Keys> {
        let bytes = self.read_meta_file(key, "keys.yaml")?;
        Ok(serde_yaml::from_slice(&bytes)?)
    }

    pub fn load_metadata_dependencies(&self, key: &str) -> Result<BTreeMap<String, String>> {
        let bytes = self.read_meta_file(key, "dependencies.yaml")?;
        Ok(serde_yaml::from_slice(&bytes)?)
    }

    fn root_entries(&self, key: &str) -> Option<Vec<kiln_cas::TreeEntry>> {
        let digest = self.refs.get_ref(key).ok()??;
        self.store.tree_entries(&digest).ok()
    }

    fn find_nested(&self, key: &str, path: &[&str]) -> Option<Digest> {
        let mut entries = self.root_entries(key)?;
        let mut digest = None;
        for (i, component) in path.iter().enumerate() {
            let entry = entries.iter().find(|e| &e.name == component)?;
            digest = entry.digest.clone();
            if i + 1 < path.len() {
                entries = self.store.tree_entries(digest.as_ref()?).ok()?;
            }
        }
        digest
    }

    fn read_meta_file(&self, key: &str, name: &str) -> Result<Vec<u8>> {
        let digest = self
            .find_nested(key, &["meta", name])
            .ok_or_else(|| ArtifactError::NotCached(format!("{key}/meta/{name}")))?;
        Ok(self.store.read_blob(&digest)?)
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct WorkspacedFlag {
    workspaced: bool,
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let target = dest.join(entry.file_name());
        if ty.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if ty.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_cas::FsStore;

    fn harness() -> (tempfile::TempDir, ArtifactStore<FsStore, FsRefStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        let refs = FsRefStore::new(dir.path());
        (dir, ArtifactStore::new(store, refs))
    }

    fn sample_public_data() -> serde_json::Value {
        serde_json::json!({"bin-path": "/usr/bin/widget"})
    }

    #[test]
    fn cache_then_cached_round_trips_under_both_keys() {
        let (dir, artifact) = harness();
        let collect = dir.path().join("collected");
        fs::create_dir_all(&collect).unwrap();
        fs::write(collect.join("out.bin"), b"payload").unwrap();

        let root = dir.path().join("artifact-root");
        let result = BuildResult { success: true, description: "ok".into(), detail: None };
        let keys = Keys { strong: "s".repeat(64), weak: "w".repeat(64) };
        let deps = BTreeMap::from([("base.bst".to_string(), "d".repeat(64))]);

        artifact
            .cache(
                &root,
                None,
                Some(&collect),
                Some("build ok\n"),
                &result,
                &keys,
                &deps,
                &sample_public_data(),
                &[keys.strong.clone(), keys.weak.clone()],
            )
            .unwrap();

        assert!(artifact.cached(&keys.strong, Completeness::FilesAndContents));
        assert!(artifact.cached(&keys.weak, Completeness::FilesAndContents));
        assert!(!artifact.cached("0".repeat(64).as_str(), Completeness::DirectoriesOnly));
    }

    #[test]
    fn missing_files_subtree_does_not_block_meta_only_artifact() {
        let (dir, artifact) = harness();
        let root = dir.path().join("artifact-root");
        let result = BuildResult { success: false, description: "junction has no output".into(), detail: None };
        let keys = Keys { strong: "a".repeat(64), weak: "b".repeat(64) };

        artifact
            .cache(
                &root,
                None,
                None,
                None,
                &result,
                &keys,
                &BTreeMap::new(),
                &sample_public_data(),
                &[keys.strong.clone()],
            )
            .unwrap();

        assert!(artifact.cached(&keys.strong, Completeness::FilesAndContents));
        assert!(artifact.get_files(&keys.strong).is_err());
        assert_eq!(artifact.load_build_result(&keys.strong).unwrap().success, false);
    }

    #[test]
    fn load_metadata_round_trips_keys_and_dependencies() {
        let (dir, artifact) = harness();
        let root = dir.path().join("artifact-root");
        let result = BuildResult { success: true, description: "ok".into(), detail: None };
        let keys = Keys { strong: "c".repeat(64), weak: "e".repeat(64) };
        let deps = BTreeMap::from([("base.bst".to_string(), "f".repeat(64))]);

        artifact
            .cache(&root, None, None, None, &result, &keys, &deps, &sample_public_data(), &[keys.strong.clone()])
            .unwrap();

        let loaded_keys = artifact.load_metadata_keys(&keys.strong).unwrap();
        assert_eq!(loaded_keys.strong, keys.strong);
        assert_eq!(loaded_keys.weak, keys.weak);

        let loaded_deps = artifact.load_metadata_dependencies(&keys.strong).unwrap();
        assert_eq!(loaded_deps, deps);

        let public = artifact.load_public_data(&keys.strong).unwrap();
        assert_eq!(public, sample_public_data());
    }

    #[test]
    fn cached_logs_and_buildtree_reflect_what_was_assembled() {
        let (dir, artifact) = harness();
        let build_dir = dir.path().join("sandbox-build");
        fs::create_dir_all(&build_dir).unwrap();
        fs::write(build_dir.join("config.log"), b"...").unwrap();

        let root = dir.path().join("artifact-root");
        let result = BuildResult { success: true, description: "ok".into(), detail: None };
        let keys = Keys { strong: "1".repeat(64), weak: "2".repeat(64) };

        artifact
            .cache(
                &root,
                Some(&build_dir),
                None,
                Some("log line\n"),
                &result,
                &keys,
                &BTreeMap::new(),
                &sample_public_data(),
                &[keys.strong.clone()],
            )
            .unwrap();

        assert!(artifact.cached_logs(&keys.strong));
        assert!(artifact.cached_buildtree(&keys.strong));
    }
}

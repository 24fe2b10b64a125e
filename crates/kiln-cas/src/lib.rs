//! A content-addressed blob and tree store: the leaf dependency everything
//! else in `kiln` is eventually built on. Blobs are addressed by
//! `{hash, size}`; directories are Merkle trees over a sorted entry list,
//! themselves stored as blobs, so a single sharded object namespace serves
//! both.
//!
//! # Example
//! ```
//! use kiln_cas::{FsStore, Store};
//! use std::io::Write;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let store = FsStore::new(dir.path());
//!
//! let src = dir.path().join("project");
//! std::fs::create_dir(&src).unwrap();
//! std::fs::write(src.join("hello.txt"), b"hi").unwrap();
//!
//! let digest = store.add_tree(&src).unwrap();
//! assert!(store.contains_directory(&digest, true).unwrap());
//!
//! let dest = dir.path().join("extracted");
//! store.extract(&digest, &dest).unwrap();
//! assert_eq!(std::fs::read(dest.join("hello.txt")).unwrap(), b"hi");
//! ```

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// A content digest: the hash algorithm, its lowercase hex encoding, and the
/// byte size of the object it names. `size_bytes` is carried alongside the
/// hash (rather than recomputed) so callers can budget transfers and detect
/// truncation without re-reading the object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest {
    pub algo: &'static str,
    pub hex: String,
    pub size_bytes: u64,
}

impl Digest {
    fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Digest {
            algo: "sha256",
            hex: hex::encode(hasher.finalize()),
            size_bytes: bytes.len() as u64,
        }
    }

    /// The two-hex-char shard prefix used to keep any one `objects/` directory
    /// from accumulating too many entries.
    fn shard(&self) -> (&str, &str) {
        self.hex.split_at(2)
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algo, self.hex)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CasError {
    #[error("missing blob: {digest}")]
    MissingBlob { digest: Digest },
    #[error("corrupt blob {digest}: expected {expected} found {found}")]
    CorruptBlob { digest: Digest, expected: String, found: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CasError>;

/// The kind of filesystem entry a [`TreeEntry`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One entry in a directory's Merkle tree. Entries are always kept sorted by
/// `name` before serialization, which is what makes two directories with
/// identical content produce an identical tree digest regardless of the
/// filesystem's own readdir order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub kind: EntryKind,
    /// The blob (for files) or tree (for directories) digest. `None` for
    /// symlinks, which carry their target inline instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(default)]
    pub executable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tree {
    entries: Vec<TreeEntry>,
}

/// Approximate, process-lifetime running total of bytes committed to the
/// store, used for cache-size bookkeeping: queues call
/// `add_artifact_size` from their `done()` hooks so a session can report
/// "approximately N bytes cached" without a full directory walk, and flag
/// `quota_exceeded` without claiming byte-exact accounting.
#[derive(Debug, Default)]
pub struct CacheUsage {
    approximate_bytes: AtomicU64,
}

impl CacheUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_artifact_size(&self, bytes: u64) {
        self.approximate_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn approximate_size(&self) -> u64 {
        self.approximate_bytes.load(Ordering::Relaxed)
    }

    pub fn quota_exceeded(&self, quota_bytes: u64) -> bool {
        self.approximate_size() > quota_bytes
    }
}

/// The content store contract. `contains_directory` with
/// `with_files = false` only verifies the tree spine (directory objects
/// reachable from `digest`) is present, not that every file blob they
/// reference has actually landed — useful for a metadata-only artifact
/// reference check.
pub trait Store {
    fn contains_blob(&self, digest: &Digest) -> Result<bool>;
    fn contains_directory(&self, digest: &Digest, with_files: bool) -> Result<bool>;
    fn add_blob(&self, bytes: &[u8]) -> Result<Digest>;
    fn add_tree(&self, local_path: &Path) -> Result<Digest>;
    fn extract(&self, digest: &Digest, dest_path: &Path) -> Result<()>;
    /// Lists the immediate entries of a tree object without materializing
    /// anything to disk, so callers that only need to navigate into a named
    /// subdirectory (e.g. `kiln-artifact` finding its `files/` entry within
    /// an artifact root) don't have to extract the whole tree first.
    fn tree_entries(&self, digest: &Digest) -> Result<Vec<TreeEntry>>;
    /// Reads a single blob's raw bytes (not a tree) without extracting it
    /// to the filesystem, e.g. for small metadata files a caller wants to
    /// deserialize directly.
    fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>>;
}

/// An on-disk [`Store`] sharding objects under `objects/<2-hex>/<rest-hex>`,
/// matching the persisted cache-dir layout. Writes go to a temp file in the
/// same shard directory, then `rename()`, so two processes racing to add
/// identical content never observe a torn write and simply agree on the same
/// final digest.
pub struct FsStore {
    root: PathBuf,
    usage: CacheUsage,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsStore { root: root.into(), usage: CacheUsage::new() }
    }

    pub fn usage(&self) -> &CacheUsage {
        &self.usage
    }

    fn object_path(&self, digest: &Digest) -> PathBuf {
        let (shard, rest) = digest.shard();
        self.root.join("objects").join(shard).join(rest)
    }

    fn write_object(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(digest);
        if path.exists() {
            return Ok(());
        }
        let dir = path.parent().expect("object path always has a shard parent");
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(".tmp-{}-{}", std::process::id(), digest.hex));
        fs::write(&tmp, bytes)?;
        match fs::rename(&tmp, &path) {
            Ok(()) => Ok(()),
            Err(e) if path.exists() => {
                let _ = fs::remove_file(&tmp);
                let _ = e;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_object(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.object_path(digest);
        fs::read(&path).map_err(|_| CasError::MissingBlob { digest: digest.clone() })
    }

    fn read_tree(&self, digest: &Digest) -> Result<Tree> {
        let bytes = self.read_object(digest)?;
        let tree: Tree = serde_json::from_slice(&bytes).map_err(|_| CasError::CorruptBlob {
            digest: digest.clone(),
            expected: "tree manifest".to_string(),
            found: format!("{} raw bytes", bytes.len()),
        })?;
        Ok(tree)
    }

    fn add_tree_recursive(&self, path: &Path) -> Result<Digest> {
        let mut names: Vec<_> = fs::read_dir(path)?.collect::<std::result::Result<_, _>>()?;
        names.sort_by_key(|e| e.file_name());

        let mut entries = Vec::with_capacity(names.len());
        for entry in names {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata()?;
            let entry_path = entry.path();

            if meta.file_type().is_symlink() {
                let target = fs::read_link(&entry_path)?.to_string_lossy().into_owned();
                entries.push(TreeEntry {
                    name,
                    kind: EntryKind::Symlink,
                    digest: None,
                    executable: false,
                    symlink_target: Some(target),
                });
            } else if meta.is_dir() {
                let digest = self.add_tree_recursive(&entry_path)?;
                entries.push(TreeEntry {
                    name,
                    kind: EntryKind::Directory,
                    digest: Some(digest),
                    executable: false,
                    symlink_target: None,
                });
            } else {
                let bytes = fs::read(&entry_path)?;
                let executable = meta.permissions().mode() & 0o100 != 0;
                let digest = self.add_blob(&bytes)?;
                entries.push(TreeEntry { name, kind: EntryKind::File, digest: Some(digest), executable, symlink_target: None });
            }
        }

        let tree = Tree { entries };
        let bytes = serde_json::to_vec(&tree)?;
        let digest = Digest::of_bytes(&bytes);
        self.write_object(&digest, &bytes)?;
        Ok(digest)
    }
}

impl Store for FsStore {
    fn contains_blob(&self, digest: &Digest) -> Result<bool> {
        Ok(self.object_path(digest).is_file())
    }

    fn contains_directory(&self, digest: &Digest, with_files: bool) -> Result<bool> {
        if !self.contains_blob(digest)? {
            return Ok(false);
        }
        let Ok(tree) = self.read_tree(digest) else {
            return Ok(false);
        };
        for entry in &tree.entries {
            match entry.kind {
                EntryKind::Directory => {
                    let Some(d) = &entry.digest else { return Ok(false) };
                    if !self.contains_directory(d, with_files)? {
                        return Ok(false);
                    }
                }
                EntryKind::File => {
                    if with_files {
                        let Some(d) = &entry.digest else { return Ok(false) };
                        if !self.contains_blob(d)? {
                            return Ok(false);
                        }
                    }
                }
                EntryKind::Symlink => {}
            }
        }
        Ok(true)
    }

    fn add_blob(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = Digest::of_bytes(bytes);
        self.write_object(&digest, bytes)?;
        Ok(digest)
    }

    fn add_tree(&self, local_path: &Path) -> Result<Digest> {
        self.add_tree_recursive(local_path)
    }

    fn tree_entries(&self, digest: &Digest) -> Result<Vec<TreeEntry>> {
        Ok(self.read_tree(digest)?.entries)
    }

    fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.read_object(digest)
    }

    fn extract(&self, digest: &Digest, dest_path: &Path) -> Result<()> {
        let tree = self.read_tree(digest)?;
        fs::create_dir_all(dest_path)?;
        for entry in &tree.entries {
            let out = dest_path.join(&entry.name);
            match entry.kind {
                EntryKind::Directory => {
                    let d = entry.digest.as_ref().expect("directory entry always has a digest");
                    self.extract(d, &out)?;
                }
                EntryKind::File => {
                    let d = entry.digest.as_ref().expect("file entry always has a digest");
                    let bytes = self.read_object(d)?;
                    fs::write(&out, &bytes)?;
                    if entry.executable {
                        let mut perm = fs::metadata(&out)?.permissions();
                        perm.set_mode(perm.mode() | 0o111);
                        fs::set_permissions(&out, perm)?;
                    }
                }
                EntryKind::Symlink => {
                    let target = entry.symlink_target.as_deref().expect("symlink entry always has a target");
                    std::os::unix::fs::symlink(target, &out)?;
                }
            }
        }
        Ok(())
    }
}

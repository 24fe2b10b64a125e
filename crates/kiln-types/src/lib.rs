//! Shared domain types threaded through every `kiln` crate: the element
//! and source data model, the enums that drive the cache-key engine and
//! queue pipeline, and the `{domain, reason, message, detail}` error
//! taxonomy that every fallible operation in the workspace eventually
//! surfaces as.
//!
//! Nothing in this crate touches the filesystem or spawns a process; it is
//! pure data plus the small amount of serde plumbing (duration encoding,
//! tagged enums) that every downstream crate relies on.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

/// Serializes a [`Duration`] as a humantime string (`"30s"`, `"2m"`), so
/// config files and event logs stay human-readable instead of carrying raw
/// millisecond counts.
///
/// # Example
/// ```
/// use kiln_types::serialize_duration;
/// use serde::Serialize;
/// use std::time::Duration;
///
/// #[derive(Serialize)]
/// struct Wrapper {
///     #[serde(serialize_with = "serialize_duration")]
///     timeout: Duration,
/// }
///
/// let json = serde_json::to_string(&Wrapper { timeout: Duration::from_secs(30) }).unwrap();
/// assert_eq!(json, r#"{"timeout":"30s"}"#);
/// ```
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

/// Deserializes a [`Duration`] from either a humantime string (`"30s"`) or a
/// bare integer number of milliseconds, so older config/event files that
/// predate the humantime encoding keep loading.
///
/// # Example
/// ```
/// use kiln_types::deserialize_duration;
/// use serde::Deserialize;
/// use std::time::Duration;
///
/// #[derive(Deserialize)]
/// struct Wrapper {
///     #[serde(deserialize_with = "deserialize_duration")]
///     timeout: Duration,
/// }
///
/// let from_string: Wrapper = serde_json::from_str(r#"{"timeout":"30s"}"#).unwrap();
/// assert_eq!(from_string.timeout, Duration::from_secs(30));
///
/// let from_millis: Wrapper = serde_json::from_str(r#"{"timeout":30000}"#).unwrap();
/// assert_eq!(from_millis.timeout, Duration::from_secs(30));
/// ```
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationRepr {
        Humantime(String),
        Millis(u64),
    }

    match DurationRepr::deserialize(deserializer)? {
        DurationRepr::Humantime(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration {s:?}: {e}"))),
        DurationRepr::Millis(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// The hex width of a SHA-256 digest; every cache key in the system is a
/// lowercase hex string of exactly this length.
pub const KEY_HEX_WIDTH: usize = 64;

/// Cheap shape check for a candidate cache key, used before treating an
/// arbitrary string as a digest (e.g. parsing `--use-artifact <key>` or a ref
/// read back from artifact metadata).
///
/// # Example
/// ```
/// use kiln_types::is_key;
///
/// assert!(is_key(&"a".repeat(64)));
/// assert!(!is_key("not-a-key"));
/// assert!(!is_key(&"A".repeat(64))); // uppercase is rejected
/// ```
pub fn is_key(s: &str) -> bool {
    s.len() == KEY_HEX_WIDTH && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// The scope of dependencies to include when iterating an element's
/// dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// The element plus everything it depends on, directly or transitively,
    /// in order to be built.
    All,
    /// Everything required to build the element's runtime dependencies too,
    /// not including the element itself.
    Build,
    /// The element plus everything required to run it.
    Run,
    /// Just the element itself, no dependencies.
    None,
}

/// The consistency state of a [`Source`]: how far along the
/// inconsistent → resolved → cached lifecycle it has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// No reference pinning upstream content; can only be tracked.
    Inconsistent = 0,
    /// A reference exists but content is not staged locally; can be fetched.
    Resolved = 1,
    /// Content is locally staged and ready to build from.
    Cached = 2,
}

impl Consistency {
    /// The minimum (least-progressed) of an element's sources' consistencies.
    pub fn min_of<I: IntoIterator<Item = Consistency>>(sources: I) -> Option<Consistency> {
        sources.into_iter().min()
    }
}

/// Which of the three cache-key tiers an operation is asking about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrength {
    /// Config plus build-dep names (or weak keys, under `strict_rebuild`).
    Weak,
    /// Config plus the transitive closure of build-deps' strict keys.
    Strict,
    /// Strict key under strict policy; the as-built key under non-strict.
    Strong,
}

/// A cache key, which is either a computed digest or not yet computable
/// because some input (typically a dependency's key) is still unresolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKey {
    Unresolved,
    Digest(String),
}

impl CacheKey {
    pub fn digest(&self) -> Option<&str> {
        match self {
            CacheKey::Digest(d) => Some(d.as_str()),
            CacheKey::Unresolved => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, CacheKey::Digest(_))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Unresolved => write!(f, "<unresolved>"),
            CacheKey::Digest(d) => write!(f, "{d}"),
        }
    }
}

/// A named resource class a job reserves before running. `kiln-job` and
/// `kiln-resources` are separate crates; this enum is the vocabulary they
/// share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Exclusive-marker only; unbounded capacity otherwise.
    Cache,
    /// Bounded by `n_fetchers`/`n_pushers`-style download concurrency.
    Download,
    /// Bounded by `n_builders`-style CPU/process concurrency.
    Process,
    /// Bounded by upload concurrency.
    Upload,
}

/// What a queue's `status()` check decided about an element, before any job
/// is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// A job should be created for this element right now.
    Ready,
    /// Re-ask later; the element stays in the queue's wait list.
    Wait,
    /// This queue's work is unnecessary for this element.
    Skip,
}

/// The outcome of a completed job, as reported back to the queue that
/// created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Ok,
    Failed,
    /// The job was terminated before completion (signal, shutdown).
    Skipped,
}

/// Whether an element's build result, once known, is a success or a
/// (legitimately cacheable) failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Success,
    Failure,
}

/// A single ordered component of an element: git checkout, tarball, local
/// directory, etc. `kiln-types` only models the state every source kind
/// shares; kind-specific fetch/track/stage behavior is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// Index within the element's ordered source list; sources are staged in
    /// this order.
    pub index: usize,
    pub kind: String,
    pub consistency: Consistency,
    /// Opaque unique-key contribution from this source (e.g. resolved ref)
    /// folded into the owning element's `config_dict` once `Resolved`.
    pub unique_key: Option<String>,
}

/// The unit of build: a stable name, a kind, sources, configuration, and
/// dependency edges to other elements.
///
/// # Example
/// ```
/// use kiln_types::Element;
///
/// let mut el = Element::new("mid.bst", "manual");
/// el.build_dependencies.push("base.bst".into());
/// assert!(el.validate().is_ok());
/// assert_eq!(el.name, "mid.bst");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    /// Project-relative identifier; unique within the owning project.
    pub name: String,
    pub kind: String,
    pub sources: Vec<Source>,
    /// Kind-specific configuration mapping, already variable-substituted.
    pub configuration: BTreeMap<String, serde_json::Value>,
    pub variables: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
    /// Environment keys excluded from `config_dict`: changing these does
    /// not change the element's cache key.
    pub environment_nocache: Vec<String>,
    /// Opaque data surfaced to dependents.
    pub public_data: BTreeMap<String, serde_json::Value>,
    pub build_dependencies: Vec<String>,
    pub runtime_dependencies: Vec<String>,
    /// When set, the weak key folds in build-deps' weak keys instead of
    /// just their names.
    pub strict_rebuild: bool,
}

impl Element {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Element {
            name: name.into(),
            kind: kind.into(),
            sources: Vec::new(),
            configuration: BTreeMap::new(),
            variables: BTreeMap::new(),
            environment: BTreeMap::new(),
            environment_nocache: Vec::new(),
            public_data: BTreeMap::new(),
            build_dependencies: Vec::new(),
            runtime_dependencies: Vec::new(),
            strict_rebuild: false,
        }
    }

    /// Checks invariants that don't require knowing the rest of the project
    /// graph. Currently only the junction no-dependencies invariant: a
    /// junction may not declare any dependency, build or runtime.
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.kind == "junction" && !self.build_dependencies.is_empty() {
            return Err(LoadError::InvalidJunction(format!(
                "junction element {:?} declares build-dependencies, which is not permitted",
                self.name
            )));
        }
        if self.kind == "junction" && !self.runtime_dependencies.is_empty() {
            return Err(LoadError::InvalidJunction(format!(
                "junction element {:?} declares runtime-dependencies, which is not permitted",
                self.name
            )));
        }
        Ok(())
    }

    /// The element's `source_consistency`: the minimum of its sources'
    /// consistencies, or `Cached` for a source-less element (a junction, or
    /// an element that only aggregates dependencies).
    pub fn source_consistency(&self) -> Consistency {
        Consistency::min_of(self.sources.iter().map(|s| s.consistency)).unwrap_or(Consistency::Cached)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    pub jitter: f64,
}

/// Structured detail attached to an error, for machine-readable test
/// harnesses: a terminal error classification kept separate from the
/// human-readable `message` so a test can assert on `(domain, reason)`
/// without string-matching prose.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetail(pub BTreeMap<String, serde_json::Value>);

/// One of the seven error domains in the taxonomy. Every `thiserror` enum
/// below implements [`ErrorDomain::domain`] so callers can build the
/// `{domain, reason, message, detail}` envelope uniformly regardless of which
/// concrete error type they're holding.
pub trait ErrorDomain: std::error::Error {
    fn domain(&self) -> &'static str;
    fn reason(&self) -> &'static str;
    fn detail(&self) -> ErrorDetail {
        ErrorDetail::default()
    }
}

macro_rules! error_domain_impl {
    ($ty:ident, $domain:literal) => {
        impl ErrorDomain for $ty {
            fn domain(&self) -> &'static str {
                $domain
            }
            fn reason(&self) -> &'static str {
                self.reason_str()
            }
        }
    };
}

/// Malformed input, missing files, invalid data, circular dependencies,
/// unresolved variables, invalid junctions, subprojects without a ref.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("malformed element definition: {0}")]
    MalformedYaml(String),
    #[error("missing file: {0}")]
    MissingFile(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("bad element suffix: {0}")]
    BadElementSuffix(String),
    #[error("bad characters in name: {0}")]
    BadCharactersInName(String),
    #[error("circular dependency detected: {0}")]
    CircularDependency(String),
    #[error("unresolved variable: {0}")]
    UnresolvedVariable(String),
    #[error("invalid junction: {0}")]
    InvalidJunction(String),
    #[error("subproject inconsistent (no ref): {0}")]
    SubprojectInconsistent(String),
}

impl LoadError {
    fn reason_str(&self) -> &'static str {
        match self {
            LoadError::MalformedYaml(_) => "malformed-yaml",
            LoadError::MissingFile(_) => "missing-file",
            LoadError::InvalidData(_) => "invalid-data",
            LoadError::BadElementSuffix(_) => "bad-element-suffix",
            LoadError::BadCharactersInName(_) => "bad-characters-in-name",
            LoadError::CircularDependency(_) => "circular-dependency",
            LoadError::UnresolvedVariable(_) => "unresolved-variable",
            LoadError::InvalidJunction(_) => "invalid-junction",
            LoadError::SubprojectInconsistent(_) => "subproject-inconsistent",
        }
    }
}
error_domain_impl!(LoadError, "load");

/// Fetch/track/stage failure for a source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("track failed: {0}")]
    Track(String),
    #[error("stage failed: {0}")]
    Stage(String),
}

impl SourceError {
    fn reason_str(&self) -> &'static str {
        match self {
            SourceError::Fetch(_) => "fetch-failed",
            SourceError::Track(_) => "track-failed",
            SourceError::Stage(_) => "stage-failed",
        }
    }
}
error_domain_impl!(SourceError, "source");

/// Configuration invalid for the element's kind, or required inputs missing.
#[derive(Debug, thiserror::Error)]
pub enum ElementError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("required input missing: {0}")]
    MissingInput(String),
}

impl ElementError {
    fn reason_str(&self) -> &'static str {
        match self {
            ElementError::InvalidConfiguration(_) => "invalid-configuration",
            ElementError::MissingInput(_) => "missing-input",
        }
    }
}
error_domain_impl!(ElementError, "element");

/// Missing blobs, corrupt tree, push/pull failure against the content store.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("missing blob: {0}")]
    MissingBlob(String),
    #[error("corrupt tree: {0}")]
    CorruptTree(String),
    #[error("push failed: {0}")]
    PushFailed(String),
    #[error("pull failed: {0}")]
    PullFailed(String),
}

impl ArtifactError {
    fn reason_str(&self) -> &'static str {
        match self {
            ArtifactError::MissingBlob(_) => "missing-blob",
            ArtifactError::CorruptTree(_) => "corrupt-tree",
            ArtifactError::PushFailed(_) => "push-failed",
            ArtifactError::PullFailed(_) => "pull-failed",
        }
    }
}
error_domain_impl!(ArtifactError, "artifact");

/// Command-not-found, non-zero exit, unsupported sandbox feature.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("command not found: {0}")]
    CommandNotFound(String),
    #[error("non-zero exit ({code}): {message}")]
    NonZeroExit { code: i32, message: String },
    #[error("unsupported sandbox feature: {0}")]
    UnsupportedFeature(String),
}

impl SandboxError {
    fn reason_str(&self) -> &'static str {
        match self {
            SandboxError::CommandNotFound(_) => "command-not-found",
            SandboxError::NonZeroExit { .. } => "non-zero-exit",
            SandboxError::UnsupportedFeature(_) => "unsupported-feature",
        }
    }
}
error_domain_impl!(SandboxError, "sandbox");

/// Top-level pipeline orchestration error (planning, scheduling).
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("planning failed: {0}")]
    PlanningFailed(String),
    #[error("scheduling aborted: {0}")]
    SchedulingAborted(String),
}

impl StreamError {
    fn reason_str(&self) -> &'static str {
        match self {
            StreamError::PlanningFailed(_) => "planning-failed",
            StreamError::SchedulingAborted(_) => "scheduling-aborted",
        }
    }
}
error_domain_impl!(StreamError, "stream");

/// Loader-level plugin failure (out of scope beyond this abstract contract;
/// the plugin ecosystem itself is not reimplemented here).
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin load failed: {0}")]
    LoadFailed(String),
}

impl PluginError {
    fn reason_str(&self) -> &'static str {
        match self {
            PluginError::LoadFailed(_) => "load-failed",
        }
    }
}
error_domain_impl!(PluginError, "plugin");

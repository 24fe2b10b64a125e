//! Runtime polymorphism expressed as a capability interface rather than
//! subclassing: `CacheKeyController` is a trait with three concrete
//! implementations here.

use kiln_artifact::{Completeness, Keys};
use kiln_cachekey::CanonicalValue;
use kiln_types::{BuildOutcome, CacheKey, Consistency};

use crate::ElementState;

/// Abstracts the artifact store query surface a controller needs, so this
/// crate doesn't have to be generic over `kiln_artifact::ArtifactStore`'s
/// own `Store`/`RefStore` type parameters.
pub trait ArtifactLookup {
    fn cached(&self, key: &str, completeness: Completeness) -> bool;
    fn load_metadata_keys(&self, key: &str) -> Option<Keys>;
}

/// The operations a cache-key controller performs in response to scheduler
/// events. Each method mutates `state` in place and returns
/// nothing: key computation never fails, it only ever produces a digest or
/// leaves the key unresolved.
pub trait CacheKeyController {
    /// Computes the weak key once `state.source_consistency` allows it.
    /// `dep_names_or_weak_keys` is the caller-supplied join: direct
    /// build-dep *names* by default, or their *weak keys* when the element
    /// declares `strict_rebuild` -- the caller decides which, and passes
    /// it uniformly as strings.
    fn calculate_weak_key(&self, state: &mut ElementState, config_dict: &CanonicalValue, dep_names_or_weak_keys: &[Option<String>]);

    /// Computes the strict key from the transitive closure of build-deps'
    /// strict keys.
    fn calculate_strict_key(&self, state: &mut ElementState, config_dict: &CanonicalValue, dep_strict_keys: &[Option<String>]);

    /// Computes (or defers) the strong key. `dep_strong_keys` is only
    /// consulted by the non-strict controller once local/pull caching has
    /// been ruled out.
    fn calculate_strong_key(
        &self,
        state: &mut ElementState,
        config_dict: &CanonicalValue,
        dep_strong_keys: &[Option<String>],
        artifact: &dyn ArtifactLookup,
    );

    /// Sets `assemble_scheduled` if the element is required, not cached,
    /// not pull-pending, and has no prior (even cached-failure) result.
    fn maybe_schedule_assemble(&self, state: &mut ElementState) {
        state.assemble_scheduled =
            state.required && !self.is_cached(state) && !state.pull_pending && state.build_result.is_none();
    }

    fn is_cached(&self, state: &ElementState) -> bool {
        state.weak_cached || state.strict_cached
    }

    /// Re-checks local cache and keys after a track completes (sources
    /// became resolved/cached).
    fn tracking_done(&self, state: &mut ElementState, config_dict: &CanonicalValue, dep_weak_inputs: &[Option<String>], artifact: &dyn ArtifactLookup);

    /// Re-checks cache and propagates a newly-discovered strong key after a
    /// pull completes.
    fn pull_done(&self, state: &mut ElementState, artifact: &dyn ArtifactLookup);

    /// Records the outcome of a completed build.
    fn assemble_done(&self, state: &mut ElementState, outcome: BuildOutcome) {
        state.assemble_done = true;
        state.assemble_scheduled = false;
        state.pull_pending = false;
        state.build_result = Some(outcome);
    }
}

fn resolve_key(value: Option<String>) -> CacheKey {
    match value {
        Some(k) => CacheKey::Digest(k),
        None => CacheKey::Unresolved,
    }
}

/// Strict policy: weak, strict, and strong (== strict) keys are all
/// computed as soon as sources aren't `INCONSISTENT`; strong key is never
/// deferred to post-build/post-pull.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictController;

impl CacheKeyController for StrictController {
    fn calculate_weak_key(&self, state: &mut ElementState, config_dict: &CanonicalValue, deps: &[Option<String>]) {
        if state.source_consistency == Consistency::Inconsistent {
            return;
        }
        state.weak_key = resolve_key(kiln_cachekey::weak_key(config_dict, deps));
    }

    fn calculate_strict_key(&self, state: &mut ElementState, config_dict: &CanonicalValue, dep_strict_keys: &[Option<String>]) {
        if state.source_consistency == Consistency::Inconsistent {
            return;
        }
        state.strict_key = resolve_key(kiln_cachekey::strict_key(config_dict, dep_strict_keys));
        // Under strict policy the strong key always equals the strict key.
        state.strong_key = state.strict_key.clone();
    }

    fn calculate_strong_key(&self, state: &mut ElementState, _config_dict: &CanonicalValue, _dep_strong_keys: &[Option<String>], artifact: &dyn ArtifactLookup) {
        // Already set in `calculate_strict_key`; just refresh the local
        // cache flags against it.
        if let CacheKey::Digest(key) = &state.strict_key {
            state.strict_cached = artifact.cached(key, Completeness::FilesAndContents);
            state.weak_cached = state.strict_cached;
        }
    }

    fn tracking_done(&self, state: &mut ElementState, config_dict: &CanonicalValue, deps: &[Option<String>], artifact: &dyn ArtifactLookup) {
        self.calculate_weak_key(state, config_dict, deps);
        self.calculate_strict_key(state, config_dict, deps);
        self.calculate_strong_key(state, config_dict, deps, artifact);
        self.maybe_schedule_assemble(state);
    }

    fn pull_done(&self, state: &mut ElementState, artifact: &dyn ArtifactLookup) {
        state.pull_pending = false;
        if let CacheKey::Digest(key) = &state.strict_key {
            state.strict_cached = artifact.cached(key, Completeness::FilesAndContents);
            state.weak_cached = state.strict_cached;
        }
        self.maybe_schedule_assemble(state);
    }
}

/// Non-strict policy: the weak key is computed first and checked against
/// the local cache; if cached, the strong key is read back from the
/// artifact's own `meta/keys.yaml` rather than recomputed, which is what
/// lets an unrelated upstream change avoid rebuilding a dependent whose
/// weak key didn't change.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonStrictController;

impl CacheKeyController for NonStrictController {
    fn calculate_weak_key(&self, state: &mut ElementState, config_dict: &CanonicalValue, deps: &[Option<String>]) {
        if state.source_consistency == Consistency::Inconsistent {
            return;
        }
        state.weak_key = resolve_key(kiln_cachekey::weak_key(config_dict, deps));
    }

    fn calculate_strict_key(&self, state: &mut ElementState, config_dict: &CanonicalValue, dep_strict_keys: &[Option<String>]) {
        if state.source_consistency == Consistency::Inconsistent {
            return;
        }
        state.strict_key = resolve_key(kiln_cachekey::strict_key(config_dict, dep_strict_keys));
    }

    fn calculate_strong_key(
        &self,
        state: &mut ElementState,
        config_dict: &CanonicalValue,
        dep_strong_keys: &[Option<String>],
        artifact: &dyn ArtifactLookup,
    ) {
        let CacheKey::Digest(weak) = state.weak_key.clone() else {
            return;
        };
        state.weak_cached = artifact.cached(&weak, Completeness::FilesAndContents);

        if state.pull_pending {
            // Strong key stays unknown until after pull.
            state.strong_key = CacheKey::Unresolved;
            return;
        }

        if state.weak_cached {
            if let Some(keys) = artifact.load_metadata_keys(&weak) {
                state.strong_key = CacheKey::Digest(keys.strong);
                return;
            }
        }

        // Not locally cached: defer until every build-dep has a strong key.
        let resolved: Option<Vec<String>> = dep_strong_keys.iter().cloned().collect();
        state.strong_key = match resolved {
            Some(values) => CacheKey::Digest(
                kiln_cachekey::generate_key(&config_with_deps(config_dict, &values)),
            ),
            None => CacheKey::Unresolved,
        };
    }

    fn tracking_done(&self, state: &mut ElementState, config_dict: &CanonicalValue, deps: &[Option<String>], artifact: &dyn ArtifactLookup) {
        self.calculate_weak_key(state, config_dict, deps);
        self.calculate_strict_key(state, config_dict, deps);
        self.calculate_strong_key(state, config_dict, &[], artifact);
        self.maybe_schedule_assemble(state);
    }

    fn pull_done(&self, state: &mut ElementState, artifact: &dyn ArtifactLookup) {
        state.pull_pending = false;
        if let CacheKey::Digest(weak) = state.weak_key.clone() {
            state.weak_cached = artifact.cached(&weak, Completeness::FilesAndContents);
            if state.weak_cached {
                if let Some(keys) = artifact.load_metadata_keys(&weak) {
                    // A pull may surface a strong key that differs from the
                    // one computed purely from this element's own inputs,
                    // if an upstream build-dep changed in a way that
                    // doesn't affect this element's weak key.
                    state.strong_key = CacheKey::Digest(keys.strong);
                }
            }
        }
        self.maybe_schedule_assemble(state);
    }
}

fn config_with_deps(config_dict: &CanonicalValue, dep_strong_keys: &[String]) -> CanonicalValue {
    use std::collections::BTreeMap;
    let mut map = BTreeMap::new();
    map.insert("config".to_string(), config_dict.clone());
    map.insert(
        "strong_dependencies".to_string(),
        CanonicalValue::List(dep_strong_keys.iter().cloned().map(CanonicalValue::Str).collect()),
    );
    CanonicalValue::Map(map)
}

/// A pre-keyed controller: weak and strong keys are
/// supplied directly (e.g. `--use-artifact <key>` workflows) rather than
/// computed from config and dependencies. Used for `ArtifactElement`-style
/// references that are identified purely by a previously-known key.
#[derive(Debug, Clone)]
pub struct FixedKeyController {
    pub weak_key: String,
    pub strong_key: String,
}

impl CacheKeyController for FixedKeyController {
    fn calculate_weak_key(&self, state: &mut ElementState, _config_dict: &CanonicalValue, _deps: &[Option<String>]) {
        state.weak_key = CacheKey::Digest(self.weak_key.clone());
    }

    fn calculate_strict_key(&self, state: &mut ElementState, _config_dict: &CanonicalValue, _dep_strict_keys: &[Option<String>]) {
        state.strict_key = CacheKey::Digest(self.strong_key.clone());
    }

    fn calculate_strong_key(&self, state: &mut ElementState, _config_dict: &CanonicalValue, _dep_strong_keys: &[Option<String>], artifact: &dyn ArtifactLookup) {
        state.strong_key = CacheKey::Digest(self.strong_key.clone());
        state.weak_cached = artifact.cached(&self.weak_key, Completeness::FilesAndContents);
        state.strict_cached = artifact.cached(&self.strong_key, Completeness::FilesAndContents);
    }

    fn tracking_done(&self, state: &mut ElementState, config_dict: &CanonicalValue, deps: &[Option<String>], artifact: &dyn ArtifactLookup) {
        self.calculate_weak_key(state, config_dict, deps);
        self.calculate_strict_key(state, config_dict, deps);
        self.calculate_strong_key(state, config_dict, deps, artifact);
        self.maybe_schedule_assemble(state);
    }

    fn pull_done(&self, state: &mut ElementState, artifact: &dyn ArtifactLookup) {
        state.pull_pending = false;
        state.weak_cached = artifact.cached(&self.weak_key, Completeness::FilesAndContents);
        state.strict_cached = artifact.cached(&self.strong_key, Completeness::FilesAndContents);
        self.maybe_schedule_assemble(state);
    }
}

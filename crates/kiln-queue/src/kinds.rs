//! The five fixed pipeline stages: track, fetch, pull, build, push.
//!
//! Each stage mutates only the raw [`ElementState`] fields it directly
//! owns; recomputing cache keys from those changes (the `CacheKeyController`
//! hooks `tracking_done`/`pull_done`/`assemble_done`, which need the
//! element's config dict and dependency keys) is the caller's job, done
//! once per tick after draining a stage's done list.

use kiln_job::{JobOutcome, JobSpec};
use kiln_resources::{ResourceSet, ResourceType};
use kiln_state::ElementState;
use kiln_types::{BuildOutcome, Consistency, QueueStatus};

use crate::QueueKind;

/// Updates refs from upstream sources. Elements with no sources skip
/// straight through, but are still marked resolved.
#[derive(Debug, Default)]
pub struct TrackQueue {
    has_sources: std::collections::BTreeMap<String, bool>,
}

impl TrackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers whether `element_name` has any sources at all, so
    /// `status` can skip source-less elements without re-deriving it from
    /// an `Element` reference it doesn't otherwise need.
    pub fn register(&mut self, element_name: impl Into<String>, has_sources: bool) {
        self.has_sources.insert(element_name.into(), has_sources);
    }
}

impl QueueKind for TrackQueue {
    fn action_name(&self) -> &'static str {
        "Track"
    }
    fn complete_name(&self) -> &'static str {
        "Tracked"
    }
    fn resources(&self) -> ResourceSet {
        [ResourceType::Download].into_iter().collect()
    }

    fn status(&self, _state: &ElementState, _build_dep_states: &[&ElementState]) -> QueueStatus {
        QueueStatus::Ready
    }

    fn process(&self, element_name: &str) -> JobSpec {
        JobSpec { action_name: self.action_name().to_string(), element_name: element_name.to_string(), payload: serde_json::Value::Null }
    }

    fn done(&self, state: &mut ElementState, outcome: &JobOutcome) {
        if outcome.is_success() {
            state.source_consistency = Consistency::Resolved;
        }
    }
}

/// Fetches all of an element's sources down to `Cached` consistency.
#[derive(Debug, Default)]
pub struct FetchQueue {
    /// When set, elements already artifact-cached skip fetching their
    /// sources at all.
    pub skip_cached: bool,
}

impl FetchQueue {
    pub fn new(skip_cached: bool) -> Self {
        FetchQueue { skip_cached }
    }
}

impl QueueKind for FetchQueue {
    fn action_name(&self) -> &'static str {
        "Fetch"
    }
    fn complete_name(&self) -> &'static str {
        "Fetched"
    }
    fn resources(&self) -> ResourceSet {
        [ResourceType::Download].into_iter().collect()
    }

    fn status(&self, state: &ElementState, _build_dep_states: &[&ElementState]) -> QueueStatus {
        if !state.required {
            return QueueStatus::Wait;
        }
        if self.skip_cached && (state.weak_cached || state.strict_cached) {
            return QueueStatus::Skip;
        }
        if state.source_consistency == Consistency::Cached {
            return QueueStatus::Skip;
        }
        QueueStatus::Ready
    }

    fn process(&self, element_name: &str) -> JobSpec {
        JobSpec { action_name: self.action_name().to_string(), element_name: element_name.to_string(), payload: serde_json::Value::Null }
    }

    fn done(&self, state: &mut ElementState, outcome: &JobOutcome) {
        if outcome.is_success() {
            state.source_consistency = Consistency::Cached;
        }
    }
}

/// Downloads an artifact from a remote cache when one is pending.
#[derive(Debug, Default)]
pub struct PullQueue;

impl PullQueue {
    pub fn new() -> Self {
        PullQueue
    }
}

impl QueueKind for PullQueue {
    fn action_name(&self) -> &'static str {
        "Pull"
    }
    fn complete_name(&self) -> &'static str {
        "Pulled"
    }
    fn resources(&self) -> ResourceSet {
        [ResourceType::Download, ResourceType::Cache].into_iter().collect()
    }

    fn status(&self, state: &ElementState, _build_dep_states: &[&ElementState]) -> QueueStatus {
        if !state.required {
            return QueueStatus::Wait;
        }
        if state.weak_key == kiln_types::CacheKey::Unresolved {
            // Cache not queryable yet (no resolved key to query with).
            return QueueStatus::Wait;
        }
        if state.pull_pending {
            QueueStatus::Ready
        } else {
            QueueStatus::Skip
        }
    }

    fn process(&self, element_name: &str) -> JobSpec {
        JobSpec { action_name: self.action_name().to_string(), element_name: element_name.to_string(), payload: serde_json::Value::Null }
    }

    fn done(&self, state: &mut ElementState, outcome: &JobOutcome) {
        // A pull that found nothing to download is reclassified as
        // skipped at done()-time rather than failed.
        if outcome.is_success() {
            state.pull_pending = false;
            state.weak_cached = true;
            state.strict_cached = true;
        }
    }
}

/// Stages build-deps and runs an element's assemble action.
#[derive(Debug, Default)]
pub struct BuildQueue {
    tried: std::cell::RefCell<std::collections::BTreeSet<String>>,
}

impl BuildQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueKind for BuildQueue {
    fn action_name(&self) -> &'static str {
        "Build"
    }
    fn complete_name(&self) -> &'static str {
        "Built"
    }
    fn resources(&self) -> ResourceSet {
        [ResourceType::Process].into_iter().collect()
    }

    fn status(&self, state: &ElementState, build_dep_states: &[&ElementState]) -> QueueStatus {
        if !state.required {
            return QueueStatus::Wait;
        }
        if matches!(state.build_result, Some(BuildOutcome::Success)) {
            return QueueStatus::Skip;
        }
        if !state.buildable(build_dep_states) {
            return QueueStatus::Wait;
        }
        QueueStatus::Ready
    }

    fn process(&self, element_name: &str) -> JobSpec {
        JobSpec { action_name: self.action_name().to_string(), element_name: element_name.to_string(), payload: serde_json::Value::Null }
    }

    fn done(&self, state: &mut ElementState, outcome: &JobOutcome) {
        state.assemble_done = true;
        state.build_result = Some(if outcome.is_success() { BuildOutcome::Success } else { BuildOutcome::Failure });
    }

    fn cached_failure(&self, state: &ElementState) -> bool {
        matches!(state.build_result, Some(BuildOutcome::Failure))
    }
}

impl BuildQueue {
    /// Tracks which elements' cached failure has already been bypassed
    /// once this session, so a subsequent `enqueue` of the same element
    /// reports the cached failure again rather than re-running it.
    pub fn mark_tried(&self, element_name: &str) -> bool {
        self.tried.borrow_mut().insert(element_name.to_string())
    }
}

/// Uploads a built artifact to remotes.
#[derive(Debug, Default)]
pub struct PushQueue {
    pub has_remotes: bool,
    /// Whether a cached-failure artifact should be pushed too, rather than
    /// skipped. Off by default: a remote is normally a place to fetch
    /// successes from, not a shared record of what failed.
    pub push_cached_failures: bool,
}

impl PushQueue {
    pub fn new(has_remotes: bool) -> Self {
        PushQueue { has_remotes, push_cached_failures: false }
    }

    pub fn with_cached_failures(has_remotes: bool, push_cached_failures: bool) -> Self {
        PushQueue { has_remotes, push_cached_failures }
    }
}

impl QueueKind for PushQueue {
    fn action_name(&self) -> &'static str {
        "Push"
    }
    fn complete_name(&self) -> &'static str {
        "Pushed"
    }
    fn resources(&self) -> ResourceSet {
        [ResourceType::Upload].into_iter().collect()
    }

    fn status(&self, state: &ElementState, _build_dep_states: &[&ElementState]) -> QueueStatus {
        if !self.has_remotes {
            return QueueStatus::Skip;
        }
        if state.pushed {
            return QueueStatus::Skip;
        }
        // Only elements actually assembled this session have anything
        // new to push; a pulled-from-cache element is already elsewhere.
        if !state.assemble_done {
            return QueueStatus::Skip;
        }
        let pushable = match state.build_result {
            Some(BuildOutcome::Success) => true,
            Some(BuildOutcome::Failure) => self.push_cached_failures,
            None => false,
        };
        if !pushable {
            return QueueStatus::Skip;
        }
        QueueStatus::Ready
    }

    fn process(&self, element_name: &str) -> JobSpec {
        JobSpec { action_name: self.action_name().to_string(), element_name: element_name.to_string(), payload: serde_json::Value::Null }
    }

    fn done(&self, state: &mut ElementState, outcome: &JobOutcome) {
        if outcome.is_success() {
            state.pushed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ElementState {
        let mut s = ElementState::new();
        s.required = true;
        s
    }

    #[test]
    fn fetch_skips_when_already_cached_consistency() {
        let q = FetchQueue::new(false);
        let mut s = state();
        s.source_consistency = Consistency::Cached;
        assert_eq!(q.status(&s, &[]), QueueStatus::Skip);
    }

    #[test]
    fn fetch_waits_when_not_required() {
        let q = FetchQueue::new(false);
        let s = ElementState::new();
        assert_eq!(q.status(&s, &[]), QueueStatus::Wait);
    }

    #[test]
    fn pull_ready_when_pending() {
        let q = PullQueue::new();
        let mut s = state();
        s.weak_key = kiln_types::CacheKey::Digest("a".repeat(64));
        s.pull_pending = true;
        assert_eq!(q.status(&s, &[]), QueueStatus::Ready);
    }

    #[test]
    fn pull_skips_when_not_pending() {
        let q = PullQueue::new();
        let mut s = state();
        s.weak_key = kiln_types::CacheKey::Digest("a".repeat(64));
        s.pull_pending = false;
        assert_eq!(q.status(&s, &[]), QueueStatus::Skip);
    }

    #[test]
    fn build_skips_cached_success() {
        let q = BuildQueue::new();
        let mut s = state();
        s.build_result = Some(BuildOutcome::Success);
        assert_eq!(q.status(&s, &[]), QueueStatus::Skip);
    }

    #[test]
    fn build_waits_until_buildable() {
        let q = BuildQueue::new();
        let s = state();
        let mut dep = ElementState::new();
        dep.weak_cached = false;
        dep.strict_cached = false;
        assert_eq!(q.status(&s, &[&dep]), QueueStatus::Wait);
    }

    #[test]
    fn build_ready_when_buildable() {
        let q = BuildQueue::new();
        let s = state();
        let mut dep = ElementState::new();
        dep.weak_cached = true;
        assert_eq!(q.status(&s, &[&dep]), QueueStatus::Ready);
    }

    #[test]
    fn build_cached_failure_reports_without_rerunning_once() {
        let q = BuildQueue::new();
        let mut s = state();
        s.build_result = Some(BuildOutcome::Failure);
        assert!(q.cached_failure(&s));
        assert!(q.mark_tried("top"));
        assert!(!q.mark_tried("top"), "second mark is a no-op");
    }

    #[test]
    fn push_skips_without_remotes() {
        let q = PushQueue::new(false);
        let s = state();
        assert_eq!(q.status(&s, &[]), QueueStatus::Skip);
    }

    #[test]
    fn push_ready_when_built_this_session() {
        let q = PushQueue::new(true);
        let mut s = state();
        s.assemble_done = true;
        s.build_result = Some(BuildOutcome::Success);
        assert_eq!(q.status(&s, &[]), QueueStatus::Ready);
    }

    #[test]
    fn push_skips_cached_failure_by_default() {
        let q = PushQueue::new(true);
        let mut s = state();
        s.assemble_done = true;
        s.build_result = Some(BuildOutcome::Failure);
        assert_eq!(q.status(&s, &[]), QueueStatus::Skip);
    }

    #[test]
    fn push_includes_cached_failure_when_opted_in() {
        let q = PushQueue::with_cached_failures(true, true);
        let mut s = state();
        s.assemble_done = true;
        s.build_result = Some(BuildOutcome::Failure);
        assert_eq!(q.status(&s, &[]), QueueStatus::Ready);
    }

    #[test]
    fn push_done_marks_state_pushed_on_success() {
        let q = PushQueue::new(true);
        let mut s = state();
        s.assemble_done = true;
        s.build_result = Some(BuildOutcome::Success);
        q.done(&mut s, &JobOutcome::Success(serde_json::Value::Null));
        assert!(s.pushed);
    }

    #[test]
    fn push_skips_element_already_pushed_this_session() {
        let q = PushQueue::new(true);
        let mut s = state();
        s.assemble_done = true;
        s.build_result = Some(BuildOutcome::Success);
        s.pushed = true;
        assert_eq!(q.status(&s, &[]), QueueStatus::Skip);
    }
}

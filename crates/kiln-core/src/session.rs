//! Wires a [`crate::project::Project`] into a running track/fetch/pull/
//! build/push session: seeds [`ElementState`] for every element, drives
//! five [`crate::stage::PayloadStage`]s through [`kiln_scheduler::Scheduler`],
//! and bridges each stage's raw field mutations back through
//! `kiln_state`'s [`CacheKeyController`] so dependents see recomputed keys
//! before they're scheduled.
//!
//! Grounded on `kiln_state::graph::StateGraph` for the state-seeding and
//! reverse-dependency-propagation shape, and on `kiln_scheduler`'s own
//! test harness for how a `Scheduler` is assembled from stages and
//! callbacks. `StateGraph` itself isn't reused directly: every
//! `JobQueueStage`/`PayloadStage` shares one `Rc<RefCell<BTreeMap<...>>>`
//! as its state store, which `StateGraph` doesn't expose (it owns its map
//! privately), so this module keeps the shared map itself and re-applies
//! `StateGraph::recompute_from`'s algorithm against it directly.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use kiln_artifact::{ArtifactStore, Keys};
use kiln_cachekey::CanonicalValue;
use kiln_cas::FsStore;
use kiln_config::SessionConfig;
use kiln_events::{EventLog, EventType, SessionEvent};
use kiln_job::JobId;
use kiln_lock::SessionLock;
use kiln_plan::PlanOptions;
use kiln_queue::{BuildQueue, FetchQueue, PullQueue, PushQueue, TrackQueue};
use kiln_remote::{ArtifactRef, ClientCertAuth, HttpRemoteCache, RemoteCache};
use kiln_resources::{ResourcePool, ResourceType};
use kiln_scheduler::{Callbacks, QueueStage, Scheduler, SchedStatus};
use kiln_state::controller::ArtifactLookup;
use kiln_state::{CacheKeyController, ElementState, NonStrictController, StrictController};

use crate::project::{PlanGraph, Project};
use crate::stage::{PayloadBuilder, PayloadStage};
use crate::worker::{BuildPayload, DepArtifact, PullPayload, PushPayload, RemoteSpec};

/// What a caller hands [`BuildSession::new`] beyond the loaded project.
pub struct SessionOptions {
    /// The `<project>` component of every [`ArtifactRef`] this session
    /// commits or looks up.
    pub project_name: String,
    pub config: SessionConfig,
}

/// One stage's verdict on one element, in the order the scheduler reported
/// it.
#[derive(Debug, Clone)]
pub struct ElementReport {
    pub name: String,
    pub stage: String,
    pub success: bool,
}

/// What [`BuildSession::build`] returns once the scheduler's run loop
/// drains.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub status: SchedStatus,
    pub elapsed: Duration,
    pub results: Vec<ElementReport>,
    pub failed: Vec<String>,
}

/// Per-element facts read once from the project at the start of a build,
/// so the per-job payload closures don't need to borrow the project for
/// the run's whole lifetime.
struct ElementFacts {
    kind: String,
    commands: Vec<String>,
    environment: BTreeMap<String, String>,
    build_deps: Vec<String>,
    public_data: serde_json::Value,
    has_sources: bool,
    strict_rebuild: bool,
}

fn element_facts(project: &Project, name: &str) -> Option<ElementFacts> {
    let element = project.element(name)?;
    let commands = element
        .configuration
        .get("commands")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|c| c.as_str().map(String::from)).collect())
        .unwrap_or_default();
    Some(ElementFacts {
        kind: element.kind.clone(),
        commands,
        environment: element.environment.clone(),
        build_deps: element.build_dependencies.clone(),
        public_data: serde_json::to_value(&element.public_data).unwrap_or(serde_json::Value::Null),
        has_sources: !element.sources.is_empty(),
        strict_rebuild: element.strict_rebuild,
    })
}

/// Adapts an [`ArtifactStore`] to the narrow query surface a
/// [`CacheKeyController`] needs.
struct ArtifactLookupImpl<'a> {
    store: &'a ArtifactStore<FsStore, kiln_artifact::FsRefStore>,
}

impl<'a> ArtifactLookup for ArtifactLookupImpl<'a> {
    fn cached(&self, key: &str, completeness: kiln_artifact::Completeness) -> bool {
        self.store.cached(key, completeness)
    }

    fn load_metadata_keys(&self, key: &str) -> Option<Keys> {
        self.store.load_metadata_keys(key).ok()
    }
}

/// Re-evaluates keys for `changed` elements and their reverse-dependents,
/// copy-adapted from `kiln_state::graph::StateGraph::recompute_from` to
/// operate on a caller-owned map instead of a private one, since every
/// stage in this session shares the same `Rc<RefCell<...>>` instance.
#[allow(clippy::too_many_arguments)]
fn recompute_from(
    states: &mut BTreeMap<String, ElementState>,
    reverse_deps: &BTreeMap<String, Vec<String>>,
    changed: &[String],
    controller: &dyn CacheKeyController,
    config_of: &dyn Fn(&str) -> CanonicalValue,
    weak_deps_of: &dyn Fn(&str, &BTreeMap<String, ElementState>) -> Vec<Option<String>>,
    strict_deps_of: &dyn Fn(&str, &BTreeMap<String, ElementState>) -> Vec<Option<String>>,
    artifact: &dyn ArtifactLookup,
) -> Vec<String> {
    let mut queue: VecDeque<String> = changed.iter().cloned().collect();
    let mut queued: BTreeSet<String> = changed.iter().cloned().collect();
    let mut touched = Vec::new();

    while let Some(name) = queue.pop_front() {
        queued.remove(&name);

        let config = config_of(&name);
        let weak_inputs = weak_deps_of(&name, states);
        let strict_inputs = strict_deps_of(&name, states);
        let prev = states.entry(name.clone()).or_insert_with(ElementState::new).clone();

        let state = states.get_mut(&name).expect("just inserted above");
        controller.calculate_weak_key(state, &config, &weak_inputs);
        controller.calculate_strict_key(state, &config, &strict_inputs);
        controller.calculate_strong_key(state, &config, &strict_inputs, artifact);
        controller.maybe_schedule_assemble(state);

        let changed_now =
            state.weak_key != prev.weak_key || state.strict_key != prev.strict_key || state.strong_key != prev.strong_key;

        if changed_now {
            touched.push(name.clone());
            for dependent in reverse_deps.get(&name).cloned().unwrap_or_default() {
                if queued.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
    }

    touched
}

/// Probes each configured remote in turn for `key`, stopping at the first
/// hit. Used after a fetch completes to decide whether a pull is worth
/// scheduling (the "pull pending" transition).
fn any_remote_has(remotes: &[RemoteSpec], project_name: &str, element_path: &str, key: &str) -> bool {
    let artifact_ref = ArtifactRef { project: project_name.to_string(), element_path: element_path.to_string(), key: key.to_string() };
    remotes.iter().any(|remote| {
        let auth = ClientCertAuth { client_cert: remote.client_cert.clone(), client_key: remote.client_key.clone() };
        match HttpRemoteCache::new(&remote.url, &auth) {
            Ok(client) => client.has_ref(&artifact_ref).unwrap_or(false),
            Err(_) => false,
        }
    })
}

/// A loaded project driven through one track/fetch/pull/build/push run.
///
/// Owns the shared element-state map every stage mutates, the resource
/// pool stages reserve from, and the artifact store and remote list the
/// worker subprocesses and the scheduler's `job_complete`
/// bookkeeping both need.
pub struct BuildSession {
    project: Rc<Project>,
    config: SessionConfig,
    cache_dir: PathBuf,
    project_name: String,
    states: Rc<RefCell<BTreeMap<String, ElementState>>>,
    reverse_deps: Rc<BTreeMap<String, Vec<String>>>,
    deps_of: Rc<BTreeMap<String, Vec<String>>>,
    pool: Rc<ResourcePool>,
    artifact: Rc<ArtifactStore<FsStore, kiln_artifact::FsRefStore>>,
    controller: Rc<dyn CacheKeyController>,
    remotes: Rc<Vec<RemoteSpec>>,
    _lock: SessionLock,
    events: EventLog,
    next_id: Rc<RefCell<JobId>>,
}

impl BuildSession {
    /// Loads a session: acquires the cache-directory lock, seeds
    /// [`ElementState`] for every element reachable via build-dependency
    /// edges, and opens the artifact store and remote clients the run
    /// will need.
    pub fn new(project: Project, options: SessionOptions) -> anyhow::Result<Self> {
        let config = options.config;
        let cache_dir = config.cache_dir();
        std::fs::create_dir_all(&cache_dir)?;
        let lock = SessionLock::acquire(&cache_dir)?;

        let build_deps = project.build_deps_map();
        let mut reverse_deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut states: BTreeMap<String, ElementState> = BTreeMap::new();
        for (name, deps) in &build_deps {
            states.entry(name.clone()).or_insert_with(ElementState::new);
            for dep in deps {
                states.entry(dep.clone()).or_insert_with(ElementState::new);
                reverse_deps.entry(dep.clone()).or_default().push(name.clone());
            }
        }
        for (name, element) in project.elements() {
            let state = states.entry(name.clone()).or_insert_with(ElementState::new);
            state.source_consistency = element.source_consistency();
        }

        let artifact = ArtifactStore::new(FsStore::new(&cache_dir), kiln_artifact::FsRefStore::new(&cache_dir));

        let controller: Rc<dyn CacheKeyController> =
            if config.strict() { Rc::new(StrictController) } else { Rc::new(NonStrictController) };

        let remotes: Vec<RemoteSpec> = config
            .remotes()
            .iter()
            .map(|r| RemoteSpec { url: r.url.clone(), client_cert: r.client_cert.clone(), client_key: r.client_key.clone(), push: r.push })
            .collect();

        Ok(BuildSession {
            project: Rc::new(project),
            config,
            cache_dir,
            project_name: options.project_name,
            states: Rc::new(RefCell::new(states)),
            reverse_deps: Rc::new(reverse_deps),
            deps_of: Rc::new(build_deps),
            pool: Rc::new(ResourcePool::new()),
            artifact: Rc::new(artifact),
            controller,
            remotes: Rc::new(remotes),
            _lock: lock,
            events: EventLog::new(),
            next_id: Rc::new(RefCell::new(0)),
        })
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Runs the full pipeline for the transitive closure of `roots`,
    /// draining the scheduler until every stage is idle.
    pub fn build(&mut self, roots: &[String]) -> anyhow::Result<SessionReport> {
        let required = self.project.closure(roots);
        {
            let mut states = self.states.borrow_mut();
            for name in &required {
                states.entry(name.clone()).or_insert_with(ElementState::new).required = true;
            }
        }

        // Cycle-detection pass; the scheduler itself makes no ordering
        // guarantee beyond each stage's own readiness predicates, so this
        // plan is not otherwise consulted.
        let cached_now: BTreeSet<String> = {
            let states = self.states.borrow();
            required.iter().filter(|n| states.get(*n).map(|s| self.controller.is_cached(s)).unwrap_or(false)).cloned().collect()
        };
        let graph = PlanGraph::new(&self.project, |name: &str| cached_now.contains(name));
        kiln_plan::build_plan(roots, &graph, &PlanOptions::default())?;

        let facts: Rc<BTreeMap<String, ElementFacts>> =
            Rc::new(required.iter().filter_map(|name| element_facts(&self.project, name).map(|f| (name.clone(), f))).collect());

        self.pool.configure(ResourceType::Process, self.config.n_builders());
        self.pool.configure(ResourceType::Download, self.config.n_fetchers());
        self.pool.configure(ResourceType::Upload, self.config.n_pushers());
        self.pool.configure(ResourceType::Cache, 0);

        let mut track_kind = TrackQueue::new();
        for name in &required {
            let has_sources = facts.get(name).map(|f| f.has_sources).unwrap_or(false);
            track_kind.register(name.clone(), has_sources);
        }
        let has_remotes = !self.remotes.is_empty();

        let retry_config = kiln_retry::RetryPolicy::Default.to_config();
        let no_payload: PayloadBuilder = Box::new(|_action, _name| serde_json::Value::Null);

        let pull_payload: PayloadBuilder = {
            let states = Rc::clone(&self.states);
            let remotes = Rc::clone(&self.remotes);
            let project_name = self.project_name.clone();
            let cache_dir = self.cache_dir.clone();
            Box::new(move |_action, name| {
                let weak_key = states.borrow().get(name).and_then(|s| s.weak_key.digest().map(String::from)).unwrap_or_default();
                let payload = PullPayload {
                    cache_dir: cache_dir.clone(),
                    project: project_name.clone(),
                    element_path: name.to_string(),
                    weak_key,
                    remotes: (*remotes).clone(),
                };
                serde_json::to_value(payload).unwrap_or(serde_json::Value::Null)
            })
        };

        let build_payload: PayloadBuilder = {
            let states = Rc::clone(&self.states);
            let facts = Rc::clone(&facts);
            let cache_dir = self.cache_dir.clone();
            Box::new(move |_action, name| {
                let states_ref = states.borrow();
                let (Some(state), Some(fact)) = (states_ref.get(name), facts.get(name)) else {
                    return serde_json::Value::Null;
                };
                let build_deps: Vec<DepArtifact> = fact
                    .build_deps
                    .iter()
                    .filter_map(|dep| {
                        let key = states_ref.get(dep)?.strong_key.digest()?.to_string();
                        Some(DepArtifact { name: dep.clone(), key })
                    })
                    .collect();
                let payload = BuildPayload {
                    cache_dir: cache_dir.clone(),
                    kind: fact.kind.clone(),
                    commands: fact.commands.clone(),
                    environment: fact.environment.clone(),
                    build_deps,
                    weak_key: state.weak_key.digest().unwrap_or_default().to_string(),
                    strict_key: state.strict_key.digest().map(String::from),
                    strong_key: state.strong_key.digest().unwrap_or_default().to_string(),
                    public_data: fact.public_data.clone(),
                };
                serde_json::to_value(payload).unwrap_or(serde_json::Value::Null)
            })
        };

        let push_payload: PayloadBuilder = {
            let states = Rc::clone(&self.states);
            let remotes = Rc::clone(&self.remotes);
            let project_name = self.project_name.clone();
            let cache_dir = self.cache_dir.clone();
            Box::new(move |_action, name| {
                let states_ref = states.borrow();
                let Some(state) = states_ref.get(name) else { return serde_json::Value::Null };
                let mut keys: Vec<String> = [state.weak_key.digest(), state.strong_key.digest(), state.strict_key.digest()]
                    .into_iter()
                    .flatten()
                    .map(String::from)
                    .collect();
                keys.sort();
                keys.dedup();
                let payload = PushPayload {
                    cache_dir: cache_dir.clone(),
                    project: project_name.clone(),
                    element_path: name.to_string(),
                    keys,
                    remotes: (*remotes).clone(),
                };
                serde_json::to_value(payload).unwrap_or(serde_json::Value::Null)
            })
        };

        let track_stage = PayloadStage::new(
            track_kind,
            Rc::clone(&self.states),
            Rc::clone(&self.deps_of),
            Rc::clone(&self.pool),
            Rc::clone(&self.next_id),
            no_payload,
            retry_config.clone(),
        );
        let fetch_stage = PayloadStage::new(
            FetchQueue::new(false),
            Rc::clone(&self.states),
            Rc::clone(&self.deps_of),
            Rc::clone(&self.pool),
            Rc::clone(&self.next_id),
            Box::new(|_action, _name| serde_json::Value::Null),
            retry_config.clone(),
        );
        let pull_stage = PayloadStage::new(
            PullQueue::new(),
            Rc::clone(&self.states),
            Rc::clone(&self.deps_of),
            Rc::clone(&self.pool),
            Rc::clone(&self.next_id),
            pull_payload,
            retry_config.clone(),
        );
        let build_stage = PayloadStage::new(
            BuildQueue::new(),
            Rc::clone(&self.states),
            Rc::clone(&self.deps_of),
            Rc::clone(&self.pool),
            Rc::clone(&self.next_id),
            build_payload,
            retry_config.clone(),
        );
        let push_stage = PayloadStage::new(
            PushQueue::with_cached_failures(has_remotes, self.config.push_cached_failures()),
            Rc::clone(&self.states),
            Rc::clone(&self.deps_of),
            Rc::clone(&self.pool),
            Rc::clone(&self.next_id),
            push_payload,
            retry_config,
        );

        let stages: Vec<Box<dyn QueueStage>> =
            vec![Box::new(track_stage), Box::new(fetch_stage), Box::new(pull_stage), Box::new(build_stage), Box::new(push_stage)];

        let config_of = {
            let project = Rc::clone(&self.project);
            move |name: &str| project.config_dict(name)
        };
        let weak_deps_of = {
            let project = Rc::clone(&self.project);
            let deps_of = Rc::clone(&self.deps_of);
            move |name: &str, states: &BTreeMap<String, ElementState>| -> Vec<Option<String>> {
                let strict_rebuild = project.element(name).map(|e| e.strict_rebuild).unwrap_or(false);
                deps_of
                    .get(name)
                    .cloned()
                    .unwrap_or_default()
                    .iter()
                    .map(|dep| {
                        if strict_rebuild {
                            states.get(dep).and_then(|s| s.weak_key.digest().map(String::from))
                        } else {
                            Some(dep.clone())
                        }
                    })
                    .collect()
            }
        };
        let strict_deps_of = {
            let deps_of = Rc::clone(&self.deps_of);
            move |name: &str, states: &BTreeMap<String, ElementState>| -> Vec<Option<String>> {
                deps_of.get(name).cloned().unwrap_or_default().iter().map(|dep| states.get(dep).and_then(|s| s.strict_key.digest().map(String::from))).collect()
            }
        };

        let results: Rc<RefCell<Vec<ElementReport>>> = Rc::new(RefCell::new(Vec::new()));
        let failed: Rc<RefCell<BTreeSet<String>>> = Rc::new(RefCell::new(BTreeSet::new()));

        let job_complete = {
            let states = Rc::clone(&self.states);
            let reverse_deps = Rc::clone(&self.reverse_deps);
            let controller = Rc::clone(&self.controller);
            let artifact = Rc::clone(&self.artifact);
            let remotes = Rc::clone(&self.remotes);
            let project_name = self.project_name.clone();
            let results = Rc::clone(&results);
            let failed = Rc::clone(&failed);

            move |element_name: &str, action_name: &str, success: bool| {
                results.borrow_mut().push(ElementReport { name: element_name.to_string(), stage: action_name.to_string(), success });
                if !success {
                    failed.borrow_mut().insert(element_name.to_string());
                }

                let lookup = ArtifactLookupImpl { store: &artifact };

                match action_name {
                    "Track" => {
                        let (config, weak_inputs) = {
                            let states_ref = states.borrow();
                            (config_of(element_name), weak_deps_of(element_name, &states_ref))
                        };
                        {
                            let mut states_mut = states.borrow_mut();
                            if let Some(state) = states_mut.get_mut(element_name) {
                                controller.tracking_done(state, &config, &weak_inputs, &lookup);
                            }
                        }
                        let mut states_mut = states.borrow_mut();
                        recompute_from(
                            &mut states_mut,
                            &reverse_deps,
                            &[element_name.to_string()],
                            controller.as_ref(),
                            &config_of,
                            &weak_deps_of,
                            &strict_deps_of,
                            &lookup,
                        );
                    }
                    "Fetch" => {
                        if success {
                            let weak_key = states.borrow().get(element_name).and_then(|s| s.weak_key.digest().map(String::from));
                            if let Some(weak_key) = weak_key {
                                if any_remote_has(&remotes, &project_name, element_name, &weak_key) {
                                    if let Some(state) = states.borrow_mut().get_mut(element_name) {
                                        state.pull_pending = true;
                                    }
                                }
                            }
                        }
                    }
                    "Pull" => {
                        {
                            let mut states_mut = states.borrow_mut();
                            if let Some(state) = states_mut.get_mut(element_name) {
                                controller.pull_done(state, &lookup);
                            }
                        }
                        let mut states_mut = states.borrow_mut();
                        recompute_from(
                            &mut states_mut,
                            &reverse_deps,
                            &[element_name.to_string()],
                            controller.as_ref(),
                            &config_of,
                            &weak_deps_of,
                            &strict_deps_of,
                            &lookup,
                        );
                    }
                    "Build" => {
                        let mut states_mut = states.borrow_mut();
                        recompute_from(
                            &mut states_mut,
                            &reverse_deps,
                            &[element_name.to_string()],
                            controller.as_ref(),
                            &config_of,
                            &weak_deps_of,
                            &strict_deps_of,
                            &lookup,
                        );
                    }
                    _ => {}
                }
            }
        };

        let callbacks = Callbacks { job_complete: Some(Box::new(job_complete)), ..Callbacks::default() };
        let mut scheduler = Scheduler::new(stages, callbacks);
        // Seeds the track stage's wait list with the build's closure;
        // without this the pipeline never receives its first elements and
        // `run()` drains nothing.
        scheduler.seed(required.iter().cloned());
        let (elapsed, status) = scheduler.run();

        self.events.record(SessionEvent {
            timestamp: chrono::Utc::now(),
            element: "<session>".to_string(),
            event_type: EventType::SchedulerFinished { status: format!("{status:?}"), elapsed_ms: elapsed.as_millis() as u64 },
        });

        Ok(SessionReport {
            status,
            elapsed,
            results: results.borrow().clone(),
            failed: failed.borrow().iter().cloned().collect(),
        })
    }
}

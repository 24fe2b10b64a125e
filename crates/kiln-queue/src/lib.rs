//! Fixed-stage queue pipeline: track, fetch, pull, build, push.
//!
//! Each stage owns a wait list and a done list of element names. The
//! scheduler pulls elements forward from one stage's done list into the
//! next stage's wait list, and periodically asks every stage to
//! [`Queue::harvest_jobs`] — reserve resources for as many ready elements as
//! it can and turn them into [`kiln_job::JobSpec`]s.

pub mod kinds;

use std::collections::{BTreeMap, VecDeque};

use kiln_job::JobSpec;
use kiln_resources::{ResourcePool, ResourceSet};
use kiln_state::ElementState;
use kiln_types::QueueStatus;

pub use kinds::{BuildQueue, FetchQueue, PullQueue, PushQueue, TrackQueue};

/// A job handed back by [`Queue::harvest_jobs`], ready to be passed to
/// [`kiln_job::Job::new`] and spawned by the scheduler.
#[derive(Debug, Clone)]
pub struct HarvestedJob {
    pub element_name: String,
    pub spec: JobSpec,
    pub resources: ResourceSet,
    pub exclusive: ResourceSet,
}

/// The stage-specific behavior every concrete queue implements.
///
/// `status` additionally takes the element's build-dependency states: only
/// [`BuildQueue`] consults them (via [`ElementState::buildable`]), but
/// threading them through the trait keeps `Queue<K>` stage-agnostic rather
/// than special-casing the build stage's signature.
pub trait QueueKind {
    fn action_name(&self) -> &'static str;
    fn complete_name(&self) -> &'static str;
    fn resources(&self) -> ResourceSet;
    /// Resources this stage's jobs need sole ownership of while running.
    fn exclusive(&self) -> ResourceSet {
        ResourceSet::new()
    }
    fn status(&self, state: &ElementState, build_dep_states: &[&ElementState]) -> QueueStatus;
    fn process(&self, element_name: &str) -> JobSpec;
    fn done(&self, state: &mut ElementState, outcome: &kiln_job::JobOutcome);

    /// Overridden by [`BuildQueue`]: true when the element already carries
    /// a terminal cached failure that should be reported without
    /// re-running the build.
    fn cached_failure(&self, _state: &ElementState) -> bool {
        false
    }
}

/// Generic stage wrapper: owns the wait/done queues and the bookkeeping
/// lists the frontend inspects (`processed`, `skipped`, `failed`).
pub struct Queue<K: QueueKind> {
    pub kind: K,
    wait_queue: VecDeque<String>,
    done_queue: VecDeque<String>,
    /// Elements for which the cached-failure short-circuit has already
    /// fired once; re-enqueuing them reports the cached failure again
    /// without bypassing the queue a second time (mirrors BuildQueue's
    /// `_tried` set).
    tried: std::collections::BTreeSet<String>,
    pub processed_elements: Vec<String>,
    pub skipped_elements: Vec<String>,
    pub failed_elements: Vec<String>,
}

impl<K: QueueKind> Queue<K> {
    pub fn new(kind: K) -> Self {
        Queue {
            kind,
            wait_queue: VecDeque::new(),
            done_queue: VecDeque::new(),
            tried: Default::default(),
            processed_elements: Vec::new(),
            skipped_elements: Vec::new(),
            failed_elements: Vec::new(),
        }
    }

    pub fn wait_len(&self) -> usize {
        self.wait_queue.len()
    }

    pub fn done_len(&self) -> usize {
        self.done_queue.len()
    }

    /// Enqueues `elements`. An element with a cached failure the stage has
    /// not yet reported this session bypasses processing entirely and goes
    /// straight to the done list as a failure. Otherwise an immediately
    /// `Skip`-status element goes straight to the done list; everything
    /// else waits.
    pub fn enqueue(&mut self, elements: &[String], states: &BTreeMap<String, ElementState>, deps_of: &BTreeMap<String, Vec<String>>) {
        for name in elements {
            let Some(state) = states.get(name) else { continue };

            if self.kind.cached_failure(state) && !self.tried.contains(name) {
                self.tried.insert(name.clone());
                self.done_queue.push_back(name.clone());
                self.failed_elements.push(name.clone());
                continue;
            }

            let build_dep_states: Vec<&ElementState> = deps_of
                .get(name)
                .into_iter()
                .flatten()
                .filter_map(|d| states.get(d))
                .collect();

            match self.kind.status(state, &build_dep_states) {
                QueueStatus::Skip => {
                    self.done_queue.push_back(name.clone());
                    self.skipped_elements.push(name.clone());
                }
                _ => self.wait_queue.push_back(name.clone()),
            }
        }
    }

    /// Drains the done list in FIFO order (the order elements finished
    /// this stage), for the scheduler to push into the next stage's wait
    /// list.
    pub fn dequeue(&mut self) -> Vec<String> {
        self.done_queue.drain(..).collect()
    }

    pub fn dequeue_ready(&self) -> bool {
        !self.done_queue.is_empty()
    }

    /// Pops as many `Ready` elements off the wait list as resources allow,
    /// turning each into a [`HarvestedJob`]. `Wait`-status elements are put
    /// back at the *head* of the wait list (preserving fairness: they'll be
    /// re-examined first next tick rather than starved behind newer
    /// arrivals). `Skip`-status elements discovered here (state changed
    /// since `enqueue`) move straight to the done list.
    pub fn harvest_jobs(
        &mut self,
        states: &BTreeMap<String, ElementState>,
        deps_of: &BTreeMap<String, Vec<String>>,
        pool: &ResourcePool,
    ) -> Vec<HarvestedJob> {
        let wants = self.kind.resources();
        let exclusive = self.kind.exclusive();
        let mut deferred = Vec::new();
        let mut ready = Vec::new();

        while let Some(name) = self.wait_queue.pop_front() {
            if !pool.reserve(&wants, &ResourceSet::new()) {
                // Peek failed: no capacity right now. Put it back and stop;
                // later elements in this stage want the same resources.
                self.wait_queue.push_front(name);
                break;
            }
            // The peek above already reserved non-exclusively; release it
            // and re-reserve honoring this element's actual exclusivity
            // once we know its status.
            pool.release(&wants, &ResourceSet::new());

            let Some(state) = states.get(&name) else { continue };
            let build_dep_states: Vec<&ElementState> = deps_of
                .get(&name)
                .into_iter()
                .flatten()
                .filter_map(|d| states.get(d))
                .collect();

            match self.kind.status(state, &build_dep_states) {
                QueueStatus::Wait => deferred.push(name),
                QueueStatus::Skip => {
                    self.done_queue.push_back(name.clone());
                    self.skipped_elements.push(name);
                }
                QueueStatus::Ready => {
                    if !pool.reserve(&wants, &exclusive) {
                        deferred.push(name);
                        continue;
                    }
                    let spec = self.kind.process(&name);
                    ready.push(HarvestedJob { element_name: name, spec, resources: wants.clone(), exclusive: exclusive.clone() });
                }
            }
        }

        for name in deferred.into_iter().rev() {
            self.wait_queue.push_front(name);
        }

        ready
    }

    /// Called by the scheduler once a harvested job's subprocess has
    /// exited and every frame has been drained. Releases the job's
    /// resources, lets the stage interpret the outcome, and files the
    /// element under `processed`/`skipped`/`failed` plus the done list.
    pub fn job_done(&mut self, pool: &ResourcePool, job: &HarvestedJob, state: &mut ElementState, outcome: kiln_job::JobOutcome) {
        pool.release(&job.resources, &job.exclusive);
        let success = outcome.is_success();
        self.kind.done(state, &outcome);
        self.done_queue.push_back(job.element_name.clone());
        if success {
            self.processed_elements.push(job.element_name.clone());
        } else {
            self.failed_elements.push(job.element_name.clone());
        }
    }
}

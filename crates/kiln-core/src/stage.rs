//! A [`kiln_scheduler::QueueStage`] implementation that enriches each
//! harvested [`kiln_job::JobSpec`]'s payload before spawning it.
//!
//! Grounded directly on `kiln_scheduler::JobQueueStage`: the scheduler
//! crate deliberately keeps kind-specific execution out of its own scope
//! (`kiln-queue`'s `QueueKind::process` always returns `payload: Null`),
//! since a worker subprocess shares no memory with the parent and needs
//! the element's config, keys, and cache location serialized across the
//! boundary explicitly. That enrichment belongs to the session layer that
//! actually knows about elements, so this type duplicates
//! `JobQueueStage`'s harvest/poll bookkeeping with one seam added: a
//! `payload_of` closure invoked per harvested job.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::Instant;

use kiln_job::envelope::Envelope;
use kiln_job::{Job, JobId, JobOutcome, JobSpec};
use kiln_queue::{Queue, QueueKind};
use kiln_resources::ResourcePool;
use kiln_scheduler::{NullReporter, QueueStage, Reporter};
use kiln_state::ElementState;

/// Builds the real JSON payload a worker subprocess needs for one job,
/// given the stage's action name and the element it's acting on.
pub type PayloadBuilder = Box<dyn Fn(&str, &str) -> serde_json::Value>;

pub struct PayloadStage<K: QueueKind> {
    queue: Queue<K>,
    states: Rc<RefCell<BTreeMap<String, ElementState>>>,
    deps_of: Rc<BTreeMap<String, Vec<String>>>,
    pool: Rc<ResourcePool>,
    next_id: Rc<RefCell<JobId>>,
    payload_of: PayloadBuilder,
    retry_policy: kiln_retry::RetryStrategyConfig,
    active: BTreeMap<JobId, (Job, kiln_queue::HarvestedJob)>,
    /// Failed-but-retryable jobs waiting out their backoff before the next
    /// `spawn()`. Counted as active work so the scheduler doesn't treat a
    /// backoff window as the stage being idle.
    pending_retries: BTreeMap<JobId, (Job, kiln_queue::HarvestedJob, Instant)>,
    sender: Sender<(JobId, Envelope)>,
    receiver: Receiver<(JobId, Envelope)>,
    pending_results: BTreeMap<JobId, serde_json::Value>,
}

impl<K: QueueKind> PayloadStage<K> {
    pub fn new(
        kind: K,
        states: Rc<RefCell<BTreeMap<String, ElementState>>>,
        deps_of: Rc<BTreeMap<String, Vec<String>>>,
        pool: Rc<ResourcePool>,
        next_id: Rc<RefCell<JobId>>,
        payload_of: PayloadBuilder,
        retry_policy: kiln_retry::RetryStrategyConfig,
    ) -> Self {
        let (sender, receiver) = channel();
        PayloadStage {
            queue: Queue::new(kind),
            states,
            deps_of,
            pool,
            next_id,
            payload_of,
            retry_policy,
            active: BTreeMap::new(),
            pending_retries: BTreeMap::new(),
            sender,
            receiver,
            pending_results: BTreeMap::new(),
        }
    }

    pub fn processed_elements(&self) -> &[String] {
        &self.queue.processed_elements
    }

    pub fn skipped_elements(&self) -> &[String] {
        &self.queue.skipped_elements
    }

    fn alloc_id(&self) -> JobId {
        let mut id = self.next_id.borrow_mut();
        *id += 1;
        *id
    }

    fn drain_envelopes(&mut self, report: &dyn Reporter) {
        while let Ok((id, envelope)) = self.receiver.try_recv() {
            match envelope {
                Envelope::Message(record) => {
                    if let Some((_, harvested)) = self.active.get(&id) {
                        report.message(&harvested.element_name, self.queue.kind.action_name(), &record.message);
                    }
                }
                Envelope::Result(value) => {
                    self.pending_results.insert(id, value);
                }
                Envelope::Error(err) => {
                    self.pending_results.insert(id, serde_json::json!({"__error__": err.reason}));
                }
                Envelope::ChildData(_) => {}
            }
        }
    }
}

impl<K: QueueKind> QueueStage for PayloadStage<K> {
    fn action_name(&self) -> &'static str {
        self.queue.kind.action_name()
    }

    fn enqueue_and_dequeue(&mut self, incoming: &[String]) -> Vec<String> {
        let states = self.states.borrow();
        self.queue.enqueue(incoming, &states, &self.deps_of);
        drop(states);
        self.queue.dequeue()
    }

    fn harvest(&mut self) {
        let states = self.states.borrow();
        let jobs = self.queue.harvest_jobs(&states, &self.deps_of, &self.pool);
        drop(states);
        for harvested in jobs {
            let id = self.alloc_id();
            let payload = (self.payload_of)(&harvested.spec.action_name, &harvested.element_name);
            let spec = JobSpec { action_name: harvested.spec.action_name.clone(), element_name: harvested.spec.element_name.clone(), payload };
            let mut job = Job::new(id, spec, harvested.resources.clone(), harvested.exclusive.clone(), self.retry_policy.max_attempts, self.retry_policy.clone());
            if job.spawn(self.sender.clone()).is_ok() {
                self.active.insert(id, (job, harvested));
            }
        }
    }

    fn poll(&mut self) -> Vec<(String, bool)> {
        self.drain_envelopes(&NullReporter);
        let mut finished = Vec::new();

        // Respawn retries whose backoff has elapsed before looking for
        // newly-finished jobs.
        let due: Vec<JobId> =
            self.pending_retries.iter().filter(|(_, (_, _, deadline))| Instant::now() >= *deadline).map(|(id, _)| *id).collect();
        for id in due {
            let (mut job, harvested, _) = self.pending_retries.remove(&id).expect("due retry");
            if job.spawn(self.sender.clone()).is_ok() {
                self.active.insert(id, (job, harvested));
            } else {
                let mut states = self.states.borrow_mut();
                if let Some(state) = states.get_mut(&harvested.element_name) {
                    self.queue.job_done(&self.pool, &harvested, state, JobOutcome::Crashed { exit_code: None });
                } else {
                    self.pool.release(&harvested.resources, &harvested.exclusive);
                }
                finished.push((harvested.element_name, false));
            }
        }

        let ids: Vec<JobId> = self.active.keys().copied().collect();
        for id in ids {
            let exited = {
                let (job, _) = self.active.get_mut(&id).expect("active job");
                matches!(job.try_wait(), Ok(Some(_)))
            };
            if !exited {
                continue;
            }
            let (mut job, harvested) = self.active.remove(&id).expect("active job");
            let exit_status = job.wait().ok();
            self.drain_envelopes(&NullReporter);
            let outcome = match self.pending_results.remove(&id) {
                Some(value) if value.get("__error__").is_none() => JobOutcome::Success(value),
                Some(value) => JobOutcome::Failure(kiln_job::envelope::ErrorEnvelope {
                    domain: "job".to_string(),
                    reason: value["__error__"].as_str().unwrap_or("unknown").to_string(),
                    message: String::new(),
                }),
                None => JobOutcome::Crashed { exit_code: exit_status.and_then(|s| s.code()) },
            };
            let success = outcome.is_success();

            if !success && job.retryable() {
                let delay = job.retry_delay();
                self.pending_retries.insert(id, (job, harvested, Instant::now() + delay));
                continue;
            }

            let mut states = self.states.borrow_mut();
            if let Some(state) = states.get_mut(&harvested.element_name) {
                self.queue.job_done(&self.pool, &harvested, state, outcome);
            } else {
                self.pool.release(&harvested.resources, &harvested.exclusive);
            }
            finished.push((harvested.element_name, success));
        }
        finished
    }

    fn active_job_count(&self) -> usize {
        self.active.len() + self.pending_retries.len()
    }

    fn pending_count(&self) -> usize {
        self.queue.wait_len() + self.queue.done_len()
    }

    fn failed_elements(&self) -> Vec<String> {
        self.queue.failed_elements.clone()
    }

    fn terminate_active(&mut self, deadline: Instant) {
        for (job, _) in self.active.values_mut() {
            let _ = job.terminate();
        }
        for (job, _) in self.active.values_mut() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !job.terminate_wait(remaining).unwrap_or(false) {
                let _ = job.kill();
            }
        }
        for (_, harvested, _) in self.pending_retries.values() {
            self.pool.release(&harvested.resources, &harvested.exclusive);
        }
        self.pending_retries.clear();
    }

    fn suspend_active(&mut self) {
        for (job, _) in self.active.values_mut() {
            let _ = job.suspend();
        }
    }

    fn resume_active(&mut self) {
        for (job, _) in self.active.values_mut() {
            let _ = job.resume();
        }
    }
}

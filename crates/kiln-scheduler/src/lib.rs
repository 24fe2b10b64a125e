//! Single-threaded cooperative event loop driving the queue pipeline.
//!
//! Real parallelism comes entirely from jobs being separate subprocesses;
//! the scheduler itself does no CPU work while they run. It only pulls
//! elements forward between stages, harvests ready jobs, and reacts to
//! signals and job completions once per tick.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::{Duration, Instant};

use kiln_job::envelope::Envelope;
use kiln_job::{Job, JobId, JobOutcome, JobSpec};
use kiln_queue::{HarvestedJob, Queue, QueueKind};
use kiln_resources::ResourcePool;
use kiln_state::ElementState;
use signal_hook::consts::{SIGINT, SIGTERM, SIGTSTP};
use signal_hook::iterator::Signals;

/// How `Scheduler::run` terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedStatus {
    Success,
    Error,
    Terminated,
}

/// Ambient logging sink: no `tracing`/`log` dependency here, callers
/// decide where messages go.
pub trait Reporter {
    fn message(&self, element_name: &str, action_name: &str, text: &str);
}

/// A no-op [`Reporter`] for tests and headless callers.
pub struct NullReporter;
impl Reporter for NullReporter {
    fn message(&self, _element_name: &str, _action_name: &str, _text: &str) {}
}

/// Object-safe per-stage surface the scheduler drives. [`JobQueueStage`] is
/// the concrete, fully-wired implementation; tests can supply their own.
pub trait QueueStage {
    fn action_name(&self) -> &'static str;
    /// Moves the previous stage's completed elements into this stage's
    /// wait list, and returns this stage's own done list in FIFO order.
    fn enqueue_and_dequeue(&mut self, incoming: &[String]) -> Vec<String>;
    /// Reserves resources and spawns as many ready jobs as possible.
    fn harvest(&mut self);
    /// Polls active jobs for completion without blocking; runs the
    /// stage's `done()` hook and files the element under
    /// processed/skipped/failed for each job that finished.
    fn poll(&mut self) -> Vec<(String, bool)>;
    fn active_job_count(&self) -> usize;
    /// Elements still sitting in this stage's wait or done list, not yet
    /// picked up by the next stage. A stage with zero active jobs but
    /// nonzero pending work is not idle — it is waiting on an upstream
    /// stage or the next tick's `harvest`.
    fn pending_count(&self) -> usize;
    fn failed_elements(&self) -> Vec<String>;
    fn terminate_active(&mut self, deadline: Instant);
    fn suspend_active(&mut self);
    fn resume_active(&mut self);
}

/// Wires a [`kiln_queue::Queue`] to real subprocess [`Job`]s: harvested
/// jobs are spawned immediately, and `poll` drains the shared envelope
/// channel to detect completions.
pub struct JobQueueStage<K: QueueKind> {
    queue: Queue<K>,
    states: Rc<RefCell<BTreeMap<String, ElementState>>>,
    deps_of: Rc<BTreeMap<String, Vec<String>>>,
    pool: Rc<ResourcePool>,
    active: BTreeMap<JobId, (Job, HarvestedJob)>,
    /// Jobs that failed but are retryable, waiting out their backoff
    /// before the next `spawn()`. Still counted as active work so the
    /// scheduler doesn't mistake a backoff window for idleness.
    pending_retries: BTreeMap<JobId, (Job, HarvestedJob, Instant)>,
    next_id: Rc<RefCell<JobId>>,
    sender: Sender<(JobId, Envelope)>,
    receiver: Receiver<(JobId, Envelope)>,
    pending_results: BTreeMap<JobId, serde_json::Value>,
}

impl<K: QueueKind> JobQueueStage<K> {
    pub fn new(
        kind: K,
        states: Rc<RefCell<BTreeMap<String, ElementState>>>,
        deps_of: Rc<BTreeMap<String, Vec<String>>>,
        pool: Rc<ResourcePool>,
        next_id: Rc<RefCell<JobId>>,
    ) -> Self {
        let (sender, receiver) = channel();
        JobQueueStage {
            queue: Queue::new(kind),
            states,
            deps_of,
            pool,
            active: BTreeMap::new(),
            pending_retries: BTreeMap::new(),
            next_id,
            sender,
            receiver,
            pending_results: BTreeMap::new(),
        }
    }

    fn alloc_id(&self) -> JobId {
        let mut id = self.next_id.borrow_mut();
        *id += 1;
        *id
    }

    /// Drains every envelope currently buffered without blocking, filing
    /// `Result`/`Error` frames for later pickup by `poll`'s exit-status
    /// check and forwarding `Message` frames to `report`.
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

impl<K: QueueKind> QueueStage for JobQueueStage<K> {
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
            let spec = JobSpec {
                action_name: harvested.spec.action_name.clone(),
                element_name: harvested.spec.element_name.clone(),
                payload: harvested.spec.payload.clone(),
            };
            let retry_config = kiln_retry::RetryPolicy::Default.to_config();
            let mut job = Job::new(id, spec, harvested.resources.clone(), harvested.exclusive.clone(), retry_config.max_attempts, retry_config);
            if job.spawn(self.sender.clone()).is_ok() {
                self.active.insert(id, (job, harvested));
            }
        }
    }

    fn poll(&mut self) -> Vec<(String, bool)> {
        self.drain_envelopes(&NullReporter);
        let mut finished = Vec::new();

        // Respawn any retry whose backoff has elapsed before looking for
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

/// Optional hooks a frontend can install: progress ticks, interrupt
/// confirmation, and per-job start/complete notifications.
#[derive(Default)]
pub struct Callbacks<'a> {
    pub interrupt: Option<Box<dyn FnMut() + 'a>>,
    pub ticker: Option<Box<dyn FnMut(Duration) + 'a>>,
    pub job_start: Option<Box<dyn FnMut(&str, &str) + 'a>>,
    pub job_complete: Option<Box<dyn FnMut(&str, &str, bool) + 'a>>,
}

pub struct Scheduler<'a> {
    stages: Vec<Box<dyn QueueStage + 'a>>,
    callbacks: Callbacks<'a>,
    queue_jobs: bool,
    terminated: bool,
    suspended: bool,
    internal_stops: u32,
    start_time: Option<Instant>,
    suspend_time: Option<Instant>,
    suspended_total: Duration,
    /// Elements to feed into the first stage's wait list on the next
    /// `sched()` tick. Consumed once, at the start of the very first tick
    /// after `seed()` is called.
    pending_seed: Vec<String>,
}

impl<'a> Scheduler<'a> {
    pub fn new(stages: Vec<Box<dyn QueueStage + 'a>>, callbacks: Callbacks<'a>) -> Self {
        Scheduler {
            stages,
            callbacks,
            queue_jobs: true,
            terminated: false,
            suspended: false,
            internal_stops: 0,
            start_time: None,
            suspend_time: None,
            suspended_total: Duration::ZERO,
            pending_seed: Vec::new(),
        }
    }

    /// Seeds the first stage's wait list with `elements` on the next tick.
    /// Call before [`Scheduler::run`] with the build's required closure —
    /// without a seed, `run` drains nothing and returns `Success` having
    /// spawned zero jobs.
    pub fn seed(&mut self, elements: impl IntoIterator<Item = String>) {
        self.pending_seed.extend(elements);
    }

    /// Drives the tick loop until every stage is idle, a signal terminates
    /// the run, or `stop_queueing` has been called and all in-flight jobs
    /// have drained.
    pub fn run(&mut self) -> (Duration, SchedStatus) {
        self.start_time = Some(Instant::now());

        let mut signals = Signals::new([SIGINT, SIGTERM, SIGTSTP]).expect("install signal handlers");
        let mut last_tick = Instant::now();

        loop {
            self.handle_signals(&mut signals);
            if self.terminated {
                break;
            }

            self.sched();

            if last_tick.elapsed() >= Duration::from_secs(1) {
                let elapsed = self.elapsed_time();
                if let Some(ticker) = self.callbacks.ticker.as_mut() {
                    ticker(elapsed);
                }
                last_tick = Instant::now();
            }

            if self.active_job_count() == 0 && !self.queue_jobs {
                break;
            }
            if self.active_job_count() == 0 && self.all_stages_idle() {
                break;
            }

            std::thread::sleep(Duration::from_millis(20));
        }

        let status = if self.failed_elements_any() {
            SchedStatus::Error
        } else if self.terminated {
            SchedStatus::Terminated
        } else {
            SchedStatus::Success
        };

        (self.elapsed_time(), status)
    }

    /// True only once no stage has an active job *and* no stage has an
    /// element sitting in its wait or done list. A stage can be between
    /// jobs (e.g. the only in-flight fetch just finished) while elements
    /// are still queued for the next tick to harvest or for a downstream
    /// stage to pick up — that tick must not be mistaken for a finished
    /// run, or a linear chain stops after its first job.
    fn all_stages_idle(&self) -> bool {
        self.pending_seed.is_empty() && self.stages.iter().all(|s| s.pending_count() == 0)
    }

    fn active_job_count(&self) -> usize {
        self.stages.iter().map(|s| s.active_job_count()).sum()
    }

    fn failed_elements_any(&self) -> bool {
        self.stages.iter().any(|s| !s.failed_elements().is_empty())
    }

    /// One tick: pull elements forward through every stage in order, then
    /// ask each stage to harvest as many ready jobs as resources allow.
    fn sched(&mut self) {
        if !self.queue_jobs {
            return;
        }

        let mut elements: Vec<String> = std::mem::take(&mut self.pending_seed);
        for stage in &mut self.stages {
            elements = stage.enqueue_and_dequeue(&elements);
        }

        for stage in &mut self.stages {
            stage.harvest();
        }

        for stage in &mut self.stages {
            for (element_name, success) in stage.poll() {
                if let Some(cb) = self.callbacks.job_complete.as_mut() {
                    cb(&element_name, stage.action_name(), success);
                }
            }
        }
    }

    fn handle_signals(&mut self, signals: &mut Signals) {
        for signal in signals.pending() {
            match signal {
                s if s == SIGINT => self.interrupt_event(),
                s if s == SIGTERM => self.terminate_event(),
                s if s == SIGTSTP => self.suspend_event(),
                _ => {}
            }
        }
    }

    fn interrupt_event(&mut self) {
        if let Some(cb) = self.callbacks.interrupt.as_mut() {
            cb();
        } else {
            self.terminate_jobs();
        }
    }

    fn terminate_event(&mut self) {
        self.terminate_jobs();
    }

    fn suspend_event(&mut self) {
        if self.internal_stops > 0 {
            self.internal_stops -= 1;
            return;
        }
        self.suspend_jobs();
        #[cfg(unix)]
        {
            let _ = nix::sys::signal::raise(nix::sys::signal::Signal::SIGSTOP);
        }
        self.resume_jobs();
    }

    /// Sends `SIGTERM` to every active job, waits up to a total 10-second
    /// budget shared across all of them, then stops the loop.
    pub fn terminate_jobs(&mut self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        for stage in &mut self.stages {
            stage.terminate_active(deadline);
        }
        self.terminated = true;
    }

    pub fn suspend_jobs(&mut self) {
        if !self.suspended {
            self.suspend_time = Some(Instant::now());
            self.suspended = true;
            for stage in &mut self.stages {
                stage.suspend_active();
            }
            // Forwarding SIGTSTP to every child generates a feedback
            // SIGTSTP back to us per child; swallow that many.
            self.internal_stops += self.active_job_count() as u32;
        }
    }

    pub fn resume_jobs(&mut self) {
        if self.suspended {
            for stage in &mut self.stages {
                stage.resume_active();
            }
            self.suspended = false;
            if let Some(since) = self.suspend_time.take() {
                self.suspended_total += since.elapsed();
            }
        }
    }

    pub fn stop_queueing(&mut self) {
        self.queue_jobs = false;
    }

    pub fn elapsed_time(&self) -> Duration {
        let Some(start) = self.start_time else { return Duration::ZERO };
        let ongoing_suspend = self.suspend_time.map(|since| since.elapsed()).unwrap_or(Duration::ZERO);
        start.elapsed().saturating_sub(self.suspended_total).saturating_sub(ongoing_suspend)
    }
}

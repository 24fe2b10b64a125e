//! Subprocess job execution for kiln.
//!
//! A [`Job`] is one queue action (track/fetch/pull/build/push) for one
//! element, run out-of-process so a misbehaving build can be suspended,
//! resumed, or killed without taking the scheduler down with it. The child
//! is the `kiln` binary re-executed with a hidden worker entry point; parent
//! and child talk over a length-prefixed, JSON-framed channel on the child's
//! stdin/stdout (see [`envelope`]).

pub mod envelope;
#[cfg(unix)]
mod unix;

use std::io::{BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use kiln_resources::ResourceSet;
use kiln_retry::RetryStrategyConfig;
use serde::{Deserialize, Serialize};

use envelope::{read_frame, write_json_frame, Envelope, ErrorEnvelope, LogLevel, LogRecord};

pub type JobId = u64;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("could not locate the kiln worker binary")]
    WorkerBinaryNotFound,
    #[error("failed to spawn job: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("job channel error: {0}")]
    Channel(#[source] std::io::Error),
    #[error("job is not running")]
    NotRunning,
    #[error("signal delivery failed: {0}")]
    Signal(#[source] nix::Error),
}

pub type Result<T> = std::result::Result<T, JobError>;

/// What a job was asked to do, handed to the worker process as its first
/// (and only) inbound frame. `payload` is whatever the action needs —
/// `kiln-queue`'s concrete queues decide its shape per action kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub action_name: String,
    pub element_name: String,
    pub payload: serde_json::Value,
}

/// The terminal result of a job, once its child has exited and every frame
/// up to the close has been drained.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Success(serde_json::Value),
    Failure(ErrorEnvelope),
    /// Exited non-zero with no structured `Error` frame (e.g. a signal, or
    /// a worker crash before it could report one).
    Crashed { exit_code: Option<i32> },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success(_))
    }
}

/// Finds the binary to re-exec as a worker: ourselves, or failing that,
/// `kiln` on `PATH`.
pub fn worker_binary() -> Result<PathBuf> {
    std::env::current_exe().or_else(|_| which::which("kiln")).map_err(|_| JobError::WorkerBinaryNotFound)
}

/// The flag that tells a re-exec'd `kiln` binary to run as a job worker
/// instead of parsing ordinary CLI arguments.
pub const WORKER_FLAG: &str = "--kiln-job-worker";

/// A running (or finished) subprocess job.
pub struct Job {
    pub id: JobId,
    pub action_name: String,
    pub element_name: String,
    pub resources: ResourceSet,
    pub exclusive: ResourceSet,
    pub max_retries: u32,
    retry_config: RetryStrategyConfig,
    attempt: u32,
    spec: JobSpec,
    child: Option<Child>,
    reader_handle: Option<thread::JoinHandle<()>>,
    started_at: Option<Instant>,
    suspended_since: Option<Instant>,
    suspended_total: Duration,
}

impl Job {
    /// Builds a job description without starting anything. Call [`Job::spawn`]
    /// to actually fork the worker.
    pub fn new(
        id: JobId,
        spec: JobSpec,
        resources: ResourceSet,
        exclusive: ResourceSet,
        max_retries: u32,
        retry_config: RetryStrategyConfig,
    ) -> Self {
        Job {
            id,
            action_name: spec.action_name.clone(),
            element_name: spec.element_name.clone(),
            resources,
            exclusive,
            max_retries,
            retry_config,
            attempt: 0,
            spec,
            child: None,
            reader_handle: None,
            started_at: None,
            suspended_since: None,
            suspended_total: Duration::ZERO,
        }
    }

    /// Re-execs the worker binary, writes the job's [`JobSpec`] as the first
    /// frame on its stdin, and spawns a reader thread that forwards every
    /// `Envelope` the child emits to `sender` tagged with this job's id.
    /// Unix-only process-group detachment (`pre_exec`) runs between fork and
    /// exec so `suspend`/`resume`/`kill` can target the whole tree later.
    pub fn spawn(&mut self, sender: Sender<(JobId, Envelope)>) -> Result<()> {
        let binary = worker_binary()?;
        let mut command = Command::new(binary);
        command.arg(WORKER_FLAG).stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::null());

        #[cfg(unix)]
        unsafe {
            use std::os::unix::process::CommandExt;
            command.pre_exec(|| unsafe { unix::child_pre_exec() });
        }

        let mut child = command.spawn().map_err(JobError::Spawn)?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        write_json_frame(&mut stdin, &self.spec).map_err(JobError::Channel)?;
        drop(stdin);

        let stdout = child.stdout.take().expect("piped stdout");
        let id = self.id;
        let handle = thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            while let Ok(Some(envelope)) = read_frame(&mut reader) {
                if sender.send((id, envelope)).is_err() {
                    break;
                }
            }
        });

        self.child = Some(child);
        self.reader_handle = Some(handle);
        self.attempt += 1;
        self.started_at = Some(Instant::now());
        self.suspended_since = None;
        self.suspended_total = Duration::ZERO;
        Ok(())
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether a non-zero exit on the current attempt should trigger
    /// another [`Job::spawn`] rather than a terminal failure. `attempt`
    /// counts spawns already made, so `max_retries = N` must permit one
    /// more spawn through attempt `N` itself, for `N + 1` total spawns.
    pub fn retryable(&self) -> bool {
        self.attempt <= self.max_retries
    }

    /// Backoff to wait before the next [`Job::spawn`] after a failed
    /// attempt, per this job's configured retry strategy.
    pub fn retry_delay(&self) -> Duration {
        kiln_retry::calculate_delay(&self.retry_config, self.attempt)
    }

    /// Reclassifies a child's log record the way `_child_message_handler`
    /// does: a FAIL emitted mid-retry is downgraded to a WARN, since the
    /// scheduler is about to try again and a terminal-looking log line
    /// would be misleading.
    pub fn classify_log(&self, record: &LogRecord) -> LogRecord {
        if record.level == LogLevel::Fail && self.retryable() {
            LogRecord { level: LogLevel::Warn, message: record.message.clone() }
        } else {
            record.clone()
        }
    }

    pub fn pid(&self) -> Option<i32> {
        self.child.as_ref().map(|c| c.id() as i32)
    }

    /// Polls for exit without blocking.
    pub fn try_wait(&mut self) -> Result<Option<std::process::ExitStatus>> {
        match &mut self.child {
            Some(child) => child.try_wait().map_err(JobError::Channel),
            None => Err(JobError::NotRunning),
        }
    }

    /// Blocks until the reader thread observes clean EOF and the child has
    /// exited, returning the exit status.
    pub fn wait(&mut self) -> Result<std::process::ExitStatus> {
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
        match &mut self.child {
            Some(child) => child.wait().map_err(JobError::Channel),
            None => Err(JobError::NotRunning),
        }
    }

    #[cfg(unix)]
    fn signal(&self, sig: nix::sys::signal::Signal) -> Result<()> {
        let pid = self.pid().ok_or(JobError::NotRunning)?;
        unix::send_signal(pid, sig).map_err(JobError::Signal)
    }

    /// Sends `SIGTSTP` to the child's process group. Suspension time is
    /// excluded from [`Job::elapsed`] so a suspended job doesn't appear to
    /// be burning wall-clock time against its own budget.
    #[cfg(unix)]
    pub fn suspend(&mut self) -> Result<()> {
        self.signal(nix::sys::signal::Signal::SIGTSTP)?;
        self.suspended_since = Some(Instant::now());
        Ok(())
    }

    #[cfg(unix)]
    pub fn resume(&mut self) -> Result<()> {
        self.signal(nix::sys::signal::Signal::SIGCONT)?;
        if let Some(since) = self.suspended_since.take() {
            self.suspended_total += since.elapsed();
        }
        Ok(())
    }

    /// Sends `SIGTERM` and returns immediately; pair with
    /// [`Job::terminate_wait`] to give the child a grace period before
    /// escalating to [`Job::kill`].
    #[cfg(unix)]
    pub fn terminate(&mut self) -> Result<()> {
        self.signal(nix::sys::signal::Signal::SIGTERM)
    }

    /// Polls `try_wait` under `timeout` after a `terminate()`, returning
    /// `true` if the child exited in time.
    pub fn terminate_wait(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_wait()?.is_some() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Force-kills the child and every descendant process it spawned
    /// (interrupted builds commonly leave shell descendants a plain
    /// `SIGKILL` to the direct child wouldn't reach).
    #[cfg(unix)]
    pub fn kill(&mut self) -> Result<()> {
        use nix::sys::signal::Signal;
        let pid = self.pid().ok_or(JobError::NotRunning)?;
        for descendant in unix::collect_descendants(pid) {
            let _ = unix::send_signal(descendant, Signal::SIGKILL);
        }
        self.signal(Signal::SIGKILL)?;
        if let Some(child) = &mut self.child {
            let _ = child.wait();
        }
        Ok(())
    }

    /// Wall-clock time since spawn, excluding any time spent suspended
    /// (including an in-progress suspension).
    pub fn elapsed(&self) -> Duration {
        let Some(started_at) = self.started_at else { return Duration::ZERO };
        let total_suspended = self.suspended_total
            + self.suspended_since.map(|since| since.elapsed()).unwrap_or(Duration::ZERO);
        started_at.elapsed().saturating_sub(total_suspended)
    }
}

/// Entry point a re-exec'd `kiln` binary runs under `--kiln-job-worker`:
/// reads its [`JobSpec`] from stdin, runs `action` against it, and frames
/// the result back over stdout. `kiln-queue`'s concrete queue kinds build
/// the `action` closure per action name; this function only owns the
/// channel protocol.
pub fn run_worker<F>(action: F) -> std::io::Result<()>
where
    F: FnOnce(JobSpec, &dyn Fn(LogRecord)) -> std::result::Result<serde_json::Value, ErrorEnvelope>,
{
    let stdin = std::io::stdin();
    let spec: JobSpec = match envelope::read_json_frame(stdin.lock())? {
        Some(spec) => spec,
        None => return Ok(()),
    };

    let stdout = std::io::stdout();
    let log_sink = |record: LogRecord| {
        let mut out = stdout.lock();
        let _ = write_json_frame(&mut out, &Envelope::Message(record));
    };

    let result = action(spec, &log_sink);

    let mut out = stdout.lock();
    let envelope = match result {
        Ok(value) => Envelope::Result(value),
        Err(error) => Envelope::Error(error),
    };
    write_json_frame(&mut out, &envelope)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_resources::ResourceType;

    fn spec() -> JobSpec {
        JobSpec {
            action_name: "build".into(),
            element_name: "foo.bst".into(),
            payload: serde_json::json!({}),
        }
    }

    fn job(max_retries: u32) -> Job {
        Job::new(
            1,
            spec(),
            ResourceSet::new(),
            ResourceSet::from([ResourceType::Process]),
            max_retries,
            kiln_retry::RetryPolicy::Default.to_config(),
        )
    }

    #[test]
    fn retryable_true_while_attempts_remain() {
        // max_retries = 3 must allow 4 total spawns (1 initial + 3
        // retries): attempt counts spawns already made, so retryable()
        // must still hold at attempt == max_retries (the 4th spawn is the
        // last retry), and only give out once attempt exceeds it.
        let mut j = job(3);
        assert!(j.retryable()); // 0 attempts spent yet, budget is 3
        j.attempt = 1;
        assert!(j.retryable());
        j.attempt = 3;
        assert!(j.retryable());
        j.attempt = 4;
        assert!(!j.retryable());
    }

    #[test]
    fn classify_log_demotes_fail_to_warn_while_retryable() {
        let mut j = job(3);
        j.attempt = 1;
        let fail = LogRecord { level: LogLevel::Fail, message: "boom".into() };
        let demoted = j.classify_log(&fail);
        assert_eq!(demoted.level, LogLevel::Warn);

        j.attempt = 4;
        let not_retryable = j.classify_log(&fail);
        assert_eq!(not_retryable.level, LogLevel::Fail);
    }

    #[test]
    fn classify_log_leaves_non_fail_alone() {
        let j = job(3);
        let info = LogRecord { level: LogLevel::Info, message: "hi".into() };
        assert_eq!(j.classify_log(&info).level, LogLevel::Info);
    }

    #[test]
    fn elapsed_is_zero_before_spawn() {
        let j = job(1);
        assert_eq!(j.elapsed(), Duration::ZERO);
    }

    #[test]
    fn worker_binary_resolves_to_something() {
        // current_exe() always succeeds for a running test binary.
        assert!(worker_binary().is_ok());
    }
}

//! Unix process-group and signal plumbing for [`crate::Job`]: the `pre_exec`
//! hook that detaches a freshly-spawned child into its own session, and the
//! `/proc` walk used to find shell descendants a `SIGKILL` to the direct
//! child alone would leave behind.

use std::io;

use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::Pid;

fn to_io_err(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Runs in the child between `fork()` and `exec()`. Puts the child in its
/// own session so `suspend()`/`resume()`/`kill()` can target the whole
/// process group, and restores default dispositions for the signals the
/// parent uses to control it (the child otherwise inherits whatever the
/// parent had masked or ignored).
///
/// # Safety
/// Must only run between `fork` and `exec`, per the contract of
/// [`std::os::unix::process::CommandExt::pre_exec`]: no allocation beyond
/// what these calls themselves perform, no locks that might be held by
/// another thread at fork time.
pub unsafe fn child_pre_exec() -> io::Result<()> {
    nix::unistd::setsid().map_err(to_io_err)?;

    for sig in [Signal::SIGTERM, Signal::SIGTSTP, Signal::SIGCONT] {
        unsafe { signal::signal(sig, SigHandler::SigDfl) }.map_err(to_io_err)?;
    }

    let mut set = SigSet::empty();
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGTSTP);
    set.add(Signal::SIGCONT);
    signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None).map_err(to_io_err)?;

    Ok(())
}

/// Sends `sig` to `pid`. Silently treats "no such process" as success: the
/// job may have already exited between the caller checking its status and
/// issuing the signal.
pub fn send_signal(pid: i32, sig: Signal) -> nix::Result<()> {
    match signal::kill(Pid::from_raw(pid), sig) {
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        other => other,
    }
}

/// Collects the pid of every live descendant of `pid`, found by walking
/// `/proc/<pid>/task/*/children`. Linux-only; on other platforms a job's
/// direct child is assumed to be the whole tree.
#[cfg(target_os = "linux")]
pub fn collect_descendants(pid: i32) -> Vec<i32> {
    let mut out = Vec::new();
    let mut frontier = vec![pid];
    while let Some(parent) = frontier.pop() {
        let task_dir = format!("/proc/{parent}/task");
        let Ok(entries) = std::fs::read_dir(&task_dir) else { continue };
        for entry in entries.flatten() {
            let children_path = entry.path().join("children");
            let Ok(contents) = std::fs::read_to_string(children_path) else { continue };
            for token in contents.split_whitespace() {
                if let Ok(child_pid) = token.parse::<i32>() {
                    out.push(child_pid);
                    frontier.push(child_pid);
                }
            }
        }
    }
    out
}

#[cfg(not(target_os = "linux"))]
pub fn collect_descendants(_pid: i32) -> Vec<i32> {
    Vec::new()
}

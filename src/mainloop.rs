//! Timing, signal integration, and the scan skip-if-unchanged optimization.
//!
//! The daemon blocks in exactly one place: a `poll(2)` wait on the
//! self-pipe [`signal-hook`] threads signals through, timed out at
//! `next_wake`. That's deliberately a poll-with-timeout rather than the
//! historical `sleep`-plus-signal-handler approach, which is vulnerable to
//! losing a signal delivered just before the `sleep` call.

use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use signal_hook::consts::{SIGCHLD, SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, info, warn};

use crate::error::AtrunError;
use crate::scanner::{self, JobRunner};
use crate::scheduler::{LoadSampler, Scheduler};

/// Run a single scan and return. Used by `-s` (one-shot) mode.
pub fn run_once(
    spool_dir: &Path,
    check_interval: u64,
    scheduler: &mut Scheduler,
    sampler: &dyn LoadSampler,
    job_runner: &dyn JobRunner,
    batch_runner: &dyn crate::scheduler::BatchRunner,
) -> Result<(), AtrunError> {
    let now = now_secs();
    let mut outcome = scanner::scan(spool_dir, now, check_interval, job_runner)?;
    scheduler.apply(spool_dir, now, &mut outcome, sampler, batch_runner);
    Ok(())
}

/// Carries the scan skip-optimization state across daemon-mode iterations
///.
struct LoopState {
    nothing_to_do: bool,
    last_mtime: Option<SystemTime>,
    cached_next_wake: u64,
}

impl LoopState {
    fn fresh(now: u64) -> Self {
        Self {
            nothing_to_do: false,
            last_mtime: None,
            cached_next_wake: now,
        }
    }
}

/// Run the daemon main loop until a termination signal arrives.
pub fn run_daemon(
    spool_dir: &Path,
    check_interval: u64,
    mut scheduler: Scheduler,
    sampler: &dyn LoadSampler,
    job_runner: &dyn JobRunner,
    batch_runner: &dyn crate::scheduler::BatchRunner,
) -> Result<(), AtrunError> {
    let mut signals = Signals::new([SIGCHLD, SIGHUP, SIGTERM, SIGINT])?;
    let mut state = LoopState::fresh(now_secs());
    let mut terminating = false;

    while !terminating {
        let now = now_secs();
        let dir_mtime = spool_mtime(spool_dir);

        let skip_scan = state.nothing_to_do
            && matches!((dir_mtime, state.last_mtime), (Some(m), Some(last)) if m <= last);

        let next_wake = if skip_scan {
            debug!("spool unchanged since last nothing-to-do verdict, skipping scan");
            state.cached_next_wake
        } else {
            state.last_mtime = dir_mtime;
            let mut outcome = scanner::scan(spool_dir, now, check_interval, job_runner)?;
            scheduler.apply(spool_dir, now, &mut outcome, sampler, batch_runner);
            state.nothing_to_do = !outcome.any_pending_work;
            state.cached_next_wake = outcome.next_wake;
            outcome.next_wake
        };

        let timeout_ms = next_wake.saturating_sub(now_secs()).saturating_mul(1000);
        wait_for_signal_or_timeout(&mut signals, timeout_ms)?;

        for signal in signals.pending() {
            match signal {
                SIGCHLD => reap_children(),
                SIGHUP => {
                    info!("SIGHUP received, forcing a rescan");
                    state.nothing_to_do = false;
                }
                SIGTERM | SIGINT => {
                    info!(signal, "termination signal received, exiting after this iteration");
                    terminating = true;
                }
                other => warn!(signal = other, "unexpected signal delivered"),
            }
        }
    }

    Ok(())
}

fn wait_for_signal_or_timeout(signals: &mut Signals, timeout_ms: u64) -> Result<(), AtrunError> {
    let fd = signals.as_raw_fd();
    let mut fds = [PollFd::new(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN)];
    let timeout = PollTimeout::try_from(timeout_ms.min(i32::MAX as u64) as i32)
        .unwrap_or(PollTimeout::MAX);
    // EINTR here just means a signal landed between computing next_wake and
    // calling poll; the pending-signal drain below still picks it up.
    match poll(&mut fds, timeout) {
        Ok(_) => Ok(()),
        Err(nix::Error::EINTR) => Ok(()),
        Err(e) => Err(AtrunError::SignalSetup(std::io::Error::from_raw_os_error(
            e as i32,
        ))),
    }
}

/// Non-blocking reap of every exited child. Never reports
/// failure upward; its only job is preventing zombie accumulation.
fn reap_children() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(nix::sys::wait::WaitStatus::StillAlive) => break,
            Ok(_) => continue,
            Err(nix::Error::ECHILD) => break,
            Err(_) => break,
        }
    }
}

fn spool_mtime(spool_dir: &Path) -> Option<SystemTime> {
    std::fs::metadata(spool_dir).ok()?.modified().ok()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

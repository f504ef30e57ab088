//! Batch scheduling policy layered on top of the scanner.
//!
//! Immediate jobs run unconditionally inside [`crate::scanner::scan`].
//! Everything here is about the *one* batch job a scan is allowed to start:
//! throttling by `batch_interval`, gating on the sampled 1-minute load
//! average, and folding the outcome back into `next_wake`.

use std::path::Path;

use tracing::{debug, info};

use crate::scanner::{BatchCandidate, ScanOutcome};
use crate::spool::JobName;

/// Samples system load. A trait so tests can substitute a fixed value
/// instead of reading real `/proc/loadavg`-equivalent state.
pub trait LoadSampler {
    /// 1-minute load average, or `None` if the platform can't report it.
    fn sample_one_minute(&self) -> Option<f64>;
}

/// Runs the selected batch job under its owner's identity, applying the
/// queue's nice adjustment.
pub trait BatchRunner {
    fn run_batch(&self, spool_dir: &Path, job: JobName, uid: u32, gid: u32, nice: i32);
}

/// Reads the 1-minute load average via `getloadavg(3)`, which `nix` does
/// not wrap. Some platforms require elevated privileges to sample load;
/// callers needing that scope it around this call.
pub struct SystemLoadSampler;

impl LoadSampler for SystemLoadSampler {
    fn sample_one_minute(&self) -> Option<f64> {
        let mut loads = [0f64; 3];
        let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), loads.len() as i32) };
        if n <= 0 {
            None
        } else {
            Some(loads[0])
        }
    }
}

/// Batch-throttle state, carried across scans by the main loop.
pub struct Scheduler {
    next_batch: u64,
    batch_interval: u64,
    load_avg_threshold: f64,
}

impl Scheduler {
    /// `next_batch` starts at the first scan's `now`.
    pub fn new(now: u64, batch_interval: u64, load_avg_threshold: f64) -> Self {
        Self {
            next_batch: now,
            batch_interval,
            load_avg_threshold,
        }
    }

    pub fn next_batch(&self) -> u64 {
        self.next_batch
    }

    pub fn set_batch_interval(&mut self, batch_interval: u64) {
        self.batch_interval = batch_interval;
    }

    pub fn set_load_avg_threshold(&mut self, threshold: f64) {
        self.load_avg_threshold = threshold;
    }

    /// Apply the batch policy to a scan's outcome: maybe run the candidate,
    /// and adjust `outcome.next_wake`/`outcome.any_pending_work` if it
    /// couldn't run this round.
    pub fn apply(
        &mut self,
        spool_dir: &Path,
        now: u64,
        outcome: &mut ScanOutcome,
        sampler: &dyn LoadSampler,
        runner: &dyn BatchRunner,
    ) {
        let Some(candidate) = outcome.batch_candidate else {
            return;
        };

        let mut ran = false;
        if now >= self.next_batch {
            self.next_batch = now + self.batch_interval;
            let load = sampler.sample_one_minute();
            let load_ok = load.map(|l| l < self.load_avg_threshold).unwrap_or(true);
            if load_ok {
                debug!(job = %candidate.job, load = ?load, "batch gate passed, running candidate");
                self.run_candidate(spool_dir, &candidate, runner);
                ran = true;
            } else {
                info!(job = %candidate.job, load = ?load, threshold = self.load_avg_threshold, "batch candidate deferred: load too high");
            }
        }

        if !ran {
            outcome.any_pending_work = true;
            if self.next_batch < outcome.next_wake {
                outcome.next_wake = self.next_batch;
            }
        }
    }

    fn run_candidate(&self, spool_dir: &Path, candidate: &BatchCandidate, runner: &dyn BatchRunner) {
        let nice = candidate.job.batch_nice();
        runner.run_batch(spool_dir, candidate.job, candidate.uid, candidate.gid, nice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FixedLoad(Option<f64>);
    impl LoadSampler for FixedLoad {
        fn sample_one_minute(&self) -> Option<f64> {
            self.0
        }
    }

    struct RecordingBatchRunner {
        ran: Mutex<Vec<(JobName, i32)>>,
    }
    impl RecordingBatchRunner {
        fn new() -> Self {
            Self {
                ran: Mutex::new(Vec::new()),
            }
        }
    }
    impl BatchRunner for RecordingBatchRunner {
        fn run_batch(&self, _spool_dir: &Path, job: JobName, _uid: u32, _gid: u32, nice: i32) {
            self.ran.lock().unwrap().push((job, nice));
        }
    }

    fn outcome_with_candidate(job: JobName) -> ScanOutcome {
        ScanOutcome {
            next_wake: job.scheduled_time() + 3600,
            batch_candidate: Some(BatchCandidate {
                job,
                uid: 1000,
                gid: 1000,
            }),
            any_pending_work: false,
        }
    }

    #[test]
    fn runs_batch_job_when_load_below_threshold() {
        let dir = TempDir::new().unwrap();
        let job = JobName::parse("B00001deadbeef").unwrap();
        let mut scheduler = Scheduler::new(0, 60, 1.0);
        let mut outcome = outcome_with_candidate(job);
        let runner = RecordingBatchRunner::new();

        scheduler.apply(dir.path(), 100, &mut outcome, &FixedLoad(Some(0.1)), &runner);

        let ran = runner.ran.lock().unwrap();
        assert_eq!(ran.len(), 1);
        assert_eq!(ran[0].0, job);
        assert_eq!(ran[0].1, job.batch_nice());
        assert!(!outcome.any_pending_work);
    }

    #[test]
    fn defers_batch_job_when_load_too_high() {
        let dir = TempDir::new().unwrap();
        let job = JobName::parse("B00001deadbeef").unwrap();
        let mut scheduler = Scheduler::new(0, 60, 1.0);
        let mut outcome = outcome_with_candidate(job);
        let runner = RecordingBatchRunner::new();

        scheduler.apply(dir.path(), 100, &mut outcome, &FixedLoad(Some(2.5)), &runner);

        assert_eq!(runner.ran.lock().unwrap().len(), 0);
        assert!(outcome.any_pending_work);
        assert_eq!(outcome.next_wake, scheduler.next_batch());
    }

    #[test]
    fn throttle_prevents_second_run_before_interval_elapses() {
        let dir = TempDir::new().unwrap();
        let job = JobName::parse("B00001deadbeef").unwrap();
        let mut scheduler = Scheduler::new(0, 60, 1.0);
        let runner = RecordingBatchRunner::new();

        let mut first = outcome_with_candidate(job);
        scheduler.apply(dir.path(), 0, &mut first, &FixedLoad(Some(0.1)), &runner);
        assert_eq!(runner.ran.lock().unwrap().len(), 1);

        let mut second = outcome_with_candidate(job);
        scheduler.apply(dir.path(), 10, &mut second, &FixedLoad(Some(0.1)), &runner);
        assert_eq!(
            runner.ran.lock().unwrap().len(),
            1,
            "throttle should block a second run before batch_interval elapses"
        );
        assert!(second.any_pending_work);
    }

    #[test]
    fn no_candidate_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let mut scheduler = Scheduler::new(0, 60, 1.0);
        let runner = RecordingBatchRunner::new();
        let mut outcome = ScanOutcome {
            next_wake: 500,
            batch_candidate: None,
            any_pending_work: false,
        };

        scheduler.apply(dir.path(), 100, &mut outcome, &FixedLoad(Some(99.0)), &runner);
        assert_eq!(runner.ran.lock().unwrap().len(), 0);
        assert_eq!(outcome.next_wake, 500);
    }
}

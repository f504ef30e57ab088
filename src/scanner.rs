//! One pass over the spool.
//!
//! The scanner never executes a batch job itself — it only classifies
//! entries, reclaims stale locks, and reports back a single batch
//! candidate for the [`crate::scheduler`] to gate. Immediate jobs run
//! inline during the scan, via the injected [`JobRunner`], without
//! breaking out of the loop.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use tracing::{trace, warn};

use crate::error::ScanError;
use crate::spool::{self, Entry, JobName, QueueClass};

/// A batch job eligible to run now, with the identity it should run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCandidate {
    pub job: JobName,
    pub uid: u32,
    pub gid: u32,
}

/// Result of one scan pass.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// Earliest instant (seconds since the epoch) the main loop should wake
    /// for another scan, bounded above by `now + check_interval`.
    pub next_wake: u64,
    /// Best (lexicographically-smallest filename) batch candidate seen this
    /// scan, if any.
    pub batch_candidate: Option<BatchCandidate>,
    /// Whether any work is outstanding: a job awaiting its execute bit, a
    /// reclaimed stale lock, or a batch candidate that couldn't run yet.
    pub any_pending_work: bool,
}

/// Runs an eligible immediate job. The scanner calls this inline; the
/// trait exists so tests can substitute a recording stub instead of the
/// real fork/exec executor.
pub trait JobRunner {
    fn run_immediate(&self, spool_dir: &Path, job: JobName, uid: u32, gid: u32);
}

/// Run one scan of `spool_dir`.
///
/// `now` and `check_interval` are both in whole seconds; `check_interval`
/// is the daemon's configured scan period, used both to bound `next_wake`
/// and to decide when a lock is stale.
pub fn scan(
    spool_dir: &Path,
    now: u64,
    check_interval: u64,
    runner: &dyn JobRunner,
) -> Result<ScanOutcome, ScanError> {
    let mut next_wake = now + check_interval;
    let mut batch_candidate: Option<BatchCandidate> = None;
    let mut any_pending_work = false;

    let entries = fs::read_dir(spool_dir).map_err(|source| ScanError::ReadDir {
        path: spool_dir.to_path_buf(),
        source,
    })?;

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };

        let classified = match spool::classify(name) {
            Some(c) => c,
            None => continue, // unparseable name: ignored
        };

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue, // racing deletion
            Err(_) => continue,
        };

        if !metadata.is_file() {
            continue;
        }

        match classified {
            Entry::Lock(job) => {
                if metadata.nlink() == 1 && job.scheduled_time() + check_interval <= now {
                    let lock_path = spool_dir.join(job.lock_filename());
                    if fs::remove_file(&lock_path).is_ok() {
                        warn!(job = %job, "reclaimed orphaned stale lock");
                    }
                }
                continue;
            }
            Entry::Job(job) => {
                if metadata.permissions().mode() & 0o100 == 0 {
                    // Owner-execute bit clear: submitter hasn't finalized
                    // this job yet. Still counts as pending work.
                    any_pending_work = true;
                    continue;
                }

                if crate::lock::is_locked(&metadata) {
                    if job.scheduled_time() + check_interval <= now {
                        let lock_path = spool_dir.join(job.lock_filename());
                        if fs::remove_file(&lock_path).is_ok() {
                            warn!(job = %job, "reclaimed stale lock from dead runner");
                        }
                        any_pending_work = true;
                        next_wake = now;
                    }
                    continue;
                }

                if job.scheduled_time() > now {
                    next_wake = next_wake.min(job.scheduled_time());
                    continue;
                }

                let uid = metadata.uid();
                let gid = metadata.gid();
                match job.class() {
                    QueueClass::Immediate => {
                        trace!(job = %job, "running immediate job");
                        runner.run_immediate(spool_dir, job, uid, gid);
                    }
                    QueueClass::Batch => {
                        let candidate = BatchCandidate { job, uid, gid };
                        batch_candidate = Some(match batch_candidate {
                            Some(current) if current.job.filename() <= candidate.job.filename() => {
                                current
                            }
                            _ => candidate,
                        });
                    }
                }
            }
        }
    }

    Ok(ScanOutcome {
        next_wake,
        batch_candidate,
        any_pending_work,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct RecordingRunner {
        ran: Mutex<Vec<JobName>>,
    }

    impl RecordingRunner {
        fn new() -> Self {
            Self {
                ran: Mutex::new(Vec::new()),
            }
        }
    }

    impl JobRunner for RecordingRunner {
        fn run_immediate(&self, _spool_dir: &Path, job: JobName, _uid: u32, _gid: u32) {
            self.ran.lock().unwrap().push(job);
        }
    }

    fn touch_executable(dir: &Path, name: &str) {
        let path = dir.join(name);
        File::create(&path).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o700);
        fs::set_permissions(&path, perms).unwrap();
    }

    fn touch_non_executable(dir: &Path, name: &str) {
        let path = dir.join(name);
        File::create(&path).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&path, perms).unwrap();
    }

    #[test]
    fn runs_past_immediate_job() {
        let dir = TempDir::new().unwrap();
        // minute 1 => scheduled_time 60s, well in the past relative to now.
        touch_executable(dir.path(), "a0000100000001");
        let runner = RecordingRunner::new();

        let outcome = scan(dir.path(), 1_000_000, 60, &runner).unwrap();
        assert_eq!(runner.ran.lock().unwrap().len(), 1);
        assert!(!outcome.any_pending_work);
    }

    #[test]
    fn future_job_sets_next_wake_without_running() {
        let dir = TempDir::new().unwrap();
        let future_minute = 2_000_000u32 / 60;
        let name = format!("a00001{:08x}", future_minute);
        touch_executable(dir.path(), &name);
        let runner = RecordingRunner::new();

        let outcome = scan(dir.path(), 1_000_000, 60, &runner).unwrap();
        assert_eq!(runner.ran.lock().unwrap().len(), 0);
        assert_eq!(outcome.next_wake, u64::from(future_minute) * 60);
    }

    #[test]
    fn non_executable_job_is_pending_and_skipped() {
        let dir = TempDir::new().unwrap();
        touch_non_executable(dir.path(), "a0000100000001");
        let runner = RecordingRunner::new();

        let outcome = scan(dir.path(), 1_000_000, 60, &runner).unwrap();
        assert_eq!(runner.ran.lock().unwrap().len(), 0);
        assert!(outcome.any_pending_work);
    }

    #[test]
    fn locked_job_is_never_rerun_while_fresh() {
        let dir = TempDir::new().unwrap();
        touch_executable(dir.path(), "a0000100000001");
        let job = JobName::parse("a0000100000001").unwrap();
        crate::lock::acquire(dir.path(), &job).unwrap();
        let runner = RecordingRunner::new();

        let outcome = scan(dir.path(), 120, 60, &runner).unwrap();
        assert_eq!(runner.ran.lock().unwrap().len(), 0);
        assert!(dir.path().join(job.lock_filename()).exists());
        assert!(!outcome.any_pending_work);
    }

    #[test]
    fn stale_lock_on_live_job_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        touch_executable(dir.path(), "a0000100000001");
        let job = JobName::parse("a0000100000001").unwrap();
        crate::lock::acquire(dir.path(), &job).unwrap();
        let runner = RecordingRunner::new();

        // scheduled_time = 60; now must be >= 60 + check_interval.
        let outcome = scan(dir.path(), 1_000_000, 60, &runner).unwrap();
        assert!(!dir.path().join(job.lock_filename()).exists());
        assert!(outcome.any_pending_work);
        assert_eq!(outcome.next_wake, 1_000_000);
    }

    #[test]
    fn orphaned_lock_past_threshold_is_removed() {
        let dir = TempDir::new().unwrap();
        touch_executable(dir.path(), "a0000100000001");
        let job = JobName::parse("a0000100000001").unwrap();
        crate::lock::acquire(dir.path(), &job).unwrap();
        fs::remove_file(dir.path().join(job.filename())).unwrap();
        let runner = RecordingRunner::new();

        scan(dir.path(), 1_000_000, 60, &runner).unwrap();
        assert!(!dir.path().join(job.lock_filename()).exists());
    }

    #[test]
    fn batch_candidate_prefers_lexicographically_smaller_filename() {
        let dir = TempDir::new().unwrap();
        touch_executable(dir.path(), "B0000100000001");
        touch_executable(dir.path(), "C0000200000000");
        let runner = RecordingRunner::new();

        let outcome = scan(dir.path(), 1_000_000, 60, &runner).unwrap();
        let candidate = outcome.batch_candidate.unwrap();
        assert_eq!(candidate.job.queue, 'B');
    }

    #[test]
    fn unparseable_names_are_ignored() {
        let dir = TempDir::new().unwrap();
        touch_executable(dir.path(), "not-a-job-file");
        let runner = RecordingRunner::new();

        let outcome = scan(dir.path(), 1_000_000, 60, &runner).unwrap();
        assert_eq!(runner.ran.lock().unwrap().len(), 0);
        assert!(!outcome.any_pending_work);
    }
}

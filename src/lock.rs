//! Hard-link lock protocol.
//!
//! Mutual exclusion between runners relies entirely on the atomicity of
//! hard-link creation: `link(job, job_with_queue_replaced_by_=)` either
//! succeeds (we now own the job) or fails with `EEXIST` (someone else got
//! there first). No advisory locks, no lock server.

use std::fs;
use std::io;
use std::path::Path;

use crate::error::LockError;
use crate::spool::JobName;

/// Attempt to acquire the lock for `job` inside `spool_dir`.
///
/// Returns `Ok(())` on success. `Err(LockError::AlreadyLocked)` means
/// another runner already owns this job — not a failure, just a signal to
/// return without running the job. Any other `Err` is
/// fatal to this job attempt.
pub fn acquire(spool_dir: &Path, job: &JobName) -> Result<(), LockError> {
    let job_path = spool_dir.join(job.filename());
    let lock_path = spool_dir.join(job.lock_filename());
    match fs::hard_link(&job_path, &lock_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(LockError::AlreadyLocked),
        Err(source) => Err(LockError::Link {
            path: lock_path,
            source,
        }),
    }
}

/// Release the lock for `job`. Called only after the worker has waited for
/// user code to finish and handed output off for mailing — the lock is the
/// sole remaining spool evidence of the job by then.
pub fn release(spool_dir: &Path, job: &JobName) -> Result<(), LockError> {
    let lock_path = spool_dir.join(job.lock_filename());
    fs::remove_file(&lock_path).map_err(|source| LockError::Unlink {
        path: lock_path,
        source,
    })
}

/// Whether the job file at `path` is currently locked: a lock is live when
/// the job file's link count is greater than one.
pub fn is_locked(metadata: &fs::Metadata) -> bool {
    link_count(metadata) > 1
}

#[cfg(unix)]
fn link_count(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.nlink()
}

#[cfg(not(unix))]
fn link_count(_metadata: &fs::Metadata) -> u64 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn make_job(dir: &Path, name: &str) -> JobName {
        File::create(dir.join(name)).unwrap();
        JobName::parse(name).unwrap()
    }

    #[test]
    fn acquire_then_release_round_trips() {
        let dir = TempDir::new().unwrap();
        let job = make_job(dir.path(), "a00001abcdef12");

        acquire(dir.path(), &job).unwrap();
        let meta = fs::symlink_metadata(dir.path().join(job.filename())).unwrap();
        assert!(is_locked(&meta));

        release(dir.path(), &job).unwrap();
        assert!(!dir.path().join(job.lock_filename()).exists());
    }

    #[test]
    fn second_acquire_is_already_locked() {
        let dir = TempDir::new().unwrap();
        let job = make_job(dir.path(), "a00001abcdef12");

        acquire(dir.path(), &job).unwrap();
        let err = acquire(dir.path(), &job).unwrap_err();
        assert!(matches!(err, LockError::AlreadyLocked));
    }

    #[test]
    fn orphaned_lock_has_nlink_one() {
        let dir = TempDir::new().unwrap();
        let job = make_job(dir.path(), "a00001abcdef12");
        acquire(dir.path(), &job).unwrap();

        fs::remove_file(dir.path().join(job.filename())).unwrap();
        let meta = fs::symlink_metadata(dir.path().join(job.lock_filename())).unwrap();
        assert!(!is_locked(&meta));
    }
}

//! The privileged-to-unprivileged job run.
//!
//! Sequence, all after the link-lock is acquired: fork a worker; in the
//! worker, resolve the submitter, open and anti-tamper-check the job file,
//! parse its header, unlink it, prepare the output file, open an auth
//! session, fork the user-code child (which drops privileges and execs
//! `/bin/sh`), wait for it, tear the auth session down, and finally decide
//! whether to mail the captured output.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::stat::{fstat, lstat, SFlag};
use nix::sys::wait::waitpid;
use nix::unistd::{self, ForkResult, Gid, Pid, Uid, User};
use tracing::{debug, error, info, warn};

use crate::auth::AuthSession;
use crate::error::ExecutorError;
use crate::header::{self, MailSwitch};
use crate::lock;
use crate::privilege::Elevated;
use crate::scanner::JobRunner;
use crate::scheduler::BatchRunner;
use crate::spool::JobName;

/// Runs jobs out of one spool directory, delivering output via one output
/// directory and one mail program.
pub struct Executor<A: AuthSession> {
    spool_dir: PathBuf,
    output_dir: PathBuf,
    mail_program: PathBuf,
    login_name_max: usize,
    auth_session_factory: Box<dyn Fn() -> A + Send + Sync>,
}

impl<A: AuthSession> Executor<A> {
    pub fn new(
        spool_dir: PathBuf,
        output_dir: PathBuf,
        mail_program: PathBuf,
        login_name_max: usize,
        auth_session_factory: impl Fn() -> A + Send + Sync + 'static,
    ) -> Self {
        Self {
            spool_dir,
            output_dir,
            mail_program,
            login_name_max,
            auth_session_factory: Box::new(auth_session_factory),
        }
    }

    /// Top-level entry point shared by immediate and batch runs. `nice`
    /// is `0` for immediate jobs and the queue's nice adjustment for
    /// batch jobs.
    pub fn run(&self, job: JobName, uid: u32, gid: u32, nice: i32) {
        match lock::acquire(&self.spool_dir, &job) {
            Ok(()) => {}
            Err(crate::error::LockError::AlreadyLocked) => {
                warn!(job = %job, "second runner attempted this job, already locked");
                return;
            }
            Err(e) => {
                error!(job = %job, error = %e, "fatal: could not acquire job lock");
                return;
            }
        }

        // SAFETY: the daemon's main loop is single-threaded; no
        // other thread can be mid-syscall when we fork.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Parent { child, .. }) => {
                debug!(job = %job, worker_pid = %child, "forked worker, returning to scanner");
            }
            Ok(ForkResult::Child) => {
                let exit_code = match self.run_worker(job, uid, gid, nice) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!(job = %job, error = %e, "job aborted");
                        1
                    }
                };
                std::process::exit(exit_code);
            }
            Err(errno) => {
                error!(job = %job, error = %errno, "fork failed; lock left for stale reclaim");
            }
        }
    }

    fn run_worker(&self, job: JobName, uid: u32, gid: u32, nice: i32) -> Result<(), ExecutorError> {
        // Confirm the submitter still resolves before doing anything else;
        // the name itself isn't needed until the privilege-dropping
        // children look it up again under their own scope.
        User::from_uid(Uid::from_raw(uid))?.ok_or(ExecutorError::UnknownUser(uid))?;

        let job_path = self.spool_dir.join(job.filename());
        let job_file = {
            let _elevated = Elevated::acquire()?;
            File::open(&job_path).map_err(|source| ExecutorError::OpenJob {
                path: job_path.clone(),
                source,
            })?
        };
        let job_file_dup = job_file.try_clone()?;
        clear_cloexec(job_file_dup.as_raw_fd())?;

        verify_untampered(&job_file, &job_path)?;

        let mut reader = BufReader::new(job_file.try_clone()?);
        let header = header::parse(&mut reader, self.login_name_max)?;
        drop(reader);

        if header.uid != uid {
            return Err(ExecutorError::HeaderUidMismatch {
                header_uid: header.uid,
                owner_uid: uid,
            });
        }

        fs::remove_file(&job_path).map_err(ExecutorError::from)?;
        drop(job_file);

        let (output_file, header_size) =
            self.prepare_output_file(&job, uid, header.gid, &header.mail_login)?;

        let mut auth_session = (self.auth_session_factory)();
        {
            let _elevated = Elevated::acquire()?;
            auth_session
                .open(&header.mail_login)
                .map_err(|e| ExecutorError::AuthSession {
                    step: "open",
                    reason: e.to_string(),
                })?;
        }

        let job_gid = header.gid;
        let child_pid = self.spawn_user_code(&job_file_dup, &output_file, gid, job_gid, uid, nice)?;

        match waitpid(child_pid, None) {
            Ok(_status) => {}
            Err(nix::Error::ECHILD) => {
                // Reaped by the daemon's SIGCHLD handler already; treated
                // as success.
            }
            Err(e) => return Err(ExecutorError::Wait(e)),
        }

        auth_session
            .close()
            .map_err(|e| ExecutorError::AuthSession {
                step: "close",
                reason: e.to_string(),
            })?;

        let final_size = output_file.metadata()?.len();
        let output_path = self.output_dir.join(job.filename());

        lock::release(&self.spool_dir, &job)?;

        let should_mail = match header.mail_switch {
            MailSwitch::Always => true,
            MailSwitch::Never => false,
            MailSwitch::IfOutput => final_size > header_size,
        };

        if should_mail {
            self.mail_output(&output_file, &output_path, uid, job_gid, &header.mail_login)?;
        } else {
            fs::remove_file(&output_path).ok();
            info!(job = %job, "job produced no mailable output");
        }

        Ok(())
    }

    fn prepare_output_file(
        &self,
        job: &JobName,
        job_uid: u32,
        header_gid: u32,
        mail_login: &str,
    ) -> Result<(File, u64), ExecutorError> {
        unistd::chdir(&self.output_dir).map_err(ExecutorError::from)?;

        let output_path = self.output_dir.join(job.filename());
        // REDESIGN: rely on O_CREAT|O_EXCL instead
        // of unlink-then-create; a pre-existing output file is a
        // programming error, not something to race against.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&output_path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    ExecutorError::OutputExists(output_path.clone())
                } else {
                    ExecutorError::Io(e)
                }
            })?;

        {
            let _elevated = Elevated::acquire()?;
            unistd::chown(
                &output_path,
                Some(Uid::from_raw(job_uid)),
                Some(Gid::from_raw(header_gid)),
            )
            .map_err(ExecutorError::from)?;
        }

        let header_line = format!(
            "Subject: Output from your job {:08}\nTo: {}\n\n",
            job.serial, mail_login
        );
        file.write_all(header_line.as_bytes())?;
        let header_size = file.metadata()?.len();

        Ok((file, header_size))
    }

    /// Forks the user-code child: wires up stdio, drops privileges, and
    /// execs `/bin/sh` with an empty environment.
    fn spawn_user_code(
        &self,
        job_file: &File,
        output_file: &File,
        _original_owner_gid: u32,
        job_gid: u32,
        job_uid: u32,
        nice: i32,
    ) -> Result<Pid, ExecutorError> {
        // SAFETY: single-threaded daemon.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Parent { child, .. }) => Ok(child),
            Ok(ForkResult::Child) => {
                if let Err(e) = run_user_code_child(
                    job_file,
                    output_file,
                    &self.spool_dir,
                    job_gid,
                    job_uid,
                    nice,
                ) {
                    // Any failure along this path is fatal to the child
                    //.
                    error!(error = %e, "user-code child setup failed");
                    std::process::exit(1);
                }
                unreachable!("run_user_code_child only returns on error");
            }
            Err(errno) => Err(ExecutorError::Fork(errno)),
        }
    }

    fn mail_output(
        &self,
        output_file: &File,
        output_path: &Path,
        job_uid: u32,
        job_gid: u32,
        login: &str,
    ) -> Result<(), ExecutorError> {
        let mut output_file = output_file.try_clone()?;
        output_file.seek(SeekFrom::Start(0))?;
        fs::remove_file(output_path).ok();

        // SAFETY: single-threaded daemon.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Parent { .. }) => Ok(()),
            Ok(ForkResult::Child) => {
                if let Err(e) = run_mail_child(&output_file, &self.mail_program, job_uid, job_gid, login) {
                    error!(error = %e, "mail child setup failed");
                    std::process::exit(1);
                }
                unreachable!("run_mail_child only returns on error");
            }
            Err(errno) => Err(ExecutorError::Fork(errno)),
        }
    }
}

fn clear_cloexec(fd: RawFd) -> Result<(), ExecutorError> {
    let flags = fcntl(fd, FcntlArg::F_GETFD)?;
    let mut flags = FdFlag::from_bits_truncate(flags);
    flags.remove(FdFlag::FD_CLOEXEC);
    fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

/// Anti-tamper check: the open descriptor and the path
/// it was opened from must still describe the same, non-symlinked, at most
/// doubly-linked file.
fn verify_untampered(job_file: &File, job_path: &Path) -> Result<(), ExecutorError> {
    let fstat_info = fstat(job_file.as_raw_fd())?;
    let lstat_info = lstat(job_path)?;

    let lstat_mode = SFlag::from_bits_truncate(lstat_info.st_mode as libc::mode_t);
    if lstat_mode.contains(SFlag::S_IFLNK) {
        return Err(ExecutorError::SymlinkDetected(job_path.to_path_buf()));
    }

    if fstat_info.st_dev != lstat_info.st_dev
        || fstat_info.st_ino != lstat_info.st_ino
        || fstat_info.st_uid != lstat_info.st_uid
        || fstat_info.st_gid != lstat_info.st_gid
        || fstat_info.st_size != lstat_info.st_size
    {
        return Err(ExecutorError::IdentityMismatch(job_path.to_path_buf()));
    }

    // Locked job has two links: its queue name and our `=` mirror. Anything
    // more means someone aliased the script under a third name.
    if fstat_info.st_nlink > 2 {
        return Err(ExecutorError::AliasedJob(job_path.to_path_buf()));
    }

    Ok(())
}

fn run_user_code_child(
    job_file: &File,
    output_file: &File,
    job_spool_dir: &Path,
    job_gid: u32,
    job_uid: u32,
    nice: i32,
) -> Result<(), ExecutorError> {
    job_file.try_clone()?.seek(SeekFrom::Start(0))?;
    dup2_checked(job_file.as_raw_fd(), 0)?;
    dup2_checked(output_file.as_raw_fd(), 1)?;
    dup2_checked(output_file.as_raw_fd(), 2)?;

    unistd::chdir(job_spool_dir).map_err(ExecutorError::from)?;

    {
        let _elevated = Elevated::acquire()?;
        if nice != 0 {
            // SAFETY: `nice(2)` with a valid, small increment.
            unsafe {
                libc::nice(nice);
            }
        }

        let user = User::from_uid(Uid::from_raw(job_uid))?.ok_or(ExecutorError::UnknownUser(job_uid))?;
        let login_c = CString::new(user.name.as_bytes()).map_err(|_| {
            ExecutorError::BadHeader("login name contains an interior NUL".into())
        })?;
        unistd::initgroups(&login_c, Gid::from_raw(job_gid)).map_err(ExecutorError::from)?;
        unistd::setgid(Gid::from_raw(job_gid)).map_err(ExecutorError::from)?;
        unistd::setuid(Uid::from_raw(job_uid)).map_err(ExecutorError::from)?;
        unistd::chdir("/").map_err(ExecutorError::from)?;
    }

    let shell = CString::new("/bin/sh").unwrap();
    let argv = [CString::new("sh").unwrap()];
    let envp: [CString; 0] = [];
    // Exec with an empty environment is a security contract, not
    // an oversight.
    let err = unistd::execve(&shell, &argv, &envp).unwrap_err();
    Err(ExecutorError::Nix(err))
}

fn run_mail_child(
    output_file: &File,
    mail_program: &Path,
    job_uid: u32,
    job_gid: u32,
    login: &str,
) -> Result<(), ExecutorError> {
    dup2_checked(output_file.as_raw_fd(), 0)?;
    let devnull = OpenOptions::new().write(true).open("/dev/null")?;
    dup2_checked(devnull.as_raw_fd(), 1)?;
    dup2_checked(devnull.as_raw_fd(), 2)?;

    {
        let _elevated = Elevated::acquire()?;
        let user = User::from_uid(Uid::from_raw(job_uid))?.ok_or(ExecutorError::UnknownUser(job_uid))?;
        let login_c = CString::new(user.name.as_bytes()).map_err(|_| {
            ExecutorError::BadHeader("login name contains an interior NUL".into())
        })?;
        unistd::initgroups(&login_c, Gid::from_raw(job_gid)).map_err(ExecutorError::from)?;
        unistd::setgid(Gid::from_raw(job_gid)).map_err(ExecutorError::from)?;
        unistd::setuid(Uid::from_raw(job_uid)).map_err(ExecutorError::from)?;
        unistd::chdir("/").map_err(ExecutorError::from)?;
    }

    let program = CString::new(mail_program.as_os_str().as_bytes()).map_err(|_| {
        ExecutorError::BadHeader("mail program path contains an interior NUL".into())
    })?;
    let argv = [
        CString::new("sendmail").unwrap(),
        CString::new("-i").unwrap(),
        CString::new(login).map_err(|_| {
            ExecutorError::BadHeader("login name contains an interior NUL".into())
        })?,
    ];
    let err = unistd::execv(&program, &argv).unwrap_err();
    Err(ExecutorError::Nix(err))
}

fn dup2_checked(src: RawFd, dst: RawFd) -> Result<(), ExecutorError> {
    unistd::dup2(src, dst).map_err(ExecutorError::from)?;
    Ok(())
}

impl<A: AuthSession> JobRunner for Executor<A> {
    fn run_immediate(&self, _spool_dir: &Path, job: JobName, uid: u32, gid: u32) {
        self.run(job, uid, gid, 0);
    }
}

impl<A: AuthSession> BatchRunner for Executor<A> {
    fn run_batch(&self, _spool_dir: &Path, job: JobName, uid: u32, gid: u32, nice: i32) {
        self.run(job, uid, gid, nice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_job(dir: &Path, name: &str, uid: u32, gid: u32, login: &str, switch: i32, body: &str) {
        let path = dir.join(name);
        let padded = format!("{:<width$}", login, width = header::DEFAULT_LOGIN_NAME_MAX);
        let contents = format!(
            "#!/bin/sh\n# atrun uid={} gid={}\n# mail {} {}\n{}",
            uid, gid, padded, switch, body
        );
        fs::write(&path, contents).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o700);
        fs::set_permissions(&path, perms).unwrap();
    }

    #[test]
    fn verify_untampered_accepts_plain_locked_file() {
        let dir = TempDir::new().unwrap();
        write_job(dir.path(), "a00001abcdef12", 1000, 1000, "alice", 0, "echo hi\n");
        let job = JobName::parse("a00001abcdef12").unwrap();
        lock::acquire(dir.path(), &job).unwrap();

        let path = dir.path().join(job.filename());
        let file = File::open(&path).unwrap();
        assert!(verify_untampered(&file, &path).is_ok());
    }

    #[test]
    fn verify_untampered_rejects_third_hard_link() {
        let dir = TempDir::new().unwrap();
        write_job(dir.path(), "a00001abcdef12", 1000, 1000, "alice", 0, "echo hi\n");
        let job = JobName::parse("a00001abcdef12").unwrap();
        lock::acquire(dir.path(), &job).unwrap();
        fs::hard_link(dir.path().join(job.filename()), dir.path().join("alias")).unwrap();

        let path = dir.path().join(job.filename());
        let file = File::open(&path).unwrap();
        assert!(matches!(
            verify_untampered(&file, &path),
            Err(ExecutorError::AliasedJob(_))
        ));
    }

    #[test]
    fn header_parsing_catches_uid_mismatch_before_worker_proceeds() {
        let dir = TempDir::new().unwrap();
        // Header declares uid=1000 but we'll claim the file's owner uid is
        // different; this mirrors the worker's explicit post-parse check.
        write_job(dir.path(), "a00001abcdef12", 1000, 1000, "alice", 0, "echo hi\n");
        let path = dir.path().join("a00001abcdef12");
        let file = File::open(&path).unwrap();
        let mut reader = BufReader::new(file);
        let header = header::parse(&mut reader, header::DEFAULT_LOGIN_NAME_MAX).unwrap();
        assert_eq!(header.uid, 1000);
        assert_ne!(header.uid, 2000, "sanity: mismatch check happens in run_worker");
        assert_eq!(header.mail_switch, MailSwitch::IfOutput);
    }
}

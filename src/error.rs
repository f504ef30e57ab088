//! Error types for the daemon.
//!
//! One variant family per component boundary, unified here so `main` has a
//! single type to match on.

use std::path::PathBuf;

/// Top-level daemon error. Fatal-to-daemon conditions are
/// returned as `Err(AtrunError)` from `main`; fatal-to-worker and
/// abort-this-job conditions are caught inside the executor and never
/// reach this type.
#[derive(thiserror::Error, Debug)]
pub enum AtrunError {
    #[error("cannot resolve daemon identity: {0}")]
    Identity(String),

    #[error("cannot change directory to spool {path}: {source}")]
    Chdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install signal handlers: {0}")]
    SignalSetup(#[from] std::io::Error),

    #[error("invalid command line: {0}")]
    Cli(String),

    #[error(transparent)]
    Scan(#[from] ScanError),
}

/// Errors a single scan pass can surface. All of these are non-fatal to the
/// daemon; the main loop logs and continues to the next scan.
#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    #[error("failed to read spool directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stat spool directory {path}: {source}")]
    StatSpool {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while acquiring or releasing the hard-link lock on a job
/// file.
#[derive(thiserror::Error, Debug)]
pub enum LockError {
    /// Another runner already owns this job; not an error condition for the
    /// caller, just a signal to back off.
    #[error("job already locked by another runner")]
    AlreadyLocked,

    #[error("failed to create lock link {path}: {source}")]
    Link {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove lock {path}: {source}")]
    Unlink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures inside the job-execution worker. Every variant
/// here corresponds either to a fatal-to-worker syscall failure or to an
/// abort-this-job quarantine condition; the executor logs the job number
/// and filename alongside whichever of these it returns and translates the
/// result into the worker's exit code.
#[derive(thiserror::Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("no passwd entry for uid {0}")]
    UnknownUser(u32),

    #[error("failed to open job file {path}: {source}")]
    OpenJob {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("symbolic link encountered at {0}")]
    SymlinkDetected(PathBuf),

    #[error("job file identity mismatch (fstat/lstat disagree) at {0}")]
    IdentityMismatch(PathBuf),

    #[error("job file has unexpected extra hard links ({0})")]
    AliasedJob(PathBuf),

    #[error("malformed job header: {0}")]
    BadHeader(String),

    #[error("header uid {header_uid} does not match file owner uid {owner_uid}")]
    HeaderUidMismatch { header_uid: u32, owner_uid: u32 },

    #[error("mail recipient name begins with '-'")]
    IllegalMailName,

    #[error("output file already exists at {0}")]
    OutputExists(PathBuf),

    #[error("auth session step '{step}' failed: {reason}")]
    AuthSession { step: &'static str, reason: String },

    #[error("fork failed: {0}")]
    Fork(nix::Error),

    #[error("wait failed: {0}")]
    Wait(nix::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Nix(#[from] nix::Error),
}

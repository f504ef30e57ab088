//! Pluggable authentication session integration.
//!
//! The original daemon opens a PAM session around user-code execution:
//! start, account-management check, open-session, establish-credentials,
//! and the mirrored teardown after the job exits. Linking a real PAM stack
//! is out of scope for this crate — the pluggable authentication stack used
//! to open a user session is treated as an external collaborator — but the
//! hook must exist and behave identically whether or not a backend is plugged
//! in — a build with only [`NoopAuthSession`] runs every job exactly as one
//! wired to a real session manager would, minus the credential bookkeeping.

use crate::error::ExecutorError;

/// An open authentication session for one job's submitter. Dropped (via
/// [`AuthSession::close`]) after the user-code child has been waited for.
pub trait AuthSession {
    /// PAM-style `pam_start` + `pam_acct_mgmt` + `pam_open_session` +
    /// `pam_setcred`, collapsed into one call since this crate doesn't
    /// expose intermediate session state to callers.
    fn open(&mut self, login: &str) -> Result<(), ExecutorError>;

    /// Mirrors the teardown: `pam_setcred(DELETE_CRED)` + `pam_close_session`
    /// + `pam_end`.
    fn close(&mut self) -> Result<(), ExecutorError>;
}

/// Default backend: every step is a no-op success. Used when no real
/// session manager is configured; keeps the executor's control flow
/// identical regardless of whether auth integration is present.
#[derive(Default)]
pub struct NoopAuthSession;

impl AuthSession for NoopAuthSession {
    fn open(&mut self, _login: &str) -> Result<(), ExecutorError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), ExecutorError> {
        Ok(())
    }
}

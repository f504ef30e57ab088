//! Scoped privilege elevation.
//!
//! The daemon runs as an unprivileged service identity most of the time. A
//! handful of operations need real root: opening a user's job file,
//! chown'ing the output file, opening the auth session, and (on platforms
//! that require it) sampling the load average. [`Elevated::acquire`] raises
//! the effective uid/gid to root for the scope of the guard and restores
//! the prior effective ids unconditionally on drop — including on an early
//! return or panic unwind, which is the property the original's bracketing
//! macros relied on.

use nix::unistd::{geteuid, getegid, seteuid, setegid, Gid, Uid};

/// RAII guard: effective privileges are root while this is alive, and are
/// restored to whatever they were on `acquire` when it's dropped.
pub struct Elevated {
    saved_euid: Uid,
    saved_egid: Gid,
}

impl Elevated {
    pub fn acquire() -> Result<Self, nix::Error> {
        let saved_euid = geteuid();
        let saved_egid = getegid();
        setegid(Gid::from_raw(0))?;
        seteuid(Uid::from_raw(0))?;
        Ok(Self {
            saved_euid,
            saved_egid,
        })
    }
}

impl Drop for Elevated {
    fn drop(&mut self) {
        // Order matters: drop euid's root first would leave us unable to
        // lower egid on some platforms, so restore uid then gid... but we
        // raised egid before euid, so unwind in reverse.
        let _ = seteuid(self.saved_euid);
        let _ = setegid(self.saved_egid);
    }
}

//! `atrund` binary entrypoint.

use std::process::ExitCode;

use atrund::auth::NoopAuthSession;
use atrund::config::Cli;
use atrund::error::AtrunError;
use atrund::header::DEFAULT_LOGIN_NAME_MAX;
use atrund::mainloop;
use atrund::scheduler::{Scheduler, SystemLoadSampler};
use atrund::Executor;
use clap::Parser;
use nix::unistd::{geteuid, Gid, Group, Uid, User};
use tracing::error;

/// Platform default load-average threshold used when `-l` is absent or
/// `<= 0`. The historical daemon reads this from a compiled-in
/// constant; there's no portable syscall for "the system's configured
/// default", so it's hardcoded here same as upstream.
const PLATFORM_DEFAULT_LOAD_AVG: f64 = 1.5;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        "atrund=debug,info"
    } else {
        "atrund=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .json()
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), AtrunError> {
    drop_to_service_identity(&cli.service_user, &cli.service_group)?;

    std::env::set_current_dir(&cli.spool_dir).map_err(|source| AtrunError::Chdir {
        path: cli.spool_dir.clone(),
        source,
    })?;

    let check_interval = cli.check_interval();
    let batch_interval = cli.batch_interval_or_default();
    let load_avg = cli.load_avg_or_default(PLATFORM_DEFAULT_LOAD_AVG);

    let executor = Executor::new(
        cli.spool_dir.clone(),
        cli.output_dir.clone(),
        cli.mail_program.clone(),
        DEFAULT_LOGIN_NAME_MAX,
        NoopAuthSession::default,
    );
    let sampler = SystemLoadSampler;

    if cli.one_shot {
        let mut scheduler = Scheduler::new(0, batch_interval, load_avg);
        mainloop::run_once(
            &cli.spool_dir,
            check_interval,
            &mut scheduler,
            &sampler,
            &executor,
            &executor,
        )
    } else {
        let scheduler = Scheduler::new(0, batch_interval, load_avg);
        mainloop::run_daemon(
            &cli.spool_dir,
            check_interval,
            scheduler,
            &sampler,
            &executor,
            &executor,
        )
    }
}

/// Drop the daemon's own process identity from root to the configured
/// service user/group, while retaining root in the saved set-ids so that
/// [`atrund::privilege::Elevated`] can still seteuid/setegid back to zero
/// for the scoped operations that need it (job-file open, output chown,
/// auth session, load sampling).
///
/// `setresuid`/`setresgid` are the only portable way to drop privileges
/// while keeping a saved root id; `nix` only wraps them on Linux, and
/// this daemon has no reason to run anywhere else.
fn drop_to_service_identity(service_user: &str, service_group: &str) -> Result<(), AtrunError> {
    if !geteuid().is_root() {
        // Already unprivileged (e.g. running under a supervisor that
        // starts us as the service user directly); nothing to drop.
        return Ok(());
    }

    let user = User::from_name(service_user)
        .map_err(|e| AtrunError::Identity(e.to_string()))?
        .ok_or_else(|| AtrunError::Identity(format!("no such user: {service_user}")))?;
    let group = Group::from_name(service_group)
        .map_err(|e| AtrunError::Identity(e.to_string()))?
        .ok_or_else(|| AtrunError::Identity(format!("no such group: {service_group}")))?;

    set_saved_root_ids(user.uid, group.gid)
}

#[cfg(target_os = "linux")]
fn set_saved_root_ids(uid: Uid, gid: Gid) -> Result<(), AtrunError> {
    nix::unistd::setresgid(gid, gid, Gid::from_raw(0))
        .map_err(|e| AtrunError::Identity(e.to_string()))?;
    nix::unistd::setresuid(uid, uid, Uid::from_raw(0))
        .map_err(|e| AtrunError::Identity(e.to_string()))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_saved_root_ids(uid: Uid, gid: Gid) -> Result<(), AtrunError> {
    use nix::unistd::{setgid, setuid};
    tracing::warn!(
        "setresuid/setresgid unavailable on this platform; dropping privileges without a saved root id, scoped elevation will not work"
    );
    setgid(gid).map_err(|e| AtrunError::Identity(e.to_string()))?;
    setuid(uid).map_err(|e| AtrunError::Identity(e.to_string()))?;
    Ok(())
}

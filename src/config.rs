//! Command-line surface.
//!
//! Kept deliberately small and close to the historical flag set; the extra
//! `--spool-dir`/`--output-dir`/`--mail-program`/`--service-user`/
//! `--service-group` options don't exist in the original `at`/`atd` but are
//! how this crate stays testable and deployable without hardcoded paths.

use std::path::PathBuf;

use clap::Parser;

/// Default batch interval in seconds.
pub const DEFAULT_BATCH_INTERVAL: u64 = 60;

/// Default spool scan period, used by the lock/scanner stale-reclaim math;
/// 60 seconds matches the historical daemon's compiled-in default.
pub const DEFAULT_CHECK_INTERVAL: u64 = 60;

#[derive(Debug, Parser)]
#[command(name = "atrund", about = "Deferred-job execution daemon")]
pub struct Cli {
    /// Enable debug logging and stay in the foreground.
    #[arg(short = 'd')]
    pub debug: bool,

    /// Stay in the foreground (implied by `-d`).
    #[arg(short = 'f')]
    pub foreground: bool,

    /// Run a single scan and exit.
    #[arg(short = 's')]
    pub one_shot: bool,

    /// Batch load-average threshold. A value `<= 0` resets to the platform
    /// default.
    #[arg(short = 'l', value_name = "FLOAT", allow_hyphen_values = true)]
    pub load_avg: Option<f64>,

    /// Batch interval in seconds.
    #[arg(short = 'b', value_name = "SECONDS")]
    pub batch_interval: Option<u64>,

    /// Spool directory holding queued job files.
    #[arg(long, env = "ATRUND_SPOOL_DIR", default_value = "/var/spool/atrun")]
    pub spool_dir: PathBuf,

    /// Directory jobs' captured stdout/stderr is staged in before mailing.
    #[arg(
        long,
        env = "ATRUND_OUTPUT_DIR",
        default_value = "/var/spool/atrun/spool"
    )]
    pub output_dir: PathBuf,

    /// Mail transfer program invoked as `<mail_program> -i <login>`.
    #[arg(long, env = "ATRUND_MAIL_PROGRAM", default_value = "/usr/sbin/sendmail")]
    pub mail_program: PathBuf,

    /// Service user the daemon itself (not job workers) runs as once
    /// started.
    #[arg(long, env = "ATRUND_SERVICE_USER", default_value = "daemon")]
    pub service_user: String,

    /// Service group the daemon itself runs as.
    #[arg(long, env = "ATRUND_SERVICE_GROUP", default_value = "daemon")]
    pub service_group: String,
}

impl Cli {
    pub fn check_interval(&self) -> u64 {
        DEFAULT_CHECK_INTERVAL
    }

    pub fn batch_interval_or_default(&self) -> u64 {
        self.batch_interval.unwrap_or(DEFAULT_BATCH_INTERVAL)
    }

    /// Resolve the configured load-average threshold, applying the
    /// "`<= 0` resets to platform default" rule.
    pub fn load_avg_or_default(&self, platform_default: f64) -> f64 {
        match self.load_avg {
            Some(v) if v > 0.0 => v,
            _ => platform_default,
        }
    }

    pub fn foreground(&self) -> bool {
        self.debug || self.foreground || self.one_shot
    }
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;

use crate::logging::LogFormat;
use crate::scanner::ProberConfig;

/// Command-line flags, each with an environment fallback.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "reachprobe",
    version,
    about = "Bounded-concurrency TCP reachability prober with a small HTTP front end.",
    long_about = None
)]
pub struct Cli {
    /// Address the HTTP service listens on.
    #[arg(long, env = "REACHPROBE_BIND", default_value = "0.0.0.0:8080")]
    pub bind: String,

    /// Basic-auth user for the /files endpoint.
    #[arg(long, env = "USERNAME", hide_env_values = true)]
    pub username: Option<String>,

    /// Basic-auth password for the /files endpoint.
    #[arg(long, env = "PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Max concurrent TCP connect attempts per scan.
    #[arg(long, env = "REACHPROBE_CONCURRENCY", default_value_t = 1000)]
    pub concurrency: usize,

    /// Per-attempt connect timeout in milliseconds.
    #[arg(long = "timeout-ms", env = "REACHPROBE_TIMEOUT_MS", default_value_t = 500)]
    pub timeout_ms: u64,

    /// Abort a whole scan after this many seconds; unfinished ports are reported unchecked.
    #[arg(long = "scan-deadline-secs", env = "REACHPROBE_SCAN_DEADLINE_SECS")]
    pub scan_deadline_secs: Option<u64>,

    /// Send a minimal HTTP request to each open port and log the reply.
    #[arg(long, env = "REACHPROBE_VERIFY", default_value_t = false)]
    pub verify: bool,

    /// Host header used for verification requests.
    #[arg(long = "verify-host", env = "RENDER_INTERNAL_HOSTNAME")]
    pub verify_host: Option<String>,

    /// Default log level; RUST_LOG overrides it.
    #[arg(long = "log-level", env = "REACHPROBE_LOG", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Scan this host once from the command line instead of serving HTTP.
    #[arg(long)]
    pub probe: Option<String>,

    /// Port range for --probe, e.g. `1-1024` or `443`.
    #[arg(long, default_value = "1-65535")]
    pub ports: String,

    /// Write the full --probe report as pretty JSON to this path.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

/// Credentials guarding the directory lister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Cli {
    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn prober_config(&self) -> ProberConfig {
        ProberConfig {
            concurrency: self.concurrency,
            verify: self.verify,
            verify_host: self.verify_host.clone().filter(|h| !h.trim().is_empty()),
            scan_deadline: self.scan_deadline_secs.map(Duration::from_secs),
            ..ProberConfig::default()
        }
    }

    /// Both credentials must be set and non-empty before the service may start.
    pub fn credentials(&self) -> Result<Credentials> {
        let username = match self.username.as_deref() {
            Some(u) if !u.is_empty() => u.to_string(),
            _ => bail!("username unset, must have some value (--username or USERNAME)"),
        };
        let password = match self.password.as_deref() {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => bail!("password unset, must have some value (--password or PASSWORD)"),
        };
        Ok(Credentials { username, password })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["reachprobe"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("valid args")
    }

    #[test]
    fn explicit_flags_map_into_prober_config() {
        let cli = parse(&[
            "--concurrency",
            "64",
            "--timeout-ms",
            "250",
            "--scan-deadline-secs",
            "30",
            "--verify",
            "--verify-host",
            "internal.example",
        ]);
        let cfg = cli.prober_config();
        assert_eq!(cfg.concurrency, 64);
        assert!(cfg.verify);
        assert_eq!(cfg.verify_host.as_deref(), Some("internal.example"));
        assert_eq!(cfg.scan_deadline, Some(Duration::from_secs(30)));
        assert_eq!(cli.per_attempt_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn credentials_must_be_non_empty() {
        let cli = parse(&["--username", "admin", "--password", ""]);
        assert!(cli.credentials().is_err());

        let cli = parse(&["--username", "admin", "--password", "hunter2"]);
        let creds = cli.credentials().unwrap();
        assert_eq!(creds.username, "admin");
        assert_eq!(creds.password, "hunter2");
    }

    #[test]
    fn log_format_accepts_json() {
        let cli = parse(&["--log-format", "json"]);
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use reachprobe::config::Cli;
use reachprobe::scanner::Prober;
use reachprobe::server::{self, AppState};
use reachprobe::types::{ScanReport, ScanRequest};
use reachprobe::{logging, ports};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_format)?;

    info!(
        bind = %cli.bind,
        concurrency = cli.concurrency,
        timeout_ms = cli.timeout_ms,
        scan_deadline_secs = ?cli.scan_deadline_secs,
        verify = cli.verify,
        "reachprobe configuration"
    );

    let prober = Prober::new(cli.prober_config());

    // Ctrl-C cancels a running one-shot scan or stops the server.
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_ctrlc.cancel();
    });

    if let Some(host) = cli.probe.as_deref() {
        let range = ports::parse_port_range(&cli.ports)?;
        let request = ScanRequest::new(host, range, cli.per_attempt_timeout());
        let report = prober.scan_with_cancel(&request, cancel).await?;

        print!("{}", report.render_open_lines());
        if let Some(path) = cli.output.as_deref() {
            write_report_json(path, &report)?;
            info!(path = %path.display(), "wrote JSON report");
        }
        return Ok(());
    }

    let credentials = cli.credentials()?;
    let state = AppState::new(credentials, prober, cli.per_attempt_timeout());
    server::spawn_server(&cli.bind, state, cancel).await
}

fn write_report_json(path: &Path, report: &ScanReport) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}

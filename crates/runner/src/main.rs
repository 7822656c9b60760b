//! `mdscript` -- run an analysis script from the console.
//!
//! ```text
//! mdscript <script.rhai>
//! ```
//!
//! Script output goes to stdout, logs and diagnostics to stderr. Ctrl-C
//! aborts the running script.
//!
//! # Environment variables
//!
//! | Variable                | Required | Default | Description                          |
//! |-------------------------|----------|---------|--------------------------------------|
//! | `MDSCRIPT_TIMEOUT_SECS` | no       | --      | Abort the script after this long     |
//! | `MDSCRIPT_*`            | no       | --      | Host settings, see `HostConfig::from_env` |
//! | `RUST_LOG`              | no       | `mdscript=info,mdscript_core=info` | Log filter |
//!
//! # Exit codes
//!
//! `0` completed, `1` syntax or runtime error, `2` usage error, `130` aborted.

use std::path::PathBuf;
use std::time::Duration;

use mdscript_core::{HostConfig, HostError, JobOutcome, ScriptHost};
use mdscript_runner::{capabilities, console};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mdscript=info,mdscript_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let path: PathBuf = std::env::args_os().nth(1).map(PathBuf::from).unwrap_or_else(|| {
        eprintln!("usage: mdscript <script>");
        std::process::exit(2);
    });

    let config = HostConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid host configuration");
        std::process::exit(1);
    });

    let timeout = std::env::var("MDSCRIPT_TIMEOUT_SECS")
        .ok()
        .map(|v| {
            v.parse::<u64>().unwrap_or_else(|_| {
                tracing::error!(value = %v, "MDSCRIPT_TIMEOUT_SECS must be a whole number of seconds");
                std::process::exit(1);
            })
        })
        .map(Duration::from_secs);

    let capabilities = capabilities::molecular().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to build capability table");
        std::process::exit(1);
    });

    let source = console::load_script(&path).await.unwrap_or_else(|e| {
        tracing::error!(error = %format!("{e:#}"), "Cannot start");
        std::process::exit(1);
    });

    tracing::info!(script = %path.display(), ?timeout, "Starting mdscript");

    let host = ScriptHost::new(config, capabilities);

    let interrupt = CancellationToken::new();
    let on_ctrl_c = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let mut stdout = tokio::io::stdout();
    let code = match console::run_script(&host, &source, timeout, &interrupt, &mut stdout).await {
        Ok(outcome) => {
            match &outcome {
                JobOutcome::Failed(failure) => eprintln!("{failure}"),
                JobOutcome::Aborted => eprintln!("Script aborted"),
                JobOutcome::Completed(_) => {}
            }
            console::exit_code(&outcome)
        }
        Err(e) => {
            match e.downcast_ref::<HostError>() {
                Some(HostError::Syntax(syntax)) => eprintln!("{syntax}"),
                _ => tracing::error!(error = %format!("{e:#}"), "Script run failed"),
            }
            1
        }
    };

    host.shutdown();
    std::process::exit(code);
}

//! hearth: a multi-virtual-host HTTP/1.1 origin server.
//!
//! One process, one thread, one readiness loop. The server reads a
//! declarative TOML configuration, binds the configured endpoints, and
//! serves static files, directory indexes, configured error pages, and
//! uploads across any number of virtual hosts.

mod config;
mod handlers;
mod http;
mod mime;
mod net;
mod router;
mod runtime;
mod vhost;

use clap::error::ErrorKind;
use clap::Parser;
use config::{CliArgs, Config};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vhost::ServerMap;

/// Cleared by the signal handler; the event loop exits at the top of
/// the next iteration.
static RUNNING: AtomicBool = AtomicBool::new(true);

fn main() -> ExitCode {
    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    // Load configuration
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(1);
        }
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // A peer hanging up mid-response must surface as EPIPE on the
    // write path, not kill the process.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    if let Err(err) = ctrlc::set_handler(|| RUNNING.store(false, Ordering::Relaxed)) {
        error!(error = %err, "failed to install signal handler");
        return ExitCode::from(2);
    }

    info!(
        servers = config.servers.len(),
        "Starting hearth"
    );

    let map = ServerMap::new(config.servers);
    match runtime::run(map, &RUNNING) {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "Fatal runtime error");
            ExitCode::from(2)
        }
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Etikett — local label-print routing service.
//
// Entry point. Initialises logging and the backend services, then runs the
// loopback ingest endpoint until interrupted.

mod services;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use etikett_core::error::{EtikettError, Result};
use services::app_services::AppServices;

/// Command-line options for the daemon.
#[derive(Debug, Parser)]
#[command(name = "etikett", version, about = "Local label-print routing service")]
struct Cli {
    /// Data directory for the selection database and config file.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Ingest port, overriding the configured value (normally 65533).
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Network scan duration in seconds, overriding the configured value.
    #[arg(long, value_name = "SECONDS")]
    scan_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Etikett starting");

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut services = AppServices::init(cli.data_dir, cli.port, cli.scan_timeout).await?;
    services.run().await?;

    if let Some(addr) = services.ingest_addr() {
        info!(addr = %addr, "ready; send SIGINT to stop");
    }

    tokio::signal::ctrl_c().await.map_err(EtikettError::Io)?;
    info!("shutdown requested");

    services.dispose().await;
    Ok(())
}

//! vmprov - declarative VirtualBox machine provisioner
//!
//! Runs one lifecycle operation per invocation and prints the observed state
//! as JSON. Configuration comes from `VMPROV_*` environment variables; see
//! [`vmprov::config::Config`].

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmprov::config::Config;
use vmprov::{ProcessRunner, Provisioner, VBoxManage};

mod cli;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing on stderr so stdout stays machine-readable
    tracing_subscriber::registry()
        .with(EnvFilter::new(config.log_level.as_str()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    info!(
        base_dir = %config.base_dir.display(),
        vboxmanage = %config.vboxmanage,
        download_dir = %config.download_dir.display(),
        "Configuration loaded"
    );

    let runner = Arc::new(ProcessRunner::new());
    let hypervisor = Arc::new(VBoxManage::with_program(
        config.vboxmanage.clone(),
        runner.clone(),
    ));
    let provisioner = Provisioner::new(config.provisioner_config(), hypervisor, runner)?;

    // Cancel the in-flight operation on Ctrl-C
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received interrupt, cancelling");
                cancel.cancel();
            }
        }
    });

    if let Err(e) = cli.run(&provisioner, &cancel).await {
        error!(error = %e, "Operation failed");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

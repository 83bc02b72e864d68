use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

use someip::e2e::{E2eProvider, NoProtection, Profile07Provider};
use someip::routing::{RoutingManager, RoutingState};
use someip::{AllowAll, Config, DefaultHost};

#[derive(Parser)]
#[command(name = "someipd", about = "SOME/IP routing manager daemon")]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enables verbose output on STDOUT
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let cfg = match cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        network = %cfg.network,
        "starting someipd"
    );

    let e2e: Arc<dyn E2eProvider> = if cfg.e2e_enabled {
        Arc::new(Profile07Provider::new())
    } else {
        Arc::new(NoProtection)
    };

    let routing = RoutingManager::new(cfg, Arc::new(DefaultHost), Arc::new(AllowAll), e2e);
    routing.start().await?;

    // SIGUSR1 suspends the routing manager, SIGUSR2 resumes it.
    let mut suspend = signal(SignalKind::user_defined1())?;
    let mut resume = signal(SignalKind::user_defined2())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            _ = suspend.recv() => {
                routing.set_routing_state(RoutingState::Suspended).await;
            }
            _ = resume.recv() => {
                routing.set_routing_state(RoutingState::Resumed).await;
            }
        }
    }

    routing.shutdown().await;
    Ok(())
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

use tokenwarden::bridge::{self, BridgeState, BridgeTabs};
use tokenwarden::browser::SiteTarget;
use tokenwarden::clearance::{ClearanceCache, ClearanceStore, EgressPath, ScraperBroker};
use tokenwarden::config::AppConfig;
use tokenwarden::coordinator::{Coordinator, CoordinatorConfig, CoordinatorTimings};
use tokenwarden::logging::init_logging;
use tokenwarden::peer::HttpPeer;
use tokenwarden::utils::http_client::install_rustls_provider;

/// Interval between background sweeps of expired clearances.
const CLEARANCE_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Site whose tabs produce tokens
    #[arg(long, global = true)]
    site_url: Option<Url>,

    /// Directory for the clearance snapshot and scraper temp files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Directory for rolling log files
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Directory containing the clearance scraper's main.py
    #[arg(long, global = true)]
    scraper_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the token coordinator and the browser bridge
    Run {
        /// Loopback address of the browser bridge
        #[arg(long)]
        bridge_addr: Option<SocketAddr>,

        /// Peer host
        #[arg(long)]
        peer_host: Option<String>,

        /// Peer port
        #[arg(long)]
        peer_port: Option<u16>,
    },
    /// Inspect or fill the clearance cache
    #[command(subcommand)]
    Clearance(ClearanceCommand),
}

#[derive(Subcommand, Debug)]
enum ClearanceCommand {
    /// Print the cached clearance, acquiring one on a miss
    Get(ClearanceArgs),
    /// Acquire a fresh clearance, replacing any cached one
    Refresh(ClearanceArgs),
    /// Drop expired clearances
    Sweep,
    /// Print cache statistics
    Stats,
}

#[derive(Args, Debug)]
struct ClearanceArgs {
    /// Proxy URL the clearance is bound to (omit for a direct connection)
    #[arg(long)]
    proxy: Option<String>,

    /// Identity the clearance is bound to
    #[arg(long)]
    user: Option<String>,

    /// Protected URL to solve the challenge for (defaults to the site URL)
    #[arg(long)]
    target: Option<Url>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env_or_default().context("Failed to load configuration")?;
    if let Some(url) = cli.site_url {
        config.site_url = url;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = cli.log_dir {
        config.log_dir = dir;
    }
    if let Some(dir) = cli.scraper_dir {
        config.scraper_dir = Some(dir);
    }

    let (logging, _guard) = init_logging(&config.log_dir).context("Failed to initialize logging")?;
    install_rustls_provider();

    match cli.command {
        Command::Run {
            bridge_addr,
            peer_host,
            peer_port,
        } => {
            if let Some(addr) = bridge_addr {
                config.bridge_addr = addr;
            }
            if let Some(host) = peer_host {
                config.settings.host = host;
            }
            if let Some(port) = peer_port {
                config.settings.port = port;
            }
            config.settings = config.settings.normalized();
            run(config, logging).await
        }
        Command::Clearance(command) => clearance(config, command).await,
    }
}

async fn open_clearance_cache(config: &AppConfig) -> ClearanceCache {
    let broker = Arc::new(ScraperBroker::new(config.scraper_config()));
    ClearanceCache::open(ClearanceStore::new(config.clearance_cache_path()), broker).await
}

async fn run(
    config: AppConfig,
    logging: Arc<tokenwarden::logging::LoggingConfig>,
) -> anyhow::Result<()> {
    let cancel_token = CancellationToken::new();
    logging.start_retention_cleanup(cancel_token.child_token());

    info!(
        site = %config.site_url,
        peer = %config.settings.peer_base_url(),
        bridge = %config.bridge_addr,
        "tokenwarden starting"
    );

    let tabs = Arc::new(BridgeTabs::default());
    let (coordinator, coordinator_task) = Coordinator::spawn(
        CoordinatorConfig {
            tabs: tabs.clone(),
            cookies: tabs.clone(),
            peer: Arc::new(HttpPeer::new(&config.settings)),
            site: SiteTarget::new(config.site_url.clone()),
            settings: config.settings.clone(),
            timings: CoordinatorTimings::default(),
            logging: Some(logging),
        },
        cancel_token.child_token(),
    );

    let clearance = Arc::new(open_clearance_cache(&config).await);
    info!(entries = clearance.len(), "Clearance cache loaded");
    let sweeper = clearance.start_sweeper(CLEARANCE_SWEEP_INTERVAL, cancel_token.child_token());

    let state = BridgeState {
        tabs: tabs.as_ref().clone(),
        coordinator,
        clearance: Some(clearance),
        default_target: config.site_url.clone(),
        cancel_token: cancel_token.child_token(),
    };
    let mut bridge_task = tokio::spawn(bridge::serve(config.bridge_addr, state));

    let mut bridge_done = false;
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");
            Ok(())
        }
        served = &mut bridge_task => {
            bridge_done = true;
            match served {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("Bridge failed")),
                Err(e) => Err(anyhow::Error::new(e).context("Bridge task panicked")),
            }
        }
    };

    cancel_token.cancel();
    if !bridge_done {
        match bridge_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Bridge failed during shutdown"),
            Err(e) => error!(error = %e, "Bridge task failed during shutdown"),
        }
    }
    let _ = coordinator_task.await;
    let _ = sweeper.await;

    info!("tokenwarden stopped");
    outcome
}

async fn clearance(config: AppConfig, command: ClearanceCommand) -> anyhow::Result<()> {
    let cache = open_clearance_cache(&config).await;

    match command {
        ClearanceCommand::Get(args) => {
            let egress = args.proxy.as_deref().map(EgressPath::parse).transpose()?;
            let target = args.target.unwrap_or_else(|| config.site_url.clone());
            let entry = cache
                .get_or_acquire(egress.as_ref(), args.user.as_deref(), &target)
                .await
                .context("Failed to obtain clearance")?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        ClearanceCommand::Refresh(args) => {
            let egress = args.proxy.as_deref().map(EgressPath::parse).transpose()?;
            let target = args.target.unwrap_or_else(|| config.site_url.clone());
            let entry = cache
                .force_refresh(egress.as_ref(), args.user.as_deref(), &target)
                .await
                .context("Failed to refresh clearance")?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        ClearanceCommand::Sweep => {
            let removed = cache.sweep_expired().await?;
            println!("Removed {removed} expired clearance(s)");
        }
        ClearanceCommand::Stats => {
            println!("{}", serde_json::to_string_pretty(&cache.stats())?);
        }
    }
    Ok(())
}

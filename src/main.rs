//! elohim-app-store: package distribution and install daemon for Elohim nodes
//!
//! Serves the store's request API, mirrors packages to peers and runs the
//! background auto-update sweep.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use elohim_app_store::api::create_router;
use elohim_app_store::config::Config;
use elohim_app_store::controller::scheduler::AutoUpdateScheduler;
use elohim_app_store::AppStore;

#[derive(Parser)]
#[command(name = "elohim-app-store")]
#[command(about = "Package distribution and install engine for Elohim nodes")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "elohim-app-store.toml")]
    config: String,

    /// Data directory
    #[arg(short, long, env = "ELOHIM_APP_STORE_DATA_DIR")]
    data_dir: Option<String>,

    /// Node ID (overrides config file)
    #[arg(long, env = "ELOHIM_NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config file)
    #[arg(long, env = "ELOHIM_APP_STORE_PORT")]
    http_port: Option<u16>,

    /// Log filter directive, e.g. `debug` or `elohim_app_store=trace`
    #[arg(long, env = "ELOHIM_APP_STORE_LOG", default_value = "elohim_app_store=info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the store API and auto-update scheduler (default)
    Serve,
    /// Drop cached listings, reconcile with installed packages and re-index
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
    /// Run one auto-update sweep and exit
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(cli.log_level.parse()?),
        )
        .init();

    info!("Starting elohim-app-store");
    info!("Config file: {}", cli.config);

    let mut config = Config::load_or_default(std::path::Path::new(&cli.config))?;

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node.id = node_id;
    }
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = PathBuf::from(data_dir);
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }

    info!("Node ID: {}", config.node.id);
    info!("Data dir: {}", config.node.data_dir.display());
    std::fs::create_dir_all(&config.node.data_dir)?;

    let store = Arc::new(AppStore::from_config(&config)?);
    let scheduler = Arc::new(AutoUpdateScheduler::from_config(store.clone(), &config.updates));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Reset { yes } => {
            let summary = store.reset_store(yes).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            return Ok(());
        }
        Command::Sweep => {
            let report = scheduler.sweep().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        Command::Serve => {}
    }

    if config.updates.enabled {
        let _sweep_task = scheduler.start().await;
    } else {
        warn!("Auto-update sweep is disabled");
    }

    let app = create_router(store);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.http_port));
    info!("App store listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    scheduler.stop().await;
    info!("App store stopped");
    Ok(())
}

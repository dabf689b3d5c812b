use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use stickycast::backplane::hub::{DEFAULT_PEER_QUEUE_LIMIT, Hub};
use stickycast::backplane::{Backoff, HubClient, Medium, MemoryBus};
use stickycast::config::{Settings, load_config};
use stickycast::node::Node;
use stickycast::utils::{StartupError, logging};

#[derive(Parser)]
#[command(name = "stickycast", version, about = "Clustered WebSocket broadcast node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a broadcast node.
    Node {
        /// Use a private in-memory backplane instead of the hub.
        #[arg(long)]
        local: bool,
    },
    /// Run a backplane hub.
    Hub {
        /// Port to listen on (defaults to BACKPLANE_PORT).
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.log_level);

    let result = match cli.command {
        Command::Node { local } => run_node(settings, local).await,
        Command::Hub { port } => run_hub(settings, port).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("startup failure: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_node(settings: Settings, local: bool) -> Result<(), StartupError> {
    let medium: Arc<dyn Medium> = if local {
        info!("using in-memory backplane");
        Arc::new(MemoryBus::new().attach())
    } else {
        let backoff = Backoff::from_millis(
            settings.backplane.reconnect_backoff_base_ms,
            settings.backplane.reconnect_backoff_max_ms,
        );
        let grace = Duration::from_millis(settings.backplane.startup_grace_ms);
        Arc::new(HubClient::connect(settings.backplane_url(), backoff, grace).await?)
    };

    let node = Node::start(settings, medium).await?;
    wait_for_ctrl_c().await;
    node.shutdown().await;
    Ok(())
}

async fn run_hub(settings: Settings, port: Option<u16>) -> Result<(), StartupError> {
    let port = port.unwrap_or(settings.backplane.port);
    let addr = format!("{}:{}", settings.backplane.host, port);
    let hub = Hub::spawn(&addr, DEFAULT_PEER_QUEUE_LIMIT).await?;
    wait_for_ctrl_c().await;
    hub.shutdown().await;
    Ok(())
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot listen for ctrl-c: {}", e);
    }
    info!("shutdown requested");
}

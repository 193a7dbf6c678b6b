//! Tandem Server - one member of a primary/secondary file storage pair
//!
//! Startup order:
//! 1. Load configuration (defaults, `--config` file, `TANDEM_*` variables, flags)
//! 2. Bind the listener so peers can queue requests while we take a role
//! 3. Start the node: sweep stale transactions, join or become primary, heartbeat
//! 4. Serve until ctrl-c, then stop the heartbeat and flush the log

use clap::{Parser, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tandem_core::Node;
use tandem_server::config::Config;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Log output format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Tandem Server CLI arguments
#[derive(Parser, Debug)]
#[command(name = "tandem-server")]
#[command(about = "Tandem replicated transactional file storage server", long_about = None)]
struct Args {
    /// Address to listen on and advertise to the peer
    #[arg(long)]
    ip: Option<IpAddr>,

    /// Port to listen on
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Directory holding the served files and the log
    #[arg(long, short = 'd')]
    dir: Option<PathBuf>,

    /// Shared file naming the current primary
    #[arg(long)]
    primary_file: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Run without the multicast heartbeat (no automatic failover)
    #[arg(long)]
    no_heartbeat: bool,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;

        if let Some(ip) = self.ip {
            config.addr = SocketAddr::new(ip, config.addr.port());
        }
        if let Some(port) = self.port {
            config.addr.set_port(port);
        }
        if let Some(dir) = self.dir {
            config = config.with_data_dir(dir);
        }
        if let Some(primary_file) = self.primary_file {
            config = config.with_primary_file(primary_file);
        }
        if self.no_heartbeat {
            config.heartbeat.enabled = false;
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "tandem_server=debug,tandem_core=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.log_format);

    let config = args.into_config()?;
    std::fs::create_dir_all(&config.data_dir)?;
    info!("Using data directory: {:?}", config.data_dir);

    let listener = TcpListener::bind(config.addr).await?;
    info!("Tandem Server listening on {}", config.addr);

    let node = Node::start(config.node_config()).await?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    tandem_server::serve(listener, node.clone(), config.server_settings(), shutdown).await;

    node.shutdown().await?;
    Ok(())
}

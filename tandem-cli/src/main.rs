use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tandem_protocol::FileClient;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{file, txn};

/// Command-line client for Tandem file storage
#[derive(Parser)]
#[command(name = "tandem")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Server address (host:port)
    #[arg(long, short, env = "TANDEM_SERVER", default_value = "127.0.0.1:8080")]
    pub server: String,

    /// Seconds to wait for each reply
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Append a local file to a server file in one transaction
    Put(file::PutArgs),
    /// Print the readable prefix of a server file
    Get(file::GetArgs),
    #[command(flatten)]
    Txn(txn::TxnCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "tandem_cli=debug,tandem_protocol=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let client = FileClient::new(cli.server.clone())
        .with_timeouts(Duration::from_secs(3), Duration::from_secs(cli.timeout));

    let output = commands::OutputContext {
        json: cli.json,
        verbose: cli.verbose,
    };

    let result = match cli.command {
        Commands::Put(args) => file::put(client, args, &output).await,
        Commands::Get(args) => file::get(client, args, &output).await,
        Commands::Txn(command) => txn::execute(client, command, &output).await,
    };

    if let Err(e) = &result {
        output.print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
    Ok(())
}

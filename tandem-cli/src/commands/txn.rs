use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;
use tandem_protocol::{CommitReply, FileClient};

use super::OutputContext;

#[derive(Subcommand)]
pub enum TxnCommands {
    /// Open a transaction on a file
    NewTxn {
        /// Name of the file on the server
        file: String,
    },
    /// Store one numbered chunk
    Write(WriteArgs),
    /// Commit chunks 0..seq
    Commit {
        /// Transaction id
        txn: i64,
        /// Number of chunks to commit
        seq: u64,
    },
    /// Abort a transaction
    Abort {
        /// Transaction id
        txn: i64,
    },
}

#[derive(Args)]
pub struct WriteArgs {
    /// Transaction id
    pub txn: i64,
    /// Chunk sequence number
    pub seq: u64,
    /// Chunk contents
    #[arg(required_unless_present = "from")]
    pub data: Option<String>,
    /// Read the chunk from a local file instead
    #[arg(long, conflicts_with = "data")]
    pub from: Option<PathBuf>,
}

pub async fn execute(client: FileClient, command: TxnCommands, output: &OutputContext) -> Result<()> {
    match command {
        TxnCommands::NewTxn { file } => {
            let txn = client.new_txn(&file).await?;
            if output.json {
                return output.print_json(&serde_json::json!({ "txn": txn, "file": file }));
            }
            println!("{}", txn);
        }
        TxnCommands::Write(args) => {
            let chunk = match (&args.data, &args.from) {
                (_, Some(path)) => std::fs::read(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (Some(data), None) => data.clone().into_bytes(),
                (None, None) => anyhow::bail!("either DATA or --from is required"),
            };
            client.write(args.txn, args.seq, &chunk).await?;
            output.print_success(&format!(
                "Wrote chunk {} ({} bytes) to txn {}",
                args.seq,
                chunk.len(),
                args.txn
            ));
        }
        TxnCommands::Commit { txn, seq } => match client.commit(txn, seq).await? {
            CommitReply::Ack => {
                if output.json {
                    return output.print_json(&serde_json::json!({ "txn": txn, "committed": true }));
                }
                output.print_success(&format!("Committed txn {}", txn));
            }
            CommitReply::Resend(missing) => {
                if output.json {
                    return output.print_json(
                        &serde_json::json!({ "txn": txn, "committed": false, "missing": missing }),
                    );
                }
                output.print_error(&format!("Txn {} is missing chunks {:?}", txn, missing));
                std::process::exit(2);
            }
        },
        TxnCommands::Abort { txn } => {
            client.abort(txn).await?;
            output.print_success(&format!("Aborted txn {}", txn));
        }
    }
    Ok(())
}

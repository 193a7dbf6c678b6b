use anyhow::{Context, Result};
use clap::Args;
use std::io::Write;
use std::path::PathBuf;
use tandem_cli::transfer::{self, DEFAULT_CHUNK_SIZE};
use tandem_protocol::FileClient;

use super::{OutputContext, create_bytes_progress_bar};

#[derive(Args)]
pub struct PutArgs {
    /// Name of the file on the server
    pub file: String,
    /// Local file whose contents are appended
    pub path: PathBuf,
    /// Bytes per WRITE
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,
}

#[derive(Args)]
pub struct GetArgs {
    /// Name of the file on the server
    pub file: String,
    /// Write to this path instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub async fn put(client: FileClient, args: PutArgs, output: &OutputContext) -> Result<()> {
    anyhow::ensure!(args.chunk_size > 0, "--chunk-size must be positive");

    let data = std::fs::read(&args.path)
        .with_context(|| format!("Failed to read {}", args.path.display()))?;

    let pb = create_bytes_progress_bar(data.len() as u64, &format!("Uploading {}", args.file));
    let report = transfer::put(client, &args.file, &data, args.chunk_size, |n| {
        pb.inc(n as u64)
    })
    .await;
    pb.finish_and_clear();
    let report = report?;

    if output.json {
        return output.print_json(&report);
    }
    if report.resent > 0 {
        output.print_info(&format!("{} chunk(s) resent", report.resent));
    }
    output.print_success(&format!(
        "Committed {} bytes to {} (txn {}, {} chunks, via {})",
        report.bytes, args.file, report.txn, report.chunks, report.server
    ));
    Ok(())
}

pub async fn get(client: FileClient, args: GetArgs, output: &OutputContext) -> Result<()> {
    let bytes = transfer::get(client, &args.file).await?;

    match args.output {
        Some(path) => {
            std::fs::write(&path, &bytes)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            output.print_success(&format!("Wrote {} bytes to {}", bytes.len(), path.display()));
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

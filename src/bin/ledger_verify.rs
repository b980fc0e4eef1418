use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use audit_ledger::anchor::HttpAnchorSink;
use audit_ledger::audit::{verify_proof, verify_proof_with_sink, ProofBundle, VerificationService};
use audit_ledger::database::Database;

#[derive(Parser)]
#[command(name = "ledger-verify", version, about = "Independently verify audit ledger proofs and chains")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify a proof bundle exported by the ledger
    Proof {
        /// Path to the bundle JSON file
        bundle: PathBuf,

        /// Confirm the anchor's external reference with this sink
        #[arg(long)]
        sink_url: Option<String>,

        #[arg(long, default_value_t = 5000)]
        sink_timeout_ms: u64,
    },
    /// Verify a chain segment from a copy of the ledger database
    Chain {
        #[arg(long)]
        database_url: String,

        #[arg(long)]
        org: String,

        #[arg(long, default_value_t = 1)]
        from: i64,

        /// Defaults to the chain head
        #[arg(long)]
        to: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .with_writer(std::io::stderr)
        .init();

    let valid = match cli.command {
        Command::Proof {
            bundle,
            sink_url,
            sink_timeout_ms,
        } => verify_bundle_file(&bundle, sink_url, sink_timeout_ms).await?,
        Command::Chain {
            database_url,
            org,
            from,
            to,
        } => verify_chain(&database_url, &org, from, to).await?,
    };

    if !valid {
        std::process::exit(1);
    }
    Ok(())
}

async fn verify_bundle_file(path: &PathBuf, sink_url: Option<String>, sink_timeout_ms: u64) -> Result<bool> {
    info!("Verifying proof bundle: {}", path.display());

    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let bundle = ProofBundle::from_json(&raw)?;

    let verification = match sink_url {
        Some(url) => {
            let sink = HttpAnchorSink::new(url, Duration::from_millis(sink_timeout_ms))?;
            verify_proof_with_sink(&bundle, &sink).await?
        }
        None => verify_proof(&bundle)?,
    };

    println!("{}", verification.summary());
    if let Some(external) = &verification.external {
        println!("External anchor: {}", serde_json::to_string(external)?);
    }
    Ok(verification.valid)
}

async fn verify_chain(database_url: &str, org: &str, from: i64, to: Option<i64>) -> Result<bool> {
    let database = Database::open_read_only(database_url)
        .await
        .with_context(|| format!("Failed to open {}", database_url))?;
    let service = VerificationService::new(Arc::new(database.clone()));

    let report = service
        .verify_chain(org, from, to.unwrap_or(i64::MAX))
        .await
        .map_err(|e| anyhow!("Chain verification failed: {}", e))?;
    println!("{}", report.summary());

    let continuity = service.verify_anchor_continuity(org).await?;
    if !continuity.valid {
        error!(
            "Anchor ranges of {} are not contiguous at sequence {:?}",
            org, continuity.broken_at_seq
        );
        println!(
            "❌ Anchor ranges broken at sequence {}",
            continuity.broken_at_seq.unwrap_or_default()
        );
    }

    database.close().await;
    Ok(report.valid && continuity.valid)
}

use anyhow::{anyhow, Context, Result};
use chrono::TimeDelta;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vote_ledger::audit::{ChainedLedger, IntegrityReport, IntegrityVerifier};
use vote_ledger::crypto::KeyManager;
use vote_ledger::database::Database;
use vote_ledger::LedgerConfig;

#[derive(Parser)]
#[command(name = "verify-ledger")]
#[command(about = "Verify vote ledger integrity")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only verify entries written in the last MINUTES minutes
    #[arg(long, value_name = "MINUTES", conflicts_with_all = ["from", "to"])]
    quick: Option<i64>,

    /// First sequence to verify
    #[arg(long, requires = "to")]
    from: Option<u64>,

    /// Last sequence to verify
    #[arg(long, requires = "from")]
    to: Option<u64>,

    /// Expected Merkle root over the verified range
    #[arg(short, long, value_name = "HASH")]
    merkle_root: Option<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = LedgerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let keys = KeyManager::load_verifier(&config.public_key_path)
        .context("Ledger public key is unusable")?;
    let database = Database::connect(&config).await?;
    let ledger = Arc::new(
        ChainedLedger::new(database.clone(), Arc::new(keys)).with_batch_size(config.verify_batch_size),
    );
    let verifier = IntegrityVerifier::new(ledger.clone());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping verification");
            on_signal.cancel();
        }
    });

    let report = match (cli.quick, cli.from, cli.to) {
        (Some(minutes), _, _) => match TimeDelta::try_minutes(minutes) {
            Some(window) => verifier.quick_verify(window).await?,
            None => {
                warn!("--quick {} is beyond any ledger history, verifying everything", minutes);
                verifier.full_verify(Some(&cancel)).await?
            }
        },
        (None, Some(from), Some(to)) => verifier.verify_range(from, to).await?,
        _ => verifier.full_verify(Some(&cancel)).await?,
    };

    let mut root_ok = true;
    if let Some(expected) = &cli.merkle_root {
        let (from, to) = match (cli.from, cli.to) {
            (Some(from), Some(to)) => (from, to),
            _ => {
                let tail = ledger
                    .tail()
                    .await?
                    .ok_or_else(|| anyhow!("Ledger is empty, nothing to compare the Merkle root with"))?;
                (1, tail.sequence)
            }
        };
        let checkpoint = verifier.checkpoint(from, to).await?;
        root_ok = &checkpoint.merkle_root == expected;
        if root_ok {
            info!("Merkle root matches for {}", checkpoint.summary());
        } else {
            error!(
                "Merkle root mismatch. Expected: {}, Got: {}",
                expected, checkpoint.merkle_root
            );
        }
    }

    print_report(&report, cli.json)?;
    database.close().await;

    if !report.valid || !root_ok {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &IntegrityReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{}", report.summary());
    println!("  Entries checked: {}", report.total);
    println!("  Verified:        {}", report.verified);
    if !report.chain_breaks.is_empty() {
        println!("  Chain breaks at: {:?}", report.chain_breaks);
    }
    if !report.signature_failures.is_empty() {
        println!("  Bad signatures:  {:?}", report.signature_failures);
    }
    if !report.hash_mismatches.is_empty() {
        println!("  Hash mismatches: {:?}", report.hash_mismatches);
    }
    Ok(())
}

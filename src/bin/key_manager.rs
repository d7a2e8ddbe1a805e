//! Key Management CLI Tool
//!
//! Creates, inspects and checks the ledger signing keypair.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use vote_ledger::crypto::KeyManager;
use vote_ledger::LedgerConfig;

#[derive(Parser)]
#[command(name = "key-manager")]
#[command(about = "Vote ledger signing key management tool")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Private key path (overrides configuration)
    #[arg(long)]
    private_key: Option<PathBuf>,

    /// Public key path (overrides configuration)
    #[arg(long)]
    public_key: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the keypair, generating and persisting one if none exists
    Init {
        /// Key size in bits (overrides configuration)
        #[arg(short, long)]
        bits: Option<usize>,
    },

    /// Print the public key and its fingerprint
    Show,

    /// Validate that the configured files form a matching pair
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = LedgerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    let private_path = cli.private_key.unwrap_or_else(|| config.private_key_path.clone());
    let public_path = cli.public_key.unwrap_or_else(|| config.public_key_path.clone());

    match cli.command {
        Commands::Init { bits } => {
            let bits = bits.unwrap_or(config.key_bits);
            let existed = private_path.exists() && public_path.exists();
            let manager = KeyManager::load_or_generate(&private_path, &public_path, bits)?;

            if existed {
                println!("Existing signing key is valid:");
            } else {
                println!("Signing key generated:");
            }
            print_key_details(&manager, &private_path, &public_path)?;
        }

        Commands::Show => {
            let manager = KeyManager::load(&private_path, &public_path)?;
            print_key_details(&manager, &private_path, &public_path)?;
            println!();
            print!("{}", manager.public_key_pem()?);
        }

        Commands::Check => match KeyManager::load(&private_path, &public_path) {
            Ok(manager) => {
                println!("Key pair OK ({} bits, {})", manager.key_bits(), manager.fingerprint()?);
            }
            Err(e) => {
                eprintln!("Key pair check failed: {}", e);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}

fn print_key_details(manager: &KeyManager, private_path: &Path, public_path: &Path) -> Result<()> {
    println!("  Private key: {}", private_path.display());
    println!("  Public key:  {}", public_path.display());
    println!("  Size:        {} bits", manager.key_bits());
    println!("  Fingerprint: {}", manager.fingerprint()?);
    Ok(())
}

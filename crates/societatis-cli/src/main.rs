use clap::{Parser, Subcommand};
use societatis_transfers::TransferFlags;
use societatis_types::{Hash, Network};
use std::path::PathBuf;

mod commands;

/// Inspect a saved transfer index.
#[derive(Parser)]
#[command(name = "societatis-transfers")]
#[command(about = "Offline inspection of a Societatis wallet transfer index")]
#[command(version)]
struct Cli {
    /// Network whose currency parameters apply.
    #[arg(long, default_value = "mainnet")]
    network: Network,

    /// Blocks after inclusion before an output counts as unlocked
    /// (defaults to the network value).
    #[arg(long)]
    spendable_age: Option<u32>,

    /// Blocks after inclusion before an output counts as safely unlocked
    /// (defaults to the network value).
    #[arg(long)]
    safe_spendable_age: Option<u32>,

    /// Evaluate lock state at this height instead of the saved one.
    #[arg(long)]
    height: Option<u32>,

    /// Snapshot file written by the wallet.
    snapshot: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Height, counts, per-state balances and the load repair report.
    Summary,

    /// Balance of the outputs selected by `--flags`.
    Balance {
        /// Comma-separated: key, multisig, unconfirmed, locked, unlocked,
        /// available, spent, all.
        #[arg(long, default_value = "key,unlocked")]
        flags: TransferFlags,

        /// Use the safe spendable age.
        #[arg(long)]
        safe: bool,
    },

    /// List the outputs selected by `--flags`.
    Outputs {
        #[arg(long, default_value = "all")]
        flags: TransferFlags,

        /// Use the safe spendable age.
        #[arg(long)]
        safe: bool,
    },

    /// List every known transaction with its account amounts.
    Transactions,

    /// Show one transaction, its outputs and the outputs it spent.
    Transaction {
        /// Transaction hash (hex).
        hash: Hash,
    },

    /// List spent outputs with their spending transactions.
    Spent,

    /// Verify the structural invariants of the loaded index.
    Check,
}

/// Settings shared across commands.
pub struct AppContext {
    pub network: Network,
    pub spendable_age: Option<u32>,
    pub safe_spendable_age: Option<u32>,
    pub height: Option<u32>,
    pub snapshot: PathBuf,
}

impl AppContext {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            network: cli.network,
            spendable_age: cli.spendable_age,
            safe_spendable_age: cli.safe_spendable_age,
            height: cli.height,
            snapshot: cli.snapshot.clone(),
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let ctx = AppContext::from_cli(&cli);

    let result = match cli.command {
        Commands::Summary => commands::summary(&ctx),
        Commands::Balance { flags, safe } => commands::balance(&ctx, flags, safe),
        Commands::Outputs { flags, safe } => commands::outputs(&ctx, flags, safe),
        Commands::Transactions => commands::transactions(&ctx),
        Commands::Transaction { hash } => commands::transaction(&ctx, &hash),
        Commands::Spent => commands::spent(&ctx),
        Commands::Check => commands::check(&ctx),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

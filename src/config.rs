use crate::application::pricing::{FixedPricing, PricingPolicy, RandomPricing};
use crate::domain::ports::LedgerStoreRef;
use crate::error::Result;
use crate::infrastructure::in_memory::InMemoryLedgerStore;
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Accounting ledger for the task economy", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the accounting service: bus consumer, outbox relay and HTTP API.
    Serve(ServeArgs),
    /// Replay a CSV event log and print the final balances as CSV.
    Replay(ReplayArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StorageArgs {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, env = "ATES_ACC_DB")]
    pub db_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Copy)]
pub struct PricingArgs {
    /// Fixed cost of assignment instead of a random one.
    #[arg(long, requires = "reward")]
    pub cost: Option<u64>,
    /// Fixed completion reward instead of a random one.
    #[arg(long, requires = "cost")]
    pub reward: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, env = "ATES_ACC_SERVER", default_value = "127.0.0.1:8082")]
    pub bind: SocketAddr,

    /// Base URL of the auth service.
    #[arg(long, env = "ATES_AUTH_SERVER", default_value = "http://127.0.0.1:8080")]
    pub auth_server: String,

    #[arg(long, env = "ATES_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Enables `POST /events/{topic}` for producers presenting this token.
    #[arg(long, env = "ATES_PRODUCER_TOKEN")]
    pub producer_token: Option<String>,

    #[arg(long, default_value_t = 1000)]
    pub outbox_interval_ms: u64,

    #[command(flatten)]
    pub storage: StorageArgs,

    #[command(flatten)]
    pub pricing: PricingArgs,
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Input events CSV file
    pub input: PathBuf,

    /// Close a billing cycle once every event has been applied.
    #[arg(long)]
    pub close_cycle: bool,

    #[arg(long, env = "ATES_WORKERS", default_value_t = 4)]
    pub workers: usize,

    #[command(flatten)]
    pub storage: StorageArgs,

    #[command(flatten)]
    pub pricing: PricingArgs,
}

impl PricingArgs {
    pub fn policy(&self) -> Arc<dyn PricingPolicy> {
        match (self.cost, self.reward) {
            (Some(cost), Some(reward)) => Arc::new(FixedPricing::new(cost, reward)),
            _ => Arc::new(RandomPricing::default()),
        }
    }
}

impl StorageArgs {
    /// Opens the configured store, falling back to memory when RocksDB
    /// support is not compiled in.
    pub fn open(&self) -> Result<LedgerStoreRef> {
        match &self.db_path {
            #[cfg(feature = "storage-rocksdb")]
            Some(path) => {
                tracing::info!(path = %path.display(), "Using RocksDB storage");
                Ok(Arc::new(crate::infrastructure::rocksdb::RocksDBStore::open(path)?))
            }
            #[cfg(not(feature = "storage-rocksdb"))]
            Some(_) => {
                tracing::warn!(
                    "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
                );
                Ok(Arc::new(InMemoryLedgerStore::new()))
            }
            None => Ok(Arc::new(InMemoryLedgerStore::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_replay_args() {
        let cli = Cli::try_parse_from([
            "ates-ledger",
            "replay",
            "events.csv",
            "--close-cycle",
            "--cost",
            "12",
            "--reward",
            "30",
        ])
        .unwrap();
        let Command::Replay(args) = cli.command else {
            panic!("expected replay");
        };
        assert!(args.close_cycle);
        assert_eq!(args.input, PathBuf::from("events.csv"));
        assert_eq!(args.pricing.policy().price("t-1").completion_reward, 30);
    }

    #[test]
    fn test_cost_without_reward_is_rejected() {
        assert!(Cli::try_parse_from(["ates-ledger", "replay", "e.csv", "--cost", "12"]).is_err());
    }

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["ates-ledger", "serve"]).unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.bind.port(), 8082);
        assert_eq!(args.workers, 4);
    }
}

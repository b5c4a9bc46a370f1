//! relayfee node binary

use clap::{Parser, Subcommand};
use relayfee_core::NodeConfig;
use relayfee_fee::FeeGenesis;
use relayfee_node::NodeBuilder;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relayfee-node")]
#[command(about = "relayfee node - relayer fee middleware devnet")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Genesis file path
        #[arg(short, long)]
        genesis: Option<PathBuf>,

        /// API listen address
        #[arg(long)]
        api_addr: Option<String>,

        /// Log filter, e.g. "info" or "relayfee_fee=debug"
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Write a default configuration file
    InitConfig {
        /// Output file path
        #[arg(short, long, default_value = "relayfee.json")]
        output: PathBuf,
    },

    /// Generate a devnet genesis file
    Genesis {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Chain ID
        #[arg(long, default_value = "relayfee-devnet")]
        chain_id: String,

        /// Initial balance as address:denom:amount, repeatable
        #[arg(long = "alloc")]
        allocations: Vec<String>,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            genesis,
            api_addr,
            log_level,
        } => {
            let mut node_config = match config {
                Some(path) => NodeConfig::load(&path)?,
                None => NodeConfig::default(),
            };
            if let Some(addr) = api_addr {
                node_config.api.listen_addr = addr;
            }
            if let Some(level) = log_level {
                node_config.log_level = level;
            }
            init_logging(&node_config.log_level);

            info!("Starting relayfee node...");

            let genesis_config = match genesis {
                Some(path) => {
                    let content = std::fs::read_to_string(&path)?;
                    FeeGenesis::from_json(&content)?
                }
                None => FeeGenesis::devnet().with_chain_id(&node_config.chain_id),
            };

            let node = NodeBuilder::new()
                .config(node_config)
                .genesis(genesis_config)
                .build()?;
            node.start().await?;
        }

        Commands::InitConfig { output } => {
            std::fs::write(&output, NodeConfig::default().to_json()?)?;
            println!("Configuration saved to: {}", output.display());
        }

        Commands::Genesis {
            output,
            chain_id,
            allocations,
        } => {
            let mut genesis = FeeGenesis::devnet().with_chain_id(&chain_id);
            for alloc in &allocations {
                let parts: Vec<&str> = alloc.split(':').collect();
                let [address, denom, amount] = parts.as_slice() else {
                    anyhow::bail!("allocation {alloc:?} is not address:denom:amount");
                };
                genesis = genesis.add_allocation(address, denom, amount.parse()?);
            }
            genesis.parse_allocations()?;

            std::fs::write(&output, genesis.to_json()?)?;
            println!("Genesis configuration saved to: {}", output.display());
        }
    }

    Ok(())
}

use clap::{Parser, Subcommand};
use std::error::Error;
use std::time::Duration;

use ferrochain::config::{Config, DEFAULT_PORT};
use ferrochain::core::chain::{Blockchain, MineOutcome};
use ferrochain::core::types::Transaction;
use ferrochain::core::utxo::UtxoIndex;
use ferrochain::crypto;
use ferrochain::miner;
use ferrochain::network::{self, Node};
use ferrochain::wallet::Wallets;

#[derive(Parser)]
#[command(name = "ferrochain", version)]
#[command(about = "Ferrochain - a compact proof-of-work UTXO ledger node")]
struct Cli {
    /// TCP port for peer-to-peer traffic
    #[arg(long, default_value_t = DEFAULT_PORT, global = true)]
    port: u16,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new keypair, persist it, and print its address
    Createwallet,
    /// Print all known wallet addresses
    Listaddresses,
    /// Initialize the chain store with a genesis block rewarding an address
    Createblockchain {
        #[arg(long)]
        address: String,
    },
    /// Show the balance of an address
    Getbalance {
        #[arg(long)]
        address: String,
    },
    /// Build, sign, and submit a transfer
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
        /// Mine the transaction into a block on this node immediately
        #[arg(long)]
        mine: bool,
    },
    /// Print every block from tip back to genesis
    Printchain,
    /// Rebuild the UTXO index from the chain
    Reindexutxo,
    /// Start the P2P server (and optionally the miner)
    Startnode {
        /// Enable mining and pay block rewards to this address
        #[arg(long)]
        miner: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ferrochain=info".parse().expect("valid directive")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.port);

    let result = match cli.command {
        Commands::Createwallet => cmd_createwallet(&config),
        Commands::Listaddresses => cmd_listaddresses(&config),
        Commands::Createblockchain { address } => cmd_createblockchain(&config, &address),
        Commands::Getbalance { address } => cmd_getbalance(&config, &address),
        Commands::Send { from, to, amount, mine } => cmd_send(&config, &from, &to, amount, mine),
        Commands::Printchain => cmd_printchain(&config),
        Commands::Reindexutxo => cmd_reindexutxo(&config),
        Commands::Startnode { miner } => cmd_startnode(config, miner),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn cmd_createwallet(config: &Config) -> Result<(), Box<dyn Error>> {
    let mut wallets = Wallets::load_or_create(&config.wallet_path())?;
    let address = wallets.create_address()?;
    println!("new address: {}", address);
    Ok(())
}

fn cmd_listaddresses(config: &Config) -> Result<(), Box<dyn Error>> {
    let wallets = Wallets::load_or_create(&config.wallet_path())?;
    for address in wallets.addresses() {
        println!("{}", address);
    }
    Ok(())
}

fn cmd_createblockchain(config: &Config, address: &str) -> Result<(), Box<dyn Error>> {
    let chain = Blockchain::create(config.chain_path(), address)?;
    let utxo = UtxoIndex::new(chain.store_handle());
    utxo.reindex(&chain)?;
    let tip = chain.tip()?;
    println!("chain ready at height {}", tip.height);
    println!("tip: {}", hex::encode(tip.hash));
    Ok(())
}

fn cmd_getbalance(config: &Config, address: &str) -> Result<(), Box<dyn Error>> {
    let pubkey_hash = crypto::address_to_pubkey_hash(address).ok_or("address is not valid")?;
    let chain = Blockchain::open(config.chain_path())?;
    let utxo = UtxoIndex::new(chain.store_handle());
    let balance = utxo.balance(&pubkey_hash)?;
    println!("balance of {}: {}", address, balance);
    Ok(())
}

fn cmd_send(
    config: &Config,
    from: &str,
    to: &str,
    amount: u64,
    mine: bool,
) -> Result<(), Box<dyn Error>> {
    let chain = Blockchain::open(config.chain_path())?;
    let utxo = UtxoIndex::new(chain.store_handle());
    let wallets = Wallets::load_or_create(&config.wallet_path())?;

    let tx = chain.new_transaction(from, to, amount, &utxo, &wallets)?;

    if mine {
        let coinbase = Transaction::new_coinbase(from, None, chain.best_height()? + 1)?;
        let (_cancel_tx, mut cancel_rx) = tokio::sync::mpsc::channel(1);
        match chain.mine_block(vec![coinbase, tx], &mut cancel_rx)? {
            MineOutcome::Mined(block) => {
                utxo.update(&block)?;
                println!("mined block #{} {}", block.height, hex::encode(block.hash));
            }
            MineOutcome::Cancelled => return Err("mining interrupted".into()),
        }
    } else {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(network::push_tx(&config.seed, &config.node_addr, &tx))?;
        println!("transaction {} sent to {}", hex::encode(tx.id), config.seed);
    }
    Ok(())
}

fn cmd_printchain(config: &Config) -> Result<(), Box<dyn Error>> {
    let chain = Blockchain::open(config.chain_path())?;
    for block in chain.iter()? {
        let block = block?;
        println!("{}", block);
        println!("  prev: {}", hex::encode(block.prev_hash));
        for tx in &block.transactions {
            print!("{}", tx);
        }
        println!();
    }
    Ok(())
}

fn cmd_reindexutxo(config: &Config) -> Result<(), Box<dyn Error>> {
    let chain = Blockchain::open(config.chain_path())?;
    let utxo = UtxoIndex::new(chain.store_handle());
    utxo.reindex(&chain)?;
    println!("utxo index rebuilt: {} transactions", utxo.count()?);
    Ok(())
}

fn cmd_startnode(config: Config, miner_address: Option<String>) -> Result<(), Box<dyn Error>> {
    if let Some(address) = &miner_address {
        if !crypto::validate_address(address) {
            return Err("address is not valid".into());
        }
    }
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_node(config, miner_address))
}

async fn run_node(config: Config, miner_address: Option<String>) -> Result<(), Box<dyn Error>> {
    let chain = Blockchain::attach(config.chain_path())?;
    let utxo = UtxoIndex::new(chain.store_handle());
    let height = chain.best_height()?;

    let (node, cancel_rx) = Node::new(
        chain,
        utxo,
        config.node_addr.clone(),
        config.seed.clone(),
        miner_address.clone(),
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;

    println!("ferrochain node {}", config.node_id);
    println!("  p2p:     0.0.0.0:{} (announced as {})", config.port, config.node_addr);
    println!("  data:    {}", config.data_dir.display());
    println!("  seed:    {}", config.seed);
    println!("  height:  {}", height);
    println!(
        "  mining:  {}",
        miner_address.as_deref().unwrap_or("disabled")
    );

    ctrlc::set_handler(|| {
        println!("\nshutting down");
        std::process::exit(0);
    })?;

    if let Some(reward_address) = miner_address {
        tokio::spawn(miner::run(node.clone(), reward_address, cancel_rx));
    }
    tokio::spawn(network::liveness_sweep(node.clone(), Duration::from_secs(45)));

    network::start(node, listener).await;
    Ok(())
}

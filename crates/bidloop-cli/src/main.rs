//! Bidloop CLI
//!
//! Runs a node, or talks to a running one over JSON-RPC.

use bidloop_node::{BidloopNode, LogFormat, LoggingConfig, NodeConfig};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "bidloop")]
#[command(version)]
#[command(about = "Bid cycles, purchase settlement and payout distribution", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON-RPC endpoint of a running node
    #[arg(long, global = true, env = "BIDLOOP_RPC", default_value = "http://127.0.0.1:8645")]
    rpc: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Node {
        /// Configuration file path
        #[arg(short, long, default_value = "bidloop.toml")]
        config: PathBuf,

        /// Data directory, overrides `node.data_dir`
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Write a configuration file with every default filled in
    Init {
        #[arg(short, long, default_value = "bidloop.toml")]
        output: PathBuf,

        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the current cycle
    Status,

    /// Buy units of the open cycle
    Purchase {
        #[arg(short, long)]
        user: String,

        /// Number of units
        #[arg(short, long)]
        quantity: i64,

        /// Expected total cost
        #[arg(short, long)]
        amount: Option<Decimal>,
    },

    /// Credit a confirmed deposit
    Deposit {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        amount: Decimal,

        /// External reference, e.g. the transaction hash
        #[arg(short, long)]
        reference: String,
    },

    /// Create an account
    Register {
        #[arg(short, long)]
        user: String,

        /// Sponsor's user id
        #[arg(short, long)]
        referrer: Option<String>,

        /// External address for payouts
        #[arg(short, long)]
        payout_address: Option<String>,
    },

    /// Show a user's balance and hold status
    Balance {
        #[arg(short, long)]
        user: String,
    },

    /// Reopen the most recent cycle closed before it filled
    Reopen,

    /// Print the consistency report
    Diagnose,

    /// Version information
    Version,
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match logging.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init(),
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false),
            )
            .init(),
    }
}

/// Call a JSON-RPC method, returning `result` or failing with the node's reason
async fn rpc_call(url: &str, method: &str, params: Value) -> anyhow::Result<Value> {
    let request = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1
    });

    let response: Value = reqwest::Client::new()
        .post(url)
        .json(&request)
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("cannot reach node at {}: {}", url, e))?
        .error_for_status()?
        .json()
        .await?;

    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
        anyhow::bail!("{} (code {})", message, code);
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Node { config, data_dir } => {
            let node_config = NodeConfig::load(Some(config.as_path()))?;
            init_logging(cli.verbose, &node_config.logging);

            let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(&node_config.node.data_dir));
            tracing::info!("Config: {:?}", config);
            tracing::info!("Data: {:?}", data_dir);

            let node = BidloopNode::new(node_config, data_dir)?;
            node.run().await?;
        }

        Commands::Init { output, force } => {
            init_logging(cli.verbose, &LoggingConfig::default());
            if output.exists() && !force {
                anyhow::bail!("{:?} already exists (use --force to overwrite)", output);
            }
            std::fs::write(&output, NodeConfig::default().to_toml()?)?;
            println!("Configuration written to {:?}", output);
        }

        Commands::Status => {
            init_logging(cli.verbose, &LoggingConfig::default());
            let result = rpc_call(&cli.rpc, "cycle_status", Value::Null).await?;
            let cycle = &result["cycle"];
            println!("Cycle #{} ({})", cycle["index"], cycle["date"].as_str().unwrap_or("-"));
            println!("  Status:    {}", cycle["status"].as_str().unwrap_or("-"));
            println!(
                "  Units:     {} / {} ({} remaining)",
                cycle["filled_units"], cycle["total_units"], cycle["remaining_units"]
            );
            println!("  Opens at:  {}", cycle["open_time"].as_str().unwrap_or("-"));
            if let Some(closed) = cycle["close_time"].as_str() {
                println!("  Closed at: {}", closed);
            }
        }

        Commands::Purchase { user, quantity, amount } => {
            init_logging(cli.verbose, &LoggingConfig::default());
            let result = rpc_call(
                &cli.rpc,
                "cycle_purchase",
                json!({"user_id": user, "quantity": quantity, "amount": amount}),
            )
            .await?;
            println!("{}", result["message"].as_str().unwrap_or("Purchase submitted"));
            println!("  Orders:  {}", result["orders"]);
            println!("  Cost:    {}", result["total_cost"].as_str().unwrap_or("-"));
            println!("  Balance: {}", result["balance"].as_str().unwrap_or("-"));
            if !result["next_cycle"].is_null() {
                println!(
                    "  Cycle filled; cycle #{} is now {}",
                    result["next_cycle"]["index"],
                    result["next_cycle"]["status"].as_str().unwrap_or("-")
                );
            }
        }

        Commands::Deposit { user, amount, reference } => {
            init_logging(cli.verbose, &LoggingConfig::default());
            let result = rpc_call(
                &cli.rpc,
                "ledger_deposit",
                json!({"user_id": user, "amount": amount, "reference": reference}),
            )
            .await?;
            print_json(&result)?;
        }

        Commands::Register { user, referrer, payout_address } => {
            init_logging(cli.verbose, &LoggingConfig::default());
            let result = rpc_call(
                &cli.rpc,
                "user_register",
                json!({"user_id": user, "referrer": referrer, "payout_address": payout_address}),
            )
            .await?;
            print_json(&result)?;
        }

        Commands::Balance { user } => {
            init_logging(cli.verbose, &LoggingConfig::default());
            let result = rpc_call(&cli.rpc, "ledger_balance", json!({"user_id": user})).await?;
            print_json(&result)?;
        }

        Commands::Reopen => {
            init_logging(cli.verbose, &LoggingConfig::default());
            let result = rpc_call(&cli.rpc, "cycle_reopenClosed", Value::Null).await?;
            println!("{}", result["message"].as_str().unwrap_or("Cycle reopened"));
        }

        Commands::Diagnose => {
            init_logging(cli.verbose, &LoggingConfig::default());
            let report = rpc_call(&cli.rpc, "cycle_diagnose", Value::Null).await?;
            print_json(&report)?;
        }

        Commands::Version => {
            println!("bidloop v{}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Components:");
            println!("  - Cycle manager (daily open, close on fill, recovery)");
            println!("  - Purchase settlement with atomic capacity checks");
            println!("  - Distribution pipeline: fees, returns, referral, team rewards");
            println!("  - Settlement outbox with bounded retries");
        }
    }

    Ok(())
}

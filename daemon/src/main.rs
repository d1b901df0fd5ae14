//! bitnode daemon: entry point for running a full node.

mod executor;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use bitnode_node::logging::{init_logging, LogFormat};
use bitnode_node::Configuration;
use bitnode_types::NetworkId;

use crate::executor::Executor;

#[derive(Parser)]
#[command(name = "bn", about = "Bitcoin full node", version)]
struct Cli {
    /// Display all configuration settings and exit.
    #[arg(long)]
    settings: bool,

    /// Initialize the chain database in the configured directory.
    #[arg(long)]
    initchain: bool,

    /// Use testnet rules and database.
    #[arg(long, env = "BN_TESTNET")]
    testnet: bool,

    /// Use regtest rules for local testing.
    #[arg(long, env = "BN_REGTEST")]
    regtest: bool,

    /// Path to a TOML configuration file. File settings are the base; the
    /// BN_ environment and CLI flags override them.
    #[arg(long, env = "BN_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match Configuration::from_toml_file(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("failed to load config file {}: {err}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => Configuration::default(),
    };
    config.apply_env_overrides();
    if cli.testnet {
        config.bitcoin.network = NetworkId::Testnet;
    }
    if cli.regtest {
        config.bitcoin.network = NetworkId::Regtest;
    }

    if cli.settings {
        // Emit directly to standard output, not the log.
        Executor::new(config).do_settings();
        return ExitCode::SUCCESS;
    }

    init_logging(LogFormat::parse(&config.log_format), &config.log_level);
    if let Some(path) = &cli.config {
        tracing::info!(file = %path.display(), "Using config file.");
    } else {
        tracing::info!("Using default configuration settings.");
    }

    let executor = Executor::new(config);

    let ok = if cli.initchain {
        executor.do_initchain()
    } else {
        executor.run().await
    };

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

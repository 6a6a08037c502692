mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, payouts::PayoutsSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "taxflow",
    about = "Harvest withheld transfer tax and distribute it pro-rata to holders",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (the state store path inside it is resolved relative to this file)
    #[arg(
        long,
        global = true,
        env = "TAXFLOW_CONFIG",
        default_value = taxflow_core::config::CONFIG_FILE
    )]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Run the scheduler until interrupted
    Run {
        /// Serve the status API on this port (overrides server.port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run the current slot's cycle once and exit
    Tick,

    /// Show scheduler position, last result and queue totals
    Status,

    /// List recorded cycles, newest first
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Inspect queued, dropped and unreconciled payouts
    Payouts {
        #[command(subcommand)]
        subcommand: PayoutsSubcommand,
    },

    /// Show or validate the config
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } | Commands::Tick => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_path();
    let result = match cli.command {
        Commands::Init { force } => cmd::init::run(config, force),
        Commands::Run { port } => cmd::run::run(config, port),
        Commands::Tick => cmd::tick::run(config, cli.json),
        Commands::Status => cmd::status::run(config, cli.json),
        Commands::History { limit } => cmd::history::run(config, limit, cli.json),
        Commands::Payouts { subcommand } => cmd::payouts::run(config, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(config, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

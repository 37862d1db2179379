//! MapStore CLI - Command-line interface
//!
//! A thin shell over the `mapstore` library: scan the package directory,
//! inspect statuses, and download, update or delete packages.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use mapstore::logging::{init_logging, LoggingConfig};

use crate::error::CliError;

#[derive(Parser, Debug)]
#[command(name = "mapstore", version, about = "Offline map package manager")]
struct Cli {
    /// INI file with a [storage] section
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Package directory, overriding the config file
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Catalog manifest (defaults to <root>/countries.txt)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Download server, may be repeated; replaces configured servers
    #[arg(long = "server", global = true)]
    servers: Vec<String>,

    /// Write daily log files to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan the package directory and register what is found
    Scan,

    /// Show the status of a node and its children
    Status {
        /// Node id (defaults to the catalog root)
        id: Option<String>,
    },

    /// Show sizes and update cost of a node
    Info {
        id: String,
    },

    /// Download a package or group and wait for completion
    Download {
        id: String,
    },

    /// Update out-of-date packages, using diffs where available
    Update {
        /// Node id (defaults to the catalog root)
        id: Option<String>,

        /// Skip the diff query and download full packages
        #[arg(long)]
        no_diffs: bool,
    },

    /// Delete the local files of a package or group
    Delete {
        id: String,
    },

    /// Query the diff server and list available diffs
    Diffs,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging = LoggingConfig::default().with_filter(if cli.verbose {
        "mapstore=debug"
    } else {
        "mapstore=warn"
    });
    let logging = match &cli.log_dir {
        Some(dir) => logging.with_log_dir(dir),
        None => logging,
    };
    let _guard = match init_logging(logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialise logging: {}", e);
            None
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", console::style("error:").red().bold(), e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let options = commands::GlobalOptions {
        config: cli.config,
        root: cli.root,
        catalog: cli.catalog,
        servers: cli.servers,
    };

    match cli.command {
        Commands::Scan => commands::scan(&options),
        Commands::Status { id } => commands::status(&options, id.as_deref()),
        Commands::Info { id } => commands::info(&options, &id),
        Commands::Download { id } => commands::download(&options, &id),
        Commands::Update { id, no_diffs } => commands::update(&options, id.as_deref(), !no_diffs),
        Commands::Delete { id } => commands::delete(&options, &id),
        Commands::Diffs => commands::diffs(&options),
    }
}

//! regattad — the Regatta control-plane daemon.
//!
//! Accepts job submissions over a REST API, admits task gangs through a
//! hierarchical fair-share pool tree, matches them against cluster
//! offers, launches them through the cluster manager and converges them
//! toward their goal state.
//!
//! # Usage
//!
//! ```text
//! regattad serve --config /etc/regatta/config.yaml --api-port 5290
//! ```
//!
//! # Exit codes
//!
//! | Code | Meaning |
//! |---|---|
//! | 0 | clean shutdown |
//! | 1 | fatal configuration error |
//! | 2 | store open/migration failure |
//! | 3 | election setup failure |
//! | 4 | permanent cluster-manager subscription failure |

mod daemon;
mod events;
mod loopback;
mod reconciler;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use regatta_core::config::Config;
use regatta_state::EmbeddedStore;

const EXIT_CONFIG: u8 = 1;
const EXIT_STORE: u8 = 2;
#[allow(dead_code)]
const EXIT_ELECTION: u8 = 3;
#[allow(dead_code)]
const EXIT_SUBSCRIPTION: u8 = 4;

#[derive(Parser)]
#[command(name = "regattad", about = "Regatta scheduler control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Serve {
        /// Path to the merged YAML configuration.
        #[arg(long)]
        config: Option<PathBuf>,

        /// REST API port (overrides the config).
        #[arg(long)]
        api_port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,regattad=debug,regatta=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, api_port } => serve(config, api_port).await,
    }
}

async fn serve(config_path: Option<PathBuf>, api_port: Option<u16>) -> ExitCode {
    let config = match config_path {
        Some(path) => match Config::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = ?path, error = %e, "failed to load configuration");
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        None => Config::default(),
    };
    let port = api_port.unwrap_or(config.res_manager.port);

    let store = if config.storage.backend == "memory" {
        EmbeddedStore::open_in_memory()
    } else {
        let path = PathBuf::from(&config.storage.path);
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!(error = %e, "failed to create data directory");
                return ExitCode::from(EXIT_STORE);
            }
        }
        EmbeddedStore::open(&path)
    };
    let store = match store {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to open store");
            return ExitCode::from(EXIT_STORE);
        }
    };
    info!(backend = %config.storage.backend, "store opened");

    let daemon = match daemon::Daemon::build(config, store).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "failed to wire subsystems");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match daemon.run(port).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "daemon exited with error");
            ExitCode::from(EXIT_SUBSCRIPTION)
        }
    }
}

//! qsfsd, the supervisor CLI for a quantum storage filesystem node.
//!
//! The long-running `daemon` subcommand supervises zdb and the zstor
//! uploader; the rest are operator tools built on the same layers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use qsfs_config::logging::{init_logging, LogLevel};
use qsfs_config::Config;
use qsfs_zstor::Client;

mod check;
mod hook_client;
mod status;

#[derive(Parser)]
#[command(name = "qsfsd", version, about = "Quantum storage filesystem node supervisor")]
struct Cli {
    /// Path to the daemon YAML config file
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/qsfsd/config.yaml",
        value_name = "FILE"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor daemon
    Daemon,
    /// Compare local files against the remote store
    Check,
    /// Show backend liveness as reported by the uploader
    Status,
    /// Forward a zdb hook line to a running daemon
    Hook {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Rebuild the local zdb tree from the remote store
    Restore {
        /// Namespace to recover; repeatable, defaults to the zdbfs pair
        #[arg(long = "namespace", value_name = "NS")]
        namespaces: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(LogLevel::Info);
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon => {
            let config = load_config(&cli.config)?;
            qsfs_daemon::run_daemon(config).await
        }
        Commands::Check => {
            let config = load_config(&cli.config)?;
            let client = uploader_client(&config)?;
            check::run(&config, &client).await
        }
        Commands::Status => {
            let config = load_config(&cli.config)?;
            status::run(&config).await
        }
        Commands::Hook { args } => {
            hook_client::run(Path::new(qsfs_daemon::HOOK_SOCKET_PATH), &args).await
        }
        Commands::Restore { namespaces } => {
            let config = load_config(&cli.config)?;
            let client = uploader_client(&config)?;
            let namespaces = if namespaces.is_empty() {
                qsfs_daemon::DEFAULT_NAMESPACES
                    .iter()
                    .map(|ns| ns.to_string())
                    .collect()
            } else {
                namespaces
            };
            qsfs_daemon::restore_namespaces(&client, &config.zdb_root_path, &namespaces).await
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path)
        .with_context(|| format!("could not load daemon config from {}", path.display()))
}

fn uploader_client(config: &Config) -> Result<Client> {
    Client::new(
        config.zstor_binary_path.clone(),
        config.zstor_config_path.clone(),
        config.zstor_decoder_path.clone(),
    )
    .context("uploader client setup failed")
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

use listen_controller::cert::{CertificateInspector, X509Inspector};
use listen_controller::store::{ConfigStore, FileStore, ListenConfig, StoreError};

#[derive(Parser)]
#[command(name = "listenctl")]
#[command(about = "Operator CLI for listen configurations", long_about = None)]
struct Cli {
    /// Listen configuration directory.
    #[arg(short, long, default_value = "listen-configs")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what a running controller is serving
    Status {
        #[arg(short, long, default_value = "http://localhost:80")]
        url: String,
    },
    /// List stored configurations, earliest first
    List,
    /// Enable a configuration
    Enable { id: String },
    /// Disable a configuration
    Disable { id: String },
    /// Print certificate metadata for PEM files
    Inspect { cert: PathBuf, key: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Status { url } => {
            let res = reqwest::get(format!("{}/status", url)).await?;
            let status = res.status();
            if !status.is_success() {
                eprintln!("Error: controller returned status {}", status);
                std::process::exit(1);
            }
            let body: Value = res.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::List => {
            let store = FileStore::open(&cli.store)?;
            for config in store.list().await? {
                print_summary(&config);
            }
        }
        Commands::Enable { id } => set_enabled(&cli.store, &id, true).await?,
        Commands::Disable { id } => set_enabled(&cli.store, &id, false).await?,
        Commands::Inspect { cert, key } => {
            let cert = std::fs::read_to_string(cert)?;
            let key = std::fs::read_to_string(key)?;
            let info = X509Inspector.inspect(&cert, &key)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}

async fn set_enabled(root: &std::path::Path, id: &str, enabled: bool) -> Result<(), StoreError> {
    let store = FileStore::open(root)?;
    let mut config = store
        .get(id)
        .await?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    config.enabled = enabled;
    let config = store.update(config).await?;
    print_summary(&config);
    Ok(())
}

fn print_summary(config: &ListenConfig) {
    let state = if config.is_deleted() {
        "deleted"
    } else if config.enabled {
        "enabled"
    } else {
        "disabled"
    };
    println!(
        "{:<38} {:<6} {:<9} {}",
        config.id,
        config.mode.as_str(),
        state,
        config.created_at.to_rfc3339()
    );
}

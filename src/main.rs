use anyhow::Result;
use chasqui::config::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "chasqui",
    about = "Conversation dispatcher for WhatsApp sales agents",
    version
)]
struct Cli {
    /// Path to config.toml (defaults to ~/.chasqui/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: gateway, dispatch worker, reminder worker, scanner
    Run {
        /// Override the gateway bind host
        #[arg(long)]
        host: Option<String>,
        /// Override the gateway bind port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Write a default config file and create the workspace
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { host, port } => {
            let mut config = Config::load(cli.config)?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            chasqui::daemon::run(config).await
        }
        Commands::Init => {
            let config = Config::load(cli.config)?;
            config.save()?;
            println!("Config written to {}", config.config_path.display());
            println!("Workspace at {}", config.workspace_dir.display());
            Ok(())
        }
    }
}

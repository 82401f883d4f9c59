use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::prelude::*;

use huddle::ClientConfig;

mod cli;

#[derive(Parser)]
#[command(name = "huddle")]
#[command(about = "Terminal chat client for STOMP chat brokers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config directory (defaults to the platform config dir + /huddle)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the chat interactively
    Chat(ChatArgs),

    /// Print the resolved configuration as TOML
    Config,
}

#[derive(Args)]
pub struct ChatArgs {
    /// Username to announce
    #[arg(short, long)]
    pub user: String,

    /// Bearer token
    #[arg(long, env = "HUDDLE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Channel to open after connecting ("public" or a group id)
    #[arg(short, long, default_value = huddle::PUBLIC_CHANNEL)]
    pub channel: String,

    /// Talk to an in-process broker instead of the configured server
    #[arg(long)]
    pub offline: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let dir = cli.config_dir.unwrap_or_else(huddle::config::config_dir);

    match cli.command {
        Commands::Config => cli::config_command(&dir),
        Commands::Chat(args) => {
            init_logging(args.debug);
            let config = ClientConfig::load(&dir)
                .with_context(|| format!("loading configuration from {}", dir.display()))?;
            cli::chat_command(config, args).await
        }
    }
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "huddle=debug,info"
    } else {
        "huddle=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

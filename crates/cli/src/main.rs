//! Collector agent CLI
//!
//! Queries a running agent for its supervised inputs, the panics recovered
//! per collector kind and component health.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{health, inputs};

/// Collector agent CLI
#[derive(Parser)]
#[command(name = "agentctl")]
#[command(author, version, about = "CLI for the Collector Agent", long_about = None)]
pub struct Cli {
    /// Agent API URL (can also be set via AGENTCTL_URL env var)
    #[arg(long, env = "AGENTCTL_URL", default_value = "http://localhost:9529")]
    pub agent_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect supervised collector inputs
    #[command(subcommand)]
    Inputs(InputsCommands),

    /// Show component health of the agent
    Health,
}

#[derive(Subcommand)]
pub enum InputsCommands {
    /// List running input instances
    List {
        /// Only show instances of this collector kind
        #[arg(long, short)]
        kind: Option<String>,
    },

    /// Show panics recovered per collector kind
    Crashes,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let client = client::ApiClient::new(&cli.agent_url)?;

    match cli.command {
        Commands::Inputs(inputs_cmd) => match inputs_cmd {
            InputsCommands::List { kind } => {
                inputs::list_inputs(&client, kind, cli.format).await?;
            }
            InputsCommands::Crashes => {
                inputs::show_crashes(&client, cli.format).await?;
            }
        },
        Commands::Health => {
            health::show_health(&client, cli.format).await?;
        }
    }

    Ok(())
}

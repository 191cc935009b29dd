//! Agent health command

use anyhow::Result;
use colored::Colorize;
use reqwest::StatusCode;
use tabled::Tabled;

use crate::client::{ApiClient, HealthResponse};
use crate::output::{color_status, format_timestamp, print_json, print_table, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Last Check")]
    last_check: String,
}

/// Show aggregate and per-component health.
///
/// Fails when the agent reports itself unhealthy so scripts can react.
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let (status, health): (StatusCode, HealthResponse) = client.get_with_status("healthz").await?;

    match format {
        OutputFormat::Json => print_json(&health)?,
        OutputFormat::Table => {
            println!("{} {}", "Agent:".bold(), color_status(&health.status));
            println!();

            print_table(
                health
                    .components
                    .iter()
                    .map(|(name, component)| ComponentRow {
                        name: name.clone(),
                        status: color_status(&component.status),
                        message: component.message.clone().unwrap_or_else(|| "-".to_string()),
                        last_check: format_timestamp(component.last_check_timestamp),
                    })
                    .collect(),
            );
        }
    }

    if status == StatusCode::SERVICE_UNAVAILABLE {
        anyhow::bail!("agent is unhealthy");
    }
    Ok(())
}

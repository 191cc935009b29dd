//! Commands for supervised collector inputs

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, InputSummary, KindCrashes};
use crate::output::{
    color_crashes, color_status, print_json, print_success, print_table, print_warning,
    OutputFormat,
};

/// Row for the inputs table
#[derive(Tabled)]
struct InputRow {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Index")]
    index: usize,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Crashes")]
    crashes: String,
    #[tabled(rename = "Capabilities")]
    capabilities: String,
}

impl From<&InputSummary> for InputRow {
    fn from(input: &InputSummary) -> Self {
        let capabilities = if input.capabilities.is_empty() {
            "-".to_string()
        } else {
            input.capabilities.join(",")
        };
        Self {
            kind: input.kind.clone(),
            index: input.index,
            source: input.source.clone(),
            state: color_status(&input.state),
            crashes: color_crashes(input.crash_count as u64),
            capabilities,
        }
    }
}

/// Row for the crash table
#[derive(Tabled)]
struct CrashRow {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Panics")]
    panics: String,
}

/// List running inputs, optionally restricted to one kind
pub async fn list_inputs(
    client: &ApiClient,
    kind: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let mut inputs: Vec<InputSummary> = client.get("v1/inputs").await?;
    if let Some(kind) = &kind {
        inputs.retain(|input| &input.kind == kind);
    }

    match format {
        OutputFormat::Json => print_json(&inputs)?,
        OutputFormat::Table => {
            if inputs.is_empty() {
                print_warning("No inputs running");
                return Ok(());
            }

            print_table(inputs.iter().map(InputRow::from).collect());
            let exited = inputs.iter().filter(|i| i.state == "exited").count();
            println!("\nTotal: {} inputs ({} exited)", inputs.len(), exited);
        }
    }

    Ok(())
}

/// Show panics recovered per collector kind
pub async fn show_crashes(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let crashes: Vec<KindCrashes> = client.get("v1/inputs/crashes").await?;

    match format {
        OutputFormat::Json => print_json(&crashes)?,
        OutputFormat::Table => {
            if crashes.is_empty() {
                print_success("No input has panicked");
                return Ok(());
            }

            print_table(
                crashes
                    .iter()
                    .map(|c| CrashRow {
                        kind: c.kind.clone(),
                        panics: color_crashes(c.panics),
                    })
                    .collect(),
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_row_joins_capabilities() {
        colored::control::set_override(false);
        let input = InputSummary {
            kind: "nginx".to_string(),
            index: 2,
            source: "confd".to_string(),
            catalog: "web".to_string(),
            capabilities: vec!["terminable".to_string(), "http".to_string()],
            state: "running".to_string(),
            crash_count: 0,
        };

        let row = InputRow::from(&input);
        assert_eq!(row.index, 2);
        assert_eq!(row.capabilities, "terminable,http");
        assert_eq!(row.state, "running");

        let bare = InputSummary {
            capabilities: Vec::new(),
            ..input
        };
        assert_eq!(InputRow::from(&bare).capabilities, "-");
    }
}

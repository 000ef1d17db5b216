pub mod discover;
pub mod init;
pub mod invoke;
pub mod overrides;
pub mod process;
pub mod runner;
pub mod serve;
pub mod status;

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::error::{PosmapError, Result};
use crate::settings::{load_settings, shellexpand_path, Settings};

#[derive(Parser)]
#[command(
    name = "posmap",
    version,
    about = "Reconcile brokerage position exports into a portfolio workbook."
)]
pub struct Cli {
    /// Override the data directory for this invocation
    #[arg(long = "data-dir", global = true)]
    pub data_dir: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write settings and create the store and mapping database.
    Init,
    /// Run the processing pipeline and print the JSON outcome.
    Process {
        /// Positions CSV key (default: latest source/positions-*.csv)
        #[arg(long)]
        source: Option<String>,
        /// Template workbook key
        #[arg(long)]
        template: Option<String>,
        /// Output workbook key (default: timestamped under output/)
        #[arg(long)]
        output: Option<String>,
        /// Bucket to read from and write to
        #[arg(long)]
        bucket: Option<String>,
        /// Print a table of written cells instead of JSON
        #[arg(long)]
        table: bool,
    },
    /// Discover account mappings with the embedding and language-model services.
    InferMapping {
        /// Positions CSV key
        #[arg(long)]
        csv: String,
        /// Template workbook key
        #[arg(long)]
        template: String,
        /// Dataset the overrides belong to
        #[arg(long)]
        dataset: Option<String>,
        /// Skip labels that already resolve
        #[arg(long)]
        only_unmapped: bool,
    },
    /// Run an event payload: JSON text, or @path to read it from a file.
    Invoke {
        payload: String,
    },
    /// Manage persisted account overrides.
    Overrides {
        #[command(subcommand)]
        command: OverridesCommands,
    },
    /// Answer bridge messages on stdin, one JSON object per line.
    Serve,
    /// Show configuration, latest input and override counts.
    Status,
}

#[derive(Subcommand)]
pub enum OverridesCommands {
    /// List overrides for a dataset.
    List {
        #[arg(long)]
        dataset: Option<String>,
    },
    /// Map a source account label to a template header.
    Set {
        source: String,
        target: String,
        #[arg(long)]
        dataset: Option<String>,
    },
}

/// Settings file plus environment, with the command-line data dir on top.
pub(crate) fn settings_for(data_dir: Option<&str>) -> Settings {
    let mut settings = load_settings();
    if let Some(dir) = data_dir {
        settings.data_dir = shellexpand_path(dir);
    }
    settings
}

/// Print a run result; a result with `ok: false` becomes the command's error.
pub(crate) fn emit(result: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    if result.get("ok").and_then(Value::as_bool) == Some(false) {
        let message = result
            .get("message")
            .or_else(|| result.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("run failed");
        return Err(PosmapError::Other(message.to_string()));
    }
    Ok(())
}

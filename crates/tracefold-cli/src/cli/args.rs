use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "tracefold",
    version,
    about = "Rebuild agent runs from OpenTelemetry span fragments"
)]
pub struct Cli {
    /// SQLite database file
    #[arg(long, global = true, env = "TRACEFOLD_DB")]
    pub db: Option<PathBuf>,

    /// YAML processing config (otherwise read from TRACEFOLD_* env vars)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit an OTLP/JSON trace export file
    Ingest {
        collection: String,
        payload: PathBuf,
    },
    /// Submit a score for a run
    Score {
        collection: String,
        run: String,
        name: String,
        /// JSON value (bare strings are accepted)
        value: String,
    },
    /// Submit run metadata as a JSON object
    Metadata {
        collection: String,
        run: String,
        json: String,
    },
    /// Submit transcript group fields as a JSON object
    Group {
        collection: String,
        run: String,
        group: String,
        json: String,
    },
    /// Submit transcript fields as a JSON object
    Transcript {
        collection: String,
        run: String,
        transcript: String,
        json: String,
    },
    /// Run processing passes until the collection is idle
    Process { collection: String },
    /// List run statuses of a collection
    Status { collection: String },
    /// Print a reconstructed run as JSON
    Show { run: String },
}

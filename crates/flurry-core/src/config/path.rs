//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about = "Incrementally ingest CSV objects into a table, exactly once")]
pub struct CliArgs {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Only report which objects would be ingested
    #[arg(long, conflicts_with = "check")]
    pub dry_run: bool,

    /// Verify that the source, the token endpoint and the destination are
    /// reachable, then exit without ingesting
    #[arg(long)]
    pub check: bool,
}

/// Check if a path has a YAML extension.
pub fn is_yaml_file(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

//! CLI command definitions.

use clap::{Subcommand, ValueEnum};

#[derive(Subcommand)]
pub enum Commands {
    /// Poll a pipeline's materials and print the fan-in resolved revisions
    Resolve {
        /// Pipeline name
        pipeline: String,
    },

    /// Force a pipeline, then drain the schedule queue
    Schedule {
        /// Pipeline name
        pipeline: String,

        /// User the build is forced by
        #[arg(long = "as", default_value = "admin")]
        user: String,

        /// Peg a material to a revision (material name or fingerprint)
        #[arg(short, long = "revision", value_name = "MATERIAL=REV")]
        revisions: Vec<String>,

        /// Environment variable override
        #[arg(short, long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
    },

    /// Render the value stream map of a pipeline instance
    Vsm {
        /// Pipeline name
        pipeline: String,

        /// Pipeline counter
        counter: u32,

        /// User the map is rendered for
        #[arg(short, long, default_value = "admin")]
        user: String,
    },

    /// Print the JSON schema of the workspace file
    Schema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

/// Split a `KEY=VALUE` argument.
pub fn parse_pair(arg: &str) -> anyhow::Result<(String, String)> {
    match arg.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => anyhow::bail!("Expected KEY=VALUE, got '{}'", arg),
    }
}

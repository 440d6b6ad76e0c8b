//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - diff: run the full pipeline once for a pull request
//! - render: render one map file
//! - bounds: print a map file's size
//! - show: list stored results for a pull request

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// mapdiffbot - Renders before/after minimaps for map files changed in pull requests
#[derive(Parser, Debug)]
#[command(name = "mapdiffbot")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the diff pipeline once for a pull request
    Diff {
        /// Repository as owner/name
        repository: String,

        /// Pull request number
        number: u64,

        /// Base commit SHA
        #[arg(long)]
        base: String,

        /// Head commit SHA
        #[arg(long)]
        head: String,

        /// Changed file paths, relative to the repository root
        #[arg(short, long = "file", required = true)]
        files: Vec<String>,

        /// Store the results in the configured database
        #[arg(long)]
        save: bool,
    },

    /// Render a minimap of one map file
    Render {
        /// Repository working copy to run in
        #[arg(short, long, default_value = ".")]
        workdir: PathBuf,

        /// Map file, relative to the working copy
        map: PathBuf,

        /// Output image path
        #[arg(short, long)]
        output: PathBuf,

        /// Crop region as min_x,min_y,max_x,max_y
        #[arg(short, long)]
        region: Option<String>,
    },

    /// Print the bounds of a map file
    Bounds {
        /// Repository working copy to run in
        #[arg(short, long, default_value = ".")]
        workdir: PathBuf,

        /// Map file, relative to the working copy
        map: PathBuf,
    },

    /// List stored results for a pull request
    Show {
        /// Repository as owner/name
        repository: String,

        /// Pull request number
        number: u64,
    },
}

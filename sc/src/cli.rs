//! CLI argument parsing for the sc binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sc")]
#[command(author, version, about = "Serialized single-owner state cells", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Increment one counter cell from many concurrent callers
    Counter {
        /// Number of concurrent callers
        #[arg(short = 'n', long, default_value = "4")]
        callers: usize,

        /// Increments per caller
        #[arg(short, long, default_value = "1000")]
        ops: usize,

        /// Use fire-and-forget casts instead of updates
        #[arg(long)]
        cast: bool,

        /// Run the cell on a dedicated thread
        #[arg(long)]
        thread: bool,
    },

    /// Push items into a queue cell, then pop them back in order
    Queue {
        /// Number of items to push
        #[arg(short, long, default_value = "5")]
        items: usize,
    },

    /// Print the effective configuration
    Config {
        /// Write it to this YAML file instead
        #[arg(short, long)]
        write: Option<PathBuf>,
    },
}

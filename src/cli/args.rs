//! CLI argument parsing using clap.
//!
//! Contains the Cli struct and the Commands enum.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Directory monitor and metadata extractor
#[derive(Parser)]
#[command(
    name = "indexwatch",
    version = env!("CARGO_PKG_VERSION"),
    about = "Directory monitor and metadata extractor",
    long_about = "Watch directory trees for changes and extract file metadata with crash recovery.",
    next_line_help = true,
    styles = clap_cargo_style()
)]
pub struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true, env = "INDEXWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Initialize configuration
    #[command(about = "Set up .indexwatch directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show active settings
    #[command(about = "Display active settings")]
    Config,

    /// Watch directory trees and print changes
    #[command(about = "Watch directories recursively and print change notifications")]
    Watch {
        /// Directories to watch
        #[arg(value_name = "DIR", required = true)]
        dirs: Vec<PathBuf>,

        /// Stop after this many seconds instead of running until killed
        #[arg(long, value_name = "SECS")]
        duration: Option<u64>,
    },

    /// Extract metadata from every file under the given directories
    #[command(about = "Recover interrupted work, then extract metadata from files")]
    Extract {
        /// Directories to crawl
        #[arg(value_name = "DIR", required = true)]
        dirs: Vec<PathBuf>,

        /// Re-extract files that are already up to date
        #[arg(short, long)]
        force: bool,
    },

    /// Show recorded extraction failures
    #[command(about = "List extraction failures, or show the one for PATH")]
    Errors {
        /// File to look up
        path: Option<PathBuf>,
    },
}

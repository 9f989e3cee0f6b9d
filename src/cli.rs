use crate::types::Platform;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default manifest looked up in the current directory
pub const DEFAULT_MANIFEST: &str = "installer.json";

/// pepinstall - installer and uninstaller for the Pep/9 tools
#[derive(Parser, Debug)]
#[command(name = "pepinstall")]
#[command(about = "Install, uninstall and plan installs of the Pep/9 tool suite")]
#[command(version)]
pub struct Cli {
    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging (debug level unless RUST_LOG is set)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install the selected components
    Install {
        /// Installation directory
        #[arg(long)]
        target: Option<String>,

        /// Offline installer: never prompt, add an "Uninstall" shortcut on Windows
        #[arg(long)]
        offline: bool,

        /// Answer every page with its default
        #[arg(long)]
        unattended: bool,

        /// Comma-separated component ids (manifest defaults when omitted)
        #[arg(long, value_delimiter = ',')]
        components: Option<Vec<String>>,

        /// Package manifest
        #[arg(long, default_value = DEFAULT_MANIFEST)]
        manifest: PathBuf,

        /// Target platform (windows, macos, linux; defaults to this host)
        #[arg(long, value_parser = Platform::parse)]
        platform: Option<Platform>,

        /// Also create a desktop shortcut (Windows)
        #[arg(long)]
        desktop_shortcut: bool,

        /// Launch the product when the install finishes
        #[arg(long)]
        launch: bool,
    },
    /// Remove an installation using its operation log
    Uninstall {
        /// Installation directory
        #[arg(long, conflicts_with = "script", required_unless_present = "script")]
        target: Option<String>,

        /// Uninstall script written by a newer installer
        #[arg(long)]
        script: Option<PathBuf>,

        /// Do not ask for confirmation
        #[arg(long)]
        unattended: bool,
    },
    /// Print the operations an install would perform, without applying them
    Plan {
        /// Installation directory
        #[arg(long)]
        target: String,

        /// Comma-separated component ids (manifest defaults when omitted)
        #[arg(long, value_delimiter = ',')]
        components: Option<Vec<String>>,

        #[arg(long)]
        offline: bool,

        #[arg(long, default_value = DEFAULT_MANIFEST)]
        manifest: PathBuf,

        #[arg(long, value_parser = Platform::parse)]
        platform: Option<Platform>,

        #[arg(long)]
        desktop_shortcut: bool,
    },
    /// Load and validate a package manifest
    Validate {
        /// Path to the manifest to validate
        manifest: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

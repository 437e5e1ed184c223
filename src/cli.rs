//! Command-line surface

use std::path::PathBuf;

use clap::Parser;

/// Continuously re-audit a Git working tree with a local LLM.
///
/// The scanner watches the target directory for uncommitted changes,
/// runs the configured check prompts against modified files, and keeps
/// `code_scanner_results.md` up to date with open and resolved issues.
#[derive(Debug, Parser)]
#[command(name = "code-scanner", version, about, max_term_width = 100)]
pub struct Cli {
    /// Target directory (must be inside a Git working tree)
    pub directory: PathBuf,

    /// Path to the configuration file
    ///
    /// Defaults to `config.toml` next to the installed binary.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Scan relative to this base commit instead of HEAD
    ///
    /// Untracked files are still included.
    #[arg(long, value_name = "HASH")]
    pub commit: Option<String>,

    /// Enable debug logging (RUST_LOG overrides this)
    #[arg(short, long)]
    pub verbose: bool,
}

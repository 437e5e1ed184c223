//! Fatal error types and exit-code mapping

use std::path::PathBuf;

/// Errors that terminate the daemon.
///
/// Recoverable conditions (LLM outages, malformed model output, tool
/// failures) never surface here; they are handled where they occur. A
/// `ScanError` reaching `main` means the process is going down.
#[derive(Debug)]
pub enum ScanError {
    /// Configuration file missing, unreadable, or invalid
    Config { message: String },
    /// Target directory is not inside a Git working tree
    NotAGitRepository { path: PathBuf },
    /// The base commit passed via --commit does not resolve
    UnknownCommit { commit: String },
    /// Another scanner instance owns the lock file
    LockHeld { path: PathBuf, pid: u32 },
    /// Lock file could not be created or written
    LockFailed { path: PathBuf, error: String },
    /// LLM backend unreachable during startup
    LlmUnreachable { url: String, error: String },
    /// Configured context limit exceeds what the server reports
    ContextLimitTooLarge { configured: usize, server: usize },
    /// Report file could not be created or rotated
    ReportIo { path: PathBuf, error: String },
}

impl ScanError {
    /// Process exit code for this error.
    ///
    /// 1 = configuration error, 2 = runtime fatal (matches the CLI contract).
    pub fn exit_code(&self) -> i32 {
        match self {
            ScanError::Config { .. } | ScanError::ContextLimitTooLarge { .. } => 1,
            ScanError::NotAGitRepository { .. }
            | ScanError::UnknownCommit { .. }
            | ScanError::LockHeld { .. }
            | ScanError::LockFailed { .. }
            | ScanError::LlmUnreachable { .. }
            | ScanError::ReportIo { .. } => 2,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        ScanError::Config {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Config { message } => write!(f, "Configuration error: {message}"),

            ScanError::NotAGitRepository { path } => {
                write!(
                    f,
                    "{} is not a Git repository\n\nInitialize one with 'git init' or point the scanner at a working tree",
                    path.display()
                )
            }

            ScanError::UnknownCommit { commit } => {
                write!(f, "Base commit {commit} does not exist in this repository")
            }

            ScanError::LockHeld { path, pid } => {
                write!(
                    f,
                    "Another scanner (pid {pid}) already holds {}\n\nStop it first, or remove the lock file if the pid is stale",
                    path.display()
                )
            }

            ScanError::LockFailed { path, error } => {
                write!(f, "Failed to acquire lock file {}: {error}", path.display())
            }

            ScanError::LlmUnreachable { url, error } => {
                write!(
                    f,
                    "LLM backend at {url} is unreachable: {error}\n\nStart the model server and retry"
                )
            }

            ScanError::ContextLimitTooLarge { configured, server } => {
                write!(
                    f,
                    "Configured context_limit {configured} exceeds the server-reported limit {server}"
                )
            }

            ScanError::ReportIo { path, error } => {
                write!(f, "Failed to write report {}: {error}", path.display())
            }
        }
    }
}

impl std::error::Error for ScanError {}

/// Extract the exit code from an error chain, if a [`ScanError`] is in it.
///
/// `main` uses this to honor the 0/1/2 CLI contract without matching on
/// every call site's error type.
pub fn exit_code(err: &anyhow::Error) -> Option<i32> {
    err.downcast_ref::<ScanError>().map(ScanError::exit_code)
}

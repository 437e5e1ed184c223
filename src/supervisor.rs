//! Process supervision
//!
//! Owns everything that happens before and after scanning: the per-user
//! lock file, signal handling, the startup validation sequence, and the
//! watcher/scanner thread lifecycle. Startup order is fixed — lock,
//! report rotation, strict config parse, Git verification, LLM
//! connectivity, context-limit validation, fresh report — so a fatal
//! error can never leave a half-started daemon behind.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fs2::FileExt;

use crate::config::Config;
use crate::error::ScanError;
use crate::filter::LOG_FILE;
use crate::git::{ChangeCell, GitWatcher, Repository};
use crate::issues::IssueStore;
use crate::llm::LlmClient;
use crate::report::ReportWriter;
use crate::scanner::Scanner;
use crate::tools::ToolExecutor;

const LOCK_DIR: &str = ".code-scanner";
const LOCK_FILE: &str = "code_scanner.lock";

/// Options resolved from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub directory: PathBuf,
    pub config_path: PathBuf,
    pub base_commit: Option<String>,
    pub poll_interval: Duration,
}

/// Exclusive per-user lock holding the owner PID.
///
/// Release is idempotent (guarded by an atomic owned flag) so it is safe
/// from the normal exit path, the Drop impl, and a signal-triggered
/// shutdown alike.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: Option<std::fs::File>,
    owned: Arc<AtomicBool>,
}

impl LockFile {
    pub fn acquire() -> Result<Self, ScanError> {
        let dir = dirs::home_dir()
            .map(|home| home.join(LOCK_DIR))
            .ok_or_else(|| ScanError::LockFailed {
                path: PathBuf::from(LOCK_DIR),
                error: "cannot determine home directory".into(),
            })?;
        Self::acquire_at(&dir.join(LOCK_FILE))
    }

    pub fn acquire_at(path: &Path) -> Result<Self, ScanError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ScanError::LockFailed {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;
        }

        // A live owner is fatal; a dead one left a stale file behind and
        // the lock is reclaimed.
        if let Some(pid) = read_pid(path) {
            if pid != std::process::id() && pid_is_live(pid) {
                return Err(ScanError::LockHeld {
                    path: path.to_path_buf(),
                    pid,
                });
            }
            log::warn!("reclaiming stale lock from dead pid {pid}");
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| ScanError::LockFailed {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;
        // Advisory lock guards against two scanners racing through the
        // PID check at the same moment.
        file.try_lock_exclusive().map_err(|e| ScanError::LockFailed {
            path: path.to_path_buf(),
            error: format!("already locked: {e}"),
        })?;
        write!(file, "{}", std::process::id()).map_err(|e| ScanError::LockFailed {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        file.flush().ok();

        Ok(LockFile {
            path: path.to_path_buf(),
            file: Some(file),
            owned: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Release the lock and remove the file. Safe to call more than once.
    pub fn release(&self) {
        if self.owned.swap(false, Ordering::SeqCst) {
            if let Some(file) = &self.file {
                let _ = fs2::FileExt::unlock(file);
            }
            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("could not remove lock file {}: {e}", self.path.display());
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    let mut text = String::new();
    std::fs::File::open(path)
        .ok()?
        .read_to_string(&mut text)
        .ok()?;
    text.trim().parse().ok()
}

#[cfg(unix)]
fn pid_is_live(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    // Signal 0 probes existence without delivering anything. EPERM means
    // the process exists but belongs to someone else — still live.
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_is_live(_pid: u32) -> bool {
    // Without a cheap probe, assume live; the user can remove the lock.
    true
}

/// Install SIGINT/SIGTERM handlers that raise the shared shutdown flag.
#[cfg(unix)]
fn install_signal_handlers(shutdown: &Arc<AtomicBool>) -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    signal_hook::flag::register(SIGINT, shutdown.clone())?;
    signal_hook::flag::register(SIGTERM, shutdown.clone())?;
    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handlers(_shutdown: &Arc<AtomicBool>) -> anyhow::Result<()> {
    Ok(())
}

/// Full daemon run: startup validation, scan loop, shutdown.
pub fn run(options: RunOptions) -> anyhow::Result<()> {
    let lock = LockFile::acquire()?;
    log::debug!("lock acquired at {}", lock.path().display());

    let target = dunce::canonicalize(&options.directory).unwrap_or(options.directory.clone());

    // Rotating the old report before anything else gives the user an
    // immediate signal that the daemon started.
    let report = ReportWriter::new(&target);
    report.rotate_existing()?;

    let config = Config::load(&options.config_path)?;

    let repo = Repository::discover(&target)?;
    if let Some(commit) = &options.base_commit
        && !repo.commit_exists(commit)
    {
        return Err(ScanError::UnknownCommit {
            commit: commit.clone(),
        }
        .into());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handlers(&shutdown)?;

    let client = LlmClient::from_config(&config.llm, shutdown.clone());
    client.check_connection().map_err(|e| ScanError::LlmUnreachable {
        url: config.llm.base_url(),
        error: e.to_string(),
    })?;
    validate_context_limit(&client, &config)?;
    log::info!(
        "connected to {} backend at {}",
        config.llm.backend,
        config.llm.base_url()
    );

    report.rewrite(&IssueStore::new())?;

    let cell = ChangeCell::new();
    let watcher = GitWatcher::new(
        repo.clone(),
        config.groups.clone(),
        options.base_commit.clone(),
        cell.clone(),
        shutdown.clone(),
        options.poll_interval,
    );
    let watcher_handle = watcher.spawn();

    let tools = ToolExecutor::new(repo.clone());
    let mut scanner = Scanner::new(
        repo,
        config,
        client,
        tools,
        report,
        cell,
        shutdown.clone(),
    );
    scanner.run();

    log::info!("shutting down");
    shutdown.store(true, Ordering::Relaxed);
    if watcher_handle.join().is_err() {
        log::warn!("watcher thread panicked during shutdown");
    }
    lock.release();
    Ok(())
}

/// Compare the configured context limit against the server-reported one.
///
/// A server that authoritatively reports a smaller window than configured
/// is fatal; a larger one is only a note and the configured value is
/// honored.
fn validate_context_limit(client: &LlmClient, config: &Config) -> Result<(), ScanError> {
    match client.server_context_limit() {
        Ok(Some(server)) if config.llm.context_limit > server => {
            Err(ScanError::ContextLimitTooLarge {
                configured: config.llm.context_limit,
                server,
            })
        }
        Ok(Some(server)) => {
            if config.llm.context_limit < server {
                log::warn!(
                    "configured context_limit {} is below the server's {server}; honoring the configured value",
                    config.llm.context_limit
                );
            }
            Ok(())
        }
        Ok(None) => {
            log::debug!("server does not report a context limit; trusting the configured value");
            Ok(())
        }
        Err(e) => {
            log::warn!("could not query the server context limit: {e}");
            Ok(())
        }
    }
}

/// Default config location: next to the installed binary.
pub fn default_config_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}

/// Log destination for a detached daemon.
pub fn log_file_path(target: &Path) -> PathBuf {
    target.join(LOG_FILE)
}

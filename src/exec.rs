//! Subprocess execution for git, ripgrep, and ctags
//!
//! Every external command the scanner runs goes through [`Cmd`] so the
//! invocation is logged uniformly and failures carry the command line and
//! trimmed stderr.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use anyhow::{Context, bail};

/// Builder around [`std::process::Command`] with debug logging.
#[derive(Debug)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    stdin_data: Option<Vec<u8>>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Cmd {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin_data: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Bytes to feed the child on stdin. The pipe is closed after writing.
    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin_data = Some(data.into());
        self
    }

    fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// Run the command and capture its output.
    pub fn run(self) -> anyhow::Result<Output> {
        log::debug!("$ {}", self.display());

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(if self.stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn: {}", self.display()))?;

        // BrokenPipe is fine: the child may exit without draining stdin.
        if let Some(data) = &self.stdin_data
            && let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(data)
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(e).with_context(|| format!("Failed to write stdin: {}", self.display()));
        }

        child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for: {}", self.display()))
    }

    /// Run the command, requiring a zero exit status, and return stdout.
    pub fn run_ok(self) -> anyhow::Result<String> {
        let display = self.display();
        let output = self.run()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{display}: {}", stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Locate a binary on PATH. Returns `None` when absent so callers can
/// degrade (the tool executor reports `tool_unavailable` instead of dying).
pub fn find_binary(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

/// Convenience for `git -C <dir> <args>`.
pub fn git(dir: &Path, args: &[&str]) -> Cmd {
    Cmd::new("git").current_dir(dir).args(args.iter().copied())
}

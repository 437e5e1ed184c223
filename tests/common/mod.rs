// Helpers are shared across several integration harnesses; not every
// harness uses all of them.
#![allow(dead_code)]

//! Test fixtures: isolated git repositories in temp directories.
//!
//! Each test gets a fresh repository with deterministic configuration.
//! Git commands run with explicit user settings so no global config can
//! leak in.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let repo = TestRepo { dir };
        repo.git(&["init", "-q", "-b", "main"]);
        repo.git(&["config", "user.email", "scanner-test@example.com"]);
        repo.git(&["config", "user.name", "Scanner Test"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        repo
    }

    /// A repo with one committed file, so HEAD exists.
    pub fn with_initial_commit() -> Self {
        let repo = TestRepo::new();
        repo.write("README.md", "# test repo\n");
        repo.git(&["add", "."]);
        repo.git(&["commit", "-q", "-m", "initial"]);
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(path, content).expect("write file");
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(rel)).expect("read file")
    }

    pub fn remove(&self, rel: &str) {
        std::fs::remove_file(self.dir.path().join(rel)).expect("remove file");
    }

    pub fn commit_all(&self, message: &str) {
        self.git(&["add", "."]);
        self.git(&["commit", "-q", "-m", message]);
    }

    pub fn head(&self) -> String {
        self.git_output(&["rev-parse", "HEAD"]).trim().to_string()
    }

    pub fn git(&self, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(self.dir.path())
            .args(args)
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    }

    pub fn git_output(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .arg("-C")
            .arg(self.dir.path())
            .args(args)
            .output()
            .expect("run git");
        assert!(output.status.success(), "git {args:?} failed");
        String::from_utf8_lossy(&output.stdout).into_owned()
    }
}

/// Paths as they appear in ChangeSets: repo-relative.
pub fn rel(path: &str) -> PathBuf {
    PathBuf::from(path)
}

/// A minimal valid config with the given check groups appended.
pub fn config_text(check_sections: &str) -> String {
    format!(
        r#"
[llm]
backend = "openai-compatible"
host = "localhost"
port = 8080
context_limit = 16384

{check_sections}
"#
    )
}

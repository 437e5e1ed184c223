//! Git repository operations
//!
//! All git access is subprocess-based (`git -C <root> …`); nothing here
//! links against libgit2. The scanner only ever *reads* repository state.

mod watcher;

pub use watcher::{
    ChangeCell, ChangeDelta, ChangeSet, DEFAULT_POLL_INTERVAL, GitWatcher, WatcherState,
};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};

use crate::error::ScanError;
use crate::exec;

/// Uncommitted paths relative to HEAD or a pinned base commit.
///
/// `present` are paths that exist in the working tree with uncommitted
/// content; `deleted` are paths known to HEAD or the index but absent from
/// the working tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedPaths {
    pub present: BTreeSet<PathBuf>,
    pub deleted: BTreeSet<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
    git_dir: PathBuf,
}

impl Repository {
    /// Discover the repository containing `path`.
    pub fn discover(path: &Path) -> Result<Self, ScanError> {
        let not_a_repo = || ScanError::NotAGitRepository {
            path: path.to_path_buf(),
        };

        let top = exec::git(path, &["rev-parse", "--show-toplevel"])
            .run_ok()
            .map_err(|_| not_a_repo())?;
        let root =
            dunce::canonicalize(PathBuf::from(top.trim())).map_err(|_| not_a_repo())?;

        let git_dir_out = exec::git(&root, &["rev-parse", "--git-common-dir"])
            .run_ok()
            .map_err(|_| not_a_repo())?;
        let git_dir_raw = PathBuf::from(git_dir_out.trim());
        let git_dir = if git_dir_raw.is_relative() {
            root.join(git_dir_raw)
        } else {
            git_dir_raw
        };

        Ok(Repository { root, git_dir })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub fn commit_exists(&self, commit: &str) -> bool {
        exec::git(&self.root, &["cat-file", "-e", &format!("{commit}^{{commit}}")])
            .run()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// True while a merge or rebase is in flight.
    ///
    /// Scanning mid-operation would race against git rewriting the working
    /// tree, so the watcher holds off until these markers disappear.
    pub fn in_conflicted_operation(&self) -> bool {
        ["MERGE_HEAD", "REBASE_HEAD", "rebase-merge", "rebase-apply"]
            .iter()
            .any(|marker| self.git_dir.join(marker).exists())
    }

    /// Collect every uncommitted path: staged, unstaged, and untracked
    /// (not ignored). With `base` set, changes are computed against that
    /// commit instead of HEAD; untracked files are still included.
    pub fn changed_paths(&self, base: Option<&str>) -> anyhow::Result<ChangedPaths> {
        match base {
            None => self.status_changes(),
            Some(commit) => self.base_commit_changes(commit),
        }
    }

    fn status_changes(&self) -> anyhow::Result<ChangedPaths> {
        let output = exec::git(
            &self.root,
            &["status", "--porcelain=v1", "-z", "--untracked-files=all"],
        )
        .run_ok()
        .context("Failed to read git status")?;
        parse_porcelain_z(&output)
    }

    fn base_commit_changes(&self, base: &str) -> anyhow::Result<ChangedPaths> {
        let mut changes = ChangedPaths::default();

        let diff = exec::git(&self.root, &["diff", "--name-status", "-z", base])
            .run_ok()
            .with_context(|| format!("Failed to diff against {base}"))?;
        let mut fields = diff.split('\0').filter(|s| !s.is_empty());
        while let Some(status) = fields.next() {
            let Some(path) = fields.next() else { break };
            match status.chars().next() {
                Some('D') => {
                    changes.deleted.insert(PathBuf::from(path));
                }
                Some('R') | Some('C') => {
                    // Rename/copy entries carry a second path: old then new.
                    changes.deleted.insert(PathBuf::from(path));
                    if let Some(new_path) = fields.next() {
                        changes.present.insert(PathBuf::from(new_path));
                    }
                }
                _ => {
                    changes.present.insert(PathBuf::from(path));
                }
            }
        }

        let untracked = exec::git(
            &self.root,
            &["ls-files", "--others", "--exclude-standard", "-z"],
        )
        .run_ok()
        .context("Failed to list untracked files")?;
        for path in untracked.split('\0').filter(|s| !s.is_empty()) {
            changes.present.insert(PathBuf::from(path));
        }

        Ok(changes)
    }

    /// Unified diff of one file against HEAD.
    pub fn file_diff(&self, rel: &Path, context_lines: u32) -> anyhow::Result<String> {
        let output = exec::Cmd::new("git")
            .current_dir(&self.root)
            .args(["--no-pager", "diff"])
            .arg(format!("-U{context_lines}"))
            .args(["HEAD", "--"])
            .arg(rel)
            .run_ok()?;
        Ok(output)
    }

    /// One batched `git check-ignore` call over all candidates; returns the
    /// subset that is ignored. Exit status 1 just means "nothing matched".
    pub fn check_ignore_batch(
        &self,
        candidates: &[PathBuf],
    ) -> anyhow::Result<BTreeSet<PathBuf>> {
        if candidates.is_empty() {
            return Ok(BTreeSet::new());
        }
        let mut stdin = Vec::new();
        for path in candidates {
            stdin.extend_from_slice(path.to_string_lossy().as_bytes());
            stdin.push(0);
        }
        let output = exec::git(&self.root, &["check-ignore", "--stdin", "-z"])
            .stdin(stdin)
            .run()?;
        // 0 = some ignored, 1 = none ignored, 128 = error
        if output.status.code() == Some(128) {
            anyhow::bail!(
                "git check-ignore failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .split('\0')
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Content hash of a working-tree file, or `None` if it vanished or
    /// cannot be read (a racing delete is not an error for the watcher).
    pub fn file_hash(&self, rel: &Path) -> Option<String> {
        let bytes = std::fs::read(self.root.join(rel)).ok()?;
        Some(hash_bytes(&bytes))
    }
}

/// SHA-256 hex digest used for all content-identity comparisons.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Parse `git status --porcelain=v1 -z` output.
///
/// Entries are `XY <path>\0`; rename/copy entries are followed by the
/// original path as a separate NUL-terminated field. A rename is reported
/// as old path deleted plus new path present, which is exactly how the
/// issue tracker wants to see it.
fn parse_porcelain_z(output: &str) -> anyhow::Result<ChangedPaths> {
    let mut changes = ChangedPaths::default();
    let mut fields = output.split('\0').filter(|s| !s.is_empty());

    while let Some(entry) = fields.next() {
        if entry.len() < 4 {
            anyhow::bail!("malformed status entry: {entry:?}");
        }
        let (code, path) = entry.split_at(3);
        let mut status = code.chars();
        let x = status.next().unwrap_or(' ');
        let y = status.next().unwrap_or(' ');
        let path = PathBuf::from(path);

        if x == 'R' || x == 'C' {
            if let Some(old_path) = fields.next() {
                changes.deleted.insert(PathBuf::from(old_path));
            }
        }

        // Worktree deletion, or a staged deletion not re-created since.
        if y == 'D' || (x == 'D' && y == ' ') {
            changes.deleted.insert(path);
        } else {
            changes.present.insert(path);
        }
    }

    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn init_repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        run_git(dir.path(), &["init", "-q", "-b", "main"]);
        run_git(dir.path(), &["config", "user.email", "scan@example.com"]);
        run_git(dir.path(), &["config", "user.name", "Scanner Test"]);
        std::fs::write(dir.path().join("tracked.txt"), "first\n").unwrap();
        run_git(dir.path(), &["add", "."]);
        run_git(dir.path(), &["commit", "-q", "-m", "initial"]);
        let repo = Repository::discover(dir.path()).unwrap();
        (dir, repo)
    }

    fn run_git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    #[test]
    fn discover_rejects_non_repo() {
        let dir = TempDir::new().unwrap();
        let err = Repository::discover(dir.path()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn clean_tree_has_no_changes() {
        let (_dir, repo) = init_repo();
        let changes = repo.changed_paths(None).unwrap();
        assert!(changes.present.is_empty());
        assert!(changes.deleted.is_empty());
    }

    #[test]
    fn modified_and_untracked_are_present() {
        let (dir, repo) = init_repo();
        std::fs::write(dir.path().join("tracked.txt"), "second\n").unwrap();
        std::fs::create_dir(dir.path().join("new")).unwrap();
        std::fs::write(dir.path().join("new/file.rs"), "fn main() {}\n").unwrap();

        let changes = repo.changed_paths(None).unwrap();
        assert!(changes.present.contains(Path::new("tracked.txt")));
        // --untracked-files=all surfaces files inside untracked directories.
        assert!(changes.present.contains(Path::new("new/file.rs")));
    }

    #[test]
    fn deleted_file_is_reported_deleted() {
        let (dir, repo) = init_repo();
        std::fs::remove_file(dir.path().join("tracked.txt")).unwrap();
        let changes = repo.changed_paths(None).unwrap();
        assert!(changes.deleted.contains(Path::new("tracked.txt")));
        assert!(!changes.present.contains(Path::new("tracked.txt")));
    }

    #[test]
    fn staged_rename_is_delete_plus_add() {
        let (dir, repo) = init_repo();
        run_git(dir.path(), &["mv", "tracked.txt", "renamed.txt"]);
        let changes = repo.changed_paths(None).unwrap();
        assert!(changes.deleted.contains(Path::new("tracked.txt")));
        assert!(changes.present.contains(Path::new("renamed.txt")));
    }

    #[test]
    fn gitignored_untracked_files_are_excluded() {
        let (dir, repo) = init_repo();
        std::fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
        run_git(dir.path(), &["add", ".gitignore"]);
        run_git(dir.path(), &["commit", "-q", "-m", "ignore"]);
        std::fs::write(dir.path().join("noise.log"), "x").unwrap();

        let changes = repo.changed_paths(None).unwrap();
        assert!(!changes.present.contains(Path::new("noise.log")));
    }

    #[test]
    fn base_commit_mode_sees_committed_changes_and_untracked() {
        let (dir, repo) = init_repo();
        let base = exec::git(dir.path(), &["rev-parse", "HEAD"])
            .run_ok()
            .unwrap()
            .trim()
            .to_string();

        std::fs::write(dir.path().join("tracked.txt"), "committed change\n").unwrap();
        run_git(dir.path(), &["commit", "-q", "-am", "change"]);
        std::fs::write(dir.path().join("scratch.rs"), "// wip\n").unwrap();

        let changes = repo.changed_paths(Some(&base)).unwrap();
        assert!(changes.present.contains(Path::new("tracked.txt")));
        assert!(changes.present.contains(Path::new("scratch.rs")));

        // Relative to HEAD the committed change is invisible.
        let head_changes = repo.changed_paths(None).unwrap();
        assert!(!head_changes.present.contains(Path::new("tracked.txt")));
    }

    #[test]
    fn conflict_gate_sees_merge_marker() {
        let (dir, repo) = init_repo();
        assert!(!repo.in_conflicted_operation());
        std::fs::write(repo.git_dir().join("MERGE_HEAD"), "deadbeef\n").unwrap();
        assert!(repo.in_conflicted_operation());
        let _ = dir;
    }

    #[test]
    fn check_ignore_batch_classifies_paths() {
        let (dir, repo) = init_repo();
        std::fs::write(dir.path().join(".gitignore"), "target/\n*.tmp\n").unwrap();
        let ignored = repo
            .check_ignore_batch(&[
                PathBuf::from("target/debug/foo"),
                PathBuf::from("src/main.rs"),
                PathBuf::from("junk.tmp"),
            ])
            .unwrap();
        assert!(ignored.contains(Path::new("target/debug/foo")));
        assert!(ignored.contains(Path::new("junk.tmp")));
        assert!(!ignored.contains(Path::new("src/main.rs")));
    }

    #[test]
    fn hash_is_stable_and_content_addressed() {
        assert_eq!(hash_bytes(b"abc"), hash_bytes(b"abc"));
        assert_ne!(hash_bytes(b"abc"), hash_bytes(b"abd"));
    }

    #[test]
    fn commit_exists_checks_object_type() {
        let (_dir, repo) = init_repo();
        assert!(repo.commit_exists("HEAD"));
        assert!(!repo.commit_exists("0000000000000000000000000000000000000000"));
    }
}

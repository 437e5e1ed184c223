//! Unified file exclusion
//!
//! A single predicate decides whether a path participates in scanning. It
//! merges three sources: scanner-owned filenames (so the report rewrite
//! never triggers a scan of itself), ignore groups from the config, and the
//! repository's gitignore rules. Both the watcher and the scanner consult
//! this predicate, and nothing else, for exclusion decisions.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::config::{CheckGroup, PathPattern};
use crate::git::Repository;

/// Report, report backup, and log file the scanner writes into the target
/// directory root. Exact-match excluded everywhere.
pub const REPORT_FILE: &str = "code_scanner_results.md";
pub const REPORT_BACKUP_FILE: &str = "code_scanner_results.md.bak";
pub const LOG_FILE: &str = "code_scanner.log";

const SCANNER_FILES: [&str; 3] = [REPORT_FILE, REPORT_BACKUP_FILE, LOG_FILE];

/// How gitignore rules are answered.
enum GitignoreSource {
    /// In-memory matcher; no subprocess per query.
    Matcher(Gitignore),
    /// Pre-resolved set from one batched `git check-ignore` call, used when
    /// the matcher could not be built.
    Resolved(BTreeSet<PathBuf>),
    /// Nothing available; gitignore layer answers "not ignored".
    None,
}

pub struct FileFilter {
    ignore_patterns: Vec<PathPattern>,
    gitignore: GitignoreSource,
}

impl FileFilter {
    /// Build the predicate for one scan cycle.
    ///
    /// `candidates` feed the `git check-ignore` fallback; pass the paths
    /// about to enter the pipeline. The matcher path ignores them.
    pub fn build(repo: &Repository, groups: &[CheckGroup], candidates: &[PathBuf]) -> Self {
        let ignore_patterns = groups
            .iter()
            .filter(|g| g.is_ignore())
            .flat_map(|g| g.patterns.iter().cloned())
            .collect();

        let gitignore = match build_gitignore(repo.root()) {
            Some(matcher) => GitignoreSource::Matcher(matcher),
            None => match repo.check_ignore_batch(candidates) {
                Ok(resolved) => GitignoreSource::Resolved(resolved),
                Err(e) => {
                    log::warn!("gitignore resolution unavailable: {e}");
                    GitignoreSource::None
                }
            },
        };

        FileFilter {
            ignore_patterns,
            gitignore,
        }
    }

    /// A filter with no gitignore layer, for callers that only need the
    /// scanner-file and config-pattern exclusions.
    pub fn without_gitignore(groups: &[CheckGroup]) -> Self {
        FileFilter {
            ignore_patterns: groups
                .iter()
                .filter(|g| g.is_ignore())
                .flat_map(|g| g.patterns.iter().cloned())
                .collect(),
            gitignore: GitignoreSource::None,
        }
    }

    /// Whether a repo-relative path participates in scanning.
    pub fn included(&self, rel: &Path) -> bool {
        if is_scanner_file(rel) {
            return false;
        }
        if self.ignore_patterns.iter().any(|p| p.matches(rel)) {
            return false;
        }
        match &self.gitignore {
            GitignoreSource::Matcher(matcher) => {
                !matcher.matched_path_or_any_parents(rel, false).is_ignore()
            }
            GitignoreSource::Resolved(ignored) => !ignored.contains(rel),
            GitignoreSource::None => true,
        }
    }
}

/// Exact match against scanner-owned filenames at the repository root.
pub fn is_scanner_file(rel: &Path) -> bool {
    rel.parent().map(|p| p.as_os_str().is_empty()).unwrap_or(true)
        && rel
            .file_name()
            .map(|name| SCANNER_FILES.iter().any(|f| name == *f))
            .unwrap_or(false)
}

/// Seed an in-memory matcher from every `.gitignore` in the worktree plus
/// `.git/info/exclude`. Returns `None` if nothing could be read, letting
/// the caller fall back to `git check-ignore`.
fn build_gitignore(root: &Path) -> Option<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let candidate = dir.join(".gitignore");
        if candidate.is_file()
            && let Some(e) = builder.add(&candidate)
        {
            log::debug!("skipping unreadable {}: {e}", candidate.display());
        }
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && entry.file_name() != ".git" {
                stack.push(path);
            }
        }
    }

    let exclude = root.join(".git").join("info").join("exclude");
    if exclude.is_file() {
        builder.add(&exclude);
    }

    // An empty matcher is still valid: it answers "not ignored", which is
    // correct for a repo with no ignore rules at all.
    builder.build().ok()
}

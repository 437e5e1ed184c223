//! Issue tracking with fuzzy identity and scoped resolution
//!
//! The store is the sole owner of issue records. Identity between runs is
//! approximate: a new finding matches an existing OPEN one when it points
//! at the same file and its normalized code snippet (or, failing that, its
//! description) is similar enough. Matches update the line number only;
//! descriptions, fixes, and timestamps are frozen at first sight.
//!
//! Resolution is scoped: after a check run, only OPEN issues whose file
//! was actually scanned — and which the run did not re-report — resolve.
//! Issues in unscanned files never change status. Resolution is terminal
//! for the session; resolved records stay in the store and the report.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

/// Minimum similarity for two findings to be the same issue.
pub const SIMILARITY_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone)]
pub struct Issue {
    pub path: PathBuf,
    /// 1-based; tracks the construct as it migrates between runs.
    pub line: u32,
    pub description: String,
    pub suggested_fix: String,
    pub check_prompt: String,
    pub first_seen: DateTime<Local>,
    pub status: IssueStatus,
    /// Whitespace-normalized code snippet used for identity.
    pub snippet: String,
}

/// A finding produced by one check run, before tracker ingestion.
#[derive(Debug, Clone)]
pub struct NewIssue {
    pub path: PathBuf,
    pub line: u32,
    pub description: String,
    pub suggested_fix: String,
    pub snippet: String,
}

/// Collapse whitespace runs so formatting churn does not break identity.
pub fn normalize_snippet(snippet: &str) -> String {
    snippet.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Default)]
pub struct IssueStore {
    issues: Vec<Issue>,
    by_path: HashMap<PathBuf, Vec<usize>>,
}

impl IssueStore {
    pub fn new() -> Self {
        IssueStore::default()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.status == IssueStatus::Open)
            .count()
    }

    /// Ingest one check run's findings and compute scoped resolution.
    ///
    /// `scanned_files` must be exactly the files the check consumed,
    /// including files that disappeared from the worktree (they scan as
    /// "zero issues" and thereby resolve their leftovers). A failed check
    /// must pass an empty set so nothing resolves from it.
    pub fn ingest(
        &mut self,
        check_prompt: &str,
        scanned_files: &BTreeSet<PathBuf>,
        produced: Vec<NewIssue>,
    ) {
        let mut seen: BTreeSet<usize> = BTreeSet::new();

        for finding in produced {
            let snippet = normalize_snippet(&finding.snippet);
            match self.best_match(&finding.path, &snippet, &finding.description) {
                Some(idx) => {
                    // Known issue: only the line migrates. Everything else
                    // stays as first reported.
                    self.issues[idx].line = finding.line;
                    seen.insert(idx);
                }
                None => {
                    let idx = self.issues.len();
                    self.issues.push(Issue {
                        path: finding.path.clone(),
                        line: finding.line,
                        description: finding.description,
                        suggested_fix: finding.suggested_fix,
                        check_prompt: check_prompt.to_string(),
                        first_seen: Local::now(),
                        status: IssueStatus::Open,
                        snippet,
                    });
                    self.by_path.entry(finding.path).or_default().push(idx);
                    seen.insert(idx);
                }
            }
        }

        for idx in 0..self.issues.len() {
            let issue = &self.issues[idx];
            if issue.status == IssueStatus::Open
                && !seen.contains(&idx)
                && scanned_files.contains(&issue.path)
            {
                log::info!(
                    "resolved: {} line {} ({})",
                    issue.path.display(),
                    issue.line,
                    first_sentence(&issue.description)
                );
                self.issues[idx].status = IssueStatus::Resolved;
            }
        }
    }

    /// Best OPEN candidate for a finding, by the identity predicate.
    ///
    /// Highest similarity wins; exact ties go to the lowest existing line
    /// number (indices are scanned in insertion order, so the first of an
    /// equal pair with a lower line sticks).
    fn best_match(&self, path: &Path, snippet: &str, description: &str) -> Option<usize> {
        let candidates = self.by_path.get(path)?;
        let mut best: Option<(f64, u32, usize)> = None;

        for &idx in candidates {
            let issue = &self.issues[idx];
            if issue.status != IssueStatus::Open {
                continue;
            }
            let similarity = if !snippet.is_empty() && !issue.snippet.is_empty() {
                strsim::normalized_levenshtein(snippet, &issue.snippet)
            } else {
                strsim::normalized_levenshtein(
                    &normalize_snippet(description),
                    &normalize_snippet(&issue.description),
                )
            };
            if similarity < SIMILARITY_THRESHOLD {
                continue;
            }
            let replace = match &best {
                None => true,
                Some((best_sim, best_line, _)) => {
                    similarity > *best_sim
                        || (similarity == *best_sim && issue.line < *best_line)
                }
            };
            if replace {
                best = Some((similarity, issue.line, idx));
            }
        }
        best.map(|(_, _, idx)| idx)
    }

    /// Issues grouped by file for rendering: OPEN before RESOLVED, then by
    /// line, in path order.
    pub fn iter_for_report(&self) -> BTreeMap<&Path, Vec<&Issue>> {
        let mut grouped: BTreeMap<&Path, Vec<&Issue>> = BTreeMap::new();
        for issue in &self.issues {
            grouped.entry(issue.path.as_path()).or_default().push(issue);
        }
        for issues in grouped.values_mut() {
            issues.sort_by_key(|i| (i.status == IssueStatus::Resolved, i.line));
        }
        grouped
    }

    /// Owned copy for the report writer, taken under a brief hold.
    pub fn snapshot(&self) -> Vec<Issue> {
        self.issues.clone()
    }
}

fn first_sentence(text: &str) -> &str {
    text.split_once('.').map(|(s, _)| s).unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(path: &str, line: u32, description: &str, snippet: &str) -> NewIssue {
        NewIssue {
            path: PathBuf::from(path),
            line,
            description: description.to_string(),
            suggested_fix: String::new(),
            snippet: snippet.to_string(),
        }
    }

    fn scanned(paths: &[&str]) -> BTreeSet<PathBuf> {
        paths.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn new_finding_opens_an_issue() {
        let mut store = IssueStore::new();
        store.ingest(
            "check heap",
            &scanned(&["src/main.cpp"]),
            vec![finding(
                "src/main.cpp",
                10,
                "heap allocation",
                "QApplication* app = new QApplication(argc, argv);",
            )],
        );
        assert_eq!(store.open_count(), 1);
        let snap = store.snapshot();
        assert_eq!(snap[0].check_prompt, "check heap");
        assert_eq!(snap[0].line, 10);
    }

    #[test]
    fn rereported_issue_migrates_line_and_keeps_description() {
        let mut store = IssueStore::new();
        let snippet = "QApplication* app = new QApplication(argc, argv);";
        store.ingest(
            "check",
            &scanned(&["src/main.cpp"]),
            vec![finding("src/main.cpp", 10, "original description", snippet)],
        );
        let first_seen = store.snapshot()[0].first_seen;

        // Same construct, moved down three lines, newly worded description.
        store.ingest(
            "check",
            &scanned(&["src/main.cpp"]),
            vec![finding(
                "src/main.cpp",
                13,
                "completely different wording this time",
                "QApplication* app = new  QApplication(argc,  argv);",
            )],
        );

        assert_eq!(store.open_count(), 1);
        let snap = store.snapshot();
        assert_eq!(snap[0].line, 13);
        assert_eq!(snap[0].description, "original description");
        assert_eq!(snap[0].first_seen, first_seen);
    }

    #[test]
    fn different_snippet_opens_a_second_issue() {
        let mut store = IssueStore::new();
        store.ingest(
            "check",
            &scanned(&["a.rs"]),
            vec![finding("a.rs", 5, "unwrap call", "let x = foo().unwrap();")],
        );
        store.ingest(
            "check",
            &scanned(&["a.rs"]),
            vec![
                finding("a.rs", 5, "unwrap call", "let x = foo().unwrap();"),
                finding("a.rs", 40, "blocking sleep", "thread::sleep(Duration::MAX);"),
            ],
        );
        assert_eq!(store.open_count(), 2);
    }

    #[test]
    fn unseen_issue_in_scanned_file_resolves() {
        let mut store = IssueStore::new();
        store.ingest(
            "check",
            &scanned(&["a.rs"]),
            vec![finding("a.rs", 5, "bad", "snippet text here")],
        );
        store.ingest("check", &scanned(&["a.rs"]), vec![]);

        let snap = store.snapshot();
        assert_eq!(snap[0].status, IssueStatus::Resolved);
        assert_eq!(store.open_count(), 0);
    }

    #[test]
    fn unscanned_files_never_change_status() {
        let mut store = IssueStore::new();
        store.ingest(
            "check",
            &scanned(&["a.rs"]),
            vec![finding("a.rs", 5, "bad", "snippet")],
        );
        // Later run scanned only b.rs; a.rs's issue must stay open.
        store.ingest("check", &scanned(&["b.rs"]), vec![]);
        assert_eq!(store.open_count(), 1);
    }

    #[test]
    fn failed_check_with_empty_scanned_set_resolves_nothing() {
        let mut store = IssueStore::new();
        store.ingest(
            "check",
            &scanned(&["a.rs"]),
            vec![finding("a.rs", 5, "bad", "snippet")],
        );
        store.ingest("check", &BTreeSet::new(), vec![]);
        assert_eq!(store.open_count(), 1);
    }

    #[test]
    fn resolution_is_terminal() {
        let mut store = IssueStore::new();
        let snippet = "let x = foo().unwrap();";
        store.ingest(
            "check",
            &scanned(&["a.rs"]),
            vec![finding("a.rs", 5, "unwrap", snippet)],
        );
        store.ingest("check", &scanned(&["a.rs"]), vec![]);
        assert_eq!(store.open_count(), 0);

        // The identical construct reappears: the resolved record must stay
        // resolved and a fresh issue opens.
        store.ingest(
            "check",
            &scanned(&["a.rs"]),
            vec![finding("a.rs", 5, "unwrap", snippet)],
        );
        let snap = store.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].status, IssueStatus::Resolved);
        assert_eq!(snap[1].status, IssueStatus::Open);
    }

    #[test]
    fn whitespace_churn_does_not_break_identity() {
        assert_eq!(
            normalize_snippet("let  x =\n\t foo();"),
            normalize_snippet("let x = foo();")
        );
    }

    #[test]
    fn description_similarity_is_the_fallback() {
        let mut store = IssueStore::new();
        store.ingest(
            "check",
            &scanned(&["a.rs"]),
            vec![finding(
                "a.rs",
                5,
                "Magic number 42 should be a named constant",
                "",
            )],
        );
        store.ingest(
            "check",
            &scanned(&["a.rs"]),
            vec![finding(
                "a.rs",
                9,
                "Magic number 42 should be a named constant.",
                "",
            )],
        );
        assert_eq!(store.open_count(), 1);
        assert_eq!(store.snapshot()[0].line, 9);
    }

    #[test]
    fn same_file_requirement_blocks_cross_file_matches() {
        let mut store = IssueStore::new();
        let snippet = "let x = foo().unwrap();";
        store.ingest(
            "check",
            &scanned(&["a.rs", "b.rs"]),
            vec![finding("a.rs", 5, "unwrap", snippet)],
        );
        store.ingest(
            "check",
            &scanned(&["a.rs", "b.rs"]),
            vec![
                finding("a.rs", 5, "unwrap", snippet),
                finding("b.rs", 5, "unwrap", snippet),
            ],
        );
        assert_eq!(store.open_count(), 2);
    }

    #[test]
    fn tie_breaks_prefer_lowest_line() {
        let mut store = IssueStore::new();
        let snippet = "x.unwrap()";
        store.ingest(
            "check",
            &scanned(&["a.rs"]),
            vec![
                finding("a.rs", 30, "first duplicate", snippet),
                finding("a.rs", 10, "second duplicate elsewhere", "y.expect(\"..\")"),
            ],
        );
        // A new finding identical to both snippets: ties on similarity
        // would pick the lower line. Here only one candidate matches
        // exactly, so it absorbs the update.
        store.ingest(
            "check",
            &scanned(&["a.rs"]),
            vec![finding("a.rs", 31, "moved a line", snippet)],
        );
        let snap = store.snapshot();
        let migrated = snap.iter().find(|i| i.description == "first duplicate").unwrap();
        assert_eq!(migrated.line, 31);
    }

    #[test]
    fn report_grouping_orders_open_before_resolved() {
        let mut store = IssueStore::new();
        store.ingest(
            "check",
            &scanned(&["a.rs"]),
            vec![
                finding("a.rs", 20, "will resolve", "snippet one"),
                finding("a.rs", 5, "stays open", "totally unrelated snippet"),
            ],
        );
        store.ingest(
            "check",
            &scanned(&["a.rs"]),
            vec![finding("a.rs", 5, "stays open", "totally unrelated snippet")],
        );

        let grouped = store.iter_for_report();
        let issues = &grouped[Path::new("a.rs")];
        assert_eq!(issues[0].status, IssueStatus::Open);
        assert_eq!(issues[1].status, IssueStatus::Resolved);
    }
}

//! Markdown report rendering and atomic rewrite
//!
//! The report on disk is always the canonical rendering of the in-memory
//! issue store: every rewrite renders the complete document and swaps it
//! in with a temp-file + rename, so a reader never observes a torn file.
//! On startup an existing report is appended to the `.bak` file under a
//! timestamped header before the fresh one is created — the first sign of
//! life a user sees from the daemon.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::error::ScanError;
use crate::filter::{REPORT_BACKUP_FILE, REPORT_FILE};
use crate::issues::{Issue, IssueStatus, IssueStore};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct ReportWriter {
    path: PathBuf,
    backup_path: PathBuf,
    target_label: String,
    started: DateTime<Local>,
}

impl ReportWriter {
    pub fn new(target_dir: &Path) -> Self {
        ReportWriter {
            path: target_dir.join(REPORT_FILE),
            backup_path: target_dir.join(REPORT_BACKUP_FILE),
            target_label: target_dir.display().to_string(),
            started: Local::now(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a previous session's report to the backup file.
    pub fn rotate_existing(&self) -> Result<(), ScanError> {
        let previous = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(ScanError::ReportIo {
                    path: self.path.clone(),
                    error: e.to_string(),
                });
            }
        };

        let mut backup = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.backup_path)
            .map_err(|e| ScanError::ReportIo {
                path: self.backup_path.clone(),
                error: e.to_string(),
            })?;
        let header = format!(
            "\n\n<!-- rotated {} -->\n\n",
            Local::now().format(TIMESTAMP_FORMAT)
        );
        backup
            .write_all(header.as_bytes())
            .and_then(|_| backup.write_all(previous.as_bytes()))
            .map_err(|e| ScanError::ReportIo {
                path: self.backup_path.clone(),
                error: e.to_string(),
            })?;
        log::info!("previous report rotated to {}", self.backup_path.display());
        Ok(())
    }

    /// Render the whole store and swap the report atomically.
    pub fn rewrite(&self, store: &IssueStore) -> Result<(), ScanError> {
        let rendered = self.render(store);
        let parent = self.path.parent().unwrap_or(Path::new("."));
        let io_err = |e: std::io::Error| ScanError::ReportIo {
            path: self.path.clone(),
            error: e.to_string(),
        };

        // Same-directory temp file so the rename cannot cross filesystems.
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
        tmp.write_all(rendered.as_bytes()).map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| ScanError::ReportIo {
            path: self.path.clone(),
            error: e.to_string(),
        })?;
        Ok(())
    }

    fn render(&self, store: &IssueStore) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "# Code scanner results for {}\n\nStarted: {}\n",
            self.target_label,
            self.started.format(TIMESTAMP_FORMAT)
        ));

        let grouped = store.iter_for_report();
        if grouped.is_empty() {
            out.push_str("\nNo issues found yet.\n");
            return out;
        }

        for (path, issues) in grouped {
            out.push_str(&format!("\n## {}\n", path.display()));
            for issue in issues {
                out.push_str(&render_issue(issue));
            }
        }
        out
    }
}

fn render_issue(issue: &Issue) -> String {
    let status = match issue.status {
        IssueStatus::Open => "OPEN",
        IssueStatus::Resolved => "RESOLVED",
    };
    let mut block = format!(
        "\n### [{status}] line {} — {}\n\n*{}*\n\n{}\n\n",
        issue.line,
        issue.first_seen.format(TIMESTAMP_FORMAT),
        issue.check_prompt,
        issue.description.trim(),
    );
    block.push_str(&fenced(&issue.suggested_fix));
    block
}

/// Wrap the fix in a fence, widening it when the fix already contains
/// triple backticks.
fn fenced(fix: &str) -> String {
    let body = fix.trim();
    if body.is_empty() {
        return String::new();
    }
    let fence = if body.contains("```") { "````" } else { "```" };
    format!("{fence}\n{body}\n{fence}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issues::NewIssue;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn store_with_issue() -> IssueStore {
        let mut store = IssueStore::new();
        let scanned: BTreeSet<PathBuf> = [PathBuf::from("src/main.cpp")].into_iter().collect();
        store.ingest(
            "Check that stack allocation is preferred over heap allocation whenever possible.",
            &scanned,
            vec![NewIssue {
                path: PathBuf::from("src/main.cpp"),
                line: 12,
                description: "QApplication is heap-allocated but never deleted; stack allocation suffices.".into(),
                suggested_fix: "QApplication app(argc, argv);".into(),
                snippet: "QApplication* app = new QApplication(argc, argv);".into(),
            }],
        );
        store
    }

    #[test]
    fn report_contains_the_fixed_layout() {
        let dir = TempDir::new().unwrap();
        let writer = ReportWriter::new(dir.path());
        let store = store_with_issue();
        writer.rewrite(&store).unwrap();

        let text = std::fs::read_to_string(writer.path()).unwrap();
        assert!(text.starts_with("# Code scanner results for"));
        assert!(text.contains("## src/main.cpp"));
        assert!(text.contains("### [OPEN] line 12 — "));
        assert!(text.contains("*Check that stack allocation is preferred"));
        assert!(text.contains("```\nQApplication app(argc, argv);\n```"));
    }

    #[test]
    fn rewrite_replaces_the_whole_document() {
        let dir = TempDir::new().unwrap();
        let writer = ReportWriter::new(dir.path());
        let mut store = store_with_issue();
        writer.rewrite(&store).unwrap();

        let scanned: BTreeSet<PathBuf> = [PathBuf::from("src/main.cpp")].into_iter().collect();
        store.ingest("Check ...", &scanned, vec![]);
        writer.rewrite(&store).unwrap();

        let text = std::fs::read_to_string(writer.path()).unwrap();
        assert!(text.contains("### [RESOLVED] line 12"));
        assert!(!text.contains("### [OPEN]"));
    }

    #[test]
    fn empty_store_renders_placeholder() {
        let dir = TempDir::new().unwrap();
        let writer = ReportWriter::new(dir.path());
        writer.rewrite(&IssueStore::new()).unwrap();
        let text = std::fs::read_to_string(writer.path()).unwrap();
        assert!(text.contains("No issues found yet."));
    }

    #[test]
    fn rotation_appends_to_backup_with_header() {
        let dir = TempDir::new().unwrap();
        let writer = ReportWriter::new(dir.path());
        std::fs::write(writer.path(), "# old report\n").unwrap();

        writer.rotate_existing().unwrap();

        let backup = std::fs::read_to_string(dir.path().join(REPORT_BACKUP_FILE)).unwrap();
        assert!(backup.contains("<!-- rotated "));
        assert!(backup.contains("# old report"));
    }

    #[test]
    fn rotation_without_a_previous_report_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let writer = ReportWriter::new(dir.path());
        writer.rotate_existing().unwrap();
        assert!(!dir.path().join(REPORT_BACKUP_FILE).exists());
    }

    #[test]
    fn fix_containing_fences_gets_a_wider_fence() {
        let fix = "Use this instead:\n```cpp\nQApplication app(argc, argv);\n```";
        let rendered = fenced(fix);
        assert!(rendered.starts_with("````\n"));
        assert!(rendered.ends_with("````\n"));
    }

    #[test]
    fn report_equals_canonical_rendering_after_each_rewrite() {
        let dir = TempDir::new().unwrap();
        let writer = ReportWriter::new(dir.path());
        let store = store_with_issue();
        writer.rewrite(&store).unwrap();
        let on_disk = std::fs::read_to_string(writer.path()).unwrap();
        assert_eq!(on_disk, writer.render(&store));
    }
}

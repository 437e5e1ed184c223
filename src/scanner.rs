//! Scanner engine
//!
//! Drives the check schedule against the worktree. The engine consumes the
//! watcher's ChangeSet cell at well-defined points (start of a cycle and
//! between checks) and implements the watermark re-scan: when the worktree
//! mutates mid-pass in a way that invalidates an already-executed check,
//! the executed prefix is re-run after the pass, and passes repeat until
//! one completes cleanly. On a clean pass every check has seen content
//! equal to the current worktree for every file it scanned, and the engine
//! goes idle until the watcher publishes something new.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::batch::{plan_batches, prompt_budget};
use crate::config::{CheckRef, Config};
use crate::git::{ChangeCell, ChangeSet, Repository, WatcherState, hash_bytes};
use crate::issues::{IssueStore, NewIssue};
use crate::llm::{LlmClient, MAX_TOOL_ITERATIONS, QueryAbort, RawIssue, estimate_tokens};
use crate::report::ReportWriter;
use crate::tools::ToolExecutor;

const SYSTEM_PROMPT: &str = "You are a code auditor reviewing uncommitted changes in a Git \
     repository. Apply exactly the check you are given; do not invent unrelated findings. \
     You may call the provided tools to explore the codebase for context. Your final reply \
     must be a single JSON object of the form {\"issues\": [{\"file\": \"relative/path\", \
     \"line_number\": 1, \"description\": \"...\", \"suggested_fix\": \"...\"}]}. \
     Report no issues as {\"issues\": []}.";

/// Idle poll cadence while waiting for the watcher.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// The scanner stopped because shutdown was requested.
#[derive(Debug)]
pub struct Interrupted;

/// What one executed check touched: per visited file, the content hash it
/// consumed, or `None` for a path it scanned as deleted.
struct CheckFootprint {
    group: usize,
    files: BTreeMap<PathBuf, Option<String>>,
}

pub struct Scanner {
    repo: Repository,
    config: Config,
    schedule: Vec<CheckRef>,
    client: LlmClient,
    tools: ToolExecutor,
    store: IssueStore,
    report: ReportWriter,
    cell: Arc<ChangeCell>,
    shutdown: Arc<AtomicBool>,
}

impl Scanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Repository,
        config: Config,
        client: LlmClient,
        tools: ToolExecutor,
        report: ReportWriter,
        cell: Arc<ChangeCell>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let schedule = config.schedule();
        Scanner {
            repo,
            config,
            schedule,
            client,
            tools,
            store: IssueStore::new(),
            report,
            cell,
            shutdown,
        }
    }

    /// Main loop: wait for a ChangeSet, run scan cycles, idle in between.
    pub fn run(&mut self) {
        let mut consumed = 0u64;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let (generation, state) = self.cell.current();
            if generation <= consumed {
                std::thread::sleep(IDLE_POLL);
                continue;
            }
            consumed = generation;
            match state {
                Some(WatcherState::Ready(set)) if !set.is_empty() => {
                    log::info!(
                        "starting scan cycle: {} changed files, {} checks",
                        set.files.len(),
                        self.schedule.len()
                    );
                    self.tools.invalidate_index();
                    match self.run_cycle(set, generation) {
                        Ok(final_generation) => {
                            consumed = final_generation;
                            log::info!(
                                "scan cycle complete, {} open issues; idle",
                                self.store.open_count()
                            );
                        }
                        Err(Interrupted) => return,
                    }
                }
                // Waiting, or an empty set: nothing to do until the
                // watcher reports again.
                _ => {}
            }
        }
    }

    /// Run passes over the schedule until one completes without a
    /// mid-pass mutation invalidating executed work. Returns the last
    /// watcher generation incorporated into the cycle.
    fn run_cycle(
        &mut self,
        initial: ChangeSet,
        initial_generation: u64,
    ) -> Result<u64, Interrupted> {
        let mut snapshot = initial;
        let mut generation = initial_generation;
        // Latest footprint per schedule index, across passes.
        let mut footprints: HashMap<usize, CheckFootprint> = HashMap::new();
        // Pass range is [0, range_end).
        let mut range_end = self.schedule.len();

        loop {
            let mut stale_end: Option<usize> = None;

            for idx in 0..range_end {
                if self.shutdown.load(Ordering::Relaxed) {
                    return Err(Interrupted);
                }

                // Consume the latest published state before each check.
                let (cell_generation, cell_state) = self.cell.current();
                if cell_generation > generation {
                    generation = cell_generation;
                    if let Some(WatcherState::Ready(new_set)) = cell_state
                        && new_set != snapshot
                    {
                        let invalidated = self.invalidated_indices(&footprints, &snapshot, &new_set);
                        if let Some(max_invalid) = invalidated.iter().max().copied() {
                            // Everything executed before this detection
                            // point is suspect, plus any older execution
                            // the new content invalidates.
                            let k = max_invalid.max(idx.saturating_sub(1));
                            stale_end = Some(stale_end.map_or(k, |s: usize| s.max(k)));
                            log::info!(
                                "worktree changed mid-pass; will re-run checks 0..={k} after this pass"
                            );
                        }
                        self.tools.invalidate_index();
                        snapshot = new_set;
                    }
                }

                let footprint = self.execute_check(idx, &snapshot)?;
                footprints.insert(idx, footprint);
            }

            match stale_end {
                Some(k) => {
                    range_end = k + 1;
                }
                None => return Ok(generation),
            }
        }
    }

    /// Indices whose most recent execution is contradicted by `new_set`.
    fn invalidated_indices(
        &self,
        footprints: &HashMap<usize, CheckFootprint>,
        old_set: &ChangeSet,
        new_set: &ChangeSet,
    ) -> Vec<usize> {
        let added: Vec<&PathBuf> = new_set
            .files
            .keys()
            .filter(|path| !old_set.files.contains_key(*path))
            .collect();

        footprints
            .iter()
            .filter(|(_, footprint)| {
                let visited_changed = footprint
                    .files
                    .iter()
                    .any(|(path, consumed)| new_set.files.get(path).cloned() != *consumed);
                let relevant_addition = added
                    .iter()
                    .any(|path| self.config.groups[footprint.group].matches(path));
                visited_changed || relevant_addition
            })
            .map(|(idx, _)| *idx)
            .collect()
    }

    /// Execute one check: select files, read them (the snapshot at
    /// dispatch time), pack batches, query the model, ingest once after
    /// the last batch, rewrite the report.
    fn execute_check(
        &mut self,
        idx: usize,
        snapshot: &ChangeSet,
    ) -> Result<CheckFootprint, Interrupted> {
        let check = self.schedule[idx];
        let group = self.config.group(check).clone();
        let prompt = self.config.prompt(check).to_string();

        // Deleted files matching the group count as scanned with zero
        // issues, which is what resolves their leftovers.
        let deleted: Vec<PathBuf> = snapshot
            .deleted
            .iter()
            .filter(|path| group.matches(path))
            .cloned()
            .collect();

        let mut contents: BTreeMap<PathBuf, String> = BTreeMap::new();
        let mut hashes: BTreeMap<PathBuf, Option<String>> = BTreeMap::new();
        for path in snapshot.files.keys().filter(|path| group.matches(path)) {
            match std::fs::read(self.repo.root().join(path)) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        hashes.insert(path.clone(), Some(hash_bytes(text.as_bytes())));
                        contents.insert(path.clone(), text);
                    }
                    Err(_) => {
                        log::debug!("skipping non-UTF-8 file {}", path.display());
                    }
                },
                // Vanished between the ChangeSet and this read: scanned as
                // deleted.
                Err(_) => {
                    hashes.insert(path.clone(), None);
                }
            }
        }

        if contents.is_empty() && deleted.is_empty() && hashes.is_empty() {
            log::debug!("check {idx} matches no changed files; skipping");
            return Ok(CheckFootprint {
                group: check.group,
                files: BTreeMap::new(),
            });
        }

        let estimates: Vec<(PathBuf, usize)> = contents
            .iter()
            .map(|(path, text)| (path.clone(), estimate_tokens(text) + 16))
            .collect();
        let budget = prompt_budget(self.config.llm.context_limit);
        let plan = plan_batches(&estimates, budget);

        let mut scanned: BTreeSet<PathBuf> = deleted.iter().cloned().collect();
        for (path, state) in &hashes {
            if state.is_none() {
                scanned.insert(path.clone());
            }
        }
        let mut produced: Vec<NewIssue> = Vec::new();

        log::info!(
            "check {}/{}: \"{}\" over {} files in {} batches",
            idx + 1,
            self.schedule.len(),
            summarize(&prompt),
            contents.len(),
            plan.batches.len()
        );

        for batch in &plan.batches {
            if self.shutdown.load(Ordering::Relaxed) {
                // Abandon unsent work; nothing partial reaches the tracker.
                return Err(Interrupted);
            }
            let user_prompt = build_user_prompt(&prompt, batch, &contents);
            match self
                .client
                .query(SYSTEM_PROMPT, &user_prompt, Some(&self.tools), MAX_TOOL_ITERATIONS)
            {
                Ok(issues) => {
                    for path in batch {
                        scanned.insert(path.clone());
                    }
                    produced.extend(convert_issues(issues, batch, &contents));
                }
                Err(QueryAbort::Shutdown) => return Err(Interrupted),
                Err(QueryAbort::Abandoned) => {
                    // The batch never produced a result; its files are not
                    // "scanned", so their issues cannot resolve from this
                    // run.
                    continue;
                }
            }
        }

        // Skipped (oversized) files were never scanned; keep them out of
        // both resolution scope and the staleness footprint.
        let mut footprint_files: BTreeMap<PathBuf, Option<String>> = BTreeMap::new();
        for path in &scanned {
            footprint_files.insert(path.clone(), hashes.get(path).cloned().flatten());
        }

        self.store.ingest(&prompt, &scanned, produced);
        if let Err(e) = self.report.rewrite(&self.store) {
            log::error!("report rewrite failed: {e}");
        }

        Ok(CheckFootprint {
            group: check.group,
            files: footprint_files,
        })
    }

    #[cfg(test)]
    fn store(&self) -> &IssueStore {
        &self.store
    }
}

/// One batch's user prompt: the check text, the reporting contract, and
/// every file with numbered lines.
fn build_user_prompt(
    check_prompt: &str,
    batch: &[PathBuf],
    contents: &BTreeMap<PathBuf, String>,
) -> String {
    let mut out = String::new();
    out.push_str(check_prompt.trim());
    out.push_str(
        "\n\nAnalyze the files below against this check. \
         Line numbers are shown in the left margin.\n",
    );
    for path in batch {
        let Some(text) = contents.get(path) else {
            continue;
        };
        out.push_str(&format!("\n--- {} ---\n", path.display()));
        for (number, line) in text.lines().enumerate() {
            out.push_str(&format!("{:>5} | {line}\n", number + 1));
        }
    }
    out
}

/// Turn wire issues into tracker entries, extracting the identity snippet
/// from the content the check actually consumed. Issues pointing at files
/// outside this batch are dropped: resolution scoping relies on issues
/// living in scanned files.
fn convert_issues(
    issues: Vec<RawIssue>,
    batch: &[PathBuf],
    contents: &BTreeMap<PathBuf, String>,
) -> Vec<NewIssue> {
    issues
        .into_iter()
        .filter_map(|issue| {
            let path = PathBuf::from(issue.file.trim_start_matches("./"));
            if !batch.contains(&path) {
                log::debug!(
                    "dropping issue for {} (not part of this batch)",
                    path.display()
                );
                return None;
            }
            let snippet = contents
                .get(&path)
                .and_then(|text| text.lines().nth(issue.line_number as usize - 1))
                .unwrap_or("")
                .to_string();
            Some(NewIssue {
                path,
                line: issue.line_number,
                description: issue.description,
                suggested_fix: issue.suggested_fix,
                snippet,
            })
        })
        .collect()
}

fn summarize(prompt: &str) -> String {
    const LIMIT: usize = 60;
    let line = prompt.lines().next().unwrap_or("");
    if line.len() <= LIMIT {
        line.to_string()
    } else {
        let mut end = LIMIT;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &line[..end])
    }
}

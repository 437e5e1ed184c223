//! Context-window packing
//!
//! Files for one check are packed into batches that fit the prompt budget
//! (55% of the context limit — the rest is headroom for the system prompt,
//! tool traffic, and the response). Packing prefers directory locality:
//! when everything does not fit in one batch, the deepest directories are
//! packed first and siblings ride together, so the model sees related
//! files side by side.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Fraction of the context limit available to batch content.
const PROMPT_BUDGET_RATIO: f64 = 0.55;

pub fn prompt_budget(context_limit: usize) -> usize {
    (context_limit as f64 * PROMPT_BUDGET_RATIO) as usize
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// Batches in dispatch order; each is a set of repo-relative paths.
    pub batches: Vec<Vec<PathBuf>>,
    /// Files whose single-file estimate exceeds the budget. They never
    /// reach the model.
    pub skipped: Vec<PathBuf>,
}

/// Pack `files` (path, estimated tokens) into batches within `budget`.
pub fn plan_batches(files: &[(PathBuf, usize)], budget: usize) -> Plan {
    let mut plan = Plan::default();
    if files.is_empty() {
        return plan;
    }

    let total: usize = files.iter().map(|(_, tokens)| tokens).sum();
    if total <= budget {
        plan.batches
            .push(files.iter().map(|(path, _)| path.clone()).collect());
        return plan;
    }

    pack_directory(Path::new(""), files, budget, &mut plan);
    plan
}

/// Recursive descent over the directory tree rooted at `prefix`.
///
/// A subtree that fits becomes one batch. Otherwise child directories are
/// packed first (depth-first, so the deepest groups form before their
/// parents), then the directory's own files ride together if they fit,
/// and individually if not.
fn pack_directory(prefix: &Path, files: &[(PathBuf, usize)], budget: usize, plan: &mut Plan) {
    let total: usize = files.iter().map(|(_, tokens)| tokens).sum();
    if total <= budget {
        plan.batches
            .push(files.iter().map(|(path, _)| path.clone()).collect());
        return;
    }

    // Partition into direct children files and per-subdirectory groups.
    let mut own_files: Vec<(PathBuf, usize)> = Vec::new();
    let mut subdirs: BTreeMap<PathBuf, Vec<(PathBuf, usize)>> = BTreeMap::new();
    for (path, tokens) in files {
        let rest = path.strip_prefix(prefix).unwrap_or(path);
        let mut components = rest.components();
        let first = components.next();
        match (first, components.next()) {
            (Some(head), Some(_)) => {
                subdirs
                    .entry(prefix.join(head))
                    .or_default()
                    .push((path.clone(), *tokens));
            }
            _ => own_files.push((path.clone(), *tokens)),
        }
    }

    for (dir, group) in &subdirs {
        pack_directory(dir, group, budget, plan);
    }

    if own_files.is_empty() {
        return;
    }
    let own_total: usize = own_files.iter().map(|(_, tokens)| tokens).sum();
    if own_total <= budget {
        plan.batches
            .push(own_files.into_iter().map(|(path, _)| path).collect());
        return;
    }
    for (path, tokens) in own_files {
        if tokens > budget {
            log::warn!(
                "{} (~{tokens} tokens) exceeds the prompt budget of {budget}; skipping",
                path.display()
            );
            plan.skipped.push(path);
        } else {
            plan.batches.push(vec![path]);
        }
    }
}

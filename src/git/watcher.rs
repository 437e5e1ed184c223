//! Worktree polling and change publication
//!
//! The watcher runs on its own thread at a fixed cadence. Each poll either
//! publishes a [`WatcherState::Waiting`] (repository mid-merge/mid-rebase)
//! or assembles a [`ChangeSet`] and publishes it when it differs from the
//! last published one. Publication goes into a single-slot cell with
//! latest-wins semantics; the scanner reads the most recent state at its
//! own pace and stale intermediate sets are coalesced away.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{after, select, tick};

use crate::config::CheckGroup;
use crate::filter::FileFilter;
use crate::git::Repository;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Uncommitted, non-excluded worktree state at one poll.
///
/// `files` maps repo-relative paths to content hashes; `deleted` are paths
/// present in HEAD or the index but gone from the worktree. Identity is the
/// hash map, so a `touch` without a content change publishes nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub files: BTreeMap<PathBuf, String>,
    pub deleted: BTreeSet<PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.deleted.is_empty()
    }

    /// Added / removed / modified-by-content relative to `older`.
    pub fn delta(&self, older: &ChangeSet) -> ChangeDelta {
        let mut delta = ChangeDelta::default();
        for (path, hash) in &self.files {
            match older.files.get(path) {
                None => delta.added.push(path.clone()),
                Some(old_hash) if old_hash != hash => delta.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in older.files.keys() {
            if !self.files.contains_key(path) {
                delta.removed.push(path.clone());
            }
        }
        for path in &self.deleted {
            if !older.deleted.contains(path) && !delta.removed.contains(path) {
                delta.removed.push(path.clone());
            }
        }
        delta
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeDelta {
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
}

impl ChangeDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// What the watcher last published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherState {
    /// Repository is mid-merge or mid-rebase; no ChangeSet is valid.
    Waiting,
    Ready(ChangeSet),
}

/// Single-slot, latest-wins publication cell.
///
/// The watcher overwrites the slot; the scanner polls it. The generation
/// counter lets the scanner sleep until something new lands without ever
/// blocking the watcher.
#[derive(Debug, Default)]
pub struct ChangeCell {
    inner: Mutex<CellInner>,
}

#[derive(Debug, Default)]
struct CellInner {
    state: Option<WatcherState>,
    generation: u64,
}

impl ChangeCell {
    pub fn new() -> Arc<Self> {
        Arc::new(ChangeCell::default())
    }

    pub fn publish(&self, state: WatcherState) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = Some(state);
        inner.generation += 1;
    }

    /// Current generation and state. Generation 0 means nothing published.
    pub fn current(&self) -> (u64, Option<WatcherState>) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        (inner.generation, inner.state.clone())
    }

    pub fn generation(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .generation
    }
}

pub struct GitWatcher {
    repo: Repository,
    groups: Vec<CheckGroup>,
    base_commit: Option<String>,
    cell: Arc<ChangeCell>,
    shutdown: Arc<AtomicBool>,
    interval: Duration,
}

impl GitWatcher {
    pub fn new(
        repo: Repository,
        groups: Vec<CheckGroup>,
        base_commit: Option<String>,
        cell: Arc<ChangeCell>,
        shutdown: Arc<AtomicBool>,
        interval: Duration,
    ) -> Self {
        GitWatcher {
            repo,
            groups,
            base_commit,
            cell,
            shutdown,
            interval,
        }
    }

    /// Run the poll loop on a dedicated thread until shutdown.
    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("git-watcher".into())
            .spawn(move || self.run())
            .expect("failed to spawn watcher thread")
    }

    fn run(self) {
        let mut last_published: Option<ChangeSet> = None;

        // First emission is unconditional, even when empty, so the scanner
        // can enter idle instead of waiting a full interval.
        self.poll(&mut last_published, true);

        let ticker = tick(self.interval);
        loop {
            select! {
                recv(ticker) -> _ => {}
                // Re-check shutdown at a finer grain than the poll cadence.
                recv(after(Duration::from_millis(500))) -> _ => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    continue;
                }
            }
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            self.poll(&mut last_published, false);
        }
    }

    fn poll(&self, last_published: &mut Option<ChangeSet>, force: bool) {
        if self.repo.in_conflicted_operation() {
            log::info!("repository is mid-merge/mid-rebase; waiting");
            self.cell.publish(WatcherState::Waiting);
            // A Waiting publication invalidates the comparison base: once
            // the operation finishes, the next set must be re-published.
            *last_published = None;
            return;
        }

        let changeset = match self.assemble() {
            Ok(set) => set,
            Err(e) => {
                log::warn!("change detection failed, will retry: {e:#}");
                return;
            }
        };

        let mut should_publish = force;
        match last_published.as_ref() {
            None => should_publish = true,
            Some(previous) => {
                let delta = changeset.delta(previous);
                if !delta.is_empty() {
                    log::info!(
                        "worktree changed: {} added, {} removed, {} modified",
                        delta.added.len(),
                        delta.removed.len(),
                        delta.modified.len()
                    );
                    should_publish = true;
                }
            }
        }

        if should_publish {
            *last_published = Some(changeset.clone());
            self.cell.publish(WatcherState::Ready(changeset));
        }
    }

    /// One ChangeSet: uncommitted paths, filtered, content-hashed.
    fn assemble(&self) -> anyhow::Result<ChangeSet> {
        let changed = self.repo.changed_paths(self.base_commit.as_deref())?;

        let candidates: Vec<PathBuf> = changed.present.iter().cloned().collect();
        let filter = FileFilter::build(&self.repo, &self.groups, &candidates);

        let mut set = ChangeSet::default();
        for path in changed.present {
            if !filter.included(&path) {
                continue;
            }
            // A file can vanish between `git status` and the hash read;
            // that poll simply sees it as deleted.
            match self.repo.file_hash(&path) {
                Some(hash) => {
                    set.files.insert(path, hash);
                }
                None => {
                    set.deleted.insert(path);
                }
            }
        }
        for path in changed.deleted {
            if filter.included(&path) {
                set.deleted.insert(path);
            }
        }
        Ok(set)
    }
}

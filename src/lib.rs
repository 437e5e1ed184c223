//! code-scanner: a daemon that continuously re-audits a Git working tree
//! with a local LLM.
//!
//! The moving parts, roughly in data-flow order: the [`git`] watcher polls
//! the worktree and publishes ChangeSets; the [`scanner`] engine consumes
//! them, filters paths through [`filter`], packs files with [`batch`],
//! queries the model through [`llm`] with the exploration tools in
//! [`tools`] bound, tracks findings in [`issues`], and rewrites the
//! Markdown report via [`report`]. The [`supervisor`] owns startup
//! validation, the lock file, signals, and thread lifecycle.

pub mod batch;
pub mod config;
pub mod error;
pub mod exec;
pub mod filter;
pub mod git;
pub mod issues;
pub mod llm;
pub mod report;
pub mod scanner;
pub mod supervisor;
pub mod tools;

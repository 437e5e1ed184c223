//! Codebase-exploration tools callable by the model
//!
//! The executor is a stateless dispatcher: every call takes a tool name
//! plus a JSON arguments object and returns a JSON result. Errors are
//! returned *to the model* as structured `{"error": {...}}` objects — a
//! misbehaving tool call never disturbs the scanner. All paths are
//! resolved inside the repository root; escapes are denied before any I/O
//! happens. Tools never mutate the repository.

mod ctags;
mod files;
mod search;

pub use ctags::CtagsIndex;

use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use serde_json::{Value, json};

use crate::git::Repository;
use crate::llm::{ToolRunner, ToolSpec};

/// Result page sizes and chunk limits, shared by the individual tools.
pub(crate) const SEARCH_PAGE: usize = 50;
pub(crate) const LISTING_PAGE: usize = 100;
/// read_file chunks are capped at ~4000 tokens (chars/4 heuristic).
pub(crate) const READ_CHUNK_TOKENS: usize = 4000;

pub struct ToolExecutor {
    repo: Repository,
    ctags: Mutex<CtagsIndex>,
}

#[derive(Debug)]
pub(crate) enum ToolError {
    PathEscape {
        path: String,
    },
    NotFound {
        path: String,
        suggestions: Vec<String>,
    },
    BinaryFile {
        path: String,
    },
    Unavailable {
        tool: String,
        message: String,
    },
    InvalidArguments {
        message: String,
    },
    Failed {
        message: String,
    },
}

impl ToolError {
    /// Structured error object handed back to the model.
    pub(crate) fn to_json(&self) -> Value {
        match self {
            ToolError::PathEscape { path } => json!({
                "error": {
                    "kind": "path_escape",
                    "message": format!("path {path:?} escapes the repository root"),
                }
            }),
            ToolError::NotFound { path, suggestions } => json!({
                "error": {
                    "kind": "not_found",
                    "message": format!("no such path {path:?} in the repository"),
                    "did_you_mean": suggestions,
                }
            }),
            ToolError::BinaryFile { path } => json!({
                "error": {
                    "kind": "binary_file",
                    "message": format!("{path:?} looks binary and cannot be read as text"),
                }
            }),
            ToolError::Unavailable { tool, message } => json!({
                "error": {
                    "kind": "tool_unavailable",
                    "message": format!("{tool}: {message}"),
                }
            }),
            ToolError::InvalidArguments { message } => json!({
                "error": {
                    "kind": "invalid_arguments",
                    "message": message,
                }
            }),
            ToolError::Failed { message } => json!({
                "error": {
                    "kind": "failed",
                    "message": message,
                }
            }),
        }
    }
}

pub(crate) type ToolResult = Result<Value, ToolError>;

impl ToolExecutor {
    pub fn new(repo: Repository) -> Self {
        ToolExecutor {
            repo,
            ctags: Mutex::new(CtagsIndex::empty()),
        }
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// Mark the ctags index stale. The scanner calls this whenever the
    /// worktree changes; the index rebuilds lazily on next use.
    pub fn invalidate_index(&self) {
        self.ctags.lock().unwrap_or_else(|e| e.into_inner()).invalidate();
    }

    pub(crate) fn with_index<T>(
        &self,
        f: impl FnOnce(&CtagsIndex) -> Result<T, ToolError>,
    ) -> Result<T, ToolError> {
        let mut index = self.ctags.lock().unwrap_or_else(|e| e.into_inner());
        index.ensure_fresh(self.repo.root())?;
        f(&index)
    }

    fn dispatch(&self, name: &str, arguments: &Value) -> ToolResult {
        match name {
            "search_text" => search::search_text(self, arguments),
            "read_file" => files::read_file(self, arguments),
            "list_directory" => files::list_directory(self, arguments),
            "get_file_diff" => files::get_file_diff(self, arguments),
            "get_file_summary" => ctags::get_file_summary(self, arguments),
            "symbol_exists" => ctags::symbol_exists(self, arguments),
            "find_definition" => ctags::find_definition(self, arguments),
            "find_symbols" => ctags::find_symbols(self, arguments),
            "get_enclosing_scope" => ctags::get_enclosing_scope(self, arguments),
            "find_usages" => ctags::find_usages(self, arguments),
            other => Err(ToolError::InvalidArguments {
                message: format!("unknown tool {other:?}"),
            }),
        }
    }

    /// Resolve a model-supplied path to (absolute, repo-relative) form.
    ///
    /// `..` components are denied outright; existing paths additionally go
    /// through symlink resolution and a containment check, so a symlink
    /// pointing outside the repository is also refused.
    pub(crate) fn resolve(&self, raw: &str) -> Result<(PathBuf, PathBuf), ToolError> {
        if raw.is_empty() {
            return Err(ToolError::InvalidArguments {
                message: "path must not be empty".into(),
            });
        }
        let requested = Path::new(raw);
        if requested.is_absolute()
            || requested
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ToolError::PathEscape { path: raw.into() });
        }

        let rel: PathBuf = requested
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        let absolute = self.repo.root().join(&rel);

        if !absolute.exists() {
            return Err(ToolError::NotFound {
                path: raw.into(),
                suggestions: self.similar_paths(&rel),
            });
        }

        let resolved = dunce::canonicalize(&absolute).map_err(|e| ToolError::Failed {
            message: format!("cannot resolve {raw:?}: {e}"),
        })?;
        if !resolved.starts_with(self.repo.root()) {
            return Err(ToolError::PathEscape { path: raw.into() });
        }

        Ok((resolved, rel))
    }

    /// Did-you-mean candidates for a missing path, ranked by file-name
    /// similarity.
    fn similar_paths(&self, missing: &Path) -> Vec<String> {
        let Some(wanted) = missing.file_name().map(|n| n.to_string_lossy().to_lowercase())
        else {
            return Vec::new();
        };

        let mut scored: Vec<(f64, String)> = Vec::new();
        let mut stack = vec![self.repo.root().to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let score = strsim::jaro_winkler(&wanted, &name.to_lowercase());
                if score >= 0.82
                    && let Ok(rel) = path.strip_prefix(self.repo.root())
                {
                    scored.push((score, rel.to_string_lossy().to_string()));
                }
            }
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(5);
        scored.into_iter().map(|(_, path)| path).collect()
    }
}

impl ToolRunner for ToolExecutor {
    fn specs(&self) -> Vec<ToolSpec> {
        tool_specs()
    }

    fn run(&self, name: &str, arguments: &Value) -> Value {
        match self.dispatch(name, arguments) {
            Ok(result) => result,
            Err(err) => {
                log::debug!("tool {name} returned an error to the model");
                err.to_json()
            }
        }
    }
}

/// Deserialize a tool's arguments object.
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(arguments: &Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments.clone()).map_err(|e| ToolError::InvalidArguments {
        message: format!("bad arguments: {e}"),
    })
}

/// Wrap a result page in the uniform pagination envelope.
///
/// `total_key` names the `total_*` field (e.g. "total_matches"). When the
/// page is truncated a human-readable warning tells the model how to ask
/// for the rest.
pub(crate) fn paginated(
    mut body: serde_json::Map<String, Value>,
    offset: usize,
    page_len: usize,
    total: usize,
    total_key: &str,
) -> Value {
    let has_more = offset + page_len < total;
    body.insert("offset".into(), json!(offset));
    body.insert("has_more".into(), json!(has_more));
    body.insert(
        "next_offset".into(),
        if has_more {
            json!(offset + page_len)
        } else {
            Value::Null
        },
    );
    body.insert(total_key.into(), json!(total));
    if has_more {
        body.insert(
            "warning".into(),
            json!(format!(
                "showing {page_len} of {total}; call again with offset={} for more",
                offset + page_len
            )),
        );
    }
    Value::Object(body)
}

/// NUL-byte heuristic over the first 8 KiB.
pub(crate) fn is_binary(path: &Path) -> bool {
    use std::io::Read;
    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    let mut buf = [0u8; 8192];
    let mut handle = file.take(8192);
    let Ok(n) = handle.read(&mut buf) else {
        return false;
    };
    buf[..n].contains(&0)
}

/// All ten tool descriptions in JSON-schema form, shared by both backends.
pub fn tool_specs() -> Vec<ToolSpec> {
    fn spec(name: &str, description: &str, parameters: Value) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    vec![
        spec(
            "search_text",
            "Search file contents for one or more patterns. Results are paginated \
             (50 per page) with definitions ordered before usages.",
            json!({
                "type": "object",
                "properties": {
                    "patterns": {"type": "array", "items": {"type": "string"},
                                 "description": "Patterns to search for"},
                    "is_regex": {"type": "boolean", "description": "Treat patterns as regular expressions"},
                    "whole_word": {"type": "boolean"},
                    "case_sensitive": {"type": "boolean"},
                    "file_pattern": {"type": "string", "description": "Glob restricting searched files"},
                    "offset": {"type": "integer", "description": "Pagination offset"}
                },
                "required": ["patterns"]
            }),
        ),
        spec(
            "read_file",
            "Read a text file, optionally a line range. Long files are chunked; the \
             response says where to continue.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "start_line": {"type": "integer", "minimum": 1},
                    "end_line": {"type": "integer", "minimum": 1}
                },
                "required": ["path"]
            }),
        ),
        spec(
            "list_directory",
            "List files (with line counts) and subdirectories. Hidden and build-artifact \
             directories are filtered. 100 entries per page.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory, empty for the repository root"},
                    "recursive": {"type": "boolean"},
                    "offset": {"type": "integer"}
                }
            }),
        ),
        spec(
            "get_file_diff",
            "Unified diff of a file against HEAD.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "context_lines": {"type": "integer", "minimum": 0, "maximum": 10}
                },
                "required": ["path"]
            }),
        ),
        spec(
            "get_file_summary",
            "Classes, functions, imports and constants of a file, with line numbers.",
            json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        ),
        spec(
            "symbol_exists",
            "Check whether a symbol is defined anywhere; returns up to 10 locations.",
            json!({
                "type": "object",
                "properties": {
                    "symbol": {"type": "string"},
                    "kind": {"type": "string", "description": "Optional ctags kind filter, e.g. function"}
                },
                "required": ["symbol"]
            }),
        ),
        spec(
            "find_definition",
            "Find the definitions of a symbol with scope and signature.",
            json!({
                "type": "object",
                "properties": {
                    "symbol": {"type": "string"},
                    "kind": {"type": "string"}
                },
                "required": ["symbol"]
            }),
        ),
        spec(
            "find_symbols",
            "Find symbols matching a wildcard pattern (* and ?).",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "kind": {"type": "string"},
                    "case_sensitive": {"type": "boolean"}
                },
                "required": ["pattern"]
            }),
        ),
        spec(
            "get_enclosing_scope",
            "The innermost symbol containing a line, with its source.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "line": {"type": "integer", "minimum": 1}
                },
                "required": ["path", "line"]
            }),
        ),
        spec(
            "find_usages",
            "References to a symbol, split into definitions and usages.",
            json!({
                "type": "object",
                "properties": {
                    "symbol": {"type": "string"},
                    "path": {"type": "string", "description": "Restrict to one file"},
                    "include_definitions": {"type": "boolean"}
                },
                "required": ["symbol"]
            }),
        ),
    ]
}

//! File reading, directory listing, and diff tools

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Value, json};

use super::{LISTING_PAGE, READ_CHUNK_TOKENS, ToolError, ToolExecutor, ToolResult, parse_args};
use crate::llm::estimate_tokens;

/// Directory names never worth exploring: build artifacts and caches.
const ARTIFACT_DIRS: &[&str] = &[
    "target",
    "node_modules",
    "build",
    "dist",
    "out",
    "__pycache__",
    "venv",
    ".venv",
    "CMakeFiles",
];

#[derive(Deserialize)]
struct ReadFileArgs {
    path: String,
    #[serde(default)]
    start_line: Option<u32>,
    #[serde(default)]
    end_line: Option<u32>,
}

pub(crate) fn read_file(executor: &ToolExecutor, arguments: &Value) -> ToolResult {
    let args: ReadFileArgs = parse_args(arguments)?;
    let (abs, rel) = executor.resolve(&args.path)?;

    if abs.is_dir() {
        return Err(ToolError::InvalidArguments {
            message: format!("{:?} is a directory; use list_directory", args.path),
        });
    }
    if super::is_binary(&abs) {
        return Err(ToolError::BinaryFile {
            path: args.path.clone(),
        });
    }

    let content = std::fs::read_to_string(&abs).map_err(|e| ToolError::Failed {
        message: format!("cannot read {:?}: {e}", args.path),
    })?;
    let lines: Vec<&str> = content.lines().collect();
    let total_lines = lines.len();

    let start = args.start_line.unwrap_or(1).max(1) as usize;
    let end = args
        .end_line
        .map(|e| (e as usize).min(total_lines))
        .unwrap_or(total_lines);
    if start > total_lines && total_lines > 0 {
        return Err(ToolError::InvalidArguments {
            message: format!("start_line {start} is past the end of the file ({total_lines} lines)"),
        });
    }

    // Emit numbered lines until the chunk budget runs out; tell the model
    // where to continue.
    let mut rendered = String::new();
    let mut emitted_end = start.saturating_sub(1);
    for (idx, line) in lines.iter().enumerate().take(end).skip(start - 1) {
        let numbered = format!("{:>5} | {line}\n", idx + 1);
        if estimate_tokens(&rendered) + estimate_tokens(&numbered) > READ_CHUNK_TOKENS
            && !rendered.is_empty()
        {
            break;
        }
        rendered.push_str(&numbered);
        emitted_end = idx + 1;
    }

    let has_more = emitted_end < end;
    let mut body = serde_json::Map::new();
    body.insert("path".into(), json!(rel.to_string_lossy()));
    body.insert("content".into(), json!(rendered));
    body.insert("start_line".into(), json!(start));
    body.insert("end_line".into(), json!(emitted_end));
    body.insert("total_lines".into(), json!(total_lines));
    body.insert("has_more".into(), json!(has_more));
    body.insert(
        "next_start_line".into(),
        if has_more {
            json!(emitted_end + 1)
        } else {
            Value::Null
        },
    );
    if has_more {
        body.insert(
            "warning".into(),
            json!(format!(
                "file truncated at line {emitted_end}; continue with start_line={}",
                emitted_end + 1
            )),
        );
    }
    Ok(Value::Object(body))
}

#[derive(Deserialize)]
struct ListDirectoryArgs {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    offset: usize,
}

pub(crate) fn list_directory(executor: &ToolExecutor, arguments: &Value) -> ToolResult {
    let args: ListDirectoryArgs = parse_args(arguments)?;
    let (abs, rel) = match args.path.as_deref() {
        None | Some("") | Some(".") => (
            executor.repo().root().to_path_buf(),
            PathBuf::new(),
        ),
        Some(path) => executor.resolve(path)?,
    };
    if !abs.is_dir() {
        return Err(ToolError::InvalidArguments {
            message: format!("{} is not a directory", rel.display()),
        });
    }

    let mut files = Vec::new();
    let mut dirs = Vec::new();
    collect_entries(executor.repo().root(), &abs, args.recursive, &mut files, &mut dirs);
    files.sort();
    dirs.sort();

    let total_files = files.len();
    let page: Vec<Value> = files
        .into_iter()
        .skip(args.offset)
        .take(LISTING_PAGE)
        .map(|path| {
            let absolute = executor.repo().root().join(&path);
            let line_count = if super::is_binary(&absolute) {
                Value::Null
            } else {
                std::fs::read_to_string(&absolute)
                    .map(|content| json!(content.lines().count()))
                    .unwrap_or(Value::Null)
            };
            json!({"path": path.to_string_lossy(), "lines": line_count})
        })
        .collect();
    let page_len = page.len();

    let mut body = serde_json::Map::new();
    body.insert("path".into(), json!(rel.to_string_lossy()));
    body.insert("files".into(), Value::Array(page));
    body.insert(
        "directories".into(),
        Value::Array(
            dirs.into_iter()
                .map(|d| json!(d.to_string_lossy()))
                .collect(),
        ),
    );
    Ok(super::paginated(
        body,
        args.offset,
        page_len,
        total_files,
        "total_files",
    ))
}

/// Gather files and subdirectories under `dir`, skipping hidden entries
/// and build-artifact directories.
fn collect_entries(
    root: &Path,
    dir: &Path,
    recursive: bool,
    files: &mut Vec<PathBuf>,
    dirs: &mut Vec<PathBuf>,
) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        if path.is_dir() {
            if ARTIFACT_DIRS.contains(&name.as_str()) {
                continue;
            }
            dirs.push(rel);
            if recursive {
                collect_entries(root, &path, true, files, dirs);
            }
        } else {
            files.push(rel);
        }
    }
}

#[derive(Deserialize)]
struct FileDiffArgs {
    path: String,
    #[serde(default)]
    context_lines: Option<u32>,
}

pub(crate) fn get_file_diff(executor: &ToolExecutor, arguments: &Value) -> ToolResult {
    let args: FileDiffArgs = parse_args(arguments)?;
    let (_abs, rel) = executor.resolve(&args.path)?;
    let context = args.context_lines.unwrap_or(3).min(10);

    let diff = executor
        .repo()
        .file_diff(&rel, context)
        .map_err(|e| ToolError::Failed {
            message: format!("git diff failed: {e}"),
        })?;

    Ok(json!({
        "path": rel.to_string_lossy(),
        "context_lines": context,
        "diff": diff,
        "is_empty": diff.trim().is_empty(),
    }))
}

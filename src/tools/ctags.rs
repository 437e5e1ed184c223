//! Symbol tools backed by a ctags index
//!
//! The index is built with `ctags -R --output-format=json` over the whole
//! worktree and cached until the scanner invalidates it after a worktree
//! change. Rebuilds are lazy: the first symbol tool used after an
//! invalidation pays for it. When ctags is not installed every tool here
//! answers with a structured `tool_unavailable` error instead of failing
//! the scan.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{SEARCH_PAGE, ToolError, ToolExecutor, ToolResult, parse_args};
use crate::exec::{Cmd, find_binary};
use crate::llm::estimate_tokens;

const CLASS_KINDS: &[&str] = &["class", "struct", "union", "trait", "interface", "enum"];
const FUNCTION_KINDS: &[&str] = &["function", "method", "func"];
const IMPORT_KINDS: &[&str] = &["import", "include", "using", "package", "namespace"];
const CONSTANT_KINDS: &[&str] = &["constant", "const", "macro", "enumerator", "define"];

#[derive(Debug, Clone)]
pub struct TagEntry {
    pub name: String,
    pub path: String,
    pub line: u32,
    pub kind: String,
    pub scope: Option<String>,
    pub signature: Option<String>,
}

#[derive(Debug)]
enum IndexState {
    Stale,
    Fresh,
    Unavailable(String),
}

#[derive(Debug)]
pub struct CtagsIndex {
    entries: Vec<TagEntry>,
    by_name: HashMap<String, Vec<usize>>,
    state: IndexState,
}

impl CtagsIndex {
    pub fn empty() -> Self {
        CtagsIndex {
            entries: Vec::new(),
            by_name: HashMap::new(),
            state: IndexState::Stale,
        }
    }

    pub fn invalidate(&mut self) {
        self.state = IndexState::Stale;
    }

    /// Rebuild the index if it went stale since the last use.
    pub(crate) fn ensure_fresh(&mut self, root: &Path) -> Result<(), ToolError> {
        match &self.state {
            IndexState::Fresh => return Ok(()),
            IndexState::Unavailable(message) => {
                return Err(ToolError::Unavailable {
                    tool: "ctags".into(),
                    message: message.clone(),
                });
            }
            IndexState::Stale => {}
        }

        let Some(ctags) = find_binary("ctags") else {
            let message = "universal-ctags is not installed".to_string();
            self.state = IndexState::Unavailable(message.clone());
            return Err(ToolError::Unavailable {
                tool: "ctags".into(),
                message,
            });
        };

        let output = Cmd::new(ctags.to_string_lossy())
            .current_dir(root)
            .args([
                "-R",
                "--output-format=json",
                "--fields=+nKsS",
                "--extras=-F",
                "-f",
                "-",
                ".",
            ])
            .run()
            .map_err(|e| ToolError::Failed {
                message: format!("ctags failed to start: {e}"),
            })?;
        if !output.status.success() {
            return Err(ToolError::Failed {
                message: format!(
                    "ctags exited with {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        self.entries = parse_ctags_json(&String::from_utf8_lossy(&output.stdout));
        self.by_name = HashMap::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            self.by_name.entry(entry.name.clone()).or_default().push(idx);
        }
        self.state = IndexState::Fresh;
        log::debug!("ctags index rebuilt: {} symbols", self.entries.len());
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Vec<&TagEntry> {
        self.by_name
            .get(name)
            .map(|indices| indices.iter().map(|&i| &self.entries[i]).collect())
            .unwrap_or_default()
    }

    pub fn entries(&self) -> &[TagEntry] {
        &self.entries
    }

    pub fn entries_for_file(&self, rel: &str) -> Vec<&TagEntry> {
        let mut entries: Vec<&TagEntry> = self
            .entries
            .iter()
            .filter(|e| normalized(&e.path) == rel)
            .collect();
        entries.sort_by_key(|e| e.line);
        entries
    }
}

/// ctags prefixes paths with "./" when invoked over ".".
fn normalized(path: &str) -> &str {
    path.strip_prefix("./").unwrap_or(path)
}

fn parse_ctags_json(stdout: &str) -> Vec<TagEntry> {
    let mut entries = Vec::new();
    for line in stdout.lines() {
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if event["_type"] != "tag" {
            continue;
        }
        let (Some(name), Some(path), Some(tag_line)) = (
            event["name"].as_str(),
            event["path"].as_str(),
            event["line"].as_u64(),
        ) else {
            continue;
        };
        entries.push(TagEntry {
            name: name.to_string(),
            path: normalized(path).to_string(),
            line: tag_line as u32,
            kind: event["kind"].as_str().unwrap_or("unknown").to_lowercase(),
            scope: event["scope"].as_str().map(String::from),
            signature: event["signature"].as_str().map(String::from),
        });
    }
    entries
}

fn entry_json(entry: &TagEntry) -> Value {
    json!({
        "name": entry.name,
        "file": entry.path,
        "line": entry.line,
        "kind": entry.kind,
        "scope": entry.scope,
        "signature": entry.signature,
    })
}

#[derive(Deserialize)]
struct FileSummaryArgs {
    path: String,
}

pub(crate) fn get_file_summary(executor: &ToolExecutor, arguments: &Value) -> ToolResult {
    let args: FileSummaryArgs = parse_args(arguments)?;
    let (_abs, rel) = executor.resolve(&args.path)?;
    let rel_str = rel.to_string_lossy().to_string();

    executor.with_index(|index| {
        let entries = index.entries_for_file(&rel_str);
        let pick = |kinds: &[&str]| -> Vec<Value> {
            entries
                .iter()
                .filter(|e| kinds.contains(&e.kind.as_str()))
                .map(|e| entry_json(e))
                .collect()
        };
        let known: Vec<&str> = CLASS_KINDS
            .iter()
            .chain(FUNCTION_KINDS)
            .chain(IMPORT_KINDS)
            .chain(CONSTANT_KINDS)
            .copied()
            .collect();
        let other: Vec<Value> = entries
            .iter()
            .filter(|e| !known.contains(&e.kind.as_str()))
            .map(|e| entry_json(e))
            .collect();

        Ok(json!({
            "file": rel_str,
            "classes": pick(CLASS_KINDS),
            "functions": pick(FUNCTION_KINDS),
            "imports": pick(IMPORT_KINDS),
            "constants": pick(CONSTANT_KINDS),
            "other": other,
            "total_symbols": entries.len(),
        }))
    })
}

#[derive(Deserialize)]
struct SymbolArgs {
    symbol: String,
    #[serde(default)]
    kind: Option<String>,
}

pub(crate) fn symbol_exists(executor: &ToolExecutor, arguments: &Value) -> ToolResult {
    let args: SymbolArgs = parse_args(arguments)?;
    executor.with_index(|index| {
        let locations: Vec<Value> = index
            .lookup(&args.symbol)
            .into_iter()
            .filter(|e| kind_matches(e, args.kind.as_deref()))
            .take(10)
            .map(entry_json)
            .collect();
        Ok(json!({
            "symbol": args.symbol,
            "exists": !locations.is_empty(),
            "locations": locations,
        }))
    })
}

pub(crate) fn find_definition(executor: &ToolExecutor, arguments: &Value) -> ToolResult {
    let args: SymbolArgs = parse_args(arguments)?;
    executor.with_index(|index| {
        let definitions: Vec<Value> = index
            .lookup(&args.symbol)
            .into_iter()
            .filter(|e| kind_matches(e, args.kind.as_deref()))
            .map(entry_json)
            .collect();
        let total = definitions.len();
        let page: Vec<Value> = definitions.into_iter().take(SEARCH_PAGE).collect();
        let page_len = page.len();

        let mut body = serde_json::Map::new();
        body.insert("symbol".into(), json!(args.symbol));
        body.insert("definitions".into(), Value::Array(page));
        Ok(super::paginated(body, 0, page_len, total, "total_definitions"))
    })
}

#[derive(Deserialize)]
struct FindSymbolsArgs {
    pattern: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default = "default_true")]
    case_sensitive: bool,
}

fn default_true() -> bool {
    true
}

pub(crate) fn find_symbols(executor: &ToolExecutor, arguments: &Value) -> ToolResult {
    let args: FindSymbolsArgs = parse_args(arguments)?;
    let pattern_text = if args.case_sensitive {
        args.pattern.clone()
    } else {
        args.pattern.to_lowercase()
    };
    let pattern = glob::Pattern::new(&pattern_text).map_err(|e| ToolError::InvalidArguments {
        message: format!("bad wildcard pattern {:?}: {e}", args.pattern),
    })?;

    executor.with_index(|index| {
        let matched: Vec<Value> = index
            .entries()
            .iter()
            .filter(|entry| {
                let name = if args.case_sensitive {
                    entry.name.clone()
                } else {
                    entry.name.to_lowercase()
                };
                pattern.matches(&name) && kind_matches(entry, args.kind.as_deref())
            })
            .map(entry_json)
            .collect();
        let total = matched.len();
        let page: Vec<Value> = matched.into_iter().take(SEARCH_PAGE).collect();
        let page_len = page.len();

        let mut body = serde_json::Map::new();
        body.insert("pattern".into(), json!(args.pattern));
        body.insert("symbols".into(), Value::Array(page));
        Ok(super::paginated(body, 0, page_len, total, "total_symbols"))
    })
}

#[derive(Deserialize)]
struct EnclosingScopeArgs {
    path: String,
    line: u32,
}

pub(crate) fn get_enclosing_scope(executor: &ToolExecutor, arguments: &Value) -> ToolResult {
    let args: EnclosingScopeArgs = parse_args(arguments)?;
    let (abs, rel) = executor.resolve(&args.path)?;
    let rel_str = rel.to_string_lossy().to_string();

    let symbol = executor.with_index(|index| {
        let entries = index.entries_for_file(&rel_str);
        // Innermost containing symbol: the latest definition at or before
        // the target line. Imports never count as a scope.
        let containing = entries
            .iter()
            .filter(|e| e.line <= args.line && !IMPORT_KINDS.contains(&e.kind.as_str()))
            .next_back()
            .map(|e| (*e).clone());
        let end = entries
            .iter()
            .map(|e| e.line)
            .find(|&l| l > args.line);
        Ok((containing, end))
    })?;

    let (Some(entry), next_symbol_line) = symbol else {
        return Ok(json!({
            "file": rel_str,
            "line": args.line,
            "symbol": Value::Null,
            "message": "no enclosing symbol found at this line",
        }));
    };

    if super::is_binary(&abs) {
        return Err(ToolError::BinaryFile {
            path: args.path.clone(),
        });
    }
    let content = std::fs::read_to_string(&abs).map_err(|e| ToolError::Failed {
        message: format!("cannot read {:?}: {e}", args.path),
    })?;
    let lines: Vec<&str> = content.lines().collect();
    let start = entry.line as usize;
    let end = next_symbol_line
        .map(|l| (l as usize).saturating_sub(1))
        .unwrap_or(lines.len())
        .min(lines.len());

    let mut source = String::new();
    let mut emitted_end = start.saturating_sub(1);
    for (idx, line) in lines.iter().enumerate().take(end).skip(start.saturating_sub(1)) {
        let numbered = format!("{:>5} | {line}\n", idx + 1);
        if estimate_tokens(&source) + estimate_tokens(&numbered) > super::READ_CHUNK_TOKENS
            && !source.is_empty()
        {
            break;
        }
        source.push_str(&numbered);
        emitted_end = idx + 1;
    }

    Ok(json!({
        "file": rel_str,
        "line": args.line,
        "symbol": entry_json(&entry),
        "start_line": start,
        "end_line": emitted_end,
        "source": source,
    }))
}

#[derive(Deserialize)]
struct FindUsagesArgs {
    symbol: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default = "default_true")]
    include_definitions: bool,
}

pub(crate) fn find_usages(executor: &ToolExecutor, arguments: &Value) -> ToolResult {
    let args: FindUsagesArgs = parse_args(arguments)?;

    let path_filter = match args.path.as_deref() {
        Some(path) => Some(executor.resolve(path)?.1.to_string_lossy().to_string()),
        None => None,
    };

    // Definition sites from the index, reference sites from ripgrep; a
    // match at a known definition line is classified as a definition.
    let definitions: Vec<(String, u32)> = executor.with_index(|index| {
        Ok(index
            .lookup(&args.symbol)
            .into_iter()
            .filter(|e| {
                path_filter
                    .as_deref()
                    .map(|p| normalized(&e.path) == p)
                    .unwrap_or(true)
            })
            .map(|e| (normalized(&e.path).to_string(), e.line))
            .collect())
    })?;

    let Some(rg) = find_binary("rg") else {
        return Err(ToolError::Unavailable {
            tool: "find_usages".into(),
            message: "ripgrep (rg) is not installed".into(),
        });
    };
    let mut cmd = Cmd::new(rg.to_string_lossy())
        .current_dir(executor.repo().root())
        .args(["--json", "--fixed-strings", "--word-regexp", "--case-sensitive"])
        .arg("--regexp")
        .arg(&args.symbol);
    if let Some(path) = &path_filter {
        cmd = cmd.arg(path);
    }
    let output = cmd.run().map_err(|e| ToolError::Failed {
        message: format!("ripgrep failed to start: {e}"),
    })?;
    if let Some(code) = output.status.code()
        && code > 1
    {
        return Err(ToolError::Failed {
            message: format!(
                "ripgrep exited with {code}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    let mut definition_hits = Vec::new();
    let mut usage_hits = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if event["type"] != "match" {
            continue;
        }
        let data = &event["data"];
        let (Some(path), Some(line_number)) =
            (data["path"]["text"].as_str(), data["line_number"].as_u64())
        else {
            continue;
        };
        let code = data["lines"]["text"]
            .as_str()
            .unwrap_or("")
            .trim_end_matches('\n');
        let hit = json!({"file": path, "line": line_number, "code": code});
        if definitions
            .iter()
            .any(|(def_path, def_line)| def_path == path && u64::from(*def_line) == line_number)
        {
            definition_hits.push(hit);
        } else {
            usage_hits.push(hit);
        }
    }

    let total = usage_hits.len();
    let page: Vec<Value> = usage_hits.into_iter().take(SEARCH_PAGE).collect();
    let page_len = page.len();

    let mut body = serde_json::Map::new();
    body.insert("symbol".into(), json!(args.symbol));
    if args.include_definitions {
        body.insert("definitions".into(), Value::Array(definition_hits));
    }
    body.insert("usages".into(), Value::Array(page));
    Ok(super::paginated(body, 0, page_len, total, "total_usages"))
}

fn kind_matches(entry: &TagEntry, wanted: Option<&str>) -> bool {
    wanted
        .map(|k| entry.kind.eq_ignore_ascii_case(k))
        .unwrap_or(true)
}

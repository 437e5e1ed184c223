//! Text search backed by ripgrep

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{SEARCH_PAGE, ToolError, ToolExecutor, ToolResult, parse_args};
use crate::exec::{Cmd, find_binary};

/// Lines that look like they introduce the matched name. Used only for
/// ordering: definitions surface before usages so the model sees the
/// declaration first.
static DEFINITION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(pub(\(.*\))?\s+)?(fn|struct|enum|trait|impl|type|const|static|class|def|function|interface|module|package|var|let)\b",
    )
    .expect("definition regex is valid")
});

#[derive(Deserialize)]
struct SearchTextArgs {
    patterns: Vec<String>,
    #[serde(default)]
    is_regex: bool,
    #[serde(default)]
    whole_word: bool,
    #[serde(default)]
    case_sensitive: bool,
    #[serde(default)]
    file_pattern: Option<String>,
    #[serde(default)]
    offset: usize,
}

#[derive(Debug)]
struct Match {
    path: String,
    line: u64,
    code: String,
    is_definition: bool,
}

pub(crate) fn search_text(executor: &ToolExecutor, arguments: &Value) -> ToolResult {
    let args: SearchTextArgs = parse_args(arguments)?;
    if args.patterns.is_empty() {
        return Err(ToolError::InvalidArguments {
            message: "patterns must not be empty".into(),
        });
    }
    let Some(rg) = find_binary("rg") else {
        return Err(ToolError::Unavailable {
            tool: "search_text".into(),
            message: "ripgrep (rg) is not installed".into(),
        });
    };

    let mut cmd = Cmd::new(rg.to_string_lossy())
        .current_dir(executor.repo().root())
        .arg("--json");
    if !args.is_regex {
        cmd = cmd.arg("--fixed-strings");
    }
    if args.whole_word {
        cmd = cmd.arg("--word-regexp");
    }
    cmd = cmd.arg(if args.case_sensitive {
        "--case-sensitive"
    } else {
        "--ignore-case"
    });
    if let Some(file_pattern) = &args.file_pattern {
        cmd = cmd.arg("--glob").arg(file_pattern);
    }
    for pattern in &args.patterns {
        cmd = cmd.arg("--regexp").arg(pattern);
    }

    let output = cmd.run().map_err(|e| ToolError::Failed {
        message: format!("ripgrep failed to start: {e}"),
    })?;
    // 0 = matches, 1 = no matches; anything else is a real failure.
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

    let mut matches = parse_rg_json(&String::from_utf8_lossy(&output.stdout));
    // Definitions first, then stable path/line order.
    matches.sort_by(|a, b| {
        b.is_definition
            .cmp(&a.is_definition)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.line.cmp(&b.line))
    });

    let total = matches.len();
    let page: Vec<Value> = matches
        .into_iter()
        .skip(args.offset)
        .take(SEARCH_PAGE)
        .map(|m| {
            json!({
                "file": m.path,
                "line": m.line,
                "code": m.code,
                "is_definition": m.is_definition,
            })
        })
        .collect();
    let page_len = page.len();

    let mut body = serde_json::Map::new();
    body.insert("matches".into(), Value::Array(page));
    Ok(super::paginated(
        body,
        args.offset,
        page_len,
        total,
        "total_matches",
    ))
}

fn parse_rg_json(stdout: &str) -> Vec<Match> {
    let mut matches = Vec::new();
    for line in stdout.lines() {
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if event["type"] != "match" {
            continue;
        }
        let data = &event["data"];
        let Some(path) = data["path"]["text"].as_str() else {
            continue;
        };
        let Some(line_number) = data["line_number"].as_u64() else {
            continue;
        };
        let code = data["lines"]["text"]
            .as_str()
            .unwrap_or("")
            .trim_end_matches('\n')
            .to_string();
        matches.push(Match {
            path: path.to_string(),
            line: line_number,
            is_definition: DEFINITION_RE.is_match(&code),
            code,
        });
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::super::tests::fixture;
    use super::*;

    #[test]
    fn definition_heuristic_spots_declarations() {
        assert!(DEFINITION_RE.is_match("fn main() {"));
        assert!(DEFINITION_RE.is_match("pub struct Watcher {"));
        assert!(DEFINITION_RE.is_match("    def process(self):"));
        assert!(DEFINITION_RE.is_match("class QApplication:"));
        assert!(!DEFINITION_RE.is_match("    watcher.poll();"));
        assert!(!DEFINITION_RE.is_match("return main();"));
    }

    #[test]
    fn rg_json_events_become_matches() {
        let stdout = concat!(
            r#"{"type":"begin","data":{"path":{"text":"src/main.rs"}}}"#,
            "\n",
            r#"{"type":"match","data":{"path":{"text":"src/main.rs"},"lines":{"text":"fn main() {\n"},"line_number":1,"absolute_offset":0,"submatches":[]}}"#,
            "\n",
            r#"{"type":"end","data":{"path":{"text":"src/main.rs"}}}"#,
            "\n",
        );
        let matches = parse_rg_json(stdout);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].path, "src/main.rs");
        assert_eq!(matches[0].line, 1);
        assert!(matches[0].is_definition);
    }

    #[test]
    fn search_finds_text_in_fixture() {
        if find_binary("rg").is_none() {
            return; // environment without ripgrep
        }
        let (_dir, executor) = fixture();
        let result = search_text(&executor, &json!({"patterns": ["println"]})).unwrap();
        assert_eq!(result["total_matches"], 1);
        let hit = &result["matches"][0];
        assert_eq!(hit["file"], "src/main.rs");
        assert_eq!(hit["line"], 2);
    }

    #[test]
    fn definitions_order_before_usages() {
        if find_binary("rg").is_none() {
            return;
        }
        let (dir, executor) = fixture();
        std::fs::write(
            dir.path().join("src/lib.rs"),
            "pub fn helper() {}\n\nfn caller() {\n    helper();\n}\n",
        )
        .unwrap();
        let result = search_text(
            &executor,
            &json!({"patterns": ["helper"], "whole_word": true}),
        )
        .unwrap();
        let matches = result["matches"].as_array().unwrap();
        assert!(matches.len() >= 2);
        assert_eq!(matches[0]["is_definition"], true);
    }

    #[test]
    fn empty_patterns_are_invalid() {
        let (_dir, executor) = fixture();
        let err = search_text(&executor, &json!({"patterns": []})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }
}

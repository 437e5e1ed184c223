//! Scanner configuration
//!
//! The config file is TOML with two sections: `[llm]` describing the model
//! backend and `[[checks]]` declaring check groups. Validation is strict:
//! unknown top-level sections and unknown keys under `[llm]` or `[[checks]]`
//! are fatal, with the accepted keys listed in the error. A legacy shape of
//! `checks = ["…"]` at the top level is accepted and converted to a single
//! group with pattern `"*"`.

use std::path::{Component, Path};

use serde::Deserialize;

use crate::error::ScanError;

/// Accepted keys, surfaced in unknown-key errors.
const TOP_LEVEL_KEYS: &[&str] = &["llm", "checks"];
const LLM_KEYS: &[&str] = &["backend", "host", "port", "model", "timeout", "context_limit"];
const CHECK_KEYS: &[&str] = &["pattern", "checks"];

/// Which wire protocol the LLM client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// `/v1/chat/completions`, OpenAI-style JSON
    OpenaiCompatible,
    /// `/api/chat`, Ollama-style JSON
    NativeChat,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::OpenaiCompatible => write!(f, "openai-compatible"),
            Backend::NativeChat => write!(f, "native-chat"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub backend: Backend,
    pub host: String,
    pub port: u16,
    /// Required for native-chat; optional for openai-compatible servers
    /// that serve a single model.
    #[serde(default)]
    pub model: Option<String>,
    /// HTTP timeout in seconds. Local models can be slow to first token,
    /// so the default is generous.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    pub context_limit: usize,
}

fn default_timeout() -> u64 {
    600
}

impl LlmConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// A single file pattern from a check group.
///
/// Two forms: shell-style globs (`*.md`, `src/*.rs`) and the directory form
/// `/*name*/` which matches any path traversing a directory whose name
/// matches the part between the slashes (wildcards permitted inside).
#[derive(Debug, Clone)]
pub enum PathPattern {
    Glob(glob::Pattern),
    Directory(glob::Pattern),
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, ScanError> {
        let raw = raw.trim();
        if let Some(inner) = raw
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
            && !inner.is_empty()
            && !inner.contains('/')
        {
            let pat = glob::Pattern::new(inner)
                .map_err(|e| ScanError::config(format!("invalid pattern '{raw}': {e}")))?;
            return Ok(PathPattern::Directory(pat));
        }
        let pat = glob::Pattern::new(raw)
            .map_err(|e| ScanError::config(format!("invalid pattern '{raw}': {e}")))?;
        Ok(PathPattern::Glob(pat))
    }

    /// Match a repo-relative path.
    ///
    /// Bare globs (no `/`) match the file name; globs containing `/` match
    /// the whole relative path. The directory form matches when any
    /// directory component of the path matches the inner glob.
    pub fn matches(&self, rel: &Path) -> bool {
        match self {
            PathPattern::Glob(pat) => {
                if pat.as_str().contains('/') {
                    pat.matches_path(rel)
                } else {
                    rel.file_name()
                        .map(|name| pat.matches(&name.to_string_lossy()))
                        .unwrap_or(false)
                }
            }
            PathPattern::Directory(pat) => rel.components().rev().skip(1).any(|c| match c {
                Component::Normal(name) => pat.matches(&name.to_string_lossy()),
                _ => false,
            }),
        }
    }
}

/// One `[[checks]]` group: patterns plus the prompts run against files
/// matching them. A group with no prompts is an ignore group; its patterns
/// feed the file filter instead of producing work.
#[derive(Debug, Clone)]
pub struct CheckGroup {
    pub patterns: Vec<PathPattern>,
    pub prompts: Vec<String>,
}

impl CheckGroup {
    pub fn is_ignore(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn matches(&self, rel: &Path) -> bool {
        self.patterns.iter().any(|p| p.matches(rel))
    }
}

/// Split a comma-separated pattern string into trimmed segments.
pub fn split_patterns(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub groups: Vec<CheckGroup>,
}

/// Serde shape for a `[[checks]]` table. Strictness is enforced separately
/// over the raw value tree so the error can list accepted keys.
#[derive(Debug, Deserialize)]
struct RawCheckGroup {
    pattern: String,
    checks: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ScanError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ScanError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ScanError> {
        let value: toml::Value = text
            .parse()
            .map_err(|e| ScanError::config(format!("invalid TOML: {e}")))?;
        let table = value
            .as_table()
            .ok_or_else(|| ScanError::config("top level must be a table"))?;

        for key in table.keys() {
            if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
                return Err(ScanError::config(format!(
                    "unknown section '{key}' (accepted: {})",
                    TOP_LEVEL_KEYS.join(", ")
                )));
            }
        }

        let llm_value = table
            .get("llm")
            .ok_or_else(|| ScanError::config("missing required [llm] section"))?;
        let llm_table = llm_value
            .as_table()
            .ok_or_else(|| ScanError::config("[llm] must be a table"))?;
        for key in llm_table.keys() {
            if !LLM_KEYS.contains(&key.as_str()) {
                return Err(ScanError::config(format!(
                    "unknown key '{key}' under [llm] (accepted: {})",
                    LLM_KEYS.join(", ")
                )));
            }
        }
        let llm: LlmConfig = llm_value
            .clone()
            .try_into()
            .map_err(|e| ScanError::config(format!("[llm]: {e}")))?;

        if llm.backend == Backend::NativeChat && llm.model.is_none() {
            return Err(ScanError::config(
                "[llm] model is required when backend = \"native-chat\"",
            ));
        }
        if llm.context_limit == 0 {
            return Err(ScanError::config("[llm] context_limit must be positive"));
        }

        let groups = match table.get("checks") {
            None => Vec::new(),
            // Legacy shape: a top-level array of prompt strings becomes a
            // single group matching everything.
            Some(toml::Value::Array(items))
                if !items.is_empty() && items.iter().all(|v| v.is_str()) =>
            {
                let prompts = items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect();
                vec![CheckGroup {
                    patterns: vec![PathPattern::parse("*")?],
                    prompts,
                }]
            }
            Some(toml::Value::Array(items)) => {
                let mut groups = Vec::with_capacity(items.len());
                for item in items {
                    let group_table = item
                        .as_table()
                        .ok_or_else(|| ScanError::config("[[checks]] entries must be tables"))?;
                    for key in group_table.keys() {
                        if !CHECK_KEYS.contains(&key.as_str()) {
                            return Err(ScanError::config(format!(
                                "unknown key '{key}' under [[checks]] (accepted: {})",
                                CHECK_KEYS.join(", ")
                            )));
                        }
                    }
                    let raw: RawCheckGroup = item
                        .clone()
                        .try_into()
                        .map_err(|e| ScanError::config(format!("[[checks]]: {e}")))?;
                    let patterns = split_patterns(&raw.pattern)
                        .map(PathPattern::parse)
                        .collect::<Result<Vec<_>, _>>()?;
                    if patterns.is_empty() {
                        return Err(ScanError::config("[[checks]] pattern is empty"));
                    }
                    groups.push(CheckGroup {
                        patterns,
                        prompts: raw.checks,
                    });
                }
                groups
            }
            Some(_) => {
                return Err(ScanError::config(
                    "'checks' must be [[checks]] tables or a legacy array of prompt strings",
                ));
            }
        };

        // Ignore-only groups are fine individually; a config where *no*
        // group produces work is a dead daemon and rejected up front.
        if !groups.iter().any(|g| !g.is_ignore()) {
            return Err(ScanError::config(
                "no checks defined: every [[checks]] group has an empty prompt list",
            ));
        }

        Ok(Config { llm, groups })
    }

    /// The check schedule: every (group, prompt) pair in declaration order.
    pub fn schedule(&self) -> Vec<CheckRef> {
        let mut schedule = Vec::new();
        for (group_idx, group) in self.groups.iter().enumerate() {
            for (prompt_idx, _) in group.prompts.iter().enumerate() {
                schedule.push(CheckRef {
                    group: group_idx,
                    prompt: prompt_idx,
                });
            }
        }
        schedule
    }

    pub fn prompt(&self, check: CheckRef) -> &str {
        &self.groups[check.group].prompts[check.prompt]
    }

    pub fn group(&self, check: CheckRef) -> &CheckGroup {
        &self.groups[check.group]
    }
}

/// Index of one check in the schedule: a (group, prompt) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckRef {
    pub group: usize,
    pub prompt: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [llm]
        backend = "openai-compatible"
        host = "localhost"
        port = 8080
        context_limit = 16384

        [[checks]]
        pattern = "*.rs"
        checks = ["Check for unwrap in non-test code."]
    "#;

    #[test]
    fn parses_minimal_config() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.llm.backend, Backend::OpenaiCompatible);
        assert_eq!(config.llm.port, 8080);
        assert_eq!(config.llm.timeout, 600);
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.schedule().len(), 1);
    }

    #[test]
    fn unknown_top_level_section_is_fatal() {
        let text = format!("{MINIMAL}\n[extras]\nfoo = 1\n");
        let err = Config::parse(&text).unwrap_err();
        assert!(err.to_string().contains("unknown section 'extras'"));
        assert!(err.to_string().contains("llm, checks"));
    }

    #[test]
    fn unknown_llm_key_is_fatal_and_lists_accepted() {
        let text = MINIMAL.replace("port = 8080", "port = 8080\ntemperature = 0.2");
        let err = Config::parse(&text).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unknown key 'temperature'"));
        assert!(msg.contains("context_limit"));
    }

    #[test]
    fn unknown_check_key_is_fatal() {
        let text = MINIMAL.replace(
            "pattern = \"*.rs\"",
            "pattern = \"*.rs\"\nseverity = \"high\"",
        );
        let err = Config::parse(&text).unwrap_err();
        assert!(err.to_string().contains("unknown key 'severity'"));
    }

    #[test]
    fn native_chat_requires_model() {
        let text = MINIMAL.replace("openai-compatible", "native-chat");
        let err = Config::parse(&text).unwrap_err();
        assert!(err.to_string().contains("model is required"));

        let text = text.replace(
            "host = \"localhost\"",
            "host = \"localhost\"\nmodel = \"qwen\"",
        );
        assert!(Config::parse(&text).is_ok());
    }

    #[test]
    fn legacy_top_level_checks_become_star_group() {
        let text = r#"
            [llm]
            backend = "openai-compatible"
            host = "localhost"
            port = 8080
            context_limit = 8192

            checks = ["First check.", "Second check."]
        "#;
        let config = Config::parse(text).unwrap();
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].prompts.len(), 2);
        assert!(config.groups[0].matches(Path::new("any/file.py")));
    }

    #[test]
    fn ignore_only_config_is_fatal() {
        let text = r#"
            [llm]
            backend = "openai-compatible"
            host = "localhost"
            port = 8080
            context_limit = 8192

            [[checks]]
            pattern = "*.md"
            checks = []
        "#;
        let err = Config::parse(text).unwrap_err();
        assert!(err.to_string().contains("no checks defined"));
    }

    #[test]
    fn ignore_group_allowed_alongside_real_group() {
        let text = format!("{MINIMAL}\n[[checks]]\npattern = \"*.md, /*build*/\"\nchecks = []\n");
        let config = Config::parse(&text).unwrap();
        assert_eq!(config.groups.len(), 2);
        assert!(config.groups[1].is_ignore());
        assert_eq!(config.groups[1].patterns.len(), 2);
        // Schedule only covers the real group.
        assert_eq!(config.schedule().len(), 1);
    }

    #[test]
    fn missing_context_limit_is_fatal() {
        let text = MINIMAL.replace("context_limit = 16384\n", "");
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn bare_glob_matches_file_name_anywhere() {
        let pat = PathPattern::parse("*.md").unwrap();
        assert!(pat.matches(Path::new("README.md")));
        assert!(pat.matches(Path::new("docs/guide/intro.md")));
        assert!(!pat.matches(Path::new("src/main.rs")));
    }

    #[test]
    fn slash_glob_matches_whole_path() {
        let pat = PathPattern::parse("src/*.rs").unwrap();
        assert!(pat.matches(Path::new("src/main.rs")));
        assert!(!pat.matches(Path::new("tests/main.rs")));
        assert!(!pat.matches(Path::new("src/git/mod.rs")));
    }

    #[test]
    fn directory_pattern_matches_traversed_dirs() {
        let pat = PathPattern::parse("/*build*/").unwrap();
        assert!(pat.matches(Path::new("build/x.cpp")));
        assert!(pat.matches(Path::new("out/build-debug/obj.o")));
        // A file named like the directory does not match.
        assert!(!pat.matches(Path::new("src/buildinfo.rs")));
    }

    #[test]
    fn comma_split_trims_segments() {
        let segs: Vec<&str> = split_patterns("*.md, /*build*/ ,,*.txt").collect();
        assert_eq!(segs, vec!["*.md", "/*build*/", "*.txt"]);
    }
}

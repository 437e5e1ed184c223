//! Configuration loading end to end: file loading, strict validation,
//! and the legacy shape.

mod common;

use code_scanner::config::{Backend, Config};

use common::TestRepo;

#[test]
fn loads_a_config_file_from_disk() {
    let repo = TestRepo::new();
    repo.write(
        "scanner.toml",
        r#"
[llm]
backend = "native-chat"
host = "127.0.0.1"
port = 11434
model = "qwen2.5-coder:14b"
timeout = 300
context_limit = 32768

[[checks]]
pattern = "*.cpp, *.h"
checks = [
    "Check that stack allocation is preferred over heap allocation whenever possible.",
    "Check for missing null-pointer checks.",
]

[[checks]]
pattern = "/*build*/"
checks = []
"#,
    );

    let config = Config::load(&repo.path().join("scanner.toml")).unwrap();
    assert_eq!(config.llm.backend, Backend::NativeChat);
    assert_eq!(config.llm.model.as_deref(), Some("qwen2.5-coder:14b"));
    assert_eq!(config.llm.timeout, 300);
    assert_eq!(config.groups.len(), 2);
    // Two prompts in the first group, none in the ignore group.
    assert_eq!(config.schedule().len(), 2);
}

#[test]
fn missing_file_is_a_config_error() {
    let repo = TestRepo::new();
    let err = Config::load(&repo.path().join("nope.toml")).unwrap_err();
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn unknown_section_lists_accepted_ones() {
    let repo = TestRepo::new();
    repo.write(
        "scanner.toml",
        r#"
[llm]
backend = "openai-compatible"
host = "localhost"
port = 8080
context_limit = 8192

[scanner]
interval = 10

[[checks]]
pattern = "*"
checks = ["c"]
"#,
    );
    let err = Config::load(&repo.path().join("scanner.toml")).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("unknown section 'scanner'"));
    assert!(message.contains("llm, checks"));
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn legacy_flat_checks_still_load() {
    let repo = TestRepo::new();
    repo.write(
        "scanner.toml",
        r#"
[llm]
backend = "openai-compatible"
host = "localhost"
port = 8080
context_limit = 8192

checks = ["Look for TODOs that reference closed tickets."]
"#,
    );
    let config = Config::load(&repo.path().join("scanner.toml")).unwrap();
    assert_eq!(config.groups.len(), 1);
    assert!(config.groups[0].matches(std::path::Path::new("deep/nested/file.py")));
    assert_eq!(config.schedule().len(), 1);
}

#[test]
fn schedule_preserves_declaration_order() {
    let repo = TestRepo::new();
    repo.write(
        "scanner.toml",
        r#"
[llm]
backend = "openai-compatible"
host = "localhost"
port = 8080
context_limit = 8192

[[checks]]
pattern = "*.rs"
checks = ["first", "second"]

[[checks]]
pattern = "*.py"
checks = ["third"]
"#,
    );
    let config = Config::load(&repo.path().join("scanner.toml")).unwrap();
    let schedule = config.schedule();
    let prompts: Vec<&str> = schedule.iter().map(|&c| config.prompt(c)).collect();
    assert_eq!(prompts, vec!["first", "second", "third"]);
}

//! Tool executor safety properties: path containment, binary refusal,
//! structured errors, and pagination behavior over a real repository.

mod common;

use code_scanner::git::Repository;
use code_scanner::llm::ToolRunner;
use code_scanner::tools::ToolExecutor;
use serde_json::json;

use common::TestRepo;

fn executor() -> (TestRepo, ToolExecutor) {
    let repo = TestRepo::with_initial_commit();
    repo.write(
        "src/main.rs",
        "fn main() {\n    let config = load();\n    run(config);\n}\n",
    );
    repo.write("src/lib.rs", "pub fn load() {}\npub fn run(_c: ()) {}\n");
    let repository = Repository::discover(repo.path()).unwrap();
    (repo, ToolExecutor::new(repository))
}

#[test]
fn read_file_path_escape_returns_structured_error() {
    // Seed scenario: the model asks for ../../etc/passwd. No file is
    // read; the error kind is path_escape; the executor keeps working.
    let (_repo, executor) = executor();
    let result = executor.run("read_file", &json!({"path": "../../etc/passwd"}));
    assert_eq!(result["error"]["kind"], "path_escape");

    // Executor is still usable afterwards.
    let ok = executor.run("read_file", &json!({"path": "src/main.rs"}));
    assert!(ok.get("error").is_none());
    assert_eq!(ok["total_lines"], 4);
}

#[test]
fn every_tool_rejects_escaping_paths() {
    let (_repo, executor) = executor();
    for (tool, args) in [
        ("read_file", json!({"path": "../outside.txt"})),
        ("list_directory", json!({"path": "../.."})),
        ("get_file_diff", json!({"path": "/etc/hosts"})),
        ("get_file_summary", json!({"path": "../x.rs"})),
        ("get_enclosing_scope", json!({"path": "../x.rs", "line": 1})),
    ] {
        let result = executor.run(tool, &args);
        assert_eq!(
            result["error"]["kind"], "path_escape",
            "{tool} accepted an escaping path"
        );
    }
}

#[test]
fn missing_file_comes_back_with_suggestions() {
    let (_repo, executor) = executor();
    let result = executor.run("read_file", &json!({"path": "src/mian.rs"}));
    assert_eq!(result["error"]["kind"], "not_found");
    let suggestions = result["error"]["did_you_mean"].as_array().unwrap();
    assert!(
        suggestions
            .iter()
            .any(|s| s.as_str().unwrap().ends_with("main.rs"))
    );
}

#[test]
fn binary_files_are_refused() {
    let (repo, executor) = executor();
    repo.write("image.png", "\u{0}PNG\u{0}\u{1}");
    let result = executor.run("read_file", &json!({"path": "image.png"}));
    assert_eq!(result["error"]["kind"], "binary_file");
}

#[test]
fn malformed_arguments_are_invalid_not_fatal() {
    let (_repo, executor) = executor();
    let result = executor.run("read_file", &json!({"paths": ["src/main.rs"]}));
    assert_eq!(result["error"]["kind"], "invalid_arguments");
}

#[test]
fn list_directory_envelope_is_uniform() {
    let (repo, executor) = executor();
    for i in 0..105 {
        repo.write(&format!("data/file{i:03}.txt"), "content\n");
    }
    let page = executor.run("list_directory", &json!({"path": "data"}));
    assert_eq!(page["offset"], 0);
    assert_eq!(page["has_more"], true);
    assert_eq!(page["next_offset"], 100);
    assert_eq!(page["total_files"], 105);
    assert!(page["warning"].as_str().unwrap().contains("offset=100"));

    let rest = executor.run("list_directory", &json!({"path": "data", "offset": 100}));
    assert_eq!(rest["has_more"], false);
    assert_eq!(rest["files"].as_array().unwrap().len(), 5);
}

#[test]
fn tools_never_mutate_the_repository() {
    let (repo, executor) = executor();
    repo.commit_all("snapshot tool inputs");
    let before = repo.git_output(&["status", "--porcelain"]);

    executor.run("read_file", &json!({"path": "src/main.rs"}));
    executor.run("list_directory", &json!({"recursive": true}));
    executor.run("get_file_diff", &json!({"path": "src/main.rs"}));
    executor.run("search_text", &json!({"patterns": ["load"]}));

    let after = repo.git_output(&["status", "--porcelain"]);
    assert_eq!(before, after);
}

#[test]
fn diff_tool_reports_uncommitted_edits() {
    let (repo, executor) = executor();
    repo.commit_all("baseline");
    repo.write(
        "src/lib.rs",
        "pub fn load() {}\npub fn run(_c: ()) {}\npub fn extra() {}\n",
    );

    let result = executor.run("get_file_diff", &json!({"path": "src/lib.rs"}));
    assert_eq!(result["is_empty"], false);
    assert!(result["diff"].as_str().unwrap().contains("+pub fn extra() {}"));
}

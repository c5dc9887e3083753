use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn indexwatch(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_indexwatch"))
        .current_dir(dir)
        .env_remove("INDEXWATCH_CONFIG")
        .args(args)
        .output()
        .expect("Failed to run indexwatch")
}

/// Settings that keep every extraction artifact inside `root`.
fn write_settings(root: &Path) {
    let config_dir = root.join(".indexwatch");
    std::fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"
version = 1

[monitor]
limit_reserve = 42

[extraction]
deadline_secs = 5
persistence_dir = "{root}/markers"
error_report_dir = "{root}/errors"
store_path = "{root}/.indexwatch/store.jsonl"
"#,
        root = root.display()
    );
    std::fs::write(config_dir.join("settings.toml"), config_content).unwrap();
}

#[test]
fn test_init_command() {
    let temp_dir = TempDir::new().unwrap();
    let temp_path = temp_dir.path();

    let output = indexwatch(temp_path, &["init"]);
    assert!(output.status.success());

    let config_path = temp_path.join(".indexwatch/settings.toml");
    assert!(config_path.exists());

    let content = std::fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("version = 1"));
    assert!(content.contains("[monitor]"));
    assert!(content.contains("[extraction]"));
}

#[test]
fn test_init_refuses_to_overwrite() {
    let temp_dir = TempDir::new().unwrap();
    let temp_path = temp_dir.path();

    assert!(indexwatch(temp_path, &["init"]).status.success());

    let again = indexwatch(temp_path, &["init"]);
    assert!(!again.status.success());
    let stderr = String::from_utf8(again.stderr).unwrap();
    assert!(stderr.contains("--force"));

    assert!(indexwatch(temp_path, &["init", "--force"]).status.success());
}

#[test]
fn test_config_command() {
    let temp_dir = TempDir::new().unwrap();
    let temp_path = temp_dir.path();
    write_settings(temp_path);

    let output = indexwatch(temp_path, &["config"]);
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("limit_reserve = 42"));
    assert!(stdout.contains("deadline_secs = 5"));
}

#[test]
fn test_explicit_config_path() {
    let temp_dir = TempDir::new().unwrap();
    let temp_path = temp_dir.path();
    write_settings(temp_path);
    let elsewhere = TempDir::new().unwrap();

    let settings = temp_path.join(".indexwatch/settings.toml");
    let output = indexwatch(
        elsewhere.path(),
        &["--config", settings.to_str().unwrap(), "config"],
    );
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("limit_reserve = 42"));
}

#[test]
fn test_extract_then_errors() {
    let temp_dir = TempDir::new().unwrap();
    let temp_path = temp_dir.path();
    write_settings(temp_path);

    let docs = temp_path.join("docs");
    std::fs::create_dir_all(&docs).unwrap();
    std::fs::write(docs.join("readme.txt"), "hello world\n").unwrap();
    std::fs::write(docs.join("data.bin"), [0u8, 1, 2, 3, 0]).unwrap();

    let output = indexwatch(temp_path, &["extract", "docs"]);
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("1 extracted, 1 failed"));

    let again = indexwatch(temp_path, &["extract", "docs"]);
    let stdout = String::from_utf8(again.stdout).unwrap();
    assert!(stdout.contains("0 extracted, 0 failed"));
    assert!(stdout.contains("2 up to date"));

    let errors = indexwatch(temp_path, &["errors"]);
    assert!(errors.status.success());
    let stdout = String::from_utf8(errors.stdout).unwrap();
    assert!(stdout.contains("data.bin"));
    assert!(!stdout.contains("readme.txt"));
}

#[test]
fn test_watch_requires_a_directory() {
    let temp_dir = TempDir::new().unwrap();
    let output = indexwatch(temp_dir.path(), &["watch"]);
    assert!(!output.status.success());
}

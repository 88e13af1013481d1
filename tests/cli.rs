use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("impactncd");
    let mut cmd = Command::new(path);
    cmd.env_remove("IMPACTNCD_CONFIG")
        .env_remove("IMPACTNCD_PASSWORD")
        .env_remove("RUST_LOG");
    cmd
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

fn make_repo(root: &Path) -> String {
    let repo = root.join("IMPACTncd_Germany");
    fs::create_dir_all(repo.join("inputs")).unwrap();
    fs::write(
        repo.join("inputs/sim_design.yaml"),
        "iteration_n: 10\noutput_dir: ./outputs # results\nsynthpop_dir: /data/synthpop\n",
    )
    .unwrap();
    repo.to_string_lossy().to_string()
}

#[test]
fn config_init_creates_and_preserves_existing() {
    let dir = tempdir().unwrap();
    let config_dir = dir.path().join("config");

    let output = bin()
        .env("IMPACTNCD_CONFIG_DIR", &config_dir)
        .args(["--json", "config", "init"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value = parse_json(&output.stdout);
    assert_eq!(value["ok"], Value::Bool(true));
    assert_eq!(value["result"]["created"], Value::Bool(true));
    let config_path = config_dir.join("config.yaml");
    assert!(config_path.exists());

    fs::write(&config_path, "version: 1\nremote:\n  user: svc\n").unwrap();
    let output = bin()
        .env("IMPACTNCD_CONFIG_DIR", &config_dir)
        .args(["--json", "config", "init"])
        .output()
        .unwrap();
    let value = parse_json(&output.stdout);
    assert_eq!(value["result"]["created"], Value::Bool(false));
    assert_eq!(
        fs::read_to_string(&config_path).unwrap(),
        "version: 1\nremote:\n  user: svc\n"
    );
}

#[test]
fn config_validate_rejects_unknown_fields() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    fs::write(&config_path, "version: 1\nsurprise: true\n").unwrap();

    let output = bin()
        .arg("--config")
        .arg(&config_path)
        .args(["--json", "config", "validate"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let value = parse_json(&output.stdout);
    assert_eq!(value["ok"], Value::Bool(false));
    assert!(value["error"].as_str().unwrap().contains("surprise"));
}

#[test]
fn mount_path_translates_drive_letters() {
    let dir = tempdir().unwrap();
    let output = bin()
        .env("IMPACTNCD_CONFIG_DIR", dir.path())
        .args(["--json", "mount-path", r"C:\Users\x\\y\"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value = parse_json(&output.stdout);
    assert_eq!(value["result"]["mount_source"], "/c/Users/x/y");

    let output = bin()
        .env("IMPACTNCD_CONFIG_DIR", dir.path())
        .args(["--json", "mount-path", "--remote", "/home/svc/data"])
        .output()
        .unwrap();
    let value = parse_json(&output.stdout);
    assert_eq!(value["result"]["mount_source"], "/home/svc/data");
}

#[test]
fn start_dry_run_prints_run_vector() {
    let dir = tempdir().unwrap();
    let repo = make_repo(dir.path());

    let output = bin()
        .env("IMPACTNCD_CONFIG_DIR", dir.path().join("config"))
        .env("IMPACTNCD_PASSWORD", "s3cret")
        .args([
            "--json",
            "--non-interactive",
            "start",
            "--user",
            "Alice Smith",
            "--repo-path",
            repo.as_str(),
            "--use-volumes",
            "--dry-run",
        ])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let value = parse_json(&output.stdout);
    let result = &value["result"];
    assert_eq!(result["container"], "IMPACTncd_Germany_alicesmith");
    assert_eq!(result["image"], "impactncd_germany");

    let args: Vec<String> = result["args"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a.as_str().unwrap().to_string())
        .collect();
    assert_eq!(args.first().map(String::as_str), Some("run"));
    assert_eq!(args.last().map(String::as_str), Some("impactncd_germany"));
    assert!(args.contains(&"PASSWORD=s3cret".to_string()));
    assert!(args.contains(
        &"impactncd_germany_output_alicesmith:/home/rstudio/IMPACTncd_Germany/outputs".to_string()
    ));
    assert!(!args.contains(&"--cpus".to_string()));

    let command = result["command"].as_str().unwrap();
    assert!(command.contains("PASSWORD=****"));
    assert!(!command.contains("s3cret"));
}

#[test]
fn start_without_password_fails_non_interactively() {
    let dir = tempdir().unwrap();
    let repo = make_repo(dir.path());
    bin()
        .env("IMPACTNCD_CONFIG_DIR", dir.path().join("config"))
        .args([
            "--non-interactive",
            "start",
            "--user",
            "alice",
            "--repo-path",
            repo.as_str(),
            "--dry-run",
        ])
        .assert()
        .failure()
        .stderr(contains("--password"));
}

#[test]
fn invalid_location_is_rejected() {
    let dir = tempdir().unwrap();
    let output = bin()
        .env("IMPACTNCD_CONFIG_DIR", dir.path())
        .args([
            "--json",
            "--non-interactive",
            "start",
            "--user",
            "alice",
            "--password",
            "pw",
            "--location",
            "ELSEWHERE",
            "--dry-run",
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let value = parse_json(&output.stdout);
    assert_eq!(value["ok"], Value::Bool(false));
    assert!(value["error"].as_str().unwrap().contains("LOCAL or REMOTE@<ip>"));
}

#[test]
fn missing_sim_design_is_a_precondition_error() {
    let dir = tempdir().unwrap();
    let repo = dir.path().join("empty_repo");
    fs::create_dir_all(&repo).unwrap();
    let output = bin()
        .env("IMPACTNCD_CONFIG_DIR", dir.path().join("config"))
        .args(["--json", "--non-interactive", "start", "--user", "alice", "--password", "pw", "--dry-run", "--repo-path"])
        .arg(&repo)
        .output()
        .unwrap();
    assert!(!output.status.success());
    let value = parse_json(&output.stdout);
    assert!(value["error"].as_str().unwrap().contains("sim_design.yaml"));
}

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

const INCIDENTS: &str = "\
incident_id,application,issue_summary,issue_description,severity,root_cause,resolution,pattern_id,created_at
INC00001,VPN,VPN drop,VPN connection failed after update,High,Network configuration,Reset network adapter,1,2024-01-02T10:00:00
INC00002,VPN,VPN drop,VPN connection failed on laptop,High,Network configuration,Reset network adapter,1,2024-01-03T10:00:00
INC00003,VPN,VPN drop,VPN tunnel dropped at gateway,High,Network configuration,Reset network adapter,1,2024-01-03T12:00:00
INC00004,Billing,Invoice,Billing system is down with error 500,Critical,Software bug,Restarted server instance,2,2024-01-04T10:00:00
INC00005,Billing,Invoice,Billing outage all invoices failing,Critical,Software bug,Restarted server instance,2,2024-01-04T11:00:00
INC00006,Billing,Invoice,Billing service crash on payment,Critical,Software bug,Restarted server instance,2,2024-01-04T12:00:00
INC00007,Email,Sync,Email not syncing on mobile device,Medium,Cache corruption,Cleared cache,3,2024-01-05T10:00:00
INC00008,Email,Sync,Email sync delayed on tablet,Medium,Cache corruption,Cleared cache,3,2024-01-05T11:00:00
INC00009,Email,Sync,Email folders not refreshing,Medium,Cache corruption,Cleared cache,3,2024-01-05T12:00:00
INC00010,Portal,Theme,Portal font looks wrong,Low,UI regression,Reverted stylesheet,4,2024-01-06T10:00:00
INC00011,Portal,Theme,Portal logo misaligned,Low,UI regression,Reverted stylesheet,4,2024-01-06T11:00:00
INC00012,Portal,Theme,Portal footer colour changed,Low,UI regression,Reverted stylesheet,4,2024-01-06T12:00:00
";

const KB: &str = "\
kb_id,application,title,content,tags,created_at
KB0001,VPN,How to resolve Network configuration in VPN,Step 1: Reset network adapter.,vpn,2024-01-01
KB0002,Email,How to resolve Cache corruption in Email,Step 1: Clear the cache.,email,2024-01-01
";

fn workspace() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    fs::create_dir_all(&data).unwrap();
    fs::write(data.join("incidents.csv"), INCIDENTS).unwrap();
    fs::write(data.join("kb_articles.csv"), KB).unwrap();
    fs::write(
        dir.path().join("incident.toml"),
        "[embedding]\nfallback_dim = 64\n\n[heal]\ndelay_ms = 0\n",
    )
    .unwrap();
    dir
}

fn bin(dir: &Path) -> Command {
    let path = assert_cmd::cargo::cargo_bin!("incident");
    let mut cmd = Command::new(path);
    cmd.current_dir(dir)
        .env_remove("INCIDENT_CONFIG")
        .env_remove("INCIDENT_DATA_DIR")
        .env_remove("INCIDENT_INDEX_DIR")
        .env_remove("INCIDENT_MODEL_DIR")
        .env_remove("GEMINI_API_KEY");
    cmd
}

fn stdout_json(cmd: &mut Command) -> Value {
    let assert = cmd.assert().success();
    serde_json::from_slice(&assert.get_output().stdout).unwrap()
}

#[test]
fn build_index_then_status_reports_current() {
    let dir = workspace();

    let meta = stdout_json(bin(dir.path()).arg("build-index"));
    assert_eq!(meta["item_count"], 14);
    assert_eq!(meta["index_version"], "1.0");
    assert_eq!(meta["embedding_model"], "hash");

    let status = stdout_json(bin(dir.path()).arg("index-status"));
    assert_eq!(status["exists"], true);
    assert_eq!(status["is_stale"], false);
    assert_eq!(status["message"], "Index is current");
}

#[test]
fn status_before_build_says_not_built() {
    let dir = workspace();
    let status = stdout_json(bin(dir.path()).arg("index-status"));
    assert_eq!(status["exists"], false);
    assert_eq!(status["message"], "Index not built yet");
}

#[test]
fn search_builds_index_and_ranks_exact_match_first() {
    let dir = workspace();

    let hits = stdout_json(bin(dir.path()).args([
        "search",
        "--query",
        "Billing system is down with error 500",
        "--top-k",
        "3",
    ]));
    let hits = hits.as_array().unwrap();
    assert!(!hits.is_empty() && hits.len() <= 3);
    assert_eq!(hits[0]["id"], "INC00004");
    assert_eq!(hits[0]["type"], "incident");
    assert!(dir.path().join("index_store").join("iiraf_index.jsonl").exists());
}

#[test]
fn train_then_predict_severity() {
    let dir = workspace();

    let report = stdout_json(bin(dir.path()).arg("train-severity"));
    assert_eq!(report["status"], "trained");
    assert_eq!(report["confusion_matrix"].as_array().unwrap().len(), 4);
    assert!(dir.path().join("models").join("severity_model.json").exists());

    let again = stdout_json(bin(dir.path()).arg("train-severity"));
    assert_eq!(again["status"], "already_trained");

    let prediction = stdout_json(
        bin(dir.path()).args(["predict", "--description", "VPN connection failed"]),
    );
    let severity = prediction["severity"].as_str().unwrap();
    assert!(["Critical", "High", "Medium", "Low"].contains(&severity));
    let total: f64 = prediction["probabilities"]
        .as_object()
        .unwrap()
        .values()
        .map(|p| p.as_f64().unwrap())
        .sum();
    assert!((total - 1.0).abs() < 1e-3);
}

#[test]
fn predict_without_model_fails() {
    let dir = workspace();
    bin(dir.path())
        .args(["predict", "--description", "anything"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("error: Model not trained"));
}

#[test]
fn patterns_account_for_every_incident() {
    let dir = workspace();
    let patterns = stdout_json(bin(dir.path()).arg("patterns"));
    let covered: u64 = patterns
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["frequency"].as_u64().unwrap())
        .sum();
    assert_eq!(covered, 12);
}

#[test]
fn verify_data_summarises_dataset() {
    let dir = workspace();
    let report = stdout_json(bin(dir.path()).arg("verify-data"));
    assert_eq!(report["incidents"], 12);
    assert_eq!(report["kb_articles"], 2);
    assert_eq!(report["severity_distribution"]["Critical"], 3);
    assert!(report["patterns"].is_null());
}

#[test]
fn verify_data_without_dataset_fails() {
    let dir = tempfile::tempdir().unwrap();
    bin(dir.path())
        .arg("verify-data")
        .assert()
        .failure()
        .stderr(predicate::str::contains("incidents.csv"));
}

#[test]
fn heal_and_suggest_action() {
    let dir = workspace();

    let result = stdout_json(bin(dir.path()).args(["heal", "--action", "scale_up", "--target", "api"]));
    assert_eq!(result["status"], "Success");
    assert_eq!(result["command_executed"], "kubectl scale deployment api --replicas=5");

    let suggestion = stdout_json(
        bin(dir.path()).args(["suggest-action", "--description", "Disk is full on node 3"]),
    );
    assert_eq!(suggestion["action"], "clear_cache");
    assert_eq!(suggestion["command"], "rm -rf /tmp/cache/*");
}

#[test]
fn help_describes_every_subcommand() {
    let dir = tempfile::tempdir().unwrap();
    let assert = bin(dir.path()).arg("--help").assert().success();
    let help = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();

    for (command, summary) in [
        ("build-index", "Embed incidents"),
        ("index-status", "Show whether the index"),
        ("search", "Semantic search"),
        ("train-severity", "Train the severity classifier"),
        ("predict", "Predict the severity"),
        ("patterns", "Detect recurring"),
        ("verify-data", "Summarise the dataset"),
        ("heal", "Simulate a remediation"),
        ("suggest-action", "Suggest a remediation"),
    ] {
        let line = help
            .lines()
            .find(|l| l.trim_start().starts_with(&format!("{command} ")))
            .unwrap_or_else(|| panic!("{command} missing from help:\n{help}"));
        assert!(line.contains(summary), "{line}");
    }
}

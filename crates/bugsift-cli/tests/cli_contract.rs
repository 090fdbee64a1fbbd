//! End-to-end contract tests for the `bugsift` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};

fn fixture(dir: &Path) -> PathBuf {
    let report = dir.join("bugreport-cli.txt");
    std::fs::write(
        &report,
        "== dumpstate: 2024-08-24 12:00:00\n\
         persist.sys.timezone=UTC\n\
         ro.product.brand=google\n\
         ------ SYSTEM LOG (logcat -v threadtime) ------\n\
         08-24 10:00:00.000  1234 5678 E ActivityManager: ANR in com.foo\n\
         08-24 10:00:01.000  1234 5678 I MyTag: hello world\n\
         08-24 10:00:02.000  2222 5679 W Network: unstable\n",
    )
    .unwrap();
    report
}

fn bugsift(cache_root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("bugsift").unwrap();
    cmd.arg("--cache-root").arg(cache_root);
    cmd
}

#[test]
fn parse_then_query_round_trips_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let report = fixture(dir.path());
    let cache = dir.path().join("cache");

    let out = bugsift(&cache)
        .args(["parse"])
        .arg(&report)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let summary: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(summary["events"], 3);
    assert_eq!(summary["anrs"], 1);
    assert_eq!(summary["device"]["brand"], "google");

    let out = bugsift(&cache)
        .args(["query"])
        .arg(&report)
        .args(["--level", "E", "--limit", "10"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let resp: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(resp["rows"].as_array().unwrap().len(), 1);
    assert_eq!(resp["rows"][0]["tag"], "ActivityManager");
    assert_eq!(resp["hasMoreNext"], false);
}

#[test]
fn stats_reports_level_counts() {
    let dir = tempfile::tempdir().unwrap();
    let report = fixture(dir.path());
    let cache = dir.path().join("cache");

    bugsift(&cache).arg("parse").arg(&report).assert().success();

    let out = bugsift(&cache)
        .arg("stats")
        .arg(&report)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stats: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(stats["totalRows"], 3);
    assert_eq!(stats["levelCounts"]["error"], 1);
    assert_eq!(stats["levelCounts"]["warning"], 1);
}

#[test]
fn jump_anchors_and_returns_cursors() {
    let dir = tempfile::tempdir().unwrap();
    let report = fixture(dir.path());
    let cache = dir.path().join("cache");

    bugsift(&cache).arg("parse").arg(&report).assert().success();

    let out = bugsift(&cache)
        .arg("jump")
        .arg(&report)
        .args(["--at", "2024-08-24 10:00:01", "--limit", "5"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let resp: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(resp["rows"][0]["tag"], "MyTag");
    assert_eq!(resp["hasMorePrev"], true);
}

#[test]
fn querying_without_a_cache_is_an_input_error() {
    let dir = tempfile::tempdir().unwrap();
    let report = fixture(dir.path());
    let cache = dir.path().join("cache");

    bugsift(&cache)
        .arg("stats")
        .arg(&report)
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("stale"));
}

#[test]
fn stale_cursor_exits_with_query_error() {
    let dir = tempfile::tempdir().unwrap();
    let report = fixture(dir.path());
    let cache = dir.path().join("cache");

    bugsift(&cache).arg("parse").arg(&report).assert().success();

    // A cursor whose fingerprint cannot match any real filter set.
    let forged = r#"{"position":0,"direction":"forward","filterHash":1}"#;
    bugsift(&cache)
        .arg("query")
        .arg(&report)
        .args(["--cursor", forged])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("cursor invalid"));
}

#[test]
fn missing_report_is_an_input_error() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("cache");
    bugsift(&cache)
        .arg("parse")
        .arg(dir.path().join("nope.txt"))
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn parse_with_progress_streams_events_to_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let report = fixture(dir.path());
    let cache = dir.path().join("cache");

    let assert = bugsift(&cache)
        .args(["parse", "--progress"])
        .arg(&report)
        .assert()
        .success();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    let phases: Vec<serde_json::Value> = stderr
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    assert!(!phases.is_empty());
    assert_eq!(phases[0]["phase"], "starting");
    assert_eq!(phases.last().unwrap()["phase"], "finalizing");
}

#[test]
fn gc_prints_a_report() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("cache");
    std::fs::create_dir_all(&cache).unwrap();

    let out = bugsift(&cache)
        .arg("gc")
        .args(["--max-bytes", "1"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(report["skipped"], false);
}

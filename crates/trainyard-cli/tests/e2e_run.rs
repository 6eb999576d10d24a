//! E2E tests for `trainyard run` and `trainyard classify` in fixture mode.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn ty_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("trainyard"));
    cmd.current_dir(dir);
    cmd.env("HOME", dir);
    cmd.env("XDG_CONFIG_HOME", dir.join(".config"));
    cmd.env("TRAINYARD_LOG", "error");
    for key in [
        "FORMAT",
        "TRAINYARD_ORG",
        "TRAINYARD_PROJECT",
        "TRAINYARD_AREA_PATH",
        "TRAINYARD_PAT",
        "AZURE_DEVOPS_EXT_PAT",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

fn feature(id: i64, title: &str) -> Value {
    json!({
        "id": id,
        "title": title,
        "item_type": "Feature",
        "area_path": "Fabrikam\\Platform",
    })
}

fn write_fixture(dir: &Path, items: &[Value]) -> PathBuf {
    let path = dir.join("backlog.json");
    fs::write(&path, serde_json::to_string_pretty(items).expect("serialize")).expect("write fixture");
    path
}

fn write_project_config(dir: &Path) {
    fs::create_dir_all(dir.join(".trainyard")).expect("config dir");
    fs::write(
        dir.join(".trainyard/config.toml"),
        "[grouping]\narea_path = \"Fabrikam\\\\Platform\"\n",
    )
    .expect("write config");
}

fn run_json(dir: &Path, fixture: &Path, extra: &[&str]) -> (Option<i32>, Value) {
    let output = ty_cmd(dir)
        .args(["run", "--json", "--fixture"])
        .arg(fixture)
        .args(extra)
        .output()
        .expect("run should not crash");
    let json: Value = serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "invalid JSON ({err}): stdout={} stderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    });
    (output.status.code(), json)
}

#[test]
fn fresh_marker_creates_and_links_in_fixture_mode() {
    let dir = TempDir::new().expect("tempdir");
    write_project_config(dir.path());
    let fixture = write_fixture(
        dir.path(),
        &[
            feature(1, "----- Q1 Release -----rt"),
            feature(2, "Feature A"),
            feature(3, "Feature B"),
            feature(4, "------------"),
        ],
    );

    let (code, report) = run_json(dir.path(), &fixture, &["--pass", "grouping"]);

    assert_eq!(code, Some(0));
    assert_eq!(report["source"], "fixture");
    assert_eq!(report["created"], 1);
    assert_eq!(report["added_relations"], 2);
    assert_eq!(report["operations"][0]["title"], "Q1 Release");
    assert_eq!(report["operations"][0]["kind"], "created");

    let calls: Vec<&str> = report["mutations"]
        .as_array()
        .expect("mutations")
        .iter()
        .filter_map(|call| call["call"].as_str())
        .collect();
    assert_eq!(
        calls,
        vec!["create_aggregate", "create_relation", "create_relation", "update_title"]
    );
}

#[test]
fn dangling_reference_is_recovered() {
    let dir = TempDir::new().expect("tempdir");
    let fixture = write_fixture(
        dir.path(),
        &[
            feature(1, "----- GCCH -----rt:4160082"),
            feature(2, "Feature X"),
            feature(3, "------------"),
        ],
    );

    let (code, report) = run_json(
        dir.path(),
        &fixture,
        &["--pass", "grouping", "--area", "Fabrikam\\Platform"],
    );

    assert_eq!(code, Some(0));
    assert_eq!(report["created"], 1);
    assert_eq!(report["updated"], 0);
    assert_eq!(report["operations"][0]["recovered_from"], 4_160_082);
    assert_eq!(report["warnings"][0]["kind"], "missing_aggregate");
}

#[test]
fn estimates_are_reconciled_per_authorship() {
    let dir = TempDir::new().expect("tempdir");
    write_project_config(dir.path());
    let aggregate = |id: i64, tags: Vec<&str>| {
        json!({
            "id": id,
            "title": format!("Train {id}"),
            "item_type": "Release Train",
            "area_path": "Fabrikam\\Platform",
            "tags": tags,
            "notes": "[ESTIMATE: 8] Agreed at planning.",
            "relations": [
                { "kind": "related", "target": 1 },
                { "kind": "related", "target": 2 }
            ]
        })
    };
    let fixture = write_fixture(
        dir.path(),
        &[
            json!({ "id": 1, "title": "A", "item_type": "Feature", "estimate": 5.0 }),
            json!({ "id": 2, "title": "B", "item_type": "Feature", "estimate": 8.0 }),
            aggregate(500, vec!["auto-generated"]),
            aggregate(501, vec![]),
        ],
    );

    let (code, report) = run_json(dir.path(), &fixture, &["--pass", "estimate-reconcile"]);

    assert_eq!(code, Some(0));
    let updates = report["estimate_updates"].as_array().expect("updates");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["aggregate_id"], 500);
    assert_eq!(updates[0]["previous"], 8.0);
    assert_eq!(updates[0]["total"], 13.0);
    assert!(
        report["warnings"]
            .as_array()
            .expect("warnings")
            .iter()
            .any(|w| w["kind"] == "estimate_mismatch" && w["item_id"] == 501)
    );
}

#[test]
fn missing_area_path_is_fatal() {
    let dir = TempDir::new().expect("tempdir");
    let fixture = write_fixture(dir.path(), &[feature(1, "----- Q1 -----rt")]);

    ty_cmd(dir.path())
        .args(["run", "--format", "text", "--fixture"])
        .arg(&fixture)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("E1004"));
}

#[test]
fn missing_token_is_fatal_without_fixture() {
    let dir = TempDir::new().expect("tempdir");
    write_project_config(dir.path());

    ty_cmd(dir.path())
        .args(["run", "--json"])
        .env("TRAINYARD_ORG", "contoso")
        .env("TRAINYARD_PROJECT", "Fabrikam")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("E1002"));
}

#[test]
fn unreadable_fixture_is_fatal() {
    let dir = TempDir::new().expect("tempdir");
    write_project_config(dir.path());
    fs::write(dir.path().join("broken.json"), "{ not json").expect("write");

    ty_cmd(dir.path())
        .args(["run", "--format", "text", "--fixture", "broken.json"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("E4001"));
}

#[test]
fn text_summary_is_printed() {
    let dir = TempDir::new().expect("tempdir");
    write_project_config(dir.path());
    let fixture = write_fixture(
        dir.path(),
        &[feature(1, "----- Q1 -----rt"), feature(2, "Feature A")],
    );

    ty_cmd(dir.path())
        .args(["run", "--format", "text", "--pass", "grouping", "--fixture"])
        .arg(&fixture)
        .assert()
        .success()
        .stdout(predicate::str::contains("created  900000  Q1  members=1  links=1"))
        .stdout(predicate::str::contains("summary  created=1"));
}

#[test]
fn classify_reports_each_title() {
    let dir = TempDir::new().expect("tempdir");

    let output = ty_cmd(dir.path())
        .args([
            "classify",
            "--json",
            "----- Q1 Release -----rt:42",
            "------------",
            "Feature A",
        ])
        .output()
        .expect("classify should not crash");
    assert!(output.status.success());

    let rows: Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    assert_eq!(rows[0]["kind"], "open");
    assert_eq!(rows[0]["name"], "Q1 Release");
    assert_eq!(rows[0]["existing_id"], 42);
    assert_eq!(rows[1]["kind"], "close");
    assert_eq!(rows[2]["kind"], "plain");
}

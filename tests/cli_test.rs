#![allow(deprecated)]

/// End-to-end tests of the command-line surface
///
/// Discovery runs with every network backend disabled so only the static
/// target list from the config file is reported.
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;
mod common;

const OFFLINE_CONFIG: &str = "discovery:
  list_timeout_ms: 50
  jdp:
    enabled: false
  kubernetes:
    enabled: false
  docker:
    enabled: false
  podman:
    enabled: false
  custom:
    targets:
      - connect_url: service:jmx:rmi:///jndi/rmi://checkout:9091/jmxrmi
        alias: checkout
        labels:
          env: prod
";

fn cryostat(config: &std::path::Path, rules: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("cryostat").unwrap();
    cmd.arg("--config").arg(config).arg("--rules-dir").arg(rules.path());
    cmd
}

#[test]
fn test_validate_accepts_expression() {
    let (_temp_dir, config_path) = common::temp_config_file(OFFLINE_CONFIG);
    let rules = TempDir::new().unwrap();
    cryostat(&config_path, &rules)
        .args(["rules", "validate", "target.labels.env == 'prod' && /^check/.test(target.alias)"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"valid\":true"));
}

#[test]
fn test_validate_rejects_illegal_expression() {
    let (_temp_dir, config_path) = common::temp_config_file(OFFLINE_CONFIG);
    let rules = TempDir::new().unwrap();
    cryostat(&config_path, &rules)
        .args(["rules", "validate", "java.lang.System.exit(1)"])
        .assert()
        .failure();
}

#[test]
fn test_add_list_disable_delete_round() {
    let (_temp_dir, config_path) = common::temp_config_file(OFFLINE_CONFIG);
    let rules = TempDir::new().unwrap();

    cryostat(&config_path, &rules)
        .args([
            "rules",
            "add",
            "--name",
            "prod capture",
            "--match",
            "target.labels.env == 'prod'",
            "--event",
            "template=Continuous",
            "--archival-period",
            "300",
            "--preserved-archives",
            "5",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("prod_capture"));
    assert!(rules.path().join("prod_capture.json").exists());

    let output = cryostat(&config_path, &rules)
        .args(["rules", "list"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let listed: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(listed.as_array().map(Vec::len), Some(1));
    assert_eq!(listed[0]["name"], "prod_capture");
    assert_eq!(listed[0]["initialDelaySeconds"], 300);
    assert_eq!(listed[0]["enabled"], true);

    cryostat(&config_path, &rules)
        .args(["rules", "disable", "prod_capture"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"enabled\": false"));

    cryostat(&config_path, &rules)
        .args([
            "rules",
            "add",
            "--name",
            "prod_capture",
            "--match",
            "true",
            "--event",
            "template=Profiling",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("prod_capture"));

    cryostat(&config_path, &rules)
        .args(["rules", "delete", "prod_capture"])
        .assert()
        .success();
    assert!(!rules.path().join("prod_capture.json").exists());

    cryostat(&config_path, &rules)
        .args(["rules", "delete", "prod_capture"])
        .assert()
        .failure();
}

#[test]
fn test_add_rejects_negative_period() {
    let (_temp_dir, config_path) = common::temp_config_file(OFFLINE_CONFIG);
    let rules = TempDir::new().unwrap();
    cryostat(&config_path, &rules)
        .args([
            "rules",
            "add",
            "--name",
            "bad",
            "--match",
            "true",
            "--event",
            "template=Continuous",
            "--archival-period",
            "-5",
        ])
        .assert()
        .failure();
    assert!(!rules.path().join("bad.json").exists());
}

#[test]
fn test_discover_lists_custom_targets() {
    let (_temp_dir, config_path) = common::temp_config_file(OFFLINE_CONFIG);
    let rules = TempDir::new().unwrap();
    let output = cryostat(&config_path, &rules)
        .arg("discover")
        .output()
        .unwrap();
    assert!(output.status.success());

    let services: Value = serde_json::from_slice(&output.stdout).unwrap();
    let services = services.as_array().expect("array of targets");
    assert_eq!(services.len(), 1);
    assert_eq!(services[0]["alias"], "checkout");
    assert_eq!(services[0]["labels"]["env"], "prod");
}

#[test]
fn test_invalid_config_rejected() {
    let (_temp_dir, config_path) = common::temp_config_file("discovery:\n  list_timeout_ms: 0\n");
    let rules = TempDir::new().unwrap();
    cryostat(&config_path, &rules)
        .arg("discover")
        .assert()
        .failure()
        .stderr(predicate::str::contains("must be greater than 0"));
}
